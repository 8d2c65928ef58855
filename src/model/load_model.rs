//! The load model: the member/bucket graph for one rebalance session and the
//! variance-minimizing move search over it.
//!
//! # Session flow
//!
//! ```text
//! LoadModel::new
//!     │
//!     ▼
//! add_region(..)      once per colocated region, parent region first
//!     │
//!     ▼
//! initialize()        classify low/over-redundancy buckets
//!     │
//!     ▼
//! ┌─────────────────────────────────────────────┐
//! │  find_best_*  ──▶  create/move/remove/..    │   caller-driven loop,
//! │        ▲                    │               │   runs to a fixed point
//! │        └────────────────────┘               │
//! └─────────────────────────────────────────────┘
//!     │
//!     ▼
//! wait_for_operations()   barrier for asynchronous creations
//! ```
//!
//! The model is driven by exactly one controller thread and is not safe for
//! concurrent use. Asynchronous creation outcomes arrive through a message
//! queue and are applied only on the controller thread, in
//! [`LoadModel::apply_completions`] and [`LoadModel::wait_for_operations`].

use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::model::bucket::{BucketRollup, Primary, RedundancyKey, RegionBucketLoad};
use crate::model::member::{MemberRollup, RefusalReason};
use crate::operator::{BucketOperator, Completion, CompletionQueue, OperationOutcome};
use crate::snapshot::{MemberLoadDetail, OfflineMemberDetails};
use crate::types::{BucketId, MemberId, Move, PartitionMemberSummary};
use crate::zones::ZonePolicy;
use std::cell::Cell;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Squared deviation of a member's weighted load from the average.
fn variance(load: f64, weight: f64, average: f64) -> f64 {
    let deviation = load / weight - average;
    deviation * deviation
}

/// Variance reduction from moving `size` units of load from source to
/// target, normalized per unit of load moved so moves of different sizes
/// are comparable.
fn improvement(
    source_load: f64,
    source_weight: f64,
    target_load: f64,
    target_weight: f64,
    size: f64,
    average: f64,
) -> f64 {
    let source_gain = variance(source_load, source_weight, average)
        - variance(source_load - size, source_weight, average);
    let target_cost = variance(target_load + size, target_weight, average)
        - variance(target_load, target_weight, average);
    (source_gain - target_cost) / size
}

/// The member/bucket graph for one rebalance session.
///
/// Built from per-region snapshots, then driven through the search/execute
/// loop until no improving move remains. All state is keyed by member id and
/// bucket id; cross-region aggregates live in [`MemberRollup`] and
/// [`BucketRollup`].
pub struct LoadModel {
    operator: Arc<dyn BucketOperator>,
    zones: Arc<dyn ZonePolicy>,
    region_name: String,
    bucket_count: usize,
    required_redundancy: usize,
    critical_members: BTreeSet<MemberId>,

    members: BTreeMap<MemberId, MemberRollup>,
    buckets: Vec<Option<BucketRollup>>,
    all_regions: BTreeSet<String>,
    fixed_partitioned: bool,

    low_redundancy: BTreeSet<RedundancyKey>,
    over_redundancy: BTreeSet<RedundancyKey>,

    attempted_creates: HashSet<Move>,
    attempted_moves: HashSet<Move>,
    attempted_primary_moves: HashSet<Move>,
    attempted_removes: HashSet<Move>,

    completions: Arc<CompletionQueue>,
    outstanding_creates: usize,

    // Lazily recomputed after every mutation.
    average_load: Cell<Option<f64>>,
    primary_average: Cell<Option<f64>>,
    min_improvement: Cell<Option<f64>>,
    min_primary_improvement: Cell<Option<f64>>,
}

impl LoadModel {
    /// Create an empty model for one session.
    pub fn new(
        operator: Arc<dyn BucketOperator>,
        zones: Arc<dyn ZonePolicy>,
        config: ModelConfig,
    ) -> Result<Self> {
        if config.bucket_count == 0 {
            return Err(Error::Config("bucket count must be nonzero".into()));
        }
        Ok(Self {
            operator,
            zones,
            region_name: config.region_name,
            bucket_count: config.bucket_count,
            required_redundancy: config.required_redundancy,
            critical_members: config.critical_members,
            members: BTreeMap::new(),
            buckets: (0..config.bucket_count).map(|_| None).collect(),
            all_regions: BTreeSet::new(),
            fixed_partitioned: false,
            low_redundancy: BTreeSet::new(),
            over_redundancy: BTreeSet::new(),
            attempted_creates: HashSet::new(),
            attempted_moves: HashSet::new(),
            attempted_primary_moves: HashSet::new(),
            attempted_removes: HashSet::new(),
            completions: CompletionQueue::new(),
            outstanding_creates: 0,
            average_load: Cell::new(None),
            primary_average: Cell::new(None),
            min_improvement: Cell::new(None),
            min_primary_improvement: Cell::new(None),
        })
    }

    /// Name of the leading colocated region.
    pub fn region_name(&self) -> &str {
        &self.region_name
    }

    /// Number of buckets in the region.
    pub fn bucket_count(&self) -> usize {
        self.bucket_count
    }

    /// Required number of extra copies per bucket.
    pub fn required_redundancy(&self) -> usize {
        self.required_redundancy
    }

    /// Whether any added region uses statically assigned fixed partitions.
    pub fn is_fixed_partitioned(&self) -> bool {
        self.fixed_partitioned
    }

    /// The member rollup for `id`, if part of the model.
    pub fn member(&self, id: &MemberId) -> Option<&MemberRollup> {
        self.members.get(id)
    }

    /// All member rollups, in id order.
    pub fn members(&self) -> impl Iterator<Item = &MemberRollup> {
        self.members.values()
    }

    /// The bucket rollup for `bucket_id`, if the bucket exists.
    pub fn bucket(&self, bucket_id: BucketId) -> Option<&BucketRollup> {
        self.buckets.get(bucket_id as usize).and_then(|slot| slot.as_ref())
    }

    /// Asynchronous creations issued but not yet resolved.
    pub fn outstanding_creations(&self) -> usize {
        self.outstanding_creates
    }

    // ------------------------------------------------------------------
    // Model construction
    // ------------------------------------------------------------------

    /// Fold one colocated region's snapshot into the model.
    ///
    /// Must be called once per colocated region, parent region first, before
    /// [`initialize`](Self::initialize). Members missing from some colocated
    /// regions are dropped from the model entirely, including their hosting
    /// entries: balancing a member the colocated regions disagree about
    /// would plan moves against a half-known topology.
    pub fn add_region(
        &mut self,
        region: &str,
        details: &[MemberLoadDetail],
        offline: &OfflineMemberDetails,
        enforce_local_max_memory: bool,
    ) -> Result<()> {
        if !self.all_regions.insert(region.to_owned()) {
            return Err(Error::Config(format!("region {region} added twice")));
        }

        for detail in details {
            if !detail.fixed_partitions.is_empty() {
                self.fixed_partitioned = true;
            }
            let critical = self.critical_members.contains(&detail.member_id);
            {
                let member = self.members.entry(detail.member_id.clone()).or_insert_with(|| {
                    MemberRollup::new(
                        detail.member_id.clone(),
                        detail.host.clone(),
                        detail.weight,
                        critical,
                        enforce_local_max_memory,
                    )
                });
                member.record_region(region, detail.max_memory_bytes);
                member.add_fixed_partitions(&detail.fixed_partitions);
            }

            for idx in 0..self.bucket_count {
                let bucket_id = idx as BucketId;
                let read_load = detail.read_load(bucket_id);
                if read_load <= 0.0 {
                    continue;
                }
                let region_share = {
                    let bucket =
                        self.buckets[idx].get_or_insert_with(|| BucketRollup::new(bucket_id));
                    if let Some(down) = offline.offline_members(bucket_id) {
                        bucket.add_offline(down);
                    }
                    if !bucket.has_region(region) {
                        // The first member reporting the bucket in a region
                        // supplies the region's canonical load and size.
                        bucket.fold_region(
                            region,
                            RegionBucketLoad {
                                load: read_load,
                                primary_load: 0.0,
                                bytes: detail.bucket_size(bucket_id),
                            },
                        );
                    }
                    bucket.add_host(detail.member_id.clone());
                    bucket.region_load(region).unwrap_or_default()
                };

                let member =
                    self.members.get_mut(&detail.member_id).expect("member recorded above");
                member.add_hosted(bucket_id, region_share.load, region_share.bytes);

                let write_load = detail.write_load(bucket_id);
                if write_load > 0.0 {
                    self.claim_primary(region, bucket_id, &detail.member_id, write_load);
                }
            }
        }

        self.drop_inconsistent_members(region);
        self.reset_averages();
        Ok(())
    }

    /// Register a member's claim to be the primary of a bucket.
    ///
    /// The first claimant within a region contributes the region's write
    /// cost; a second distinct claimant anywhere marks the primary ambiguous
    /// and withdraws the first claimant's primary accounting.
    fn claim_primary(
        &mut self,
        region: &str,
        bucket_id: BucketId,
        claimant: &MemberId,
        write_load: f64,
    ) {
        let idx = bucket_id as usize;
        let (current, total_before, region_unclaimed) = {
            let bucket = self.buckets[idx].as_ref().expect("bucket folded before primary claim");
            let share = bucket.region_load(region).unwrap_or_default();
            (bucket.primary().clone(), bucket.primary_load(), share.primary_load == 0.0)
        };

        match current {
            Primary::None => {
                let bucket = self.buckets[idx].as_mut().expect("bucket exists");
                if region_unclaimed {
                    bucket.add_region_primary_load(region, write_load);
                }
                let total = bucket.primary_load();
                bucket.set_primary(Primary::Member(claimant.clone()));
                if let Some(member) = self.members.get_mut(claimant) {
                    member.attach_primary(bucket_id, total);
                }
            }
            Primary::Member(existing) if existing == *claimant => {
                if region_unclaimed {
                    self.buckets[idx]
                        .as_mut()
                        .expect("bucket exists")
                        .add_region_primary_load(region, write_load);
                    if let Some(member) = self.members.get_mut(claimant) {
                        member.add_primary_load(write_load);
                    }
                }
            }
            Primary::Member(existing) => {
                warn!(
                    region = %self.region_name,
                    bucket_id,
                    existing = %existing,
                    claimant = %claimant,
                    "two members behaved as primary, marking bucket ambiguous"
                );
                if let Some(member) = self.members.get_mut(&existing) {
                    member.detach_primary(bucket_id, total_before);
                }
                let bucket = self.buckets[idx].as_mut().expect("bucket exists");
                bucket.set_primary(Primary::Ambiguous);
                if region_unclaimed {
                    bucket.add_region_primary_load(region, write_load);
                }
            }
            Primary::Ambiguous => {
                if region_unclaimed {
                    self.buckets[idx]
                        .as_mut()
                        .expect("bucket exists")
                        .add_region_primary_load(region, write_load);
                }
            }
        }
    }

    /// Drop every member rollup whose colocated-region set does not match
    /// the full set seen so far, removing it from every bucket it hosts.
    fn drop_inconsistent_members(&mut self, region: &str) {
        let stale: Vec<MemberId> = self
            .members
            .iter()
            .filter(|(_, member)| !member.regions().keys().eq(self.all_regions.iter()))
            .map(|(id, _)| id.clone())
            .collect();

        for id in stale {
            warn!(
                region,
                member = %id,
                "member missing from some colocated regions, dropping from model"
            );
            let member = self.members.remove(&id).expect("collected from the map");
            for &bucket_id in member.buckets() {
                if let Some(bucket) = self.buckets[bucket_id as usize].as_mut() {
                    bucket.remove_host(&id);
                    if bucket.primary().is(&id) {
                        bucket.set_primary(Primary::None);
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Classification
    // ------------------------------------------------------------------

    /// Reset cached statistics and rebuild the low/over-redundancy sets.
    pub fn initialize(&mut self) {
        self.reset_averages();
        self.low_redundancy.clear();
        self.over_redundancy.clear();

        let mut low_keys = Vec::new();
        let mut over_keys = Vec::new();
        for bucket in self.buckets.iter().flatten() {
            let (low, over) = self.classify(bucket);
            let key = bucket.redundancy_key();
            if low {
                low_keys.push(key);
            }
            if over {
                over_keys.push(key);
            }
        }
        self.low_redundancy.extend(low_keys);
        self.over_redundancy.extend(over_keys);

        debug!(
            region = %self.region_name,
            members = self.members.len(),
            low_redundancy = self.low_redundancy.len(),
            over_redundancy = self.over_redundancy.len(),
            "initialized load model"
        );
    }

    /// Classify a bucket as (low-redundancy, over-redundancy).
    ///
    /// A bucket with two copies in one zone is over-redundant in that zone
    /// even at the required count; if removing the duplicate would drop the
    /// online redundancy below the requirement, the bucket is also marked
    /// low so a different-zone copy gets created first.
    fn classify(&self, bucket: &BucketRollup) -> (bool, bool) {
        let required = self.required_redundancy as isize;
        let redundancy = bucket.redundancy();
        let online = bucket.online_redundancy();

        let mut low = redundancy >= 0 && redundancy < required;
        let mut over = online > required;

        if self.zones.enforce_unique_zones() && self.has_zone_duplicate(bucket) {
            over = true;
            if online <= required {
                low = true;
            }
        }
        (low, over)
    }

    fn has_zone_duplicate(&self, bucket: &BucketRollup) -> bool {
        let mut seen = BTreeSet::new();
        for host in bucket.hosting() {
            if let Some(zone) = self.zones.zone_of(host) {
                if !seen.insert(zone) {
                    return true;
                }
            }
        }
        false
    }

    /// Re-derive one bucket's membership in the redundancy sets after a
    /// mutation. `old_key` is the bucket's key before the mutation.
    fn reindex_bucket(&mut self, bucket_id: BucketId, old_key: RedundancyKey) {
        self.low_redundancy.remove(&old_key);
        self.over_redundancy.remove(&old_key);

        let classified = self.bucket(bucket_id).map(|bucket| {
            let (low, over) = self.classify(bucket);
            (low, over, bucket.redundancy_key())
        });
        if let Some((low, over, key)) = classified {
            if low {
                self.low_redundancy.insert(key);
            }
            if over {
                self.over_redundancy.insert(key);
            }
        }
    }

    /// Buckets below the required redundancy, neediest first.
    pub fn low_redundancy_buckets(&self) -> Vec<BucketId> {
        self.low_redundancy.iter().map(|key| key.id).collect()
    }

    /// Buckets above the required redundancy (or with a zone duplicate),
    /// in the same composite order.
    pub fn over_redundancy_buckets(&self) -> Vec<BucketId> {
        self.over_redundancy.iter().map(|key| key.id).collect()
    }

    /// Whether the bucket is currently classified low-redundancy.
    pub fn is_low_redundancy(&self, bucket_id: BucketId) -> bool {
        self.bucket(bucket_id)
            .map_or(false, |bucket| self.low_redundancy.contains(&bucket.redundancy_key()))
    }

    /// Whether the bucket is currently classified over-redundancy.
    pub fn is_over_redundancy(&self, bucket_id: BucketId) -> bool {
        self.bucket(bucket_id)
            .map_or(false, |bucket| self.over_redundancy.contains(&bucket.redundancy_key()))
    }

    // ------------------------------------------------------------------
    // Statistics
    // ------------------------------------------------------------------

    fn reset_averages(&self) {
        self.average_load.set(None);
        self.primary_average.set(None);
        self.min_improvement.set(None);
        self.min_primary_improvement.set(None);
    }

    /// Average weighted load: total load over total weight.
    pub fn average_load(&self) -> f64 {
        if let Some(cached) = self.average_load.get() {
            return cached;
        }
        let (total, weight) = self
            .members
            .values()
            .fold((0.0, 0.0), |(load, weight), m| (load + m.total_load(), weight + m.weight()));
        let average = if weight > 0.0 { total / weight } else { 0.0 };
        self.average_load.set(Some(average));
        average
    }

    /// Average weighted primary load.
    pub fn primary_average(&self) -> f64 {
        if let Some(cached) = self.primary_average.get() {
            return cached;
        }
        let (total, weight) = self
            .members
            .values()
            .fold((0.0, 0.0), |(load, weight), m| (load + m.primary_load(), weight + m.weight()));
        let average = if weight > 0.0 { total / weight } else { 0.0 };
        self.primary_average.set(Some(average));
        average
    }

    /// Noise floor for bucket moves: the normalized variance gain from
    /// moving the smallest nonzero bucket off the heaviest-weighted member.
    /// Zero when every bucket is empty, so an all-zero model never divides
    /// by zero.
    pub fn min_improvement(&self) -> f64 {
        if let Some(cached) = self.min_improvement.get() {
            return cached;
        }
        let min_load = self
            .buckets
            .iter()
            .flatten()
            .map(|bucket| bucket.load())
            .filter(|load| *load > 0.0)
            .fold(f64::INFINITY, f64::min);
        let value = self.min_improvement_for(min_load, self.average_load());
        self.min_improvement.set(Some(value));
        value
    }

    /// Noise floor for primary moves, from the smallest nonzero primary load.
    pub fn min_primary_improvement(&self) -> f64 {
        if let Some(cached) = self.min_primary_improvement.get() {
            return cached;
        }
        let min_load = self
            .buckets
            .iter()
            .flatten()
            .map(|bucket| bucket.primary_load())
            .filter(|load| *load > 0.0)
            .fold(f64::INFINITY, f64::min);
        let value = self.min_improvement_for(min_load, self.primary_average());
        self.min_primary_improvement.set(Some(value));
        value
    }

    fn min_improvement_for(&self, min_load: f64, average: f64) -> f64 {
        let max_weight = self.members.values().map(|m| m.weight()).fold(0.0, f64::max);
        if !min_load.is_finite() || max_weight <= 0.0 {
            return 0.0;
        }
        let before = variance(average * max_weight + min_load, max_weight, average);
        let after = variance(average * max_weight, max_weight, average);
        (before - after) / min_load
    }

    // ------------------------------------------------------------------
    // Admission
    // ------------------------------------------------------------------

    /// Why `target` would refuse a copy of `bucket_id`, or `None` when it
    /// would accept. Unknown members or buckets also return `None`.
    pub fn refusal_reason(
        &self,
        target: &MemberId,
        bucket_id: BucketId,
        check_same_host: bool,
    ) -> Option<RefusalReason> {
        let target = self.members.get(target)?;
        let bucket = self.bucket(bucket_id)?;
        self.member_refusal(target, bucket, None, check_same_host)
    }

    fn member_refusal(
        &self,
        target: &MemberRollup,
        bucket: &BucketRollup,
        source: Option<&MemberId>,
        check_same_host: bool,
    ) -> Option<RefusalReason> {
        if target.hosts(bucket.id()) {
            return Some(RefusalReason::AlreadyHosting);
        }
        if target.is_critical() {
            return Some(RefusalReason::CriticalMember);
        }
        if target.enforces_local_max_memory()
            && target.total_bytes() + bucket.bytes() > target.max_memory_bytes()
        {
            return Some(RefusalReason::LocalMaxMemoryFull);
        }
        let enforce_zones = self.zones.enforce_unique_zones();
        for host in bucket.hosting() {
            if source == Some(host) {
                // The copy being replaced does not count against placement.
                continue;
            }
            if check_same_host {
                if let Some(other) = self.members.get(host) {
                    if other.host() == target.host() {
                        return Some(RefusalReason::SameHost);
                    }
                }
            }
            if enforce_zones && self.zones.same_zone(target.id(), host) {
                return Some(RefusalReason::SameZone);
            }
        }
        None
    }

    // ------------------------------------------------------------------
    // Move search
    // ------------------------------------------------------------------

    /// Best member to receive a new copy of `bucket_id`: the willing member
    /// with the lowest post-add weighted load. Pure read; never contacts
    /// the operator.
    pub fn find_best_target(&self, bucket_id: BucketId, check_same_host: bool) -> Option<Move> {
        let bucket = self.bucket(bucket_id)?;
        let mut best: Option<(f64, &MemberId)> = None;
        for member in self.members.values() {
            if self.attempted_creates.contains(&Move::create(member.id().clone(), bucket_id)) {
                continue;
            }
            if self.member_refusal(member, bucket, None, check_same_host).is_some() {
                continue;
            }
            let cost = (member.total_load() + bucket.load()) / member.weight();
            if best.map_or(true, |(lowest, _)| cost < lowest) {
                best = Some((cost, member.id()));
            }
        }
        best.map(|(_, id)| Move::create(id.clone(), bucket_id))
    }

    /// Target selection for fixed-partition regions: only the member
    /// statically assigned the partition covering `bucket_id` (as a
    /// secondary) may receive the copy.
    pub fn find_best_target_for_fpr(
        &self,
        bucket_id: BucketId,
        check_same_host: bool,
    ) -> Option<Move> {
        let bucket = self.bucket(bucket_id)?;
        for member in self.members.values() {
            if !member.holds_secondary_fixed_partition(bucket_id) {
                continue;
            }
            if self.attempted_creates.contains(&Move::create(member.id().clone(), bucket_id)) {
                continue;
            }
            if self.member_refusal(member, bucket, None, check_same_host).is_some() {
                continue;
            }
            return Some(Move::create(member.id().clone(), bucket_id));
        }
        None
    }

    /// Best copy of `bucket_id` to delete: never the primary, preferring a
    /// zone that already holds a duplicate, and among candidates the host
    /// whose removal relieves the most weighted load.
    pub fn find_best_remove(&self, bucket_id: BucketId) -> Option<Move> {
        let bucket = self.bucket(bucket_id)?;
        let preferred_zone = self.preferred_deletion_zone(bucket);

        let mut best: Option<(f64, &MemberId)> = None;
        for host in bucket.hosting() {
            if bucket.primary().is(host) {
                continue;
            }
            if let Some(zone) = &preferred_zone {
                if self.zones.zone_of(host).as_ref() != Some(zone) {
                    continue;
                }
            }
            if self.attempted_removes.contains(&Move::removal(host.clone(), bucket_id)) {
                continue;
            }
            let Some(member) = self.members.get(host) else {
                continue;
            };
            let load_after = (member.total_load() - bucket.load()) / member.weight();
            if best.map_or(true, |(highest, _)| load_after > highest) {
                best = Some((load_after, host));
            }
        }
        best.map(|(_, id)| Move::removal(id.clone(), bucket_id))
    }

    /// The zone holding more than one copy of the bucket, if zone
    /// uniqueness is enforced: deletions should come from there.
    fn preferred_deletion_zone(&self, bucket: &BucketRollup) -> Option<String> {
        if !self.zones.enforce_unique_zones() {
            return None;
        }
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for host in bucket.hosting() {
            if let Some(zone) = self.zones.zone_of(host) {
                *counts.entry(zone).or_insert(0) += 1;
            }
        }
        counts
            .into_iter()
            .filter(|(_, count)| *count > 1)
            .max_by_key(|(_, count)| *count)
            .map(|(zone, _)| zone)
    }

    /// Best single bucket transfer: the (source, bucket, target) triple with
    /// the largest normalized variance reduction above the noise floor.
    pub fn find_best_bucket_move(&self) -> Option<Move> {
        let average = self.average_load();
        let floor = self.min_improvement();

        let mut best: Option<(f64, Move)> = None;
        for source in self.members.values() {
            for &bucket_id in source.buckets() {
                let Some(bucket) = self.bucket(bucket_id) else {
                    continue;
                };
                let size = bucket.load();
                if size <= 0.0 {
                    continue;
                }
                for target in self.members.values() {
                    if target.id() == source.id() {
                        continue;
                    }
                    let mv = Move::transfer(source.id().clone(), target.id().clone(), bucket_id);
                    if self.attempted_moves.contains(&mv) {
                        continue;
                    }
                    if self.member_refusal(target, bucket, Some(source.id()), false).is_some() {
                        continue;
                    }
                    let delta = improvement(
                        source.total_load(),
                        source.weight(),
                        target.total_load(),
                        target.weight(),
                        size,
                        average,
                    );
                    if delta > floor
                        && best.as_ref().map_or(true, |(largest, _)| delta > *largest)
                    {
                        best = Some((delta, mv));
                    }
                }
            }
        }
        best.map(|(_, mv)| mv)
    }

    /// Best primary transfer: among hosting members of each unambiguous
    /// primary, the transfer with the largest normalized primary-variance
    /// reduction above the primary noise floor.
    pub fn find_best_primary_move(&self) -> Option<Move> {
        let average = self.primary_average();
        let floor = self.min_primary_improvement();

        let mut best: Option<(f64, Move)> = None;
        for bucket in self.buckets.iter().flatten() {
            let Primary::Member(source_id) = bucket.primary() else {
                continue;
            };
            let Some(source) = self.members.get(source_id) else {
                continue;
            };
            let size = bucket.primary_load();
            if size <= 0.0 {
                continue;
            }
            for host in bucket.hosting() {
                if host == source_id {
                    continue;
                }
                let mv = Move::transfer(source_id.clone(), host.clone(), bucket.id());
                if self.attempted_primary_moves.contains(&mv) {
                    continue;
                }
                let Some(target) = self.members.get(host) else {
                    continue;
                };
                let delta = improvement(
                    source.primary_load(),
                    source.weight(),
                    target.primary_load(),
                    target.weight(),
                    size,
                    average,
                );
                if delta > floor && best.as_ref().map_or(true, |(largest, _)| delta > *largest) {
                    best = Some((delta, mv));
                }
            }
        }
        best.map(|(_, mv)| mv)
    }

    // ------------------------------------------------------------------
    // Move execution
    // ------------------------------------------------------------------

    fn record_attempt(attempted: &mut HashSet<Move>, mv: &Move, what: &str) -> Result<()> {
        if attempted.insert(mv.clone()) {
            Ok(())
        } else {
            error!(%mv, what, "move proposed twice");
            Err(Error::InvariantViolation(format!("{what} proposed twice: {mv}")))
        }
    }

    fn host_bucket(&mut self, member_id: &MemberId, bucket_id: BucketId) {
        let (load, bytes) = {
            let bucket = self.buckets[bucket_id as usize].as_mut().expect("bucket validated");
            bucket.add_host(member_id.clone());
            (bucket.load(), bucket.bytes())
        };
        self.members
            .get_mut(member_id)
            .expect("member validated")
            .add_hosted(bucket_id, load, bytes);
    }

    fn unhost_bucket(&mut self, member_id: &MemberId, bucket_id: BucketId) {
        let (load, bytes) = {
            let bucket = self.buckets[bucket_id as usize].as_mut().expect("bucket validated");
            bucket.remove_host(member_id);
            (bucket.load(), bucket.bytes())
        };
        if let Some(member) = self.members.get_mut(member_id) {
            member.remove_hosted(bucket_id, load, bytes);
        }
    }

    /// Move the primary reference and its member-side accounting.
    fn assign_primary(&mut self, bucket_id: BucketId, new: Primary) {
        let (old, primary_load) = {
            let bucket = self.buckets[bucket_id as usize].as_ref().expect("bucket validated");
            (bucket.primary().clone(), bucket.primary_load())
        };
        if old == new {
            return;
        }
        if let Primary::Member(previous) = &old {
            if let Some(member) = self.members.get_mut(previous) {
                member.detach_primary(bucket_id, primary_load);
            }
        }
        self.buckets[bucket_id as usize]
            .as_mut()
            .expect("bucket validated")
            .set_primary(new.clone());
        if let Primary::Member(next) = &new {
            if let Some(member) = self.members.get_mut(next) {
                member.attach_primary(bucket_id, primary_load);
            }
        }
    }

    fn validate(&self, bucket_id: BucketId, member_id: &MemberId) -> Result<()> {
        if self.bucket(bucket_id).is_none() {
            return Err(Error::UnknownBucket(bucket_id));
        }
        if !self.members.contains_key(member_id) {
            return Err(Error::UnknownMember(member_id.clone()));
        }
        Ok(())
    }

    /// Create a redundant copy per `mv` (a creation move from
    /// [`find_best_target`](Self::find_best_target)).
    ///
    /// The hosting change is applied immediately so subsequent searches see
    /// it; the operator runs asynchronously and a later failure outcome
    /// reverts the change.
    pub fn create_redundant_bucket(&mut self, mv: &Move) -> Result<()> {
        if mv.source.is_some() {
            return Err(Error::InvariantViolation(format!("creation move carries a source: {mv}")));
        }
        self.validate(mv.bucket_id, &mv.target)?;
        Self::record_attempt(&mut self.attempted_creates, mv, "bucket creation")?;

        let (sizes, old_key) = {
            let bucket = self.bucket(mv.bucket_id).expect("validated");
            (bucket.region_sizes(), bucket.redundancy_key())
        };

        self.host_bucket(&mv.target, mv.bucket_id);
        self.reindex_bucket(mv.bucket_id, old_key);
        self.reset_averages();
        self.outstanding_creates += 1;

        debug!(bucket_id = mv.bucket_id, target = %mv.target, "creating redundant bucket");
        let completion = Completion::new(self.completions.clone(), mv.target.clone(), mv.bucket_id);
        self.operator.create_redundant_bucket(&mv.target, mv.bucket_id, &sizes, completion);

        // Fold in a synchronously delivered outcome right away.
        self.apply_completions();
        Ok(())
    }

    /// Move a bucket per `mv`. Returns `false`, with no state change, when
    /// the operator refuses. When the source held the primary it transfers
    /// to the target along with the copy.
    pub fn move_bucket(&mut self, mv: &Move) -> Result<bool> {
        let source = mv
            .source
            .clone()
            .ok_or_else(|| {
                Error::InvariantViolation(format!("bucket move without a source: {mv}"))
            })?;
        self.validate(mv.bucket_id, &source)?;
        self.validate(mv.bucket_id, &mv.target)?;
        Self::record_attempt(&mut self.attempted_moves, mv, "bucket move")?;

        let (sizes, old_key, was_primary) = {
            let bucket = self.bucket(mv.bucket_id).expect("validated");
            if !bucket.is_hosted_by(&source) {
                return Err(Error::InvariantViolation(format!(
                    "move source does not host the bucket: {mv}"
                )));
            }
            if bucket.is_hosted_by(&mv.target) {
                return Err(Error::InvariantViolation(format!(
                    "move target already hosts the bucket: {mv}"
                )));
            }
            (bucket.region_sizes(), bucket.redundancy_key(), bucket.primary().is(&source))
        };

        if !self.operator.move_bucket(&source, &mv.target, mv.bucket_id, &sizes) {
            debug!(%mv, "bucket move refused by operator");
            return Ok(false);
        }

        if was_primary {
            self.assign_primary(mv.bucket_id, Primary::Member(mv.target.clone()));
        }
        self.unhost_bucket(&source, mv.bucket_id);
        self.host_bucket(&mv.target, mv.bucket_id);
        self.reindex_bucket(mv.bucket_id, old_key);
        self.reset_averages();
        debug!(%mv, "moved bucket");
        Ok(true)
    }

    /// Transfer a bucket's primary per `mv`. Returns `false`, with no state
    /// change, when the operator refuses.
    pub fn move_primary(&mut self, mv: &Move) -> Result<bool> {
        let source = mv
            .source
            .clone()
            .ok_or_else(|| {
                Error::InvariantViolation(format!("primary move without a source: {mv}"))
            })?;
        self.validate(mv.bucket_id, &source)?;
        self.validate(mv.bucket_id, &mv.target)?;
        {
            let bucket = self.bucket(mv.bucket_id).expect("validated");
            if !bucket.primary().is(&source) {
                return Err(Error::InvariantViolation(format!(
                    "primary move source is not the primary: {mv}"
                )));
            }
            if !bucket.is_hosted_by(&mv.target) {
                return Err(Error::InvariantViolation(format!(
                    "primary move target does not host the bucket: {mv}"
                )));
            }
        }
        Self::record_attempt(&mut self.attempted_primary_moves, mv, "primary move")?;

        if !self.operator.move_primary(&source, &mv.target, mv.bucket_id) {
            debug!(%mv, "primary move refused by operator");
            return Ok(false);
        }

        self.assign_primary(mv.bucket_id, Primary::Member(mv.target.clone()));
        self.reset_averages();
        debug!(%mv, "moved primary");
        Ok(true)
    }

    /// Remove the copy named by `mv` (a removal move from
    /// [`find_best_remove`](Self::find_best_remove)). Returns `false`, with
    /// no state change, when the operator refuses.
    pub fn remove_over_redundancy_bucket(&mut self, mv: &Move) -> Result<bool> {
        self.validate(mv.bucket_id, &mv.target)?;
        Self::record_attempt(&mut self.attempted_removes, mv, "bucket removal")?;

        let (sizes, old_key, was_primary) = {
            let bucket = self.bucket(mv.bucket_id).expect("validated");
            if !bucket.is_hosted_by(&mv.target) {
                return Err(Error::InvariantViolation(format!(
                    "removal target does not host the bucket: {mv}"
                )));
            }
            (bucket.region_sizes(), bucket.redundancy_key(), bucket.primary().is(&mv.target))
        };

        if !self.operator.remove_bucket(&mv.target, mv.bucket_id, &sizes) {
            debug!(%mv, "bucket removal refused by operator");
            return Ok(false);
        }

        if was_primary {
            self.assign_primary(mv.bucket_id, Primary::None);
        }
        self.unhost_bucket(&mv.target, mv.bucket_id);
        self.reindex_bucket(mv.bucket_id, old_key);
        self.reset_averages();
        debug!(%mv, "removed over-redundant bucket");
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Completion handling
    // ------------------------------------------------------------------

    /// Apply every creation outcome delivered so far without blocking.
    /// Returns the number of outcomes applied.
    pub fn apply_completions(&mut self) -> usize {
        let mut applied = 0;
        while let Some(outcome) = self.completions.try_pop() {
            self.apply_outcome(outcome);
            applied += 1;
        }
        applied
    }

    fn apply_outcome(&mut self, outcome: OperationOutcome) {
        self.outstanding_creates = self.outstanding_creates.saturating_sub(1);
        if outcome.success {
            debug!(
                bucket_id = outcome.bucket_id,
                target = %outcome.target,
                "redundant bucket created"
            );
            return;
        }
        warn!(
            bucket_id = outcome.bucket_id,
            target = %outcome.target,
            "bucket creation failed, reverting"
        );
        let old_key = match self.bucket(outcome.bucket_id) {
            Some(bucket) if bucket.is_hosted_by(&outcome.target) => bucket.redundancy_key(),
            _ => return,
        };
        if self.bucket(outcome.bucket_id).map_or(false, |b| b.primary().is(&outcome.target)) {
            self.assign_primary(outcome.bucket_id, Primary::None);
        }
        self.unhost_bucket(&outcome.target, outcome.bucket_id);
        self.reindex_bucket(outcome.bucket_id, old_key);
        self.reset_averages();
    }

    /// Block until every asynchronous creation issued in this session has
    /// resolved and its outcome has been applied to the model.
    pub fn wait_for_operations(&mut self) {
        self.operator.wait_for_operations();
        while self.outstanding_creates > 0 {
            let outcome = self.completions.pop_blocking();
            self.apply_outcome(outcome);
        }
    }

    // ------------------------------------------------------------------
    // Reporting
    // ------------------------------------------------------------------

    /// Per-member summaries for the session report.
    pub fn member_summaries(&self) -> Vec<PartitionMemberSummary> {
        self.members
            .values()
            .map(|member| PartitionMemberSummary {
                member_id: member.id().clone(),
                max_memory_bytes: member.max_memory_bytes(),
                size_bytes: member.total_bytes(),
                bucket_count: member.buckets().len(),
                primary_count: member.primary_buckets().len(),
            })
            .collect()
    }

    /// Human-readable member × bucket matrix: `P` primary, `R` replica,
    /// `X` not hosted.
    pub fn table_string(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{:<24} {:>10} {:>10} {:>12}  buckets",
            "member", "load", "primary", "bytes"
        );
        for member in self.members.values() {
            let mut row = String::with_capacity(self.bucket_count);
            for idx in 0..self.bucket_count {
                let mark = match self.bucket(idx as BucketId) {
                    Some(bucket) if bucket.primary().is(member.id()) => 'P',
                    Some(bucket) if bucket.is_hosted_by(member.id()) => 'R',
                    _ => 'X',
                };
                row.push(mark);
            }
            let _ = writeln!(
                out,
                "{:<24} {:>10.2} {:>10.2} {:>12}  {}",
                member.id(),
                member.total_load(),
                member.primary_load(),
                member.total_bytes(),
                row
            );
        }
        out
    }
}

impl fmt::Debug for LoadModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadModel")
            .field("region", &self.region_name)
            .field("bucket_count", &self.bucket_count)
            .field("required_redundancy", &self.required_redundancy)
            .field("members", &self.members.len())
            .field("low_redundancy", &self.low_redundancy.len())
            .field("over_redundancy", &self.over_redundancy.len())
            .field("outstanding_creates", &self.outstanding_creates)
            .finish()
    }
}
