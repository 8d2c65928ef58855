//! Per-member state aggregated across colocated regions.

use crate::snapshot::FixedPartitionSpec;
use crate::types::{BucketId, MemberId};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::warn;

/// Why a member declined to host another bucket copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefusalReason {
    /// The member already hosts a copy of the bucket.
    AlreadyHosting,
    /// The member is over its memory threshold and may not take new load.
    CriticalMember,
    /// Another copy already lives on the same machine.
    SameHost,
    /// Another copy already lives in the same redundancy zone.
    SameZone,
    /// Hosting the bucket would exceed the configured local max memory.
    LocalMaxMemoryFull,
}

impl fmt::Display for RefusalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = match self {
            RefusalReason::AlreadyHosting => "already hosting",
            RefusalReason::CriticalMember => "critical member",
            RefusalReason::SameHost => "same host",
            RefusalReason::SameZone => "same redundancy zone",
            RefusalReason::LocalMaxMemoryFull => "local max memory full",
        };
        f.write_str(reason)
    }
}

/// Cross-region aggregate of one member.
///
/// Every balancing decision is made against the rollup; the per-region
/// breakdown only survives in the `regions` map, which also drives the
/// colocation-consistency repair: a rollup whose region set does not match
/// the full colocated set is dropped from the model.
#[derive(Debug, Clone)]
pub struct MemberRollup {
    id: MemberId,
    host: String,
    weight: f64,
    critical: bool,
    enforce_local_max_memory: bool,
    max_memory_bytes: u64,
    total_bytes: u64,
    total_load: f64,
    primary_load: f64,
    buckets: BTreeSet<BucketId>,
    primary_buckets: BTreeSet<BucketId>,
    regions: BTreeMap<String, u64>,
    fixed_partitions: Vec<FixedPartitionSpec>,
}

impl MemberRollup {
    pub(crate) fn new(
        id: MemberId,
        host: String,
        weight: f64,
        critical: bool,
        enforce_local_max_memory: bool,
    ) -> Self {
        let weight = if weight > 0.0 {
            weight
        } else {
            warn!(member = %id, weight, "non-positive member weight, using 1.0");
            1.0
        };
        Self {
            id,
            host,
            weight,
            critical,
            enforce_local_max_memory,
            max_memory_bytes: 0,
            total_bytes: 0,
            total_load: 0.0,
            primary_load: 0.0,
            buckets: BTreeSet::new(),
            primary_buckets: BTreeSet::new(),
            regions: BTreeMap::new(),
            fixed_partitions: Vec::new(),
        }
    }

    /// The member id.
    pub fn id(&self) -> &MemberId {
        &self.id
    }

    /// Machine address of the member.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Relative allocation share.
    pub fn weight(&self) -> f64 {
        self.weight
    }

    /// Whether the member is over its memory threshold and thus ineligible
    /// for new load.
    pub fn is_critical(&self) -> bool {
        self.critical
    }

    /// Whether the configured local max memory is enforced on admission.
    pub fn enforces_local_max_memory(&self) -> bool {
        self.enforce_local_max_memory
    }

    /// Configured memory budget, summed over colocated regions, in bytes.
    pub fn max_memory_bytes(&self) -> u64 {
        self.max_memory_bytes
    }

    /// Bytes hosted, summed over hosted buckets.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    /// Sum of the load of every hosted bucket.
    pub fn total_load(&self) -> f64 {
        self.total_load
    }

    /// Sum of the primary load of every bucket this member is primary for.
    pub fn primary_load(&self) -> f64 {
        self.primary_load
    }

    /// Load normalized by weight: the quantity the balancer equalizes.
    pub fn weighted_load(&self) -> f64 {
        self.total_load / self.weight
    }

    /// Hosted bucket ids, in order.
    pub fn buckets(&self) -> &BTreeSet<BucketId> {
        &self.buckets
    }

    /// Bucket ids this member is primary for, in order.
    pub fn primary_buckets(&self) -> &BTreeSet<BucketId> {
        &self.primary_buckets
    }

    /// Whether this member hosts the bucket.
    pub fn hosts(&self, bucket_id: BucketId) -> bool {
        self.buckets.contains(&bucket_id)
    }

    /// Colocated regions this member has reported, with the per-region
    /// configured max memory.
    pub fn regions(&self) -> &BTreeMap<String, u64> {
        &self.regions
    }

    /// Fixed-partition assignments carried by this member.
    pub fn fixed_partitions(&self) -> &[FixedPartitionSpec] {
        &self.fixed_partitions
    }

    /// Whether this member is the configured secondary host for the fixed
    /// partition covering `bucket_id`.
    pub fn holds_secondary_fixed_partition(&self, bucket_id: BucketId) -> bool {
        self.fixed_partitions.iter().any(|spec| !spec.is_primary && spec.covers(bucket_id))
    }

    pub(crate) fn record_region(&mut self, region: &str, max_memory_bytes: u64) {
        if self.regions.insert(region.to_owned(), max_memory_bytes).is_none() {
            self.max_memory_bytes = self.max_memory_bytes.saturating_add(max_memory_bytes);
        }
    }

    pub(crate) fn add_fixed_partitions(&mut self, specs: &[FixedPartitionSpec]) {
        for spec in specs {
            if !self.fixed_partitions.contains(spec) {
                self.fixed_partitions.push(spec.clone());
            }
        }
    }

    pub(crate) fn add_hosted(&mut self, bucket_id: BucketId, load: f64, bytes: u64) {
        self.buckets.insert(bucket_id);
        self.total_load += load;
        self.total_bytes += bytes;
    }

    pub(crate) fn remove_hosted(&mut self, bucket_id: BucketId, load: f64, bytes: u64) {
        self.buckets.remove(&bucket_id);
        self.total_load -= load;
        self.total_bytes = self.total_bytes.saturating_sub(bytes);
    }

    pub(crate) fn attach_primary(&mut self, bucket_id: BucketId, primary_load: f64) {
        self.primary_buckets.insert(bucket_id);
        self.primary_load += primary_load;
    }

    pub(crate) fn detach_primary(&mut self, bucket_id: BucketId, primary_load: f64) {
        self.primary_buckets.remove(&bucket_id);
        self.primary_load -= primary_load;
    }

    /// Account additional write load folded into a bucket this member is
    /// already primary for.
    pub(crate) fn add_primary_load(&mut self, delta: f64) {
        self.primary_load += delta;
    }
}
