//! Per-bucket state: load, size, hosting members, primary, and redundancy.

use crate::operator::ColocatedRegionSizes;
use crate::types::{BucketId, MemberId};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

/// Who is authoritative for writes to a bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Primary {
    /// No member currently claims the primary.
    None,
    /// A single member holds the primary.
    Member(MemberId),
    /// Two members behaved as primary while the snapshot was collected.
    /// The bucket keeps its copies but is excluded from primary planning
    /// until the cluster resolves the conflict.
    Ambiguous,
}

impl Primary {
    /// The primary member, when unambiguously known.
    pub fn member(&self) -> Option<&MemberId> {
        match self {
            Primary::Member(id) => Some(id),
            _ => None,
        }
    }

    /// Whether `member` is the unambiguous primary.
    pub fn is(&self, member: &MemberId) -> bool {
        matches!(self, Primary::Member(id) if id == member)
    }
}

/// One colocated region's share of a bucket's load.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RegionBucketLoad {
    /// Read cost reported for the bucket in this region.
    pub load: f64,
    /// Write cost reported by the region's primary.
    pub primary_load: f64,
    /// Bytes stored for the bucket in this region.
    pub bytes: u64,
}

/// Cross-region aggregate of one bucket.
///
/// The rollup sums load over every colocated region while keeping the
/// per-region breakdown, which the operator needs to budget transfers.
/// Hosting and primary are tracked by member id; the model keeps the
/// member-side bookkeeping consistent.
#[derive(Debug, Clone)]
pub struct BucketRollup {
    id: BucketId,
    load: f64,
    primary_load: f64,
    bytes: u64,
    hosting: BTreeSet<MemberId>,
    primary: Primary,
    offline: BTreeSet<MemberId>,
    per_region: BTreeMap<String, RegionBucketLoad>,
}

impl BucketRollup {
    /// Create an empty rollup for `id`.
    pub fn new(id: BucketId) -> Self {
        Self {
            id,
            load: 0.0,
            primary_load: 0.0,
            bytes: 0,
            hosting: BTreeSet::new(),
            primary: Primary::None,
            offline: BTreeSet::new(),
            per_region: BTreeMap::new(),
        }
    }

    /// The bucket id.
    pub fn id(&self) -> BucketId {
        self.id
    }

    /// Total read cost across colocated regions.
    pub fn load(&self) -> f64 {
        self.load
    }

    /// Total write cost across colocated regions.
    pub fn primary_load(&self) -> f64 {
        self.primary_load
    }

    /// Total stored bytes across colocated regions.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Members currently hosting a copy, in id order.
    pub fn hosting(&self) -> &BTreeSet<MemberId> {
        &self.hosting
    }

    /// Whether `member` hosts a copy.
    pub fn is_hosted_by(&self, member: &MemberId) -> bool {
        self.hosting.contains(member)
    }

    /// The current primary.
    pub fn primary(&self) -> &Primary {
        &self.primary
    }

    /// Historically hosting members that are currently offline.
    pub fn offline_members(&self) -> &BTreeSet<MemberId> {
        &self.offline
    }

    /// Copies beyond one that are online right now.
    pub fn online_redundancy(&self) -> isize {
        self.hosting.len() as isize - 1
    }

    /// Copies beyond one, counting offline historical copies. A value below
    /// zero means the bucket does not exist online anywhere.
    pub fn redundancy(&self) -> isize {
        self.online_redundancy() + self.offline.len() as isize
    }

    /// Whether this region already contributed load to the rollup.
    pub fn has_region(&self, region: &str) -> bool {
        self.per_region.contains_key(region)
    }

    /// This region's share of the bucket, if folded in.
    pub fn region_load(&self, region: &str) -> Option<RegionBucketLoad> {
        self.per_region.get(region).copied()
    }

    /// Per-region stored bytes, as passed to the operator.
    pub fn region_sizes(&self) -> ColocatedRegionSizes {
        self.per_region.iter().map(|(region, load)| (region.clone(), load.bytes)).collect()
    }

    /// The composite key ordering this bucket in the redundancy sets.
    pub fn redundancy_key(&self) -> RedundancyKey {
        RedundancyKey {
            redundancy: self.redundancy(),
            load: self.load,
            id: self.id,
        }
    }

    pub(crate) fn fold_region(&mut self, region: &str, contribution: RegionBucketLoad) {
        self.load += contribution.load;
        self.bytes += contribution.bytes;
        self.per_region.insert(region.to_owned(), contribution);
    }

    /// Add write cost to an already-folded region's share.
    pub(crate) fn add_region_primary_load(&mut self, region: &str, write_load: f64) {
        if let Some(share) = self.per_region.get_mut(region) {
            share.primary_load += write_load;
            self.primary_load += write_load;
        }
    }

    pub(crate) fn add_offline(&mut self, members: &BTreeSet<MemberId>) {
        self.offline.extend(members.iter().cloned());
    }

    /// Add a hosting member; `true` when it was not already hosting.
    pub(crate) fn add_host(&mut self, member: MemberId) -> bool {
        self.hosting.insert(member)
    }

    /// Remove a hosting member; `true` when it was hosting. The primary
    /// reference is left untouched, the model reassigns it explicitly.
    pub(crate) fn remove_host(&mut self, member: &MemberId) -> bool {
        self.hosting.remove(member)
    }

    pub(crate) fn set_primary(&mut self, primary: Primary) {
        self.primary = primary;
    }
}

/// Composite ordering key for the redundancy-sorted bucket sets.
///
/// Orders by ascending redundancy (neediest first), then descending load
/// (the bucket most worth placing first), then ascending id so buckets with
/// equal redundancy and load remain distinct set elements.
#[derive(Debug, Clone, Copy)]
pub struct RedundancyKey {
    /// Redundancy at the time the key was computed.
    pub redundancy: isize,
    /// Total bucket load.
    pub load: f64,
    /// The bucket id, as the final tie-break.
    pub id: BucketId,
}

impl Ord for RedundancyKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.redundancy
            .cmp(&other.redundancy)
            .then_with(|| other.load.total_cmp(&self.load))
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for RedundancyKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for RedundancyKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for RedundancyKey {}

#[cfg(test)]
mod tests {
    use super::*;

    fn bucket_with_hosts(id: BucketId, hosts: &[&str]) -> BucketRollup {
        let mut bucket = BucketRollup::new(id);
        for host in hosts {
            bucket.add_host(MemberId::new(*host));
        }
        bucket
    }

    #[test]
    fn test_redundancy_counts_offline_copies() {
        let mut bucket = bucket_with_hosts(0, &["m1", "m2"]);
        assert_eq!(bucket.online_redundancy(), 1);
        assert_eq!(bucket.redundancy(), 1);

        let mut offline = BTreeSet::new();
        offline.insert(MemberId::new("down1"));
        bucket.add_offline(&offline);

        assert_eq!(bucket.online_redundancy(), 1);
        assert_eq!(bucket.redundancy(), 2);
    }

    #[test]
    fn test_empty_bucket_has_negative_redundancy() {
        let bucket = BucketRollup::new(3);
        assert_eq!(bucket.online_redundancy(), -1);
        assert_eq!(bucket.redundancy(), -1);
    }

    #[test]
    fn test_fold_region_accumulates() {
        let mut bucket = BucketRollup::new(0);
        bucket.fold_region(
            "orders",
            RegionBucketLoad {
                load: 2.0,
                primary_load: 0.0,
                bytes: 100,
            },
        );
        bucket.fold_region(
            "order_lines",
            RegionBucketLoad {
                load: 3.0,
                primary_load: 0.0,
                bytes: 400,
            },
        );
        bucket.add_region_primary_load("orders", 1.5);

        assert_eq!(bucket.load(), 5.0);
        assert_eq!(bucket.bytes(), 500);
        assert_eq!(bucket.primary_load(), 1.5);

        let sizes = bucket.region_sizes();
        assert_eq!(sizes["orders"], 100);
        assert_eq!(sizes["order_lines"], 400);
    }

    #[test]
    fn test_redundancy_key_ordering() {
        let needier = RedundancyKey {
            redundancy: 0,
            load: 1.0,
            id: 5,
        };
        let satisfied = RedundancyKey {
            redundancy: 1,
            load: 9.0,
            id: 1,
        };
        // Redundancy dominates load.
        assert!(needier < satisfied);

        let heavy = RedundancyKey {
            redundancy: 0,
            load: 9.0,
            id: 7,
        };
        // Equal redundancy: higher load sorts first.
        assert!(heavy < needier);

        let twin = RedundancyKey {
            redundancy: 0,
            load: 1.0,
            id: 6,
        };
        // Equal redundancy and load: distinct ids stay distinct.
        assert!(needier < twin);
        assert_ne!(needier, twin);
    }
}
