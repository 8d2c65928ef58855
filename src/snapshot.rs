//! Per-region input snapshots consumed by the load model.
//!
//! One [`MemberLoadDetail`] is collected from every member hosting a region
//! and handed to [`LoadModel::add_region`](crate::model::LoadModel::add_region).
//! The tables are indexed by bucket id; a nonzero read load marks the member
//! as hosting that bucket, a nonzero write load marks it as the primary.

use crate::types::{BucketId, MemberId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Statically configured partition assignment for fixed-partition regions.
///
/// For these regions the planner may not choose targets freely: each bucket
/// id belongs to exactly one named partition, and redundant copies may only
/// be created on the member configured as that partition's secondary host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedPartitionSpec {
    /// Partition name from region configuration.
    pub name: String,
    /// Whether this member holds the primary assignment of the partition.
    pub is_primary: bool,
    /// First bucket id covered by the partition.
    pub first_bucket: BucketId,
    /// Number of consecutive bucket ids covered.
    pub num_buckets: u32,
}

impl FixedPartitionSpec {
    /// Create a spec covering `[first_bucket, first_bucket + num_buckets)`.
    pub fn new(
        name: impl Into<String>,
        is_primary: bool,
        first_bucket: BucketId,
        num_buckets: u32,
    ) -> Self {
        Self {
            name: name.into(),
            is_primary,
            first_bucket,
            num_buckets,
        }
    }

    /// Whether the partition covers the given bucket id.
    pub fn covers(&self, bucket_id: BucketId) -> bool {
        bucket_id >= self.first_bucket && bucket_id < self.first_bucket + self.num_buckets
    }
}

/// One member's contribution to a region snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberLoadDetail {
    /// The reporting member.
    pub member_id: MemberId,
    /// Machine address of the member, used for optional same-host exclusion
    /// when placing redundant copies.
    pub host: String,
    /// Relative allocation share of this member (capacity-normalized).
    pub weight: f64,
    /// Configured memory budget for this region on this member, in bytes.
    pub max_memory_bytes: u64,
    /// Per-bucket read load. Indexed by bucket id; missing entries are zero.
    pub bucket_read_load: Vec<f64>,
    /// Per-bucket write load. Nonzero marks this member as the primary.
    pub bucket_write_load: Vec<f64>,
    /// Per-bucket stored bytes.
    pub bucket_sizes: Vec<u64>,
    /// Fixed partitions hosted by this member; empty for ordinary regions.
    pub fixed_partitions: Vec<FixedPartitionSpec>,
}

impl MemberLoadDetail {
    /// Create a detail record with empty load tables.
    pub fn new(
        member_id: impl Into<MemberId>,
        host: impl Into<String>,
        weight: f64,
        max_memory_bytes: u64,
    ) -> Self {
        Self {
            member_id: member_id.into(),
            host: host.into(),
            weight,
            max_memory_bytes,
            bucket_read_load: Vec::new(),
            bucket_write_load: Vec::new(),
            bucket_sizes: Vec::new(),
            fixed_partitions: Vec::new(),
        }
    }

    /// Record one hosted bucket: read load, write load, and size.
    ///
    /// A nonzero `write_load` declares this member the bucket's primary.
    pub fn with_bucket(
        mut self,
        bucket_id: BucketId,
        read_load: f64,
        write_load: f64,
        size_bytes: u64,
    ) -> Self {
        let idx = bucket_id as usize;
        if self.bucket_read_load.len() <= idx {
            self.bucket_read_load.resize(idx + 1, 0.0);
            self.bucket_write_load.resize(idx + 1, 0.0);
            self.bucket_sizes.resize(idx + 1, 0);
        }
        self.bucket_read_load[idx] = read_load;
        self.bucket_write_load[idx] = write_load;
        self.bucket_sizes[idx] = size_bytes;
        self
    }

    /// Attach a fixed-partition assignment.
    pub fn with_fixed_partition(mut self, spec: FixedPartitionSpec) -> Self {
        self.fixed_partitions.push(spec);
        self
    }

    /// Read load for a bucket; zero when the table is shorter.
    pub fn read_load(&self, bucket_id: BucketId) -> f64 {
        self.bucket_read_load.get(bucket_id as usize).copied().unwrap_or(0.0)
    }

    /// Write load for a bucket; zero when the table is shorter.
    pub fn write_load(&self, bucket_id: BucketId) -> f64 {
        self.bucket_write_load.get(bucket_id as usize).copied().unwrap_or(0.0)
    }

    /// Stored bytes for a bucket; zero when the table is shorter.
    pub fn bucket_size(&self, bucket_id: BucketId) -> u64 {
        self.bucket_sizes.get(bucket_id as usize).copied().unwrap_or(0)
    }
}

/// Persistent members that historically hosted buckets but are currently
/// offline, indexed by bucket id.
///
/// Offline copies count toward a bucket's redundancy so the planner does not
/// recreate copies that will come back when their member restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OfflineMemberDetails {
    per_bucket: Vec<BTreeSet<MemberId>>,
}

impl OfflineMemberDetails {
    /// No offline members for any bucket.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Record an offline member for a bucket.
    pub fn with_offline(mut self, bucket_id: BucketId, member: impl Into<MemberId>) -> Self {
        let idx = bucket_id as usize;
        if self.per_bucket.len() <= idx {
            self.per_bucket.resize(idx + 1, BTreeSet::new());
        }
        self.per_bucket[idx].insert(member.into());
        self
    }

    /// Offline members recorded for a bucket, if any.
    pub fn offline_members(&self, bucket_id: BucketId) -> Option<&BTreeSet<MemberId>> {
        self.per_bucket.get(bucket_id as usize).filter(|set| !set.is_empty())
    }
}
