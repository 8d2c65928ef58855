//! Core identifier and value types used throughout the planner.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a bucket: a fixed shard of a partitioned region's key space.
///
/// Bucket ids are dense indices in `[0, bucket_count)`.
pub type BucketId = u32;

/// Opaque identifier of a cluster member.
///
/// Member ids are ordered and hashable so they can key maps and sorted sets;
/// the planner never interprets their contents.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemberId(String);

impl MemberId {
    /// Create a member id from any string-like value.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MemberId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<String> for MemberId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A proposed relocation of a single bucket.
///
/// `source` is `None` for creations and removals. Equality covers the whole
/// triple: the attempted-move bookkeeping uses `Move` as a set key so the
/// planner never proposes the same move twice in one session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Move {
    /// Member the bucket leaves, if any.
    pub source: Option<MemberId>,
    /// Member the operation acts on: the receiver of a create or transfer,
    /// or the member losing the bucket for a removal.
    pub target: MemberId,
    /// The bucket being acted on.
    pub bucket_id: BucketId,
}

impl Move {
    /// A creation of a new redundant copy on `target`.
    pub fn create(target: MemberId, bucket_id: BucketId) -> Self {
        Self {
            source: None,
            target,
            bucket_id,
        }
    }

    /// A transfer of the bucket (or its primary) from `source` to `target`.
    pub fn transfer(source: MemberId, target: MemberId, bucket_id: BucketId) -> Self {
        Self {
            source: Some(source),
            target,
            bucket_id,
        }
    }

    /// A removal of the copy hosted by `member`.
    pub fn removal(member: MemberId, bucket_id: BucketId) -> Self {
        Self {
            source: None,
            target: member,
            bucket_id,
        }
    }
}

impl fmt::Display for Move {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "bucket {} {} -> {}", self.bucket_id, source, self.target),
            None => write!(f, "bucket {} -> {}", self.bucket_id, self.target),
        }
    }
}

/// Per-member summary produced at the end of a rebalance session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMemberSummary {
    /// The member being summarized.
    pub member_id: MemberId,
    /// Configured memory budget, summed over all colocated regions, in bytes.
    pub max_memory_bytes: u64,
    /// Bytes currently hosted, summed over all hosted buckets.
    pub size_bytes: u64,
    /// Number of buckets hosted.
    pub bucket_count: usize,
    /// Number of buckets for which this member is the primary.
    pub primary_count: usize,
}
