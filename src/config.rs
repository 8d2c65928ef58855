//! Configuration types for rebalance sessions.

use crate::types::MemberId;
use std::collections::BTreeSet;

/// Parameters of a single rebalance session.
///
/// One model is built per session; a new session starts from fresh
/// snapshots and a fresh config.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// Name of the leading colocated region, used in diagnostics.
    pub region_name: String,
    /// Total number of buckets in the region (`bucket ids are [0, count)`).
    pub bucket_count: usize,
    /// Number of extra copies every bucket should have.
    pub required_redundancy: usize,
    /// Members over their memory threshold; they never receive new load.
    pub critical_members: BTreeSet<MemberId>,
}

impl ModelConfig {
    /// Create a config with no required redundancy and no critical members.
    pub fn new(region_name: impl Into<String>, bucket_count: usize) -> Self {
        Self {
            region_name: region_name.into(),
            bucket_count,
            required_redundancy: 0,
            critical_members: BTreeSet::new(),
        }
    }

    /// Set the required redundancy level.
    pub fn with_required_redundancy(mut self, redundancy: usize) -> Self {
        self.required_redundancy = redundancy;
        self
    }

    /// Mark a member as critical.
    pub fn with_critical_member(mut self, member: impl Into<MemberId>) -> Self {
        self.critical_members.insert(member.into());
        self
    }

    /// Mark a set of members as critical.
    pub fn with_critical_members(mut self, members: impl IntoIterator<Item = MemberId>) -> Self {
        self.critical_members.extend(members);
        self
    }
}

/// Which phases a [`RebalanceDirector`](crate::director::RebalanceDirector)
/// session runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectorConfig {
    /// Create copies for buckets below the required redundancy.
    pub restore_redundancy: bool,
    /// Remove copies beyond the required redundancy.
    pub remove_over_redundancy: bool,
    /// Move buckets to even out weighted load.
    pub move_buckets: bool,
    /// Move primaries to even out weighted primary load.
    pub move_primaries: bool,
}

impl Default for DirectorConfig {
    fn default() -> Self {
        Self {
            restore_redundancy: true,
            remove_over_redundancy: true,
            move_buckets: true,
            move_primaries: true,
        }
    }
}

impl DirectorConfig {
    /// Run every phase.
    pub fn all() -> Self {
        Self::default()
    }

    /// Only repair redundancy, without relocating load.
    pub fn redundancy_only() -> Self {
        Self {
            restore_redundancy: true,
            remove_over_redundancy: true,
            move_buckets: false,
            move_primaries: false,
        }
    }

    /// Enable or disable redundancy restoration.
    pub fn with_restore_redundancy(mut self, enabled: bool) -> Self {
        self.restore_redundancy = enabled;
        self
    }

    /// Enable or disable over-redundancy removal.
    pub fn with_remove_over_redundancy(mut self, enabled: bool) -> Self {
        self.remove_over_redundancy = enabled;
        self
    }

    /// Enable or disable bucket moves.
    pub fn with_move_buckets(mut self, enabled: bool) -> Self {
        self.move_buckets = enabled;
        self
    }

    /// Enable or disable primary moves.
    pub fn with_move_primaries(mut self, enabled: bool) -> Self {
        self.move_primaries = enabled;
        self
    }
}
