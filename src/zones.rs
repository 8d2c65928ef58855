//! Redundancy-zone lookups consumed by the admission checks.
//!
//! A redundancy zone is a logical failure domain (a rack, an availability
//! zone). When zone uniqueness is enforced, the planner refuses to place two
//! copies of a bucket in the same zone and treats existing zone duplicates
//! as over-redundancy to be repaired.

use crate::types::MemberId;
use std::collections::BTreeMap;

/// Answers which failure zone a member belongs to and whether the cluster
/// forbids two copies of a bucket in the same zone.
///
/// Zone classification is owned by the surrounding cluster-membership
/// service; the planner only consumes it through this trait.
pub trait ZonePolicy: Send + Sync {
    /// Whether two copies of a bucket may never share a zone.
    fn enforce_unique_zones(&self) -> bool;

    /// The zone a member belongs to, if classified.
    fn zone_of(&self, member: &MemberId) -> Option<String>;

    /// Whether two members are in the same zone. Unclassified members are
    /// never considered colocated.
    fn same_zone(&self, a: &MemberId, b: &MemberId) -> bool {
        match (self.zone_of(a), self.zone_of(b)) {
            (Some(za), Some(zb)) => za == zb,
            _ => false,
        }
    }
}

/// Policy for clusters without redundancy zones.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoZones;

impl ZonePolicy for NoZones {
    fn enforce_unique_zones(&self) -> bool {
        false
    }

    fn zone_of(&self, _member: &MemberId) -> Option<String> {
        None
    }
}

/// Fixed member-to-zone table, typically built once from cluster
/// configuration at the start of a session.
#[derive(Debug, Clone, Default)]
pub struct StaticZoneMap {
    zones: BTreeMap<MemberId, String>,
    enforce: bool,
}

impl StaticZoneMap {
    /// Create an empty table.
    pub fn new(enforce_unique_zones: bool) -> Self {
        Self {
            zones: BTreeMap::new(),
            enforce: enforce_unique_zones,
        }
    }

    /// Assign a member to a zone.
    pub fn with_member_zone(
        mut self,
        member: impl Into<MemberId>,
        zone: impl Into<String>,
    ) -> Self {
        self.zones.insert(member.into(), zone.into());
        self
    }
}

impl ZonePolicy for StaticZoneMap {
    fn enforce_unique_zones(&self) -> bool {
        self.enforce
    }

    fn zone_of(&self, member: &MemberId) -> Option<String> {
        self.zones.get(member).cloned()
    }
}
