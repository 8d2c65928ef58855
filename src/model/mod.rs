//! The load model: per-member and per-bucket rollups plus the move search.

mod bucket;
mod load_model;
mod member;

pub use bucket::{BucketRollup, Primary, RedundancyKey, RegionBucketLoad};
pub use load_model::LoadModel;
pub use member::{MemberRollup, RefusalReason};
