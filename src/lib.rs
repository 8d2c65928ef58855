//! Rebalance planner for partitioned, bucket-sharded regions.
//!
//! This crate plans redundancy repair and load balancing for a cluster that
//! shards region data into fixed buckets:
//! - **Load model** built from per-member, per-region snapshots, aggregated
//!   across colocated regions
//! - **Variance-minimizing search** for bucket and primary moves, weighted
//!   by per-member capacity
//! - **Redundancy repair** that creates missing copies and removes
//!   over-redundant or zone-duplicated ones
//!
//! # Features
//!
//! - Greedy bucket and primary placement that equalizes weighted load
//! - Redundancy-zone and same-host placement constraints
//! - Colocated regions balanced as one unit
//! - Fixed-partition regions with statically assigned targets
//! - Asynchronous creation with revert-on-failure, applied on a single
//!   controller thread
//!
//! # Example
//!
//! ```rust,no_run
//! use tamp::{
//!     DirectorConfig, LoadModel, MemberLoadDetail, ModelConfig, NoZones,
//!     OfflineMemberDetails, RebalanceDirector,
//! };
//! use std::sync::Arc;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // An operator connects the planner to the cluster transport.
//!     let operator = Arc::new(tamp::testing::RecordingOperator::new());
//!
//!     // Snapshot: member-1 hosts both buckets, member-2 is empty.
//!     let details = vec![
//!         MemberLoadDetail::new("member-1", "host-a", 1.0, 1 << 30)
//!             .with_bucket(0, 2.0, 1.0, 4096)
//!             .with_bucket(1, 2.0, 1.0, 4096),
//!         MemberLoadDetail::new("member-2", "host-b", 1.0, 1 << 30),
//!     ];
//!
//!     let config = ModelConfig::new("orders", 2).with_required_redundancy(1);
//!     let mut model = LoadModel::new(operator, Arc::new(NoZones), config)?;
//!     model.add_region("orders", &details, &OfflineMemberDetails::empty(), false)?;
//!
//!     let stats = RebalanceDirector::new(DirectorConfig::all()).run(&mut model)?;
//!     println!("created {} copies:\n{}", stats.buckets_created, model.table_string());
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │       Snapshots (per member, per region)    │
//! │  MemberLoadDetail · OfflineMemberDetails    │
//! └─────────────────────────────────────────────┘
//!                     │ add_region()
//!                     ▼
//! ┌─────────────────────────────────────────────┐
//! │                 LoadModel                   │
//! │  MemberRollup · BucketRollup · Primary      │
//! │  low/over-redundancy sets · move search     │
//! └─────────────────────────────────────────────┘
//!                     │ find_best_* / create/move/remove
//!                     ▼
//! ┌─────────────────────────────────────────────┐
//! │             RebalanceDirector               │
//! │  restore → remove-over → move → primaries   │
//! └─────────────────────────────────────────────┘
//!                     │ BucketOperator
//!                     ▼
//! ┌─────────────────────────────────────────────┐
//! │          Cluster transport (yours)          │
//! │  async creates report back via Completion   │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! The planner is deliberately single-threaded: one controller thread owns
//! the model, and asynchronous creation outcomes are ferried back to it over
//! a completion queue instead of mutating shared state.

pub mod config;
pub mod director;
pub mod error;
pub mod model;
pub mod operator;
pub mod snapshot;
pub mod testing;
pub mod types;
pub mod zones;

pub use config::{DirectorConfig, ModelConfig};
pub use director::{RebalanceDirector, RebalanceStats};
pub use error::{Error, Result};
pub use model::{BucketRollup, LoadModel, MemberRollup, Primary, RefusalReason};
pub use operator::{
    BucketOperator, ColocatedRegionSizes, Completion, CompletionQueue, OperationOutcome,
};
pub use snapshot::{FixedPartitionSpec, MemberLoadDetail, OfflineMemberDetails};
pub use types::{BucketId, MemberId, Move, PartitionMemberSummary};
pub use zones::{NoZones, StaticZoneMap, ZonePolicy};
