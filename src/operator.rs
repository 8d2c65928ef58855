//! The boundary between the planner and the transport that actually creates,
//! moves, and removes buckets on remote members.
//!
//! The planner is single-threaded by design: one controller thread drives the
//! search/execute loop. The only concurrency seam is bucket creation, which
//! is fire-and-forget: the operator reports the result later through a
//! [`Completion`], possibly from a different thread. Completions do not touch
//! the model directly; they post an [`OperationOutcome`] onto a
//! [`CompletionQueue`] that the controller thread drains at well-defined
//! points.
//!
//! ```text
//!  controller thread                      operator threads
//!  ─────────────────                      ────────────────
//!  create_redundant_bucket(..) ──────────▶ remote create
//!       │                                      │
//!       │          CompletionQueue ◀── completion.success()/failure()
//!       ▼                │
//!  apply_completions() ◀─┘   (outcomes applied on the controller thread)
//! ```

use crate::types::{BucketId, MemberId};
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;

/// Sizes of one bucket in every colocated region, keyed by region name.
///
/// Passed along with each operation so the operator can budget the transfer
/// per region.
pub type ColocatedRegionSizes = HashMap<String, u64>;

/// Executes bucket operations against the cluster.
///
/// `create_redundant_bucket` is asynchronous; the remaining operations are
/// synchronous and report success by return value. A `false` return means
/// the remote operation did not take effect and the planner must not apply
/// the corresponding state change.
pub trait BucketOperator: Send + Sync {
    /// Create a redundant copy of `bucket_id` on `target`. The result is
    /// delivered later through `completion`, possibly from another thread.
    fn create_redundant_bucket(
        &self,
        target: &MemberId,
        bucket_id: BucketId,
        region_sizes: &ColocatedRegionSizes,
        completion: Completion,
    );

    /// Remove the copy of `bucket_id` hosted by `member`.
    fn remove_bucket(
        &self,
        member: &MemberId,
        bucket_id: BucketId,
        region_sizes: &ColocatedRegionSizes,
    ) -> bool;

    /// Move the copy of `bucket_id` from `source` to `target`.
    fn move_bucket(
        &self,
        source: &MemberId,
        target: &MemberId,
        bucket_id: BucketId,
        region_sizes: &ColocatedRegionSizes,
    ) -> bool;

    /// Transfer the primary of `bucket_id` from `source` to `target`.
    fn move_primary(&self, source: &MemberId, target: &MemberId, bucket_id: BucketId) -> bool;

    /// Block until every previously issued asynchronous operation has
    /// invoked its completion.
    fn wait_for_operations(&self);
}

/// Outcome of one asynchronous bucket creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationOutcome {
    /// Member the copy was created on.
    pub target: MemberId,
    /// The bucket that was created.
    pub bucket_id: BucketId,
    /// Whether the remote creation succeeded.
    pub success: bool,
}

/// Single-consumer queue ferrying completion outcomes back to the controller
/// thread. Producers may live on any thread.
#[derive(Default)]
pub struct CompletionQueue {
    outcomes: Mutex<VecDeque<OperationOutcome>>,
    ready: Condvar,
}

impl CompletionQueue {
    /// Create an empty queue.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn push(&self, outcome: OperationOutcome) {
        let mut outcomes = self.outcomes.lock();
        outcomes.push_back(outcome);
        self.ready.notify_one();
    }

    /// Pop the next outcome without blocking.
    pub fn try_pop(&self) -> Option<OperationOutcome> {
        self.outcomes.lock().pop_front()
    }

    /// Pop the next outcome, blocking until one arrives.
    pub fn pop_blocking(&self) -> OperationOutcome {
        let mut outcomes = self.outcomes.lock();
        while outcomes.is_empty() {
            self.ready.wait(&mut outcomes);
        }
        outcomes.pop_front().expect("queue non-empty after wait")
    }

    /// Number of outcomes waiting to be applied.
    pub fn len(&self) -> usize {
        self.outcomes.lock().len()
    }

    /// Whether no outcomes are waiting.
    pub fn is_empty(&self) -> bool {
        self.outcomes.lock().is_empty()
    }
}

impl fmt::Debug for CompletionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionQueue").field("pending", &self.len()).finish()
    }
}

/// Completion handle for one asynchronous bucket creation.
///
/// Exactly one of [`success`](Completion::success) or
/// [`failure`](Completion::failure) must be called; both consume the handle.
/// Safe to call from any thread.
pub struct Completion {
    queue: Arc<CompletionQueue>,
    target: MemberId,
    bucket_id: BucketId,
}

impl Completion {
    pub(crate) fn new(queue: Arc<CompletionQueue>, target: MemberId, bucket_id: BucketId) -> Self {
        Self {
            queue,
            target,
            bucket_id,
        }
    }

    /// Member the creation was issued against.
    pub fn target(&self) -> &MemberId {
        &self.target
    }

    /// Bucket the creation was issued for.
    pub fn bucket_id(&self) -> BucketId {
        self.bucket_id
    }

    /// Report that the remote creation succeeded.
    pub fn success(self) {
        self.finish(true)
    }

    /// Report that the remote creation failed. The planner will revert its
    /// speculative state change when the outcome is applied.
    pub fn failure(self) {
        self.finish(false)
    }

    fn finish(self, success: bool) {
        self.queue.push(OperationOutcome {
            target: self.target,
            bucket_id: self.bucket_id,
            success,
        });
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("target", &self.target)
            .field("bucket_id", &self.bucket_id)
            .finish()
    }
}
