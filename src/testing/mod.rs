//! Testing utilities for the rebalance planner.
//!
//! The centerpiece is [`RecordingOperator`], a [`BucketOperator`] that
//! executes nothing: it records every operation the planner issues and
//! answers with scripted results, so tests can assert on the exact plan and
//! exercise failure handling without a cluster.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     RecordingOperator                     │
//! │                                                           │
//! │  records()           every operation, in issue order      │
//! │  fail_create(..)     script an asynchronous failure       │
//! │  fail_move(..)       script a refused move                │
//! │  defer_completions() hold outcomes until release/wait     │
//! └──────────────────────────────────────────────────────────┘
//! ```

use crate::operator::{BucketOperator, ColocatedRegionSizes, Completion};
use crate::types::{BucketId, MemberId};
use parking_lot::Mutex;
use std::collections::HashSet;

#[cfg(test)]
mod scenarios;

/// One operation issued by the planner, as observed by the operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationRecord {
    /// A redundant-copy creation.
    Create {
        /// Receiving member.
        target: MemberId,
        /// Bucket created.
        bucket_id: BucketId,
    },
    /// A copy removal.
    Remove {
        /// Member losing the copy.
        member: MemberId,
        /// Bucket removed.
        bucket_id: BucketId,
    },
    /// A bucket transfer.
    Move {
        /// Member losing the copy.
        source: MemberId,
        /// Member receiving the copy.
        target: MemberId,
        /// Bucket moved.
        bucket_id: BucketId,
    },
    /// A primary transfer.
    MovePrimary {
        /// Member giving up the primary.
        source: MemberId,
        /// Member taking over the primary.
        target: MemberId,
        /// Bucket whose primary moved.
        bucket_id: BucketId,
    },
}

#[derive(Default)]
struct RecorderState {
    records: Vec<OperationRecord>,
    failing_creates: HashSet<(MemberId, BucketId)>,
    failing_moves: HashSet<(MemberId, MemberId, BucketId)>,
    failing_removes: HashSet<(MemberId, BucketId)>,
    failing_primary_moves: HashSet<(MemberId, MemberId, BucketId)>,
    deferred: Vec<(Completion, bool)>,
    defer: bool,
}

/// A scriptable in-memory [`BucketOperator`].
///
/// By default every operation succeeds and creation completions are
/// delivered synchronously, inside the `create_redundant_bucket` call.
/// Individual operations can be scripted to fail, and completions can be
/// deferred to exercise the asynchronous paths.
#[derive(Default)]
pub struct RecordingOperator {
    state: Mutex<RecorderState>,
}

impl RecordingOperator {
    /// An operator where everything succeeds immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold creation completions until [`release_completions`]
    /// (or [`wait_for_operations`]) instead of delivering them inline.
    ///
    /// [`release_completions`]: Self::release_completions
    /// [`wait_for_operations`]: BucketOperator::wait_for_operations
    pub fn defer_completions(&self) {
        self.state.lock().defer = true;
    }

    /// Script the creation of `bucket_id` on `target` to fail.
    pub fn fail_create(&self, target: impl Into<MemberId>, bucket_id: BucketId) {
        self.state.lock().failing_creates.insert((target.into(), bucket_id));
    }

    /// Script the move of `bucket_id` from `source` to `target` to be refused.
    pub fn fail_move(
        &self,
        source: impl Into<MemberId>,
        target: impl Into<MemberId>,
        bucket_id: BucketId,
    ) {
        self.state
            .lock()
            .failing_moves
            .insert((source.into(), target.into(), bucket_id));
    }

    /// Script the removal of `bucket_id` on `member` to be refused.
    pub fn fail_remove(&self, member: impl Into<MemberId>, bucket_id: BucketId) {
        self.state.lock().failing_removes.insert((member.into(), bucket_id));
    }

    /// Script the primary transfer of `bucket_id` to be refused.
    pub fn fail_primary_move(
        &self,
        source: impl Into<MemberId>,
        target: impl Into<MemberId>,
        bucket_id: BucketId,
    ) {
        self.state
            .lock()
            .failing_primary_moves
            .insert((source.into(), target.into(), bucket_id));
    }

    /// Deliver every deferred completion now.
    pub fn release_completions(&self) {
        let deferred = std::mem::take(&mut self.state.lock().deferred);
        for (completion, success) in deferred {
            if success {
                completion.success();
            } else {
                completion.failure();
            }
        }
    }

    /// Completions currently held back.
    pub fn deferred_count(&self) -> usize {
        self.state.lock().deferred.len()
    }

    /// Every operation issued so far, in order.
    pub fn records(&self) -> Vec<OperationRecord> {
        self.state.lock().records.clone()
    }

    /// Number of operations issued so far.
    pub fn record_count(&self) -> usize {
        self.state.lock().records.len()
    }
}

impl BucketOperator for RecordingOperator {
    fn create_redundant_bucket(
        &self,
        target: &MemberId,
        bucket_id: BucketId,
        _region_sizes: &ColocatedRegionSizes,
        completion: Completion,
    ) {
        let success;
        {
            let mut state = self.state.lock();
            state.records.push(OperationRecord::Create {
                target: target.clone(),
                bucket_id,
            });
            success = !state.failing_creates.contains(&(target.clone(), bucket_id));
            if state.defer {
                state.deferred.push((completion, success));
                return;
            }
        }
        if success {
            completion.success();
        } else {
            completion.failure();
        }
    }

    fn remove_bucket(
        &self,
        member: &MemberId,
        bucket_id: BucketId,
        _region_sizes: &ColocatedRegionSizes,
    ) -> bool {
        let mut state = self.state.lock();
        state.records.push(OperationRecord::Remove {
            member: member.clone(),
            bucket_id,
        });
        !state.failing_removes.contains(&(member.clone(), bucket_id))
    }

    fn move_bucket(
        &self,
        source: &MemberId,
        target: &MemberId,
        bucket_id: BucketId,
        _region_sizes: &ColocatedRegionSizes,
    ) -> bool {
        let mut state = self.state.lock();
        state.records.push(OperationRecord::Move {
            source: source.clone(),
            target: target.clone(),
            bucket_id,
        });
        !state.failing_moves.contains(&(source.clone(), target.clone(), bucket_id))
    }

    fn move_primary(&self, source: &MemberId, target: &MemberId, bucket_id: BucketId) -> bool {
        let mut state = self.state.lock();
        state.records.push(OperationRecord::MovePrimary {
            source: source.clone(),
            target: target.clone(),
            bucket_id,
        });
        !state.failing_primary_moves.contains(&(source.clone(), target.clone(), bucket_id))
    }

    fn wait_for_operations(&self) {
        self.release_completions();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operator::CompletionQueue;

    #[test]
    fn test_records_preserve_order() {
        let operator = RecordingOperator::new();
        let queue = CompletionQueue::new();
        let sizes = ColocatedRegionSizes::new();

        operator.create_redundant_bucket(
            &MemberId::new("m1"),
            0,
            &sizes,
            Completion::new(queue.clone(), MemberId::new("m1"), 0),
        );
        assert!(operator.move_bucket(&MemberId::new("m1"), &MemberId::new("m2"), 0, &sizes));
        assert!(operator.remove_bucket(&MemberId::new("m2"), 0, &sizes));

        let records = operator.records();
        assert_eq!(records.len(), 3);
        assert_eq!(
            records[0],
            OperationRecord::Create {
                target: MemberId::new("m1"),
                bucket_id: 0
            }
        );
        assert!(matches!(records[1], OperationRecord::Move { .. }));
        assert!(matches!(records[2], OperationRecord::Remove { .. }));
        // The inline completion was delivered.
        assert!(queue.try_pop().unwrap().success);
    }

    #[test]
    fn test_scripted_failures() {
        let operator = RecordingOperator::new();
        operator.fail_move("m1", "m2", 3);
        operator.fail_remove("m1", 3);
        let sizes = ColocatedRegionSizes::new();

        assert!(!operator.move_bucket(&MemberId::new("m1"), &MemberId::new("m2"), 3, &sizes));
        assert!(operator.move_bucket(&MemberId::new("m1"), &MemberId::new("m2"), 4, &sizes));
        assert!(!operator.remove_bucket(&MemberId::new("m1"), 3, &sizes));
        assert!(operator.move_primary(&MemberId::new("m1"), &MemberId::new("m2"), 3));
    }

    #[test]
    fn test_deferred_completions() {
        let operator = RecordingOperator::new();
        operator.defer_completions();
        operator.fail_create("m2", 1);
        let queue = CompletionQueue::new();
        let sizes = ColocatedRegionSizes::new();

        operator.create_redundant_bucket(
            &MemberId::new("m1"),
            0,
            &sizes,
            Completion::new(queue.clone(), MemberId::new("m1"), 0),
        );
        operator.create_redundant_bucket(
            &MemberId::new("m2"),
            1,
            &sizes,
            Completion::new(queue.clone(), MemberId::new("m2"), 1),
        );
        assert_eq!(operator.deferred_count(), 2);
        assert!(queue.is_empty());

        operator.wait_for_operations();
        assert_eq!(operator.deferred_count(), 0);
        assert!(queue.try_pop().unwrap().success);
        assert!(!queue.try_pop().unwrap().success);
    }
}
