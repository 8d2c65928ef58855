//! End-to-end planner scenarios driven through [`RecordingOperator`].

use crate::config::{DirectorConfig, ModelConfig};
use crate::director::RebalanceDirector;
use crate::model::LoadModel;
use crate::snapshot::{MemberLoadDetail, OfflineMemberDetails};
use crate::testing::{OperationRecord, RecordingOperator};
use crate::types::{MemberId, Move};
use crate::zones::{NoZones, StaticZoneMap, ZonePolicy};
use std::sync::Arc;
use std::thread;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn detail(id: &str, host: &str, weight: f64) -> MemberLoadDetail {
    MemberLoadDetail::new(id, host, weight, u64::MAX)
}

fn new_model(
    operator: Arc<RecordingOperator>,
    zones: Arc<dyn ZonePolicy>,
    bucket_count: usize,
    redundancy: usize,
    details: Vec<MemberLoadDetail>,
) -> LoadModel {
    init_tracing();
    let config = ModelConfig::new("orders", bucket_count).with_required_redundancy(redundancy);
    let mut model = LoadModel::new(operator, zones, config).unwrap();
    model
        .add_region("orders", &details, &OfflineMemberDetails::empty(), false)
        .unwrap();
    model.initialize();
    model
}

#[test]
fn test_two_members_converge_to_equal_load() {
    // Four buckets of load 1 on x only; required redundancy 1.
    let operator = Arc::new(RecordingOperator::new());
    let mut x = detail("x", "host1", 1.0);
    for bucket_id in 0..4 {
        x = x.with_bucket(bucket_id, 1.0, 1.0, 10);
    }
    let mut model = new_model(
        operator.clone(),
        Arc::new(NoZones),
        4,
        1,
        vec![x, detail("y", "host2", 1.0)],
    );

    for bucket_id in 0..4 {
        let mv = model.find_best_target(bucket_id, true).unwrap();
        assert_eq!(mv.target, MemberId::new("y"));
        model.create_redundant_bucket(&mv).unwrap();
    }
    model.wait_for_operations();

    let x_load = model.member(&MemberId::new("x")).unwrap().total_load();
    let y_load = model.member(&MemberId::new("y")).unwrap().total_load();
    assert_eq!(x_load, 4.0);
    assert_eq!(y_load, 4.0);
    let average = model.average_load();
    for member in model.members() {
        assert!((member.weighted_load() - average).abs() < 1e-9);
    }
    assert_eq!(operator.record_count(), 4);
}

#[test]
fn test_heavier_weight_wins_target_selection() {
    // One bucket of load 10 on a; c carries twice the weight of b, so the
    // post-add cost 10/2 beats 10/1.
    let operator = Arc::new(RecordingOperator::new());
    let details = vec![
        detail("a", "host1", 1.0).with_bucket(0, 10.0, 1.0, 10),
        detail("b", "host2", 1.0),
        detail("c", "host3", 2.0),
    ];
    let model = new_model(operator, Arc::new(NoZones), 1, 1, details);

    let mv = model.find_best_target(0, true).unwrap();
    assert_eq!(mv.target, MemberId::new("c"));
}

#[test]
fn test_zone_duplicate_is_repaired_across_zones() {
    // Both copies of bucket 7 live in z1; the planner must add a z2 copy
    // and then drop one of the z1 copies.
    let operator = Arc::new(RecordingOperator::new());
    let zones = Arc::new(
        StaticZoneMap::new(true)
            .with_member_zone("a", "z1")
            .with_member_zone("b", "z1")
            .with_member_zone("c", "z2"),
    );
    let details = vec![
        detail("a", "host1", 1.0).with_bucket(7, 1.0, 1.0, 10),
        detail("b", "host2", 1.0).with_bucket(7, 1.0, 0.0, 10),
        detail("c", "host3", 1.0),
    ];
    let mut model = new_model(operator.clone(), zones, 8, 1, details);

    assert!(model.is_over_redundancy(7));
    assert!(model.is_low_redundancy(7));

    let stats = RebalanceDirector::new(DirectorConfig::redundancy_only())
        .run(&mut model)
        .unwrap();

    assert_eq!(stats.buckets_created, 1);
    assert_eq!(stats.buckets_removed, 1);
    let bucket = model.bucket(7).unwrap();
    assert!(bucket.is_hosted_by(&MemberId::new("c")));
    assert!(bucket.primary().is(&MemberId::new("a")));
    assert!(!bucket.is_hosted_by(&MemberId::new("b")));
    assert!(!model.is_over_redundancy(7));
    assert!(!model.is_low_redundancy(7));
}

#[test]
fn test_member_absent_from_a_colocated_region_is_excluded() {
    let operator = Arc::new(RecordingOperator::new());
    let config = ModelConfig::new("orders", 2).with_required_redundancy(1);
    let mut model = LoadModel::new(operator, Arc::new(NoZones), config).unwrap();

    let orders = vec![
        detail("a", "host1", 1.0).with_bucket(0, 1.0, 1.0, 10),
        detail("b", "host2", 1.0).with_bucket(0, 1.0, 0.0, 10),
    ];
    let lines = vec![detail("a", "host1", 1.0).with_bucket(0, 2.0, 1.0, 20)];
    model.add_region("orders", &orders, &OfflineMemberDetails::empty(), false).unwrap();
    model.add_region("order_lines", &lines, &OfflineMemberDetails::empty(), false).unwrap();
    model.initialize();

    assert!(model.member(&MemberId::new("b")).is_none());
    assert!(!model.bucket(0).unwrap().is_hosted_by(&MemberId::new("b")));
    // With b gone the bucket is back to a single copy.
    assert!(model.is_low_redundancy(0));
}

#[test]
fn test_async_failure_from_another_thread_is_reverted() {
    let operator = Arc::new(RecordingOperator::new());
    operator.defer_completions();
    operator.fail_create("b", 0);
    let details = vec![
        detail("a", "host1", 1.0).with_bucket(0, 1.0, 1.0, 10),
        detail("b", "host2", 1.0),
    ];
    let mut model = new_model(operator.clone(), Arc::new(NoZones), 1, 1, details);

    let mv = model.find_best_target(0, true).unwrap();
    model.create_redundant_bucket(&mv).unwrap();

    // The speculative change is visible while the operation is in flight.
    assert!(model.bucket(0).unwrap().is_hosted_by(&MemberId::new("b")));
    assert_eq!(model.outstanding_creations(), 1);

    // The outcome arrives from a different thread; the model applies it on
    // this one.
    let remote = Arc::clone(&operator);
    let handle = thread::spawn(move || remote.release_completions());
    handle.join().unwrap();
    model.wait_for_operations();

    assert_eq!(model.outstanding_creations(), 0);
    assert!(!model.bucket(0).unwrap().is_hosted_by(&MemberId::new("b")));
    assert!(model.is_low_redundancy(0));
}

#[test]
fn test_move_loop_terminates_with_a_refusing_operator() {
    // The operator refuses every move; the attempted-move set must still
    // drive the search to exhaustion instead of spinning.
    let operator = Arc::new(RecordingOperator::new());
    for bucket_id in 0..4 {
        operator.fail_move("a", "b", bucket_id);
    }
    let mut a = detail("a", "host1", 1.0);
    for bucket_id in 0..4 {
        a = a.with_bucket(bucket_id, 1.0, 1.0, 10);
    }
    let mut model = new_model(
        operator.clone(),
        Arc::new(NoZones),
        4,
        0,
        vec![a, detail("b", "host2", 1.0)],
    );

    let mut proposals = 0;
    while let Some(mv) = model.find_best_bucket_move() {
        assert!(!model.move_bucket(&mv).unwrap());
        proposals += 1;
        assert!(proposals <= 8, "search proposed more moves than (member, bucket) pairs");
    }
    assert_eq!(proposals, 4);
    // Nothing actually moved.
    assert_eq!(model.member(&MemberId::new("a")).unwrap().total_load(), 4.0);
    assert_eq!(model.member(&MemberId::new("b")).unwrap().total_load(), 0.0);
}

#[test]
fn test_weighted_cluster_balances_proportionally() {
    // Member c has weight 2 and should end up with half the buckets.
    let operator = Arc::new(RecordingOperator::new());
    let mut a = detail("a", "host1", 1.0);
    for bucket_id in 0..8 {
        a = a.with_bucket(bucket_id, 1.0, 1.0, 10);
    }
    let details = vec![a, detail("b", "host2", 1.0), detail("c", "host3", 2.0)];
    let mut model = new_model(operator, Arc::new(NoZones), 8, 0, details);

    let stats = RebalanceDirector::new(DirectorConfig::all()).run(&mut model).unwrap();

    assert!(stats.buckets_moved > 0);
    assert_eq!(model.member(&MemberId::new("a")).unwrap().total_load(), 2.0);
    assert_eq!(model.member(&MemberId::new("b")).unwrap().total_load(), 2.0);
    assert_eq!(model.member(&MemberId::new("c")).unwrap().total_load(), 4.0);
}

#[test]
fn test_plan_is_recorded_in_issue_order() {
    let operator = Arc::new(RecordingOperator::new());
    let details = vec![
        detail("a", "host1", 1.0).with_bucket(0, 1.0, 1.0, 10),
        detail("b", "host2", 1.0),
    ];
    let mut model = new_model(operator.clone(), Arc::new(NoZones), 1, 1, details);

    RebalanceDirector::new(DirectorConfig::all()).run(&mut model).unwrap();

    let records = operator.records();
    assert_eq!(
        records,
        vec![OperationRecord::Create {
            target: MemberId::new("b"),
            bucket_id: 0
        }]
    );
}

#[test]
fn test_colocated_load_moves_as_one_unit() {
    // Two colocated regions contribute to the same buckets; the balancer
    // moves the combined load and hands the operator per-region sizes.
    let operator = Arc::new(RecordingOperator::new());
    let config = ModelConfig::new("orders", 2);
    let mut model = LoadModel::new(operator.clone(), Arc::new(NoZones), config).unwrap();

    let orders = vec![
        detail("a", "host1", 1.0).with_bucket(0, 2.0, 1.0, 100).with_bucket(1, 2.0, 1.0, 100),
        detail("b", "host2", 1.0),
    ];
    let lines = vec![
        detail("a", "host1", 1.0).with_bucket(0, 2.0, 1.0, 300).with_bucket(1, 2.0, 1.0, 300),
        detail("b", "host2", 1.0),
    ];
    model.add_region("orders", &orders, &OfflineMemberDetails::empty(), false).unwrap();
    model.add_region("order_lines", &lines, &OfflineMemberDetails::empty(), false).unwrap();

    let stats = RebalanceDirector::new(DirectorConfig::all()).run(&mut model).unwrap();

    assert_eq!(stats.buckets_moved, 1);
    // Both regions' bytes travel with the bucket.
    assert_eq!(stats.bytes_transferred, 400);
    assert_eq!(model.member(&MemberId::new("a")).unwrap().total_load(), 4.0);
    assert_eq!(model.member(&MemberId::new("b")).unwrap().total_load(), 4.0);
    let moved = operator
        .records()
        .iter()
        .any(|record| matches!(record, OperationRecord::Move { .. }));
    assert!(moved);
}

#[test]
fn test_duplicate_proposal_is_rejected() {
    let operator = Arc::new(RecordingOperator::new());
    operator.fail_primary_move("a", "b", 0);
    let details = vec![
        detail("a", "host1", 1.0).with_bucket(0, 1.0, 2.0, 10),
        detail("b", "host2", 1.0).with_bucket(0, 1.0, 0.0, 10),
    ];
    let mut model = new_model(operator, Arc::new(NoZones), 1, 1, details);

    let mv = Move::transfer(MemberId::new("a"), MemberId::new("b"), 0);
    assert!(!model.move_primary(&mv).unwrap());
    assert!(model.move_primary(&mv).is_err());
}
