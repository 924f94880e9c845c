//! Phase scheduling scenarios against scripted workers
//!
//! Time is paused in every test, so multi-second delays run instantly and
//! the monitors tick deterministically.

mod common;

use common::{map_items, reduce_items, subdirs, MockWorker};
use mapred::coordinator::{
    FailurePolicy, Phase, PhaseController, PhaseError, SchedulerConfig, WorkerState,
};
use mapred::worker::WorkerProxy;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn controller(workers: &[&Arc<MockWorker>], config: SchedulerConfig) -> PhaseController {
    let proxies: Vec<Arc<dyn WorkerProxy>> = workers
        .iter()
        .map(|w| Arc::clone(w) as Arc<dyn WorkerProxy>)
        .collect();
    PhaseController::new(proxies, config, "wordcount")
}

// ============================================================================
// Worker Loss
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_worker_lost_mid_phase_keeps_accepted_output() {
    let root = tempfile::tempdir().unwrap();
    let a = MockWorker::new("a:1").with_delay(1000).dies_on(3).build();
    let b = MockWorker::new("b:1").with_delay(2500).build();
    let mut controller = controller(&[&a, &b], SchedulerConfig::default());

    let outcome = controller
        .run_phase(Phase::Map, map_items(root.path(), 4))
        .await
        .unwrap();

    // A accepted two items, then went down holding item 3
    assert_eq!(a.task_ids(Phase::Map).len(), 3);
    assert_eq!(a.task_ids(Phase::Map).last(), Some(&3));
    assert!(b.task_ids(Phase::Map).contains(&3));

    let locations: Vec<_> = outcome.accepted_locations.iter().flatten().collect();
    assert_eq!(locations.len(), 4);
    assert_eq!(locations.iter().collect::<HashSet<_>>().len(), 4);
    for (id, location) in locations.iter().enumerate() {
        assert!(location.starts_with(root.path().join(id.to_string())));
        assert!(location.is_dir());
        assert_eq!(subdirs(&root.path().join(id.to_string())).len(), 1);
    }

    assert_eq!(controller.worker_states(), &[WorkerState::Dead, WorkerState::Idle]);
    assert_eq!(outcome.report.stats.workers_lost, 1);
    assert_eq!(outcome.report.stats.failure_requeues, 1);
    assert_eq!(outcome.report.stats.duplicates_discarded, 0);
    assert_eq!(outcome.report.workers_alive, 1);
}

#[tokio::test(start_paused = true)]
async fn test_transport_failure_requeues_to_survivor() {
    let root = tempfile::tempdir().unwrap();
    let a = MockWorker::new("a:1").broken().build();
    let b = MockWorker::new("b:1").build();
    let mut controller = controller(&[&a, &b], SchedulerConfig::default());

    let outcome = controller
        .run_phase(Phase::Map, map_items(root.path(), 3))
        .await
        .unwrap();

    assert_eq!(outcome.report.stats.accepted, 3);
    assert_eq!(outcome.report.stats.workers_lost, 1);
    assert_eq!(outcome.report.stats.failure_requeues, 1);

    // A is never handed work after its first failure
    let failed = a.task_ids(Phase::Map);
    assert_eq!(failed.len(), 1);
    assert!(b.task_ids(Phase::Map).contains(&failed[0]));
    assert_eq!(b.calls().len(), 3);
    assert_eq!(controller.worker_states(), &[WorkerState::Dead, WorkerState::Idle]);
}

#[tokio::test(start_paused = true)]
async fn test_all_workers_dead_reports_livelock() {
    let root = tempfile::tempdir().unwrap();
    let a = MockWorker::new("a:1").build();
    let b = MockWorker::new("b:1").build();
    a.kill();
    b.kill();
    let mut controller = controller(&[&a, &b], SchedulerConfig::default());

    let err = controller
        .run_phase(Phase::Map, map_items(root.path(), 3))
        .await
        .unwrap_err();

    assert_eq!(
        err,
        PhaseError::NoLiveWorkers {
            phase: Phase::Map,
            remaining: 3
        }
    );
    assert_eq!(controller.worker_states(), &[WorkerState::Dead; 2]);
}

#[tokio::test(start_paused = true)]
async fn test_workers_lost_in_map_sit_out_reduce() {
    let root = tempfile::tempdir().unwrap();
    let out = root.path().join("out");
    let a = MockWorker::new("a:1").broken().build();
    let b = MockWorker::new("b:1").with_delay(400).build();
    let mut controller = controller(&[&a, &b], SchedulerConfig::default());

    controller
        .run_phase(Phase::Map, map_items(&root.path().join("map"), 4))
        .await
        .unwrap();
    let a_map_calls = a.calls().len();

    let reduce = controller
        .run_phase(Phase::Reduce, reduce_items(3, &out))
        .await
        .unwrap();

    assert_eq!(reduce.report.stats.accepted, 3);
    assert_eq!(reduce.report.workers_alive, 1);
    assert_eq!(a.calls().len(), a_map_calls);
    assert!(a.task_ids(Phase::Reduce).is_empty());
    assert_eq!(b.task_ids(Phase::Reduce).len(), 3);
}

// ============================================================================
// Speculative Execution
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_straggler_is_speculated_and_original_abandoned() {
    let root = tempfile::tempdir().unwrap();
    let a = MockWorker::new("a:1").with_delay(2000).build();
    let b = MockWorker::new("b:1").with_delay(2000).build();
    let slow = MockWorker::new("slow:1").with_delay(20_000).build();
    let mut controller = controller(&[&a, &b, &slow], SchedulerConfig::default());

    let outcome = controller
        .run_phase(Phase::Map, map_items(root.path(), 8))
        .await
        .unwrap();

    // the slow worker only ever held its first item
    let slow_calls = slow.calls();
    assert_eq!(slow_calls.len(), 1);
    let straggler = slow_calls[0].task_id;
    let straggler_dir = slow_calls[0].output_dir.clone().unwrap();

    // a fast worker won the race and the original never wrote its output
    let accepted = outcome.accepted_locations[straggler].clone().unwrap();
    assert_ne!(accepted, straggler_dir);
    assert!(accepted.is_dir());
    assert!(!straggler_dir.exists());
    assert_eq!(subdirs(&root.path().join(straggler.to_string())), vec![accepted]);

    let stats = outcome.report.stats;
    assert_eq!(stats.accepted, 8);
    assert_eq!(stats.speculative_requeues, 1);
    assert_eq!(stats.duplicates_discarded, 0);
    assert_eq!(stats.workers_lost, 0);
    // the phase did not wait out the 20s original
    assert!(outcome.report.elapsed < Duration::from_secs(20));
    assert_eq!(controller.worker_states(), &[WorkerState::Idle; 3]);
}

#[tokio::test(start_paused = true)]
async fn test_hung_reachable_worker_does_not_hold_phase_open() {
    let root = tempfile::tempdir().unwrap();
    // answers every probe but sits on its first item for an hour
    let hung = MockWorker::new("hung:1").with_task_delay(0, 3_600_000).build();
    let b = MockWorker::new("b:1").build();
    let c = MockWorker::new("c:1").build();
    let mut controller = controller(&[&hung, &b, &c], SchedulerConfig::default());

    let outcome = tokio::time::timeout(
        Duration::from_secs(600),
        controller.run_phase(Phase::Map, map_items(root.path(), 20)),
    )
    .await
    .expect("phase should finish once every item is accepted")
    .unwrap();

    assert_eq!(hung.task_ids(Phase::Map), vec![0]);
    let fast: HashSet<usize> = b
        .task_ids(Phase::Map)
        .into_iter()
        .chain(c.task_ids(Phase::Map))
        .collect();
    assert_eq!(fast, (0..20).collect::<HashSet<_>>());

    let stats = outcome.report.stats;
    assert_eq!(stats.accepted, 20);
    assert_eq!(stats.speculative_requeues, 1);
    assert_eq!(stats.workers_lost, 0);
    assert!(outcome.report.elapsed < Duration::from_secs(60));
    assert!(outcome.accepted_locations.iter().all(Option::is_some));
    assert_eq!(subdirs(&root.path().join("0")).len(), 1);
    assert_eq!(controller.worker_states(), &[WorkerState::Idle; 3]);
}

#[tokio::test(start_paused = true)]
async fn test_uniformly_slow_workers_are_not_speculated() {
    let root = tempfile::tempdir().unwrap();
    let a = MockWorker::new("a:1").with_delay(9000).build();
    let b = MockWorker::new("b:1").with_delay(9000).build();
    let mut controller = controller(&[&a, &b], SchedulerConfig::default());

    let outcome = controller
        .run_phase(Phase::Map, map_items(root.path(), 4))
        .await
        .unwrap();

    assert_eq!(outcome.report.stats.speculative_requeues, 0);
    assert_eq!(a.calls().len() + b.calls().len(), 4);
}

// ============================================================================
// Application Failures
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_application_failure_marks_worker_dead_by_default() {
    let root = tempfile::tempdir().unwrap();
    let a = MockWorker::new("a:1").rejects_all().build();
    let b = MockWorker::new("b:1").with_delay(1500).build();
    let mut controller = controller(&[&a, &b], SchedulerConfig::default());

    let outcome = controller
        .run_phase(Phase::Map, map_items(root.path(), 3))
        .await
        .unwrap();

    assert_eq!(outcome.report.stats.accepted, 3);
    assert_eq!(outcome.report.stats.application_failures, 1);
    assert_eq!(controller.worker_states()[0], WorkerState::Dead);
    assert_eq!(a.calls().len(), 1);
    // only accepted attempts left a directory behind
    for id in 0..3 {
        assert_eq!(subdirs(&root.path().join(id.to_string())).len(), 1);
    }
}

#[tokio::test(start_paused = true)]
async fn test_retry_policy_keeps_worker_and_gives_up_on_bad_item() {
    let root = tempfile::tempdir().unwrap();
    let a = MockWorker::new("a:1").app_fails_on(1).build();
    let config = SchedulerConfig::builder()
        .failure_policy(FailurePolicy::RetryItem { max_attempts: 2 })
        .build()
        .unwrap();
    let mut controller = controller(&[&a], config);

    let err = controller
        .run_phase(Phase::Reduce, reduce_items(3, &root.path().join("out")))
        .await
        .unwrap_err();

    match err {
        PhaseError::ItemExhausted {
            phase,
            item,
            attempts,
            last_error,
        } => {
            assert_eq!(phase, Phase::Reduce);
            assert_eq!(item, 1);
            assert_eq!(attempts, 2);
            assert!(last_error.contains("bad record"));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(controller.worker_states(), &[WorkerState::Idle]);
    assert_eq!(a.task_ids(Phase::Reduce).iter().filter(|&&id| id == 1).count(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_retry_policy_recovers_after_transient_failure() {
    let root = tempfile::tempdir().unwrap();
    let a = MockWorker::new("a:1").app_fails_times(0, 2).build();
    let config = SchedulerConfig::builder()
        .failure_policy(FailurePolicy::RetryItem { max_attempts: 3 })
        .build()
        .unwrap();
    let mut controller = controller(&[&a], config);

    let outcome = controller
        .run_phase(Phase::Map, map_items(root.path(), 2))
        .await
        .unwrap();

    let stats = outcome.report.stats;
    assert_eq!(stats.accepted, 2);
    assert_eq!(stats.application_failures, 2);
    assert_eq!(stats.failure_requeues, 2);
    assert_eq!(stats.workers_lost, 0);
    assert_eq!(a.task_ids(Phase::Map), vec![0, 1, 0, 0]);
    assert_eq!(controller.worker_states(), &[WorkerState::Idle]);
}
