//! Batch fan-out and fan-in tests.
//!
//! These tests verify that the tasks of a batch run concurrently, that
//! one failure does not stop its siblings, and that results merge in a
//! deterministic order whatever order they finish in.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use conductor::core::{TaskGraph, TaskStatus};
use conductor::orchestration::{EngineConfig, ExecutionEngine, ResolutionStatus, StageRegistry};
use conductor::workflow::{RunInput, RunStatus};

use crate::fixtures::{failing_stage, independent_graph, ok_stage, slow_stage, test_task};

/// Test: One failure in a batch
/// Given a batch of three independent tasks where one always fails
/// When the run executes
/// Then the other two complete, only the failed one escalates and the
/// next batch still runs
#[tokio::test]
async fn test_batch_failure_does_not_stop_siblings() {
    let a = test_task("a");
    let b = test_task("b");
    let c = test_task("c").with_max_retries(0);
    let next = test_task("next").depends_on(a.id).depends_on(b.id);
    let graph = TaskGraph::from_tasks(vec![a, b, c, next]).unwrap();

    let (broken, calls) = failing_stage("c", "compiler crashed");
    let stages = StageRegistry::new()
        .with(ok_stage("a"))
        .with(ok_stage("b"))
        .with(broken)
        .with(ok_stage("next"));
    let engine = ExecutionEngine::new(stages);

    let report = engine.execute(&graph, RunInput::new("x")).await.unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.completed, 3);
    assert_eq!(report.failed, 1);
    assert_eq!(report.cancelled, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    assert!(report.output("a").is_some());
    assert!(report.output("b").is_some());
    assert!(report.output("next").is_some());
    assert!(report.output("c").is_none());

    assert_eq!(report.escalations.len(), 1);
    assert_eq!(report.escalations[0].task_name, "c");
    assert_eq!(report.escalations[0].status, ResolutionStatus::ManualReview);
    assert!(matches!(report.task_statuses["c"], TaskStatus::Failed { .. }));
    assert_eq!(report.task_statuses["next"], TaskStatus::Completed);
}

/// Test: Failed dependency cancels dependents
/// Given b depends on a and a fails permanently
/// When the run executes
/// Then b is cancelled without running
#[tokio::test]
async fn test_failed_task_cancels_dependents() {
    let a = test_task("a").with_max_retries(0);
    let b = test_task("b").depends_on(a.id);
    let c = test_task("c").depends_on(b.id);
    let graph = TaskGraph::from_tasks(vec![a, b, c]).unwrap();

    let (broken, _) = failing_stage("a", "boom");
    let stages = StageRegistry::new()
        .with(broken)
        .with(ok_stage("b"))
        .with(ok_stage("c"));
    let engine = ExecutionEngine::new(stages);

    let report = engine.execute(&graph, RunInput::new("x")).await.unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.failed, 1);
    assert_eq!(report.cancelled, 2);
    assert!(matches!(
        report.task_statuses["c"],
        TaskStatus::Cancelled { ref reason } if reason.contains("a")
    ));
    assert_eq!(report.results.len(), 1);
    assert!(!report.state.warnings().is_empty());
}

/// Test: Concurrent fan-out
/// Given four independent tasks that each sleep 100ms
/// When the run executes without a parallelism cap
/// Then the batch takes about as long as one task
#[tokio::test]
async fn test_batch_runs_concurrently() {
    let names = ["w", "x", "y", "z"];
    let graph = independent_graph(&names);
    let stages = names.iter().fold(StageRegistry::new(), |registry, name| {
        registry.with(slow_stage(name, Duration::from_millis(100)))
    });
    let engine = ExecutionEngine::new(stages);

    let started = Instant::now();
    let report = engine.execute(&graph, RunInput::new("x")).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.batches.len(), 1);
    assert!(
        elapsed < Duration::from_millis(350),
        "Batch of 4 x 100ms took {:?}, expected concurrent execution",
        elapsed
    );
}

/// Test: Deterministic merge order
/// Given a batch whose first task finishes last
/// When the run executes
/// Then results still merge in batch order
#[tokio::test]
async fn test_merge_order_ignores_completion_order() {
    let graph = independent_graph(&["slow", "fast"]);
    let stages = StageRegistry::new()
        .with(slow_stage("slow", Duration::from_millis(80)))
        .with(ok_stage("fast"));
    let engine = ExecutionEngine::new(stages);

    let report = engine.execute(&graph, RunInput::new("x")).await.unwrap();

    let merged: Vec<&str> = report.results.iter().map(|r| r.task_name.as_str()).collect();
    assert_eq!(merged, vec!["slow", "fast"]);
    let history: Vec<&str> = report
        .state
        .history()
        .iter()
        .map(|h| h.stage.as_str())
        .collect();
    assert_eq!(history, vec!["slow", "fast"]);
}

/// Test: Parallelism cap
/// Given four 60ms tasks and max_parallel = 1
/// When the run executes
/// Then they run one at a time
#[tokio::test]
async fn test_max_parallel_serializes_batch() {
    let names = ["p", "q", "r", "s"];
    let graph = independent_graph(&names);
    let stages = names.iter().fold(StageRegistry::new(), |registry, name| {
        registry.with(slow_stage(name, Duration::from_millis(60)))
    });
    let engine = ExecutionEngine::new(stages).with_config(EngineConfig {
        max_parallel: 1,
        ..EngineConfig::default()
    });

    let started = Instant::now();
    let report = engine.execute(&graph, RunInput::new("x")).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert!(started.elapsed() >= Duration::from_millis(240));
}

/// Test: Abort between batches
/// Given a two batch run whose token is cancelled while the first batch runs
/// When the first batch finishes
/// Then the second batch is cancelled and the run ends Cancelled
#[tokio::test]
async fn test_cancellation_stops_next_batch() {
    let first = test_task("first");
    let second = test_task("second").depends_on(first.id);
    let graph = TaskGraph::from_tasks(vec![first, second]).unwrap();
    let stages = StageRegistry::new()
        .with(slow_stage("first", Duration::from_millis(100)))
        .with(ok_stage("second"));
    let engine = ExecutionEngine::new(stages);

    let token = engine.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();
    });

    let report = engine.execute(&graph, RunInput::new("x")).await.unwrap();

    assert_eq!(report.status, RunStatus::Cancelled);
    assert_eq!(report.task_statuses["first"], TaskStatus::Completed);
    assert!(matches!(
        report.task_statuses["second"],
        TaskStatus::Cancelled { .. }
    ));
    assert!(report.output("second").is_none());
}
