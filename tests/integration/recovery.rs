//! Escalation and recovery integration tests.
//!
//! These tests verify that the supervisor turns stage failures, quality
//! gate rejections, timeouts and panics into retries, reroutes or manual
//! review, within each task's retry budget.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use conductor::core::{Priority, Task, TaskGraph, TaskStatus};
use conductor::orchestration::{
    ConstantScorer, DecisionAction, EngineConfig, EscalationKind, ExecutionEngine,
    QualityScorer, QualityThresholds, ResolutionStatus, ResolutionStrategy, RootCause,
    StageRegistry,
};
use conductor::workflow::{RunInput, RunStatus};
use conductor::{Error, Result};

use crate::fixtures::{
    failing_stage, flaky_stage, ok_stage, panicking_stage, scored_stage, slow_stage, test_task,
};

fn single(task: Task) -> TaskGraph {
    TaskGraph::from_tasks(vec![task]).unwrap()
}

/// Test: Retry budget exhausted
/// Given a task with max_retries = 2 whose stage always fails
/// When the run executes
/// Then it runs three times, the third failure is terminal and ends in
/// manual review with no further retry
#[tokio::test]
async fn test_retry_budget_exhausted_goes_to_manual_review() {
    let task = test_task("code").with_max_retries(2);
    let (stage, calls) = failing_stage("code", "tool returned garbage");
    let engine = ExecutionEngine::new(StageRegistry::new().with(stage));

    let report = engine.execute(&single(task), RunInput::new("x")).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.results.len(), 3);
    assert!(report.results.iter().all(|r| !r.success));
    assert_eq!(
        report.results.iter().map(|r| r.attempt).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );

    let statuses: Vec<ResolutionStatus> = report.escalations.iter().map(|e| e.status).collect();
    assert_eq!(
        statuses,
        vec![
            ResolutionStatus::Retrying,
            ResolutionStatus::Retrying,
            ResolutionStatus::ManualReview
        ]
    );
    assert!(matches!(report.task_statuses["code"], TaskStatus::Failed { .. }));
    assert_eq!(report.state.retry_count("code"), 2);
    assert_eq!(report.stats.retries, 2);
    assert_eq!(report.stats.manual_reviews, 1);
    assert_eq!(report.stage_timings["code"].attempts, 3);
}

/// Test: Transient failure recovers
/// Given a stage that fails once with a rate limit error
/// When the run executes
/// Then the retry succeeds with the retry block in its parameters
#[tokio::test]
async fn test_transient_failure_recovers_on_retry() {
    let task = test_task("req").with_priority(Priority::Normal);
    let (stage, calls) = flaky_stage("req", 1, "429 rate limit exceeded");
    let engine = ExecutionEngine::new(StageRegistry::new().with(stage));

    let report = engine.execute(&single(task), RunInput::new("x")).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let retry = &report.output("req").unwrap()["retry"];
    assert_eq!(retry["attempt"], json!(2));
    assert_eq!(retry["previous_stage"], json!("req"));
    assert!(retry["previous_error"]
        .as_str()
        .unwrap()
        .contains("rate limit"));

    let escalation = &report.escalations[0];
    assert_eq!(escalation.root_cause, Some(RootCause::Transient));
    assert_eq!(
        escalation.strategy,
        Some(ResolutionStrategy::RetryWithModifiedInput)
    );

    let retry_decision = report
        .decisions
        .iter()
        .find(|d| d.action == DecisionAction::Retry)
        .unwrap();
    assert_eq!(retry_decision.payload["priority"], json!("medium"));
}

/// Test: Fatal failure skips retries
/// Given a stage failing with a permission error and retries left
/// When the run executes
/// Then the task goes straight to manual review
#[tokio::test]
async fn test_fatal_failure_skips_retries() {
    let task = test_task("deploy").with_max_retries(3);
    let (stage, calls) = failing_stage("deploy", "Permission denied (publickey)");
    let engine = ExecutionEngine::new(StageRegistry::new().with(stage));

    let report = engine.execute(&single(task), RunInput::new("x")).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.escalations.len(), 1);
    assert_eq!(report.escalations[0].root_cause, Some(RootCause::Fatal));
    assert_eq!(report.escalations[0].status, ResolutionStatus::ManualReview);
}

/// Test: Quality gate reroute
/// Given a stage scoring below threshold with a registered alternate stage
/// When the run executes
/// Then the task is rerouted and the alternate stage's output is kept
#[tokio::test]
async fn test_quality_failure_reroutes_to_fallback() {
    let task = test_task("code").with_fallback_stage("senior_code");
    let stages = StageRegistry::new()
        .with(scored_stage("code", 0.3))
        .with(scored_stage("senior_code", 0.9));
    let engine = ExecutionEngine::new(stages);

    let report = engine.execute(&single(task), RunInput::new("x")).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.results.len(), 2);
    assert_eq!(report.results[0].stage, "code");
    assert!(!report.results[0].success);
    assert_eq!(report.results[1].stage, "senior_code");
    assert_eq!(report.results[1].quality_score, Some(0.9));

    let escalation = &report.escalations[0];
    assert_eq!(escalation.kind, EscalationKind::QualityGate);
    assert_eq!(escalation.status, ResolutionStatus::Rerouted);
    assert_eq!(report.stats.reroutes, 1);
    assert_eq!(report.stats.quality_failures, 1);
    assert_eq!(report.stats.quality_passes, 1);
}

/// Test: Reroute keeps the task's own threshold
/// Given a task requiring 0.9 on code whose alternate stage scores 0.8
/// When the first attempt is rerouted
/// Then the alternate output is still gated at 0.9 and the task fails
#[tokio::test]
async fn test_reroute_keeps_task_threshold() {
    let task = test_task("code")
        .with_fallback_stage("senior_code")
        .with_quality_criterion("code", 0.9)
        .with_max_retries(1);
    let stages = StageRegistry::new()
        .with(scored_stage("code", 0.3))
        .with(scored_stage("senior_code", 0.8));
    let engine = ExecutionEngine::new(stages);

    let report = engine.execute(&single(task), RunInput::new("x")).await.unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.results.len(), 2);
    assert_eq!(report.results[1].stage, "senior_code");
    assert!(!report.results[1].success);
    assert_eq!(report.stats.quality_failures, 2);
    assert_eq!(report.stats.quality_passes, 0);
    assert!(report
        .decisions
        .iter()
        .filter(|d| d.action == DecisionAction::QualityFail)
        .all(|d| d.payload["category"] == json!("code") && d.payload["threshold"] == json!(0.9)));
}

/// Test: Unregistered alternate stage degrades
/// Given a quality failure whose alternate stage is not registered
/// When the escalation is handled
/// Then it degrades to manual review instead of erroring
#[tokio::test]
async fn test_missing_fallback_degrades_to_manual_review() {
    let task = test_task("code").with_fallback_stage("ghost");
    let engine = ExecutionEngine::new(StageRegistry::new().with(scored_stage("code", 0.1)));

    let report = engine.execute(&single(task), RunInput::new("x")).await.unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.escalations.len(), 1);
    assert_eq!(report.escalations[0].status, ResolutionStatus::ManualReview);
    assert_eq!(report.stats.degraded, 1);
    assert!(report
        .decisions
        .iter()
        .any(|d| d.action == DecisionAction::Degrade));
}

/// Test: Per-category thresholds
/// Given a 0.75 score, a 0.7 default threshold and a 0.8 `security` threshold
/// When one task uses each category
/// Then the default one passes and the security one fails
#[tokio::test]
async fn test_category_thresholds_gate_independently() {
    let general = test_task("docs").with_max_retries(0);
    let secure = test_task("audit")
        .with_quality_category("security")
        .with_max_retries(0);
    let graph = TaskGraph::from_tasks(vec![general, secure]).unwrap();
    let engine = ExecutionEngine::new(
        StageRegistry::new()
            .with(ok_stage("docs"))
            .with(ok_stage("audit")),
    )
    .with_scorer(Arc::new(ConstantScorer::new(0.75)))
    .with_config(EngineConfig {
        thresholds: QualityThresholds::default().with_threshold("security", 0.8),
        ..EngineConfig::default()
    });

    let report = engine.execute(&graph, RunInput::new("x")).await.unwrap();

    assert_eq!(report.task_statuses["docs"], TaskStatus::Completed);
    assert!(matches!(report.task_statuses["audit"], TaskStatus::Failed { .. }));
    assert_eq!(report.escalations[0].kind, EscalationKind::QualityGate);
}

struct BrokenScorer;

#[async_trait]
impl QualityScorer for BrokenScorer {
    async fn score(&self, _output: &serde_json::Value, _category: &str) -> Result<f64> {
        Err(Error::QualityScorer("model unavailable".to_string()))
    }
}

/// Test: Scorer failure
/// Given a scorer that always errors
/// When a task's threshold is at or below 0.5
/// Then the fallback score approves it and the failure is counted
#[tokio::test]
async fn test_scorer_failure_uses_fallback_score() {
    let lenient = test_task("lenient").with_quality_criterion("lenient", 0.5);
    let strict = test_task("strict").with_max_retries(0);
    let graph = TaskGraph::from_tasks(vec![lenient, strict]).unwrap();
    let engine = ExecutionEngine::new(
        StageRegistry::new()
            .with(ok_stage("lenient"))
            .with(ok_stage("strict")),
    )
    .with_scorer(Arc::new(BrokenScorer));

    let report = engine.execute(&graph, RunInput::new("x")).await.unwrap();

    assert_eq!(report.task_statuses["lenient"], TaskStatus::Completed);
    assert!(matches!(report.task_statuses["strict"], TaskStatus::Failed { .. }));
    assert_eq!(report.stats.scorer_failures, 2);
    let lenient_result = report
        .results
        .iter()
        .find(|r| r.task_name == "lenient")
        .unwrap();
    assert_eq!(lenient_result.quality_score, Some(0.5));
}

/// Test: Stage timeout
/// Given a stage that takes longer than its task timeout
/// When the run executes
/// Then the attempt fails as a timeout escalation
#[tokio::test]
async fn test_timeout_becomes_escalation() {
    let task = test_task("slow")
        .with_timeout(Duration::from_millis(30))
        .with_max_retries(1);
    let engine = ExecutionEngine::new(
        StageRegistry::new().with(slow_stage("slow", Duration::from_secs(5))),
    );

    let report = engine.execute(&single(task), RunInput::new("x")).await.unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.results.len(), 2);
    assert!(report.results[0]
        .error_message
        .as_deref()
        .unwrap()
        .contains("timed out"));
    assert_eq!(report.escalations[0].kind, EscalationKind::Timeout);
    assert_eq!(report.escalations[0].root_cause, Some(RootCause::Transient));
    assert_eq!(report.escalations[1].status, ResolutionStatus::ManualReview);
}

/// Test: Stage panic
/// Given a stage unit that panics
/// When the run executes
/// Then the panic is contained as a failed attempt
#[tokio::test]
async fn test_panicking_stage_is_contained() {
    let task = test_task("boom").with_max_retries(0);
    let after = test_task("other");
    let graph = TaskGraph::from_tasks(vec![task, after]).unwrap();
    let engine = ExecutionEngine::new(
        StageRegistry::new()
            .with(panicking_stage("boom"))
            .with(ok_stage("other")),
    );

    let report = engine.execute(&graph, RunInput::new("x")).await.unwrap();

    assert_eq!(report.status, RunStatus::Failed);
    assert_eq!(report.task_statuses["other"], TaskStatus::Completed);
    let failure = report
        .results
        .iter()
        .find(|r| r.task_name == "boom")
        .unwrap();
    assert!(!failure.success);
    assert!(failure
        .error_message
        .as_deref()
        .unwrap()
        .contains("stage exploded"));
}

/// Test: Retries run before the next batch
/// Given a flaky first stage and a dependent second stage
/// When the run executes
/// Then the retry completes before the dependent starts
#[tokio::test]
async fn test_retry_runs_before_next_batch() {
    let first = test_task("first");
    let second = test_task("second").depends_on(first.id);
    let graph = TaskGraph::from_tasks(vec![first, second]).unwrap();
    let (flaky, _) = flaky_stage("first", 1, "connection reset by peer");
    let engine = ExecutionEngine::new(StageRegistry::new().with(flaky).with(ok_stage("second")));

    let report = engine.execute(&graph, RunInput::new("x")).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    let order: Vec<(&str, bool)> = report
        .results
        .iter()
        .map(|r| (r.task_name.as_str(), r.success))
        .collect();
    assert_eq!(
        order,
        vec![("first", false), ("first", true), ("second", true)]
    );
    assert_eq!(report.output("second").unwrap()["upstream"], json!(["first"]));
}
