//! End-to-end run tests.
//!
//! These tests verify that a run executes from input to final report:
//! batch order, stage routing, upstream outputs and the decision log.

use std::sync::Arc;

use serde_json::json;

use conductor::core::{Task, TaskGraph, TaskStatus};
use conductor::orchestration::{DecisionAction, ExecutionEngine, Scheduler, StageRegistry};
use conductor::workflow::{
    ClassifierRule, RuleClassifier, RunId, RunInput, RunStatus, StageState, StaticClassifier,
    WorkflowRunState,
};

use crate::fixtures::{
    diamond_graph, failing_stage, logged_stage, ok_stage, pipeline_graph, CallLog,
};

fn registry(names: &[&str]) -> StageRegistry {
    names
        .iter()
        .fold(StageRegistry::new(), |registry, name| registry.with(ok_stage(name)))
}

/// Test: Priority tie-break within a batch
/// Given A -> {B(low), C(high)} -> D
/// When the graph is scheduled
/// Then the batches are [[A], [C, B], [D]]
#[test]
fn test_diamond_batches_break_ties_by_priority() {
    let graph = diamond_graph();
    let order = Scheduler::order_graph(&graph).unwrap();

    assert_eq!(
        order.batch_names(),
        vec![vec!["A"], vec!["C", "B"], vec!["D"]]
    );
}

/// Test: Full diamond run
/// Given the diamond graph with every stage registered
/// When the run executes
/// Then stages run batch by batch and the run completes
#[tokio::test]
async fn test_diamond_run_completes_in_batch_order() {
    let log = CallLog::new();
    let stages = ["A", "B", "C", "D"]
        .iter()
        .fold(StageRegistry::new(), |registry, name| {
            registry.with(logged_stage(name, &log))
        });
    let engine = ExecutionEngine::new(stages);

    let report = engine
        .execute(&diamond_graph(), RunInput::new("build it"))
        .await
        .unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert!(report.is_success());
    assert_eq!(report.completed, 4);
    assert_eq!(report.failed, 0);
    assert_eq!(report.required_stages, vec!["A", "C", "B", "D"]);

    let calls = log.calls();
    assert_eq!(calls.len(), 4);
    assert_eq!(calls[0], "A");
    assert_eq!(calls[3], "D");

    // Results merge in batch order, priority first
    let merged: Vec<&str> = report.results.iter().map(|r| r.task_name.as_str()).collect();
    assert_eq!(merged, vec!["A", "C", "B", "D"]);
    assert_eq!(report.state.phase(), &StageState::Complete);
}

/// Test: Router walk
/// Given required stages req, arch, code
/// When each stage completes in turn
/// Then next() walks req -> arch -> code -> COMPLETE
#[test]
fn test_router_walks_required_stages() {
    let declared: Vec<String> = ["req", "arch", "code", "test"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    let required = vec!["req".to_string(), "arch".to_string(), "code".to_string()];
    let mut state = WorkflowRunState::new(RunId::new(), declared, required).unwrap();

    assert_eq!(state.next(), StageState::Stage("req".to_string()));
    state.complete_stage("req", json!({})).unwrap();
    assert_eq!(state.next(), StageState::Stage("arch".to_string()));
    state.complete_stage("arch", json!({})).unwrap();
    assert_eq!(state.next(), StageState::Stage("code".to_string()));
    state.complete_stage("code", json!({})).unwrap();
    assert_eq!(state.next(), StageState::Complete);
    assert!(state.is_complete());
}

/// Test: Upstream outputs
/// Given a three stage pipeline
/// When the run executes
/// Then each stage sees the outputs of every stage completed before it
#[tokio::test]
async fn test_pipeline_passes_upstream_outputs() {
    let graph = pipeline_graph(&["req", "code", "review"]);
    let engine = ExecutionEngine::new(registry(&["req", "code", "review"]));

    let report = engine.execute(&graph, RunInput::new("x")).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.output("req").unwrap()["upstream"], json!([]));
    assert_eq!(report.output("code").unwrap()["upstream"], json!(["req"]));
    assert_eq!(
        report.output("review").unwrap()["upstream"],
        json!(["code", "req"])
    );
    assert_eq!(report.state.history().len(), 3);
}

/// Test: Classifier narrows the run
/// Given a rule requiring `test` only for inputs mentioning tests
/// When the input does not mention tests
/// Then `test` is neither required nor executed
#[tokio::test]
async fn test_rule_classifier_skips_unrequired_stage() {
    let graph = pipeline_graph(&["req", "code", "test"]);
    let rules = vec![ClassifierRule {
        pattern: "tests?".to_string(),
        stages: vec!["test".to_string()],
    }];
    let classifier =
        RuleClassifier::new(vec!["req".to_string(), "code".to_string()], &rules).unwrap();
    let log = CallLog::new();
    let stages = ["req", "code", "test"]
        .iter()
        .fold(StageRegistry::new(), |registry, name| {
            registry.with(logged_stage(name, &log))
        });
    let engine = ExecutionEngine::new(stages).with_classifier(Arc::new(classifier));

    let report = engine.execute(&graph, RunInput::new("a small cli")).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.required_stages, vec!["req", "code"]);
    assert_eq!(log.count("test"), 0);
    assert!(!report.task_statuses.contains_key("test"));

    let report = engine
        .execute(&graph, RunInput::new("a cli with tests"))
        .await
        .unwrap();
    assert_eq!(report.required_stages, vec!["req", "code", "test"]);
    assert_eq!(log.count("test"), 1);
}

/// Test: Pruned dependency
/// Given code depends on arch and arch is not required
/// When the run executes
/// Then code runs anyway and the pruning is logged as a decision
#[tokio::test]
async fn test_pruned_dependency_is_logged() {
    let graph = pipeline_graph(&["req", "arch", "code"]);
    let engine = ExecutionEngine::new(registry(&["req", "arch", "code"]))
        .with_classifier(Arc::new(StaticClassifier::new(["req", "code"])));

    let report = engine.execute(&graph, RunInput::new("x")).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.batches, vec![vec!["req", "code"]]);
    let pruned: Vec<_> = report
        .decisions
        .iter()
        .filter(|d| d.action == DecisionAction::PruneDependency)
        .collect();
    assert_eq!(pruned.len(), 1);
    assert_eq!(pruned[0].task.as_deref(), Some("code"));
}

/// Test: Every decision carries context
/// Given a run where one task fails and its dependent is cancelled
/// When the decision log is inspected
/// Then no record has an empty context and the finish record sees the
/// final counters
#[tokio::test]
async fn test_every_decision_has_context() {
    let a = Task::new("a", "").with_max_retries(0);
    let b = Task::new("b", "").depends_on(a.id);
    let graph = TaskGraph::from_tasks(vec![a, b]).unwrap();
    let (broken, _) = failing_stage("a", "boom");
    let engine = ExecutionEngine::new(StageRegistry::new().with(broken).with(ok_stage("b")));

    let report = engine.execute(&graph, RunInput::new("x")).await.unwrap();

    assert!(report.decisions.iter().all(|d| d.context.is_object()));
    let classify = &report.decisions[0];
    assert_eq!(classify.context["declared"], json!(2));
    let cancel = report
        .decisions
        .iter()
        .find(|d| d.action == DecisionAction::Cancel)
        .unwrap();
    assert_eq!(cancel.context["errors"], json!(1));
    let finish = report.decisions.last().unwrap();
    assert_eq!(finish.context["status"], json!(RunStatus::Failed));
    assert_eq!(finish.context["completed"], json!(0));
}

/// Test: Decision log ordering
/// Given any completed run
/// When the decision log is inspected
/// Then sequence numbers are strictly increasing from classify to finish
#[tokio::test]
async fn test_decision_log_is_ordered() {
    let graph = pipeline_graph(&["a", "b"]);
    let engine = ExecutionEngine::new(registry(&["a", "b"]));

    let report = engine.execute(&graph, RunInput::new("x")).await.unwrap();

    let decisions = &report.decisions;
    assert_eq!(decisions.first().unwrap().action, DecisionAction::Classify);
    assert_eq!(decisions.last().unwrap().action, DecisionAction::Finish);
    assert!(decisions.windows(2).all(|w| w[0].sequence < w[1].sequence));
    assert_eq!(
        decisions
            .iter()
            .filter(|d| d.action == DecisionAction::Delegate)
            .count(),
        2
    );
}

/// Test: Cyclic graph
/// Given two tasks depending on each other
/// When the graph is built
/// Then a structural error is returned and nothing runs
#[test]
fn test_cycle_is_structural_error() {
    let mut a = Task::new("a", "");
    let mut b = Task::new("b", "");
    a.dependencies.insert(b.id);
    b.dependencies.insert(a.id);

    let err = TaskGraph::from_tasks(vec![a, b]).unwrap_err();
    assert!(err.is_structural());
}

/// Test: Unregistered stage
/// Given a required task whose stage unit is missing
/// When the run executes
/// Then execute returns a structural error before dispatching anything
#[tokio::test]
async fn test_unregistered_stage_fails_before_dispatch() {
    let log = CallLog::new();
    let graph = pipeline_graph(&["a", "b"]);
    let engine = ExecutionEngine::new(StageRegistry::new().with(logged_stage("a", &log)));

    let err = engine.execute(&graph, RunInput::new("x")).await.unwrap_err();

    assert!(err.is_structural());
    assert!(log.calls().is_empty());
}

/// Test: Stage override
/// Given a task whose stage unit differs from its name
/// When the run executes
/// Then the named unit runs and the output is stored under the task name
#[tokio::test]
async fn test_task_stage_override() {
    let task = Task::new("code", "write code").with_stage("coder");
    let graph = TaskGraph::from_tasks(vec![task]).unwrap();
    let engine = ExecutionEngine::new(registry(&["coder"]));

    let report = engine.execute(&graph, RunInput::new("x")).await.unwrap();

    assert_eq!(report.status, RunStatus::Completed);
    assert_eq!(report.output("code").unwrap()["stage"], json!("coder"));
    assert_eq!(report.task_statuses["code"], TaskStatus::Completed);
}
