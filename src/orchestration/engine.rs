//! Execution engine.
//!
//! Drives a run end to end: classify the input into the required stage set,
//! select and schedule the matching subgraph, then for each batch fan out
//! every task concurrently, fan the results back in and merge them into
//! the run state in batch order. Failed tasks are escalated right after
//! their batch; retried or rerouted tasks run in a follow-up batch before
//! the next scheduled one.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::core::dag::{PrunedDependency, TaskGraph};
use crate::core::result::TaskResult;
use crate::core::task::{Task, TaskId, TaskStatus};
use crate::error::{Error, Result};
use crate::orchestration::escalation::{Escalation, EscalationKind, ResolutionStatus};
use crate::orchestration::quality::{ConstantScorer, QualityScorer, QualityThresholds};
use crate::orchestration::scheduler::{ExecutionOrder, Scheduler};
use crate::orchestration::stage::{RunContextView, StageRegistry, StageUnit};
use crate::orchestration::supervisor::{
    DecisionAction, DecisionRecord, SupervisorDecisionLayer, SupervisorStats,
};
use crate::state::{RunRecord, RunRecordStore, RECORD_VERSION};
use crate::workflow::{
    AllStages, HistoryEntry, RunId, RunInput, RunStatus, StageClassifier, StageSet,
    WorkflowRunState,
};

/// Default per-stage timeout (10 minutes).
pub const DEFAULT_STAGE_TIMEOUT_SECS: u64 = 600;

/// Engine tuning.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Timeout for tasks without their own.
    pub stage_timeout: Duration,
    /// Concurrent stage invocations per batch; 0 means unbounded.
    pub max_parallel: usize,
    pub thresholds: QualityThresholds,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stage_timeout: Duration::from_secs(DEFAULT_STAGE_TIMEOUT_SECS),
            max_parallel: 0,
            thresholds: QualityThresholds::default(),
        }
    }
}

/// What a run will do, computed before any stage executes.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub required: StageSet,
    pub pruned: Vec<PrunedDependency>,
    pub order: ExecutionOrder,
    /// Selected subgraph.
    pub graph: TaskGraph,
}

/// Accumulated timing of one stage across attempts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTiming {
    pub attempts: u32,
    pub total_ms: u64,
}

/// Final report of a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub run_id: RunId,
    pub status: RunStatus,
    pub input: String,
    pub required_stages: Vec<String>,
    /// Scheduled batches by task name.
    pub batches: Vec<Vec<String>>,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub stage_timings: BTreeMap<String, StageTiming>,
    pub task_statuses: BTreeMap<String, TaskStatus>,
    /// Every attempt, in merge order.
    pub results: Vec<TaskResult>,
    pub escalations: Vec<Escalation>,
    pub decisions: Vec<DecisionRecord>,
    pub stats: SupervisorStats,
    pub state: WorkflowRunState,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Where the run record was written, if a store is configured.
    pub record_path: Option<PathBuf>,
}

impl ExecutionReport {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Completed
    }

    /// Final output of a stage, if it completed.
    pub fn output(&self, stage: &str) -> Option<&serde_json::Value> {
        self.state.output(stage)
    }

    pub fn to_record(&self) -> RunRecord {
        RunRecord {
            version: RECORD_VERSION,
            run_id: self.run_id,
            status: self.status,
            input: self.input.clone(),
            required_stages: self.required_stages.clone(),
            started_at: Some(self.started_at),
            finished_at: Some(self.finished_at),
            history: self.state.history().to_vec(),
            decisions: self.decisions.clone(),
            escalations: self.escalations.clone(),
            errors: self.state.errors().to_vec(),
            warnings: self.state.warnings().to_vec(),
        }
    }
}

/// One task ready for dispatch.
struct Job {
    task: Task,
    unit: Option<Arc<dyn StageUnit>>,
    ctx: RunContextView,
    timeout: Duration,
}

/// Runs task graphs.
pub struct ExecutionEngine {
    stages: StageRegistry,
    classifier: Arc<dyn StageClassifier>,
    scorer: Arc<dyn QualityScorer>,
    config: EngineConfig,
    records: Option<RunRecordStore>,
    cancel: CancellationToken,
}

impl ExecutionEngine {
    /// Engine over `stages` that requires every declared stage and
    /// approves every output.
    pub fn new(stages: StageRegistry) -> Self {
        Self {
            stages,
            classifier: Arc::new(AllStages),
            scorer: Arc::new(ConstantScorer::default()),
            config: EngineConfig::default(),
            records: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn StageClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn QualityScorer>) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_record_store(mut self, store: RunRecordStore) -> Self {
        self.records = Some(store);
        self
    }

    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that aborts the run before its next batch.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn stages(&self) -> &StageRegistry {
        &self.stages
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Classify, select and schedule without executing anything.
    ///
    /// # Errors
    /// Structural errors: a cyclic or invalid graph, or a selected task
    /// whose stage unit is not registered.
    pub fn plan(&self, graph: &TaskGraph, input: &RunInput) -> Result<RunPlan> {
        let declared = graph.stage_names();
        let required = self.classifier.classify(input, &declared);
        let (selected, pruned) = graph.select(required.as_slice())?;

        if let Some(task) = selected
            .all_tasks()
            .into_iter()
            .find(|t| !self.stages.contains(t.stage_name()))
        {
            return Err(Error::UnknownStage(task.stage_name().to_string()));
        }

        let order = Scheduler::order_graph(&selected)?;
        Ok(RunPlan {
            required,
            pruned,
            order,
            graph: selected,
        })
    }

    /// Execute a run of `graph` against `input`.
    ///
    /// Only structural errors are returned; every task failure is handled
    /// by the supervisor and shows up in the report.
    pub async fn execute(&self, graph: &TaskGraph, input: RunInput) -> Result<ExecutionReport> {
        let run_id = RunId::new();
        let started_at = Utc::now();
        let mut supervisor =
            SupervisorDecisionLayer::new(self.scorer.clone(), self.config.thresholds.clone());

        let RunPlan {
            required,
            pruned,
            order,
            graph: mut selected,
        } = self.plan(graph, &input)?;

        let plan_context = json!({
            "run_id": run_id,
            "declared": graph.task_count(),
            "selected": selected.task_count(),
            "batches": order.len(),
        });
        supervisor.record_decision(
            DecisionAction::Classify,
            None,
            json!({ "classifier": self.classifier.name(), "required": required }),
            plan_context.clone(),
            format!(
                "{} of {} declared stages required for this input",
                required.len(),
                graph.task_count()
            ),
        );
        for edge in &pruned {
            supervisor.record_decision(
                DecisionAction::PruneDependency,
                Some(&edge.task),
                json!({ "dependency": edge.dependency }),
                plan_context.clone(),
                format!(
                    "{} no longer waits on {}, which does not run in this run",
                    edge.task, edge.dependency
                ),
            );
        }
        supervisor.record_decision(
            DecisionAction::Schedule,
            None,
            json!({ "batches": order.batch_names() }),
            plan_context,
            format!(
                "{} tasks scheduled in {} batches",
                order.task_count(),
                order.len()
            ),
        );

        let mut state = WorkflowRunState::new(run_id, graph.stage_names(), order.flatten_names())?;
        state.start();
        info!(
            run = %run_id.short(),
            stages = ?state.required_stages(),
            batches = order.len(),
            "Run started"
        );

        let input_text: Arc<str> = Arc::from(input.text.as_str());
        let mut results = Vec::new();
        let mut aborted = false;

        'batches: for batch in order.batches() {
            if self.cancel.is_cancelled() {
                aborted = true;
                break;
            }
            info!(run = %run_id.short(), batch = batch.index, tasks = ?batch.names(), "Dispatching batch");

            let mut pending: Vec<TaskId> = batch
                .task_ids()
                .into_iter()
                .filter(|id| selected.get_task(id).is_some_and(Task::can_start))
                .collect();

            while !pending.is_empty() {
                let jobs = self.prepare(&mut selected, &state, run_id, &input_text, &pending);
                let round = self.dispatch(&supervisor, jobs).await;
                let requeued = self
                    .merge(&mut supervisor, &mut selected, &mut state, round, &mut results)
                    .await?;

                if requeued.is_empty() {
                    break;
                }
                if self.cancel.is_cancelled() {
                    aborted = true;
                    break 'batches;
                }
                let tasks: Vec<Task> = requeued
                    .iter()
                    .filter_map(|id| selected.get_task(id).cloned())
                    .collect();
                pending = supervisor.prioritize(&tasks)?;
                info!(run = %run_id.short(), tasks = pending.len(), "Dispatching follow-up batch");
            }
        }

        if aborted {
            self.cancel_remaining(&mut supervisor, &mut selected, &mut state);
        }

        let tasks = selected.all_tasks();
        let count = |pred: fn(&TaskStatus) -> bool| tasks.iter().filter(|t| pred(&t.status)).count();
        let completed = count(|s| matches!(s, TaskStatus::Completed));
        let failed = count(|s| matches!(s, TaskStatus::Failed { .. }));
        let cancelled = count(|s| matches!(s, TaskStatus::Cancelled { .. }));
        let task_statuses: BTreeMap<String, TaskStatus> = tasks
            .iter()
            .map(|t| (t.name.clone(), t.status.clone()))
            .collect();

        let status = if aborted {
            RunStatus::Cancelled
        } else if failed > 0 {
            RunStatus::Failed
        } else {
            RunStatus::Completed
        };
        state.finish(status);
        supervisor.record_decision(
            DecisionAction::Finish,
            None,
            json!({ "status": status, "completed": completed, "failed": failed, "cancelled": cancelled }),
            state.snapshot(),
            format!(
                "Run {}: {} completed, {} permanently failed, {} cancelled",
                status, completed, failed, cancelled
            ),
        );
        info!(run = %run_id.short(), status = %status, completed, failed, cancelled, "Run finished");

        let mut stage_timings: BTreeMap<String, StageTiming> = BTreeMap::new();
        for result in &results {
            let timing = stage_timings.entry(result.task_name.clone()).or_default();
            timing.attempts += 1;
            timing.total_ms += result.duration_ms();
        }

        let (log, escalations, stats) = supervisor.into_parts();
        let mut report = ExecutionReport {
            run_id,
            status,
            input: input.text,
            required_stages: state.required_stages().to_vec(),
            batches: order.batch_names(),
            completed,
            failed,
            cancelled,
            stage_timings,
            task_statuses,
            results,
            escalations,
            decisions: log.into_entries(),
            stats,
            state,
            started_at,
            finished_at: Utc::now(),
            record_path: None,
        };

        if let Some(store) = &self.records {
            match store.save(&report.to_record()).await {
                Ok(path) => report.record_path = Some(path),
                Err(e) => {
                    warn!(run = %run_id.short(), error = %e, "Failed to write run record");
                    report
                        .state
                        .record_warning(format!("run record not written: {}", e));
                }
            }
        }

        Ok(report)
    }

    /// Mark tasks in progress and build their dispatch jobs.
    fn prepare(
        &self,
        graph: &mut TaskGraph,
        state: &WorkflowRunState,
        run_id: RunId,
        input: &Arc<str>,
        pending: &[TaskId],
    ) -> Vec<Job> {
        let upstream = Arc::new(state.outputs().clone());
        pending
            .iter()
            .filter_map(|id| {
                let task = graph.get_task_mut(id)?;
                task.start();
                let task = task.clone();
                let ctx = RunContextView::new(
                    run_id,
                    task.id,
                    &task.name,
                    task.stage_name(),
                    task.retry_count + 1,
                    input.clone(),
                    task.parameters.clone(),
                    upstream.clone(),
                );
                Some(Job {
                    unit: self.stages.get(task.stage_name()),
                    timeout: task.timeout.unwrap_or(self.config.stage_timeout),
                    task,
                    ctx,
                })
            })
            .collect()
    }

    /// Fan out `jobs` and wait for all of them. Results come back in job
    /// order regardless of completion order.
    async fn dispatch(&self, supervisor: &SupervisorDecisionLayer, jobs: Vec<Job>) -> Vec<TaskResult> {
        let semaphore =
            (self.config.max_parallel > 0).then(|| Arc::new(Semaphore::new(self.config.max_parallel)));

        let runs = jobs.into_iter().map(|job| {
            let semaphore = semaphore.clone();
            async move {
                let _permit = match semaphore {
                    Some(semaphore) => semaphore.acquire_owned().await.ok(),
                    None => None,
                };
                match job.unit {
                    Some(unit) => supervisor.delegate(&job.task, unit, job.ctx, job.timeout).await,
                    None => TaskResult::failure(
                        job.task.id,
                        &job.task.name,
                        job.task.stage_name(),
                        &Error::UnknownStage(job.task.stage_name().to_string()).to_string(),
                        Duration::ZERO,
                    )
                    .with_attempt(job.ctx.attempt),
                }
            }
        });
        join_all(runs).await
    }

    /// Merge one round of results, escalating failures. Returns the tasks
    /// re-queued for a follow-up batch.
    async fn merge(
        &self,
        supervisor: &mut SupervisorDecisionLayer,
        graph: &mut TaskGraph,
        state: &mut WorkflowRunState,
        round: Vec<TaskResult>,
        results: &mut Vec<TaskResult>,
    ) -> Result<Vec<TaskId>> {
        let mut requeued = Vec::new();

        for mut result in round {
            supervisor.record_delegation(&result);
            let id = result.task_id;
            let task = graph
                .get_task(&id)
                .cloned()
                .ok_or_else(|| Error::TaskNotFound(result.task_name.clone()))?;

            let failure_kind = if result.success {
                let assessment = supervisor.assess_quality(&task, &result).await;
                result.quality_score = Some(assessment.score);
                if assessment.approved {
                    None
                } else {
                    result.mark_failed(&assessment.reasoning);
                    Some(EscalationKind::QualityGate)
                }
            } else {
                Some(EscalationKind::of_failure(
                    result.error_message.as_deref().unwrap_or_default(),
                ))
            };

            state.record_attempt(HistoryEntry {
                stage: task.name.clone(),
                success: result.success,
                attempt: result.attempt,
                timestamp: result.finished_at,
                duration_ms: result.duration_ms(),
            });

            match failure_kind {
                None => {
                    if let Some(task) = graph.get_task_mut(&id) {
                        task.complete();
                    }
                    let next = state.complete_stage(&task.name, result.result_data.clone())?;
                    debug!(task = %task.name, next = %next, "Stage completed");
                }
                Some(kind) => {
                    state.record_error(
                        &task.name,
                        result.error_message.as_deref().unwrap_or("unknown failure"),
                    );
                    let escalation = Escalation::new(&result, kind);
                    let task_mut = graph
                        .get_task_mut(&id)
                        .ok_or_else(|| Error::TaskNotFound(task.name.clone()))?;
                    let escalation = supervisor.handle_escalation(escalation, task_mut, &self.stages);

                    match escalation.status {
                        ResolutionStatus::Retrying | ResolutionStatus::Rerouted => {
                            state.increment_retry(&task.name);
                            requeued.push(id);
                        }
                        ResolutionStatus::ManualReview | ResolutionStatus::Open => {
                            cancel_dependents(supervisor, graph, state, &id, &task.name);
                        }
                    }
                }
            }
            results.push(result);
        }

        Ok(requeued)
    }

    fn cancel_remaining(
        &self,
        supervisor: &mut SupervisorDecisionLayer,
        graph: &mut TaskGraph,
        state: &mut WorkflowRunState,
    ) {
        warn!("Run aborted, cancelling remaining tasks");
        let remaining: Vec<TaskId> = graph
            .all_tasks()
            .into_iter()
            .filter(|t| !t.is_finished())
            .map(|t| t.id)
            .collect();
        for id in remaining {
            if let Some(task) = graph.get_task_mut(&id) {
                task.cancel("run aborted");
                supervisor.record_decision(
                    DecisionAction::Cancel,
                    Some(&task.name),
                    json!({ "cause": "abort" }),
                    state.snapshot(),
                    format!("{} not run: run aborted before it was dispatched", task.name),
                );
                state.record_warning(format!("{} cancelled: run aborted", task.name));
            }
        }
    }
}

/// Cancel every task downstream of a permanently failed one.
fn cancel_dependents(
    supervisor: &mut SupervisorDecisionLayer,
    graph: &mut TaskGraph,
    state: &mut WorkflowRunState,
    failed: &TaskId,
    failed_name: &str,
) {
    for id in graph.transitive_dependents(failed) {
        let Some(task) = graph.get_task_mut(&id) else {
            continue;
        };
        if task.is_finished() {
            continue;
        }
        let reason = format!("upstream task {} failed", failed_name);
        task.cancel(&reason);
        warn!(task = %task.name, upstream = %failed_name, "Cancelling dependent of failed task");
        supervisor.record_decision(
            DecisionAction::Cancel,
            Some(&task.name),
            json!({ "upstream": failed_name }),
            state.snapshot(),
            format!("{} not run: {}", task.name, reason),
        );
        state.record_warning(format!("{} cancelled: {}", task.name, reason));
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("stages", &self.stages)
            .field("classifier", &self.classifier.name())
            .field("config", &self.config)
            .field("records", &self.records)
            .finish()
    }
}
