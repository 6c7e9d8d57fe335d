//! Supervisor decision layer.
//!
//! The supervisor prioritizes work, delegates tasks to stage units, gates
//! their output on quality and resolves failures through escalation. Every
//! decision lands in an append-only [`DecisionLog`] with a reasoning string,
//! and intervention counters live in [`SupervisorStats`] on the instance.
//!
//! Failures never escape as errors: delegation turns them into failed
//! results, and a failure inside escalation handling degrades to manual
//! review.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::cmp::Reverse;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinError;
use tracing::{debug, info, warn};

use crate::core::result::TaskResult;
use crate::core::task::{Task, TaskId};
use crate::error::{Error, Result};
use crate::orchestration::escalation::{
    analyze_failure, choose_strategy, Escalation, FailureAnalysis, ResolutionStatus,
    ResolutionStrategy,
};
use crate::orchestration::quality::{check_score, QualityAssessment, QualityScorer, QualityThresholds};
use crate::orchestration::scheduler::Scheduler;
use crate::orchestration::stage::{RunContextView, StageRegistry, StageUnit};

/// Tag of a decision record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionAction {
    /// Required stage set computed from the run input.
    Classify,
    /// Dependency on an unselected stage dropped.
    PruneDependency,
    /// Execution order computed.
    Schedule,
    Prioritize,
    Delegate,
    QualityPass,
    QualityFail,
    Analyze,
    Strategy,
    Retry,
    Reroute,
    ManualReview,
    /// Escalation handling failed and fell back to manual review.
    Degrade,
    /// Task not dispatched because of an upstream failure or an abort.
    Cancel,
    Finish,
}

/// One append-only audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecisionRecord {
    /// Position in the log, starting at 0.
    pub sequence: usize,
    pub timestamp: DateTime<Utc>,
    pub action: DecisionAction,
    /// Task the decision concerns, if any.
    pub task: Option<String>,
    pub payload: serde_json::Value,
    /// Snapshot of the state the decision was made against.
    pub context: serde_json::Value,
    pub reasoning: String,
}

/// Append-only decision audit trail.
///
/// Records can be read but never modified or removed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DecisionLog {
    entries: Vec<DecisionRecord>,
}

impl DecisionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a record and return its sequence number.
    pub fn record(
        &mut self,
        action: DecisionAction,
        task: Option<&str>,
        payload: serde_json::Value,
        context: serde_json::Value,
        reasoning: impl Into<String>,
    ) -> usize {
        let sequence = self.entries.len();
        let reasoning = reasoning.into();
        debug!(sequence, action = ?action, task = ?task, "{}", reasoning);
        self.entries.push(DecisionRecord {
            sequence,
            timestamp: Utc::now(),
            action,
            task: task.map(str::to_string),
            payload,
            context,
            reasoning,
        });
        sequence
    }

    pub fn entries(&self) -> &[DecisionRecord] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn with_action(&self, action: DecisionAction) -> Vec<&DecisionRecord> {
        self.entries.iter().filter(|r| r.action == action).collect()
    }

    pub fn for_task(&self, task: &str) -> Vec<&DecisionRecord> {
        self.entries
            .iter()
            .filter(|r| r.task.as_deref() == Some(task))
            .collect()
    }

    pub fn into_entries(self) -> Vec<DecisionRecord> {
        self.entries
    }
}

/// Intervention counters of one supervisor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupervisorStats {
    pub delegations: u32,
    pub delegation_failures: u32,
    pub quality_passes: u32,
    pub quality_failures: u32,
    pub scorer_failures: u32,
    pub escalations: u32,
    pub retries: u32,
    pub reroutes: u32,
    pub manual_reviews: u32,
    pub degraded: u32,
}

/// Prioritizes, delegates, quality-gates and escalates tasks for one run.
pub struct SupervisorDecisionLayer {
    scorer: Arc<dyn QualityScorer>,
    thresholds: QualityThresholds,
    log: DecisionLog,
    escalations: Vec<Escalation>,
    stats: SupervisorStats,
}

impl SupervisorDecisionLayer {
    pub fn new(scorer: Arc<dyn QualityScorer>, thresholds: QualityThresholds) -> Self {
        Self {
            scorer,
            thresholds,
            log: DecisionLog::new(),
            escalations: Vec::new(),
            stats: SupervisorStats::default(),
        }
    }

    pub fn log(&self) -> &DecisionLog {
        &self.log
    }

    pub fn stats(&self) -> SupervisorStats {
        self.stats
    }

    pub fn escalations(&self) -> &[Escalation] {
        &self.escalations
    }

    pub fn thresholds(&self) -> &QualityThresholds {
        &self.thresholds
    }

    /// Append a decision made outside the supervisor (classification,
    /// scheduling, cancellation) together with the run state it saw.
    pub fn record_decision(
        &mut self,
        action: DecisionAction,
        task: Option<&str>,
        payload: serde_json::Value,
        context: serde_json::Value,
        reasoning: impl Into<String>,
    ) -> usize {
        self.log.record(action, task, payload, context, reasoning)
    }

    /// Consume the supervisor, returning its audit trail.
    pub fn into_parts(self) -> (DecisionLog, Vec<Escalation>, SupervisorStats) {
        (self.log, self.escalations, self.stats)
    }

    // ========== Prioritization ==========

    /// Dispatch order for `tasks`.
    ///
    /// Independent tasks are stable-sorted by descending priority. When
    /// tasks depend on each other, scheduler batches come first and
    /// priority only breaks ties within a batch. Dependencies on tasks
    /// outside `tasks` are treated as satisfied.
    pub fn prioritize(&mut self, tasks: &[Task]) -> Result<Vec<TaskId>> {
        let members: HashSet<TaskId> = tasks.iter().map(|t| t.id).collect();
        let constrained = tasks
            .iter()
            .any(|t| t.dependencies.iter().any(|d| members.contains(d)));

        let (order, reasoning): (Vec<TaskId>, &str) = if constrained {
            let scoped: Vec<Task> = tasks
                .iter()
                .cloned()
                .map(|mut t| {
                    t.dependencies.retain(|d| members.contains(d));
                    t
                })
                .collect();
            let order = Scheduler::build_order(&scoped)?;
            (
                order.batches().iter().flat_map(|b| b.task_ids()).collect(),
                "dependencies force batch order; priority breaks ties within each batch",
            )
        } else {
            let mut sorted: Vec<&Task> = tasks.iter().collect();
            sorted.sort_by_key(|t| Reverse(t.priority));
            (
                sorted.into_iter().map(|t| t.id).collect(),
                "independent tasks ordered by descending priority, then insertion order",
            )
        };

        let names: Vec<&str> = order
            .iter()
            .filter_map(|id| tasks.iter().find(|t| &t.id == id))
            .map(|t| t.name.as_str())
            .collect();
        self.log.record(
            DecisionAction::Prioritize,
            None,
            json!({ "order": names }),
            json!({ "tasks": tasks.len(), "constrained": constrained }),
            reasoning,
        );
        Ok(order)
    }

    // ========== Delegation ==========

    /// Run `task` on `unit` and capture the outcome as a [`TaskResult`].
    ///
    /// The unit runs on its own tokio task so that a panic is caught at the
    /// task boundary. Errors, panics and timeouts all become failed results.
    pub async fn delegate(
        &self,
        task: &Task,
        unit: Arc<dyn StageUnit>,
        ctx: RunContextView,
        timeout: Duration,
    ) -> TaskResult {
        let stage = unit.name().to_string();
        let attempt = ctx.attempt;
        debug!(task = %task.name, stage = %stage, attempt, "Delegating task");

        let started = Instant::now();
        let mut handle = tokio::spawn(async move { unit.execute(&ctx).await });
        let outcome = match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(join_error)) => Err(Error::TaskJoin(join_error_message(join_error))),
            Err(_) => {
                handle.abort();
                Err(Error::Timeout(timeout))
            }
        };
        let elapsed = started.elapsed();

        match outcome {
            Ok(output) => {
                let mut result =
                    TaskResult::success(task.id, &task.name, &stage, output.data, elapsed)
                        .with_attempt(attempt);
                result.quality_score = output.quality_score;
                result
            }
            Err(e) => TaskResult::failure(task.id, &task.name, &stage, &e.to_string(), elapsed)
                .with_attempt(attempt),
        }
    }

    /// Count and log the outcome of a delegation.
    pub fn record_delegation(&mut self, result: &TaskResult) {
        self.stats.delegations += 1;
        let reasoning = if result.success {
            format!(
                "{} completed on stage {} (attempt {}) in {}ms",
                result.task_name,
                result.stage,
                result.attempt,
                result.duration_ms()
            )
        } else {
            self.stats.delegation_failures += 1;
            warn!(
                task = %result.task_name,
                stage = %result.stage,
                attempt = result.attempt,
                error = ?result.error_message,
                "Stage unit failed"
            );
            format!(
                "{} failed on stage {} (attempt {}): {}",
                result.task_name,
                result.stage,
                result.attempt,
                result.error_message.as_deref().unwrap_or("no error message")
            )
        };
        self.log.record(
            DecisionAction::Delegate,
            Some(&result.task_name),
            json!({
                "stage": result.stage,
                "success": result.success,
                "attempt": result.attempt,
                "duration_ms": result.duration_ms(),
            }),
            json!({
                "delegations": self.stats.delegations,
                "delegation_failures": self.stats.delegation_failures,
            }),
            reasoning,
        );
    }

    // ========== Quality Gate ==========

    /// Threshold for `task`: its own criterion for the category if set,
    /// otherwise the configured one.
    pub fn threshold_for(&self, task: &Task) -> f64 {
        let category = task.quality_key();
        task.quality_criteria
            .get(category)
            .copied()
            .unwrap_or_else(|| self.thresholds.threshold_for(category))
    }

    /// Gate a successful result on quality.
    ///
    /// Uses the score the stage reported when present, otherwise asks the
    /// scorer. A scorer failure falls back to a 0.5 score and is logged.
    pub async fn assess_quality(&mut self, task: &Task, result: &TaskResult) -> QualityAssessment {
        let category = task.quality_key().to_string();
        let threshold = self.threshold_for(task);

        let scored = match result.quality_score {
            Some(score) => check_score(score),
            None => self
                .scorer
                .score(&result.result_data, &category)
                .await
                .and_then(check_score),
        };

        let assessment = match scored {
            Ok(score) => QualityAssessment::evaluate(&category, score, threshold),
            Err(e) => {
                warn!(task = %task.name, category = %category, error = %e, "Quality scorer failed");
                self.stats.scorer_failures += 1;
                QualityAssessment::scorer_failed(&category, threshold, &e.to_string())
            }
        };

        let action = if assessment.approved {
            self.stats.quality_passes += 1;
            DecisionAction::QualityPass
        } else {
            self.stats.quality_failures += 1;
            DecisionAction::QualityFail
        };
        self.log.record(
            action,
            Some(&task.name),
            json!({
                "category": assessment.category,
                "score": assessment.score,
                "threshold": assessment.threshold,
                "scorer_error": assessment.scorer_error,
            }),
            task_context(task),
            assessment.reasoning.clone(),
        );
        assessment
    }

    // ========== Escalation ==========

    /// Analyze, pick a strategy for and resolve a failed task.
    ///
    /// On return the task is either re-queued (Pending, `retry_count`
    /// incremented) or permanently failed. A failure in any step falls back
    /// to manual review.
    pub fn handle_escalation(
        &mut self,
        mut escalation: Escalation,
        task: &mut Task,
        stages: &StageRegistry,
    ) -> Escalation {
        self.stats.escalations += 1;
        warn!(
            task = %escalation.task_name,
            kind = ?escalation.kind,
            attempt = escalation.attempt,
            reason = %escalation.reason,
            "Escalating task failure"
        );

        if let Err(e) = self.resolve(&mut escalation, task, stages) {
            self.degrade(&mut escalation, task, &e);
        }

        self.escalations.push(escalation.clone());
        escalation
    }

    fn resolve(
        &mut self,
        escalation: &mut Escalation,
        task: &mut Task,
        stages: &StageRegistry,
    ) -> Result<()> {
        let analysis = self.analyze(escalation, task)?;
        let strategy = self.determine_resolution_strategy(escalation, &analysis, task, stages)?;
        self.execute_resolution(escalation, strategy, task)
    }

    /// Root cause and severity of the failure.
    pub fn analyze(&mut self, escalation: &mut Escalation, task: &Task) -> Result<FailureAnalysis> {
        if escalation.task_id != task.id {
            return Err(Error::Escalation(format!(
                "escalation for {} was handed task {}",
                escalation.task_name, task.name
            )));
        }

        let analysis = analyze_failure(escalation, task);
        escalation.root_cause = Some(analysis.root_cause);
        escalation.severity = analysis.severity;
        escalation.suggested_actions = analysis.suggested_actions.clone();

        self.log.record(
            DecisionAction::Analyze,
            Some(&task.name),
            json!({
                "root_cause": analysis.root_cause,
                "severity": analysis.severity,
                "suggested_actions": analysis.suggested_actions,
            }),
            task_context(task),
            format!(
                "{} failure of {} with {} retries remaining",
                analysis.root_cause, task.name, analysis.retries_remaining
            ),
        );
        Ok(analysis)
    }

    /// Retry, reroute or manual review.
    pub fn determine_resolution_strategy(
        &mut self,
        escalation: &mut Escalation,
        analysis: &FailureAnalysis,
        task: &Task,
        stages: &StageRegistry,
    ) -> Result<ResolutionStrategy> {
        let strategy = choose_strategy(analysis, task);
        if let ResolutionStrategy::Reroute { stage } = &strategy {
            if !stages.contains(stage) {
                return Err(Error::Escalation(format!(
                    "alternate stage {} for {} is not registered",
                    stage, task.name
                )));
            }
        }
        escalation.strategy = Some(strategy.clone());

        self.log.record(
            DecisionAction::Strategy,
            Some(&task.name),
            serde_json::to_value(&strategy)?,
            task_context(task),
            format!("{} chosen for {} failure", strategy, analysis.root_cause),
        );
        Ok(strategy)
    }

    /// Apply the strategy to the task.
    pub fn execute_resolution(
        &mut self,
        escalation: &mut Escalation,
        strategy: ResolutionStrategy,
        task: &mut Task,
    ) -> Result<()> {
        let reroute = match strategy {
            ResolutionStrategy::ManualReview { reason } => {
                self.mark_permanently_failed(escalation, task, &reason);
                return Ok(());
            }
            _ if !task.can_retry() => {
                let reason = format!("retry budget of {} exhausted", task.max_retries);
                self.mark_permanently_failed(escalation, task, &reason);
                return Ok(());
            }
            ResolutionStrategy::Reroute { stage } => Some(stage),
            ResolutionStrategy::RetryWithModifiedInput => None,
        };

        let retry_block = json!({
            "attempt": task.retry_count + 2,
            "previous_stage": task.stage_name(),
            "previous_error": escalation.reason,
            "suggestions": escalation.suggested_actions,
        });
        let parameters = task.parameters.as_object_mut().ok_or_else(|| {
            Error::Escalation(format!("parameters of {} are not a JSON object", task.name))
        })?;
        parameters.insert("retry".to_string(), retry_block);

        let action = match reroute {
            Some(stage) => {
                task.reroute(&stage);
                escalation.status = ResolutionStatus::Rerouted;
                self.stats.reroutes += 1;
                DecisionAction::Reroute
            }
            None => {
                escalation.status = ResolutionStatus::Retrying;
                self.stats.retries += 1;
                DecisionAction::Retry
            }
        };
        task.requeue();
        task.priority = task.priority.escalate();

        info!(
            task = %task.name,
            stage = %task.stage_name(),
            retry = task.retry_count,
            max_retries = task.max_retries,
            "Task re-queued"
        );
        self.log.record(
            action,
            Some(&task.name),
            json!({
                "stage": task.stage_name(),
                "retry_count": task.retry_count,
                "priority": task.priority,
            }),
            task_context(task),
            format!(
                "{} re-queued on {} (retry {} of {}), priority raised to {}",
                task.name,
                task.stage_name(),
                task.retry_count,
                task.max_retries,
                task.priority
            ),
        );
        Ok(())
    }

    fn mark_permanently_failed(&mut self, escalation: &mut Escalation, task: &mut Task, reason: &str) {
        task.fail(&format!("{} (manual review: {})", escalation.reason, reason));
        escalation.status = ResolutionStatus::ManualReview;
        self.stats.manual_reviews += 1;
        warn!(task = %task.name, reason = %reason, "Task permanently failed, manual review requested");
        self.log.record(
            DecisionAction::ManualReview,
            Some(&task.name),
            json!({ "reason": reason, "escalation": escalation.id }),
            task_context(task),
            format!("{} permanently failed: {}", task.name, reason),
        );
    }

    fn degrade(&mut self, escalation: &mut Escalation, task: &mut Task, error: &Error) {
        warn!(task = %task.name, error = %error, "Escalation handling failed, falling back to manual review");
        self.stats.degraded += 1;
        let reason = format!("escalation handling failed: {}", error);
        self.log.record(
            DecisionAction::Degrade,
            Some(&task.name),
            json!({ "error": error.to_string() }),
            task_context(task),
            reason.clone(),
        );
        escalation.strategy = Some(ResolutionStrategy::ManualReview {
            reason: reason.clone(),
        });
        self.mark_permanently_failed(escalation, task, &reason);
    }
}

impl std::fmt::Debug for SupervisorDecisionLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupervisorDecisionLayer")
            .field("thresholds", &self.thresholds)
            .field("decisions", &self.log.len())
            .field("stats", &self.stats)
            .finish()
    }
}

fn task_context(task: &Task) -> serde_json::Value {
    json!({
        "stage": task.stage_name(),
        "priority": task.priority,
        "status": task.status.to_string(),
        "retry_count": task.retry_count,
        "max_retries": task.max_retries,
    })
}

fn join_error_message(error: JoinError) -> String {
    if !error.is_panic() {
        return "stage unit was cancelled".to_string();
    }
    let payload = error.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    format!("stage unit panicked: {}", message)
}
