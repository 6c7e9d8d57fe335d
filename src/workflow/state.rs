//! Run state and stage routing.
//!
//! `WorkflowStateMachine` is the router: given the required stages of a run
//! and the stages already completed, it names the next stage or COMPLETE.
//! `WorkflowRunState` is the per-run record the engine owns and mutates; it
//! keeps its routing fields consistent with the router after every change.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Error, Result};

use super::{RunId, RunStatus, StageState};

/// One attempt at a stage, in execution order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Stage (task) name.
    pub stage: String,
    /// Whether the attempt passed.
    pub success: bool,
    /// 1-based attempt number.
    pub attempt: u32,
    /// When the attempt finished.
    pub timestamp: DateTime<Utc>,
    /// Time spent in the stage unit.
    pub duration_ms: u64,
}

/// Stage router over the declared stages of a pipeline.
///
/// States are START, one per declared stage, and COMPLETE.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkflowStateMachine {
    declared: Vec<String>,
}

impl WorkflowStateMachine {
    pub fn new(declared: Vec<String>) -> Self {
        Self {
            declared: dedupe(declared),
        }
    }

    /// Declared stage names in declaration order.
    pub fn declared(&self) -> &[String] {
        &self.declared
    }

    /// Every state of the machine: START, each declared stage, COMPLETE.
    pub fn states(&self) -> Vec<StageState> {
        std::iter::once(StageState::Start)
            .chain(self.declared.iter().cloned().map(StageState::Stage))
            .chain(std::iter::once(StageState::Complete))
            .collect()
    }

    pub fn is_declared(&self, stage: &str) -> bool {
        self.declared.iter().any(|s| s == stage)
    }

    /// Check that every required stage is declared.
    pub fn validate_required(&self, required: &[String]) -> Result<()> {
        match required.iter().find(|s| !self.is_declared(s)) {
            Some(stage) => Err(Error::InvalidStageTransition {
                stage: stage.clone(),
                reason: "stage is not declared by the pipeline".to_string(),
            }),
            None => Ok(()),
        }
    }

    /// First required stage not yet completed, or COMPLETE.
    ///
    /// Pure: the result depends only on the two arguments.
    pub fn next(required: &[String], completed: &BTreeSet<String>) -> StageState {
        required
            .iter()
            .find(|s| !completed.contains(*s))
            .map(|s| StageState::Stage(s.clone()))
            .unwrap_or(StageState::Complete)
    }

    /// Every required stage not yet completed, in required order.
    pub fn pending(required: &[String], completed: &BTreeSet<String>) -> Vec<String> {
        required
            .iter()
            .filter(|s| !completed.contains(*s))
            .cloned()
            .collect()
    }
}

/// Mutable state of one run.
///
/// Invariant: `next_stage` is the first stage of `required_stages` not in
/// `completed_stages`, or `None` once every required stage completed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRunState {
    run_id: RunId,
    status: RunStatus,
    phase: StageState,
    declared_stages: Vec<String>,
    required_stages: Vec<String>,
    completed_stages: BTreeSet<String>,
    next_stage: Option<String>,
    outputs: BTreeMap<String, serde_json::Value>,
    errors: Vec<String>,
    warnings: Vec<String>,
    retry_counts: BTreeMap<String, u32>,
    history: Vec<HistoryEntry>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl WorkflowRunState {
    /// Create the state for a run.
    ///
    /// `required` is deduplicated preserving order and must be a subset of
    /// `declared`.
    pub fn new(run_id: RunId, declared: Vec<String>, required: Vec<String>) -> Result<Self> {
        let machine = WorkflowStateMachine::new(declared);
        let required = dedupe(required);
        machine.validate_required(&required)?;

        let mut state = Self {
            run_id,
            status: RunStatus::Pending,
            phase: StageState::Start,
            declared_stages: machine.declared().to_vec(),
            required_stages: required,
            completed_stages: BTreeSet::new(),
            next_stage: None,
            outputs: BTreeMap::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            retry_counts: BTreeMap::new(),
            history: Vec::new(),
            started_at: None,
            finished_at: None,
        };
        state.next_stage = state.next().stage().map(str::to_string);
        Ok(state)
    }

    pub fn run_id(&self) -> RunId {
        self.run_id
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    /// Router position: START until the run starts, then the next pending
    /// stage, then COMPLETE.
    pub fn phase(&self) -> &StageState {
        &self.phase
    }

    pub fn declared_stages(&self) -> &[String] {
        &self.declared_stages
    }

    pub fn required_stages(&self) -> &[String] {
        &self.required_stages
    }

    pub fn completed_stages(&self) -> &BTreeSet<String> {
        &self.completed_stages
    }

    pub fn next_stage(&self) -> Option<&str> {
        self.next_stage.as_deref()
    }

    pub fn outputs(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.outputs
    }

    pub fn output(&self, stage: &str) -> Option<&serde_json::Value> {
        self.outputs.get(stage)
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    /// Recompute the routed state from required and completed stages.
    pub fn next(&self) -> StageState {
        WorkflowStateMachine::next(&self.required_stages, &self.completed_stages)
    }

    /// Required stages still to run.
    pub fn pending_stages(&self) -> Vec<String> {
        WorkflowStateMachine::pending(&self.required_stages, &self.completed_stages)
    }

    /// Whether every required stage completed.
    pub fn is_complete(&self) -> bool {
        self.required_stages
            .iter()
            .all(|s| self.completed_stages.contains(s))
    }

    pub fn is_required(&self, stage: &str) -> bool {
        self.required_stages.iter().any(|s| s == stage)
    }

    /// Mark the run as running and route to its first stage.
    pub fn start(&mut self) {
        self.status = RunStatus::Running;
        self.started_at = Some(Utc::now());
        self.phase = self.next();
    }

    /// Counters describing the run at this moment, attached to decisions.
    pub fn snapshot(&self) -> serde_json::Value {
        serde_json::json!({
            "status": self.status,
            "phase": self.phase.to_string(),
            "completed": self.completed_stages.len(),
            "required": self.required_stages.len(),
            "errors": self.errors.len(),
            "warnings": self.warnings.len(),
        })
    }

    /// Record a completed stage, merge its output and re-route.
    ///
    /// # Errors
    /// `InvalidStageTransition` if the stage is not required for this run.
    pub fn complete_stage(&mut self, stage: &str, output: serde_json::Value) -> Result<StageState> {
        if !self.is_required(stage) {
            return Err(Error::InvalidStageTransition {
                stage: stage.to_string(),
                reason: "stage is not required for this run".to_string(),
            });
        }

        self.completed_stages.insert(stage.to_string());
        self.outputs.insert(stage.to_string(), output);
        let next = self.next();
        self.next_stage = next.stage().map(str::to_string);
        self.phase = next.clone();
        Ok(next)
    }

    /// Append to the error log.
    pub fn record_error(&mut self, stage: &str, message: &str) {
        self.errors.push(format!("{}: {}", stage, message));
    }

    /// Append to the warning log.
    pub fn record_warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    /// Append an attempt to the execution history.
    pub fn record_attempt(&mut self, entry: HistoryEntry) {
        self.history.push(entry);
    }

    /// Bump the retry counter of a task and return the new count.
    pub fn increment_retry(&mut self, task: &str) -> u32 {
        let count = self.retry_counts.entry(task.to_string()).or_insert(0);
        *count += 1;
        *count
    }

    pub fn retry_count(&self, task: &str) -> u32 {
        self.retry_counts.get(task).copied().unwrap_or(0)
    }

    pub fn retry_counts(&self) -> &BTreeMap<String, u32> {
        &self.retry_counts
    }

    /// Set the final status and finish time.
    pub fn finish(&mut self, status: RunStatus) {
        self.status = status;
        self.finished_at = Some(Utc::now());
    }
}

fn dedupe(stages: Vec<String>) -> Vec<String> {
    let mut seen = BTreeSet::new();
    stages
        .into_iter()
        .filter(|s| seen.insert(s.clone()))
        .collect()
}
