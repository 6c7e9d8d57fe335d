//! Outcome of a single task attempt.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::task::TaskId;

/// Result of one attempt at a task.
///
/// Stage failures never escape as errors; they are captured here with
/// `success == false` and routed through escalation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    /// The task this result belongs to.
    pub task_id: TaskId,
    /// Name of the task.
    pub task_name: String,
    /// Stage unit that produced the result.
    pub stage: String,
    /// Whether the stage unit reported success.
    pub success: bool,
    /// Opaque structured payload from the stage unit.
    pub result_data: serde_json::Value,
    /// Failure description when `success` is false.
    pub error_message: Option<String>,
    /// Wall-clock time spent in the stage unit.
    pub execution_time: Duration,
    /// Quality score in `[0, 1]`, if one was reported or assessed.
    pub quality_score: Option<f64>,
    /// 1-based attempt number.
    pub attempt: u32,
    /// When the attempt finished.
    pub finished_at: DateTime<Utc>,
}

impl TaskResult {
    /// A successful attempt.
    pub fn success(
        task_id: TaskId,
        task_name: &str,
        stage: &str,
        result_data: serde_json::Value,
        execution_time: Duration,
    ) -> Self {
        Self {
            task_id,
            task_name: task_name.to_string(),
            stage: stage.to_string(),
            success: true,
            result_data,
            error_message: None,
            execution_time,
            quality_score: None,
            attempt: 1,
            finished_at: Utc::now(),
        }
    }

    /// A failed attempt.
    pub fn failure(
        task_id: TaskId,
        task_name: &str,
        stage: &str,
        error: &str,
        execution_time: Duration,
    ) -> Self {
        Self {
            task_id,
            task_name: task_name.to_string(),
            stage: stage.to_string(),
            success: false,
            result_data: serde_json::Value::Null,
            error_message: Some(error.to_string()),
            execution_time,
            quality_score: None,
            attempt: 1,
            finished_at: Utc::now(),
        }
    }

    pub fn with_attempt(mut self, attempt: u32) -> Self {
        self.attempt = attempt;
        self
    }

    pub fn with_quality_score(mut self, score: f64) -> Self {
        self.quality_score = Some(score);
        self
    }

    /// Turn a successful result into a failed one, keeping the payload for the audit trail.
    pub fn mark_failed(&mut self, error: &str) {
        self.success = false;
        self.error_message = Some(error.to_string());
    }

    /// Execution time in whole milliseconds.
    pub fn duration_ms(&self) -> u64 {
        self.execution_time.as_millis() as u64
    }
}
