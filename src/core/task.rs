//! Task data model for the execution graph.
//!
//! Tasks are the atomic units of work handed to stage units. Each task
//! tracks its status, priority, dependencies, retry budget and the quality
//! thresholds its output must meet.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use uuid::Uuid;

/// Default number of retries a task gets before it is permanently failed.
pub const DEFAULT_MAX_RETRIES: u32 = 2;

/// Unique identifier for a task within a run.
///
/// Uses UUID v4 for generation and provides a short form display
/// for human-readable output.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new unique task identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Return first 8 characters of the UUID for display.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Scheduling priority of a task.
///
/// Variants are declared lowest first so the derived ordering gives
/// `Critical > High > Medium > Normal > Low`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    Medium,
    High,
    Critical,
}

impl Priority {
    /// The next level up, saturating at `Critical`.
    pub fn escalate(self) -> Self {
        match self {
            Priority::Low => Priority::Normal,
            Priority::Normal => Priority::Medium,
            Priority::Medium => Priority::High,
            Priority::High | Priority::Critical => Priority::Critical,
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Normal => write!(f, "normal"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
            Priority::Critical => write!(f, "critical"),
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(crate::error::Error::Validation(format!(
                "unknown priority: {}",
                other
            ))),
        }
    }
}

/// Task status in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum TaskStatus {
    /// Task created but not yet dispatched.
    #[default]
    Pending,
    /// Task is currently being executed by a stage unit.
    InProgress,
    /// Task completed and passed its quality gate.
    Completed,
    /// Task failed permanently.
    Failed {
        /// Error message describing the failure.
        error: String,
    },
    /// Task will not run in this run.
    Cancelled {
        /// Why the task was cancelled.
        reason: String,
    },
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InProgress => write!(f, "in_progress"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed { error } => write!(f, "failed: {}", error),
            TaskStatus::Cancelled { reason } => write!(f, "cancelled: {}", reason),
        }
    }
}

/// A single task in the execution graph.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier for this task.
    pub id: TaskId,
    /// Human-readable name; also the stage name used by the workflow router.
    pub name: String,
    /// What the task should accomplish.
    pub description: String,
    /// Stage unit that executes this task. Defaults to `name`.
    pub stage: Option<String>,
    /// Alternate stage unit used when the supervisor reroutes the task.
    pub fallback_stage: Option<String>,
    /// Scheduling priority.
    pub priority: Priority,
    /// Current execution status.
    pub status: TaskStatus,
    /// Tasks that must complete before this one starts.
    pub dependencies: BTreeSet<TaskId>,
    /// Named quality thresholds overriding the configured ones.
    pub quality_criteria: BTreeMap<String, f64>,
    /// Threshold key for the quality gate. Defaults to the stage name.
    pub quality_category: Option<String>,
    /// Parameters handed to the stage unit.
    pub parameters: serde_json::Value,
    /// How many times the task has been re-queued.
    pub retry_count: u32,
    /// Re-queue budget before the task is permanently failed.
    pub max_retries: u32,
    /// Per-task override of the stage timeout.
    pub timeout: Option<Duration>,
    /// When the task was created.
    pub created_at: DateTime<Utc>,
    /// When the latest attempt started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state.
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a new task with the given name and description.
    ///
    /// The task starts Pending at `Normal` priority with no dependencies
    /// and the default retry budget.
    pub fn new(name: &str, description: &str) -> Self {
        Self {
            id: TaskId::new(),
            name: name.to_string(),
            description: description.to_string(),
            stage: None,
            fallback_stage: None,
            priority: Priority::default(),
            status: TaskStatus::Pending,
            dependencies: BTreeSet::new(),
            quality_criteria: BTreeMap::new(),
            quality_category: None,
            parameters: serde_json::Value::Object(serde_json::Map::new()),
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            timeout: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_stage(mut self, stage: &str) -> Self {
        self.stage = Some(stage.to_string());
        self
    }

    pub fn with_fallback_stage(mut self, stage: &str) -> Self {
        self.fallback_stage = Some(stage.to_string());
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.parameters = parameters;
        self
    }

    pub fn with_quality_category(mut self, category: &str) -> Self {
        self.quality_category = Some(category.to_string());
        self
    }

    pub fn with_quality_criterion(mut self, category: &str, threshold: f64) -> Self {
        self.quality_criteria.insert(category.to_string(), threshold);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Declare that this task runs after `dependency`.
    pub fn depends_on(mut self, dependency: TaskId) -> Self {
        self.dependencies.insert(dependency);
        self
    }

    /// The stage unit that executes this task.
    pub fn stage_name(&self) -> &str {
        self.stage.as_deref().unwrap_or(&self.name)
    }

    /// Key used to look up the quality threshold for this task's output.
    pub fn quality_key(&self) -> &str {
        self.quality_category
            .as_deref()
            .unwrap_or_else(|| self.stage_name())
    }

    /// Move the task onto another stage unit.
    ///
    /// The quality category is pinned to the current stage first so the
    /// threshold that applies does not change with the unit.
    pub fn reroute(&mut self, stage: &str) {
        if self.quality_category.is_none() {
            self.quality_category = Some(self.stage_name().to_string());
        }
        self.stage = Some(stage.to_string());
    }

    /// Transition to InProgress and record the start time.
    pub fn start(&mut self) {
        self.status = TaskStatus::InProgress;
        self.started_at = Some(Utc::now());
    }

    /// Mark the task as successfully completed.
    pub fn complete(&mut self) {
        self.status = TaskStatus::Completed;
        self.completed_at = Some(Utc::now());
    }

    /// Mark the task as permanently failed.
    pub fn fail(&mut self, error: &str) {
        self.status = TaskStatus::Failed {
            error: error.to_string(),
        };
        self.completed_at = Some(Utc::now());
    }

    /// Mark the task as cancelled.
    pub fn cancel(&mut self, reason: &str) {
        self.status = TaskStatus::Cancelled {
            reason: reason.to_string(),
        };
        self.completed_at = Some(Utc::now());
    }

    /// Put the task back into Pending for another attempt.
    pub fn requeue(&mut self) {
        self.retry_count += 1;
        self.status = TaskStatus::Pending;
    }

    /// Whether the retry budget allows another attempt.
    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Check if the task is in a terminal state.
    pub fn is_finished(&self) -> bool {
        matches!(
            self.status,
            TaskStatus::Completed | TaskStatus::Failed { .. } | TaskStatus::Cancelled { .. }
        )
    }

    /// Check if the task can be dispatched.
    pub fn can_start(&self) -> bool {
        matches!(self.status, TaskStatus::Pending)
    }
}
