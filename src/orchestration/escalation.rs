//! Escalation records and failure analysis.
//!
//! When a task fails, the supervisor opens an [`Escalation`], analyzes the
//! failure message into a [`RootCause`] and [`Severity`], and picks a
//! [`ResolutionStrategy`]:
//! - `RetryWithModifiedInput` for transient and unknown failures
//! - `Reroute` for quality failures when an alternate stage exists
//! - `ManualReview` once retries are exhausted or the cause is fatal

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::result::TaskResult;
use crate::core::task::{Task, TaskId};

/// Failure messages that indicate a transient condition worth retrying.
pub const TRANSIENT_PATTERNS: &[&str] = &[
    "rate limit",
    "rate_limit",
    "too many requests",
    "connection refused",
    "connection reset",
    "timed out",
    "timeout",
    "temporary",
    "unavailable",
    "502",
    "503",
    "504",
    "network error",
];

/// Failure messages that retrying cannot fix.
pub const FATAL_PATTERNS: &[&str] = &[
    "permission denied",
    "access denied",
    "authentication failed",
    "unauthorized",
    "invalid credentials",
    "invalid api key",
];

/// Failure messages produced by a quality gate.
pub const QUALITY_PATTERNS: &[&str] = &["below threshold", "quality"];

/// What kind of failure opened the escalation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationKind {
    /// The stage unit raised or reported failure.
    StageFailure,
    /// The output scored below its quality threshold.
    QualityGate,
    /// The stage unit did not finish within its timeout.
    Timeout,
}

/// How urgent the escalation is.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

/// Root cause derived from the failure message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RootCause {
    Transient,
    Fatal,
    Quality,
    Unknown,
}

impl std::fmt::Display for RootCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RootCause::Transient => write!(f, "transient"),
            RootCause::Fatal => write!(f, "fatal"),
            RootCause::Quality => write!(f, "quality"),
            RootCause::Unknown => write!(f, "unknown"),
        }
    }
}

/// How the supervisor resolves an escalation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "strategy")]
pub enum ResolutionStrategy {
    /// Re-queue the task with a `retry` parameter block.
    RetryWithModifiedInput,
    /// Re-queue the task on an alternate stage unit.
    Reroute { stage: String },
    /// Stop and leave the task for a human.
    ManualReview { reason: String },
}

impl ResolutionStrategy {
    pub fn is_requeue(&self) -> bool {
        !matches!(self, ResolutionStrategy::ManualReview { .. })
    }
}

impl std::fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolutionStrategy::RetryWithModifiedInput => write!(f, "retry with modified input"),
            ResolutionStrategy::Reroute { stage } => write!(f, "reroute to {}", stage),
            ResolutionStrategy::ManualReview { .. } => write!(f, "manual review"),
        }
    }
}

/// Where an escalation stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStatus {
    #[default]
    Open,
    /// Task re-queued on the same stage.
    Retrying,
    /// Task re-queued on an alternate stage.
    Rerouted,
    /// Task permanently failed, awaiting a human.
    ManualReview,
}

/// Structured record of a task failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Escalation {
    pub id: Uuid,
    pub task_id: TaskId,
    pub task_name: String,
    /// Stage unit the failed attempt ran on.
    pub stage: String,
    pub kind: EscalationKind,
    pub severity: Severity,
    pub reason: String,
    pub suggested_actions: Vec<String>,
    pub root_cause: Option<RootCause>,
    pub strategy: Option<ResolutionStrategy>,
    pub status: ResolutionStatus,
    /// Attempt that failed.
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
}

impl Escalation {
    /// Open an escalation for a failed result.
    pub fn new(result: &TaskResult, kind: EscalationKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id: result.task_id,
            task_name: result.task_name.clone(),
            stage: result.stage.clone(),
            kind,
            severity: Severity::default(),
            reason: result
                .error_message
                .clone()
                .unwrap_or_else(|| "stage reported failure without a message".to_string()),
            suggested_actions: Vec::new(),
            root_cause: None,
            strategy: None,
            status: ResolutionStatus::Open,
            attempt: result.attempt,
            created_at: Utc::now(),
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.status != ResolutionStatus::Open
    }
}

impl EscalationKind {
    /// Kind of a failed result whose failure did not come from the quality gate.
    pub fn of_failure(message: &str) -> Self {
        if message.to_lowercase().contains("timed out") {
            EscalationKind::Timeout
        } else {
            EscalationKind::StageFailure
        }
    }
}

/// Output of failure analysis.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureAnalysis {
    pub root_cause: RootCause,
    pub severity: Severity,
    pub suggested_actions: Vec<String>,
    /// Retries left on the task when it failed.
    pub retries_remaining: u32,
}

/// Classify a failure message into a root cause.
pub fn classify_root_cause(kind: EscalationKind, message: &str) -> RootCause {
    let lower = message.to_lowercase();
    if FATAL_PATTERNS.iter().any(|p| lower.contains(p)) {
        return RootCause::Fatal;
    }
    if kind == EscalationKind::QualityGate {
        return RootCause::Quality;
    }
    if kind == EscalationKind::Timeout || TRANSIENT_PATTERNS.iter().any(|p| lower.contains(p)) {
        return RootCause::Transient;
    }
    if QUALITY_PATTERNS.iter().any(|p| lower.contains(p)) {
        return RootCause::Quality;
    }
    RootCause::Unknown
}

/// Analyze an escalation against the task's retry budget.
pub fn analyze_failure(escalation: &Escalation, task: &Task) -> FailureAnalysis {
    let root_cause = classify_root_cause(escalation.kind, &escalation.reason);
    let retries_remaining = task.max_retries.saturating_sub(task.retry_count);

    let severity = match (root_cause, retries_remaining) {
        (RootCause::Fatal, _) => Severity::Critical,
        (_, 0) => Severity::High,
        (RootCause::Transient, _) => Severity::Low,
        (RootCause::Quality, _) | (RootCause::Unknown, _) => Severity::Medium,
    };

    let mut suggested_actions = match root_cause {
        RootCause::Transient => vec!["Retry the stage; the failure looks transient".to_string()],
        RootCause::Fatal => vec![
            "Check credentials and permissions of the stage backend".to_string(),
        ],
        RootCause::Quality => {
            let mut actions = vec!["Address reviewer feedback and raise output quality".to_string()];
            if let Some(stage) = &task.fallback_stage {
                actions.push(format!("Run the task on alternate stage {}", stage));
            }
            actions
        }
        RootCause::Unknown => vec!["Retry with the previous error as context".to_string()],
    };
    if retries_remaining == 0 {
        suggested_actions.push("Retry budget exhausted; review the task manually".to_string());
    }

    FailureAnalysis {
        root_cause,
        severity,
        suggested_actions,
        retries_remaining,
    }
}

/// Pick the resolution for an analyzed failure.
///
/// Exhausted retries or a fatal cause always go to manual review. A quality
/// failure is rerouted when the task has an alternate stage it is not
/// already running on.
pub fn choose_strategy(analysis: &FailureAnalysis, task: &Task) -> ResolutionStrategy {
    if analysis.retries_remaining == 0 {
        return ResolutionStrategy::ManualReview {
            reason: format!(
                "retried {} of {} times",
                task.retry_count, task.max_retries
            ),
        };
    }
    if analysis.root_cause == RootCause::Fatal {
        return ResolutionStrategy::ManualReview {
            reason: "fatal failure cannot be fixed by retrying".to_string(),
        };
    }
    if analysis.root_cause == RootCause::Quality {
        if let Some(fallback) = &task.fallback_stage {
            if fallback != task.stage_name() {
                return ResolutionStrategy::Reroute {
                    stage: fallback.clone(),
                };
            }
        }
    }
    ResolutionStrategy::RetryWithModifiedInput
}
