//! Workflow routing for a single run.
//!
//! This module provides the run identity and status types, the required
//! stage classifiers and the stage router with its per-run state.

mod classifier;
mod state;
mod types;

pub use classifier::{
    AllStages, ClassifierRule, RuleClassifier, RunInput, StageClassifier, StageSet,
    StaticClassifier,
};
pub use state::{HistoryEntry, WorkflowRunState, WorkflowStateMachine};
pub use types::{RunId, RunStatus, StageState};
