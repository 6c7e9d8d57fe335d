//! Core domain models for orchestration.
//!
//! This module contains the fundamental data structures used throughout
//! the orchestrator: tasks, their results and the dependency graph.

pub mod dag;
pub mod result;
pub mod task;

pub use dag::{PrunedDependency, TaskGraph};
pub use result::TaskResult;
pub use task::{Priority, Task, TaskId, TaskStatus, DEFAULT_MAX_RETRIES};
