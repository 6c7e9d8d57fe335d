use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Cyclic dependency among tasks: {}", .tasks.join(", "))]
    CyclicDependency { tasks: Vec<String> },

    #[error("Task {task} depends on unknown task {dependency}")]
    UnknownDependency { task: String, dependency: String },

    #[error("Duplicate task name: {0}")]
    DuplicateTask(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("No stage unit registered for stage: {0}")]
    UnknownStage(String),

    #[error("Invalid stage transition: {stage} ({reason})")]
    InvalidStageTransition { stage: String, reason: String },

    #[error("Stage error: {0}")]
    Stage(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Quality scorer error: {0}")]
    QualityScorer(String),

    #[error("Escalation handling error: {0}")]
    Escalation(String),
}

impl Error {
    /// Structural errors describe an invalid graph or stage set and abort a run
    /// before any stage executes. Everything else is handled per task.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            Error::CyclicDependency { .. }
                | Error::UnknownDependency { .. }
                | Error::DuplicateTask(_)
                | Error::TaskNotFound(_)
                | Error::UnknownStage(_)
                | Error::InvalidStageTransition { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
