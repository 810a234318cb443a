use thiserror::Error;

use crate::core::TaskId;

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

    #[error("Malformed spec: {reason}")]
    MalformedSpec { reason: String },

    #[error("Duplicate feature id: {id}")]
    DuplicateFeatureId { id: String },

    #[error("Unknown dependency '{reference}' in feature {feature}")]
    UnknownDependency { feature: String, reference: String },

    #[error("Cyclic dependency: {}", format_cycle(.cycle))]
    CyclicDependency { cycle: Vec<TaskId> },

    #[error("Batch has no tasks")]
    EmptyBatch,

    #[error("Invalid batch {batch}: {reason}")]
    InvalidBatch { batch: String, reason: String },

    #[error("Task not found: {0}")]
    UnknownTask(TaskId),

    #[error("Executor failed: {0}")]
    ExecutorFailed(String),

    #[error("Operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid phase transition from {from} to {to}")]
    InvalidPhaseTransition { from: String, to: String },

    #[error("Orchestrator is not halted (phase: {0})")]
    NotHalted(String),

    #[error("No home directory")]
    NoHomeDir,

    #[error("Task join error: {0}")]
    TaskJoin(String),

    #[error("Validation error: {0}")]
    Validation(String),
}

impl Error {
    /// Whether this error aborts orchestration outright.
    ///
    /// Parse-time, graph-time and batch-time errors are fatal. Execution-time
    /// errors (executor failure, timeout, cancellation) are retried or halt the
    /// loop for manual intervention.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Error::ExecutorFailed(_) | Error::Timeout(_) | Error::Cancelled
        )
    }
}

fn format_cycle(cycle: &[TaskId]) -> String {
    cycle
        .iter()
        .map(|id| id.as_str())
        .collect::<Vec<_>>()
        .join(" -> ")
}

pub type Result<T> = std::result::Result<T, Error>;
