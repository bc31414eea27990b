//! Domain errors for the Cohort coordination engine.

use std::path::PathBuf;
use thiserror::Error;

/// Domain-level errors that can occur anywhere in the coordination engine.
#[derive(Debug, Error)]
pub enum CoordError {
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Task dependency cycle detected involving task: {0}")]
    DependencyCycle(String),

    #[error("Invalid state transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Timed out acquiring lock on {path} after {waited_ms}ms")]
    LockTimeout { path: PathBuf, waited_ms: u64 },

    #[error("Task store is busy: {0}")]
    StoreBusy(String),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Git operation failed: {0}")]
    Git(String),

    #[error("Provider invocation failed: {0}")]
    Provider(String),

    #[error("Merge conflict requires manual intervention: {0}")]
    ManualInterventionRequired(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type CoordResult<T> = Result<T, CoordError>;

impl From<serde_json::Error> for CoordError {
    fn from(err: serde_json::Error) -> Self {
        CoordError::Serialization(err.to_string())
    }
}
