use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Execution timed out after {0:?}")]
    ExecutionTimeout(std::time::Duration),

    #[error("Experiment not found: {0}")]
    NotFound(String),

    #[error("Experiment already exists: {0}")]
    DuplicateExperiment(String),

    #[error("Artifact not found: {experiment}/{name}")]
    ArtifactNotFound { experiment: String, name: String },

    #[error("Image build failed: {0}")]
    Build(String),

    #[error("Artifact capture failed: {0}")]
    Capture(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RunnerError {
    /// Infrastructure faults are retried with backoff before surfacing.
    /// Everything else is surfaced to the caller or recorded in experiment
    /// state immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RunnerError::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, RunnerError>;
