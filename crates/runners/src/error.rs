use gantry_core::{GantryError, JobId, StoreError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Invalid URL: {0}")]
    Url(#[from] url::ParseError),

    #[error("Command error: {0}")]
    Command(#[from] GantryError),

    /// The backend refused or failed to accept the job.
    #[error("Submission failed: {0}")]
    Submission(String),

    /// The backend could not be reached or answered nonsense.
    #[error("Backend communication failed: {0}")]
    Communication(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("job {0} cannot be recovered: {1}")]
    Unrecoverable(JobId, String),

    #[error("runner is shutting down")]
    ShuttingDown,
}

pub type Result<T> = std::result::Result<T, RunnerError>;
