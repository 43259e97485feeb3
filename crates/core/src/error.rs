use thiserror::Error;

use crate::job::{DatasetId, JobId};

/// Errors raised by a [`JobStore`](crate::store::JobStore) implementation.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    #[error("dataset not found: {0}")]
    DatasetNotFound(DatasetId),

    #[error("lock poisoned: {0}")]
    LockPoisoned(String),

    #[error("store backend error: {0}")]
    Backend(String),
}

#[derive(Error, Debug)]
pub enum GantryError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Command error: {0}")]
    Command(String),

    #[error("{0}")]
    Other(String),
}

impl From<serde_json::Error> for GantryError {
    fn from(e: serde_json::Error) -> Self {
        GantryError::Serialize(e.to_string())
    }
}
