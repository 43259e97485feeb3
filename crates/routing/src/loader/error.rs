//! Error types for the policy loader.

use crate::validation::ValidationResult;

/// Errors that can occur while loading a routing policy.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// Filesystem I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The document could not be turned into a policy at all.
    #[error("Invalid routing policy: {}", summarize(.0))]
    Invalid(ValidationResult),

    /// Filesystem watcher error.
    #[error("Notify watcher error: {0}")]
    Notify(#[from] notify::Error),
}

fn summarize(result: &ValidationResult) -> String {
    result
        .errors
        .iter()
        .map(|e| {
            if e.path.is_empty() {
                e.message.clone()
            } else {
                format!("{}: {}", e.path, e.message)
            }
        })
        .collect::<Vec<_>>()
        .join("; ")
}

/// Result alias for loader operations.
pub type Result<T> = std::result::Result<T, PolicyError>;
