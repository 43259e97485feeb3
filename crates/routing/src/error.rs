use thiserror::Error;

/// Why a job could not be routed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoutingError {
    /// The policy sends this job to `fail`; `message` is shown to the user.
    #[error("job rejected: {message}")]
    Rejected { message: String },

    /// The policy cannot produce a destination for this job.
    #[error("routing configuration error: {0}")]
    Configuration(String),
}

pub type Result<T> = std::result::Result<T, RoutingError>;
