//! Job runners: the plugin interface the dispatcher talks to, the shared
//! monitor/worker-pool pattern for polling backends, rule-driven
//! resubmission, and the concrete backends.

pub mod backends;
pub mod error;
pub mod monitor;
pub mod resubmit;
pub mod runner;
pub mod wrapper;

pub use backends::{ClusterBackend, LocalRunner, RunnerParams, SlurmBackend, StagingBackend};
pub use error::{Result, RunnerError};
pub use monitor::{AsyncRunner, PollingBackend, RemoteStatus, Submission, WatchedJobState};
pub use runner::JobRunner;
pub use wrapper::{
    JobOutcome, JobWrapper, PreparedJob, RunnerContext, Settled, GENERIC_REMOTE_ERROR,
};
