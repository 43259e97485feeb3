//! The capability interface every backend implements.

use async_trait::async_trait;
use gantry_core::Job;

use crate::error::Result;
use crate::wrapper::JobWrapper;

/// A backend plugin that accepts, monitors and terminates jobs.
///
/// Implementations never block the caller: `queue_job` and `stop_job` hand
/// work to the runner's own tasks and return.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Plugin name, as recorded in `Job::runner_name`.
    fn name(&self) -> &str;

    /// Accept a job for submission.
    async fn queue_job(&self, wrapper: JobWrapper) -> Result<()>;

    /// Terminate a job previously submitted by this runner. The caller has
    /// already moved the job to its final state.
    async fn stop_job(&self, job: &Job) -> Result<()>;

    /// Reattach to a job submitted before a restart, without resubmitting.
    async fn recover(&self, job: &Job, wrapper: JobWrapper) -> Result<()>;

    /// Stop monitoring and release workers.
    async fn shutdown(&self);
}
