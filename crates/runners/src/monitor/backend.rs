use std::time::Duration;

use async_trait::async_trait;
use gantry_core::{FailureKind, Job, JobDestination, JobState};
use tracing::{debug, error, warn};

use super::state::{RemoteStatus, Submission, WatchedJobState, WorkItem, WorkQueue};
use crate::error::Result;
use crate::wrapper::{JobOutcome, JobWrapper, PreparedJob, GENERIC_REMOTE_ERROR};

/// Consecutive poll failures tolerated before a job is failed.
pub const MAX_POLL_ERRORS: u32 = 5;

/// A backend driven by [`AsyncRunner`](super::AsyncRunner): submit once,
/// then poll until the job stops.
///
/// The three `*_job` hooks have working defaults. Backends override them to
/// stage files back or clean up remote state.
#[async_trait]
pub trait PollingBackend: Send + Sync + 'static {
    /// Per-job state carried between polls.
    type Handle: Clone + Send + Sync + 'static;

    fn name(&self) -> &str;

    fn poll_interval(&self) -> Duration {
        Duration::from_secs(5)
    }

    async fn submit(
        &self,
        job: &PreparedJob,
        destination: &JobDestination,
    ) -> Result<Submission<Self::Handle>>;

    async fn poll(&self, state: &WatchedJobState<Self::Handle>) -> Result<RemoteStatus>;

    /// Gather output once the job stopped.
    async fn collect(&self, state: &WatchedJobState<Self::Handle>) -> Result<JobOutcome>;

    async fn kill(&self, job: &Job) -> Result<()>;

    /// Rebuild the handle of a job submitted before a restart.
    fn reattach(&self, job: &Job, wrapper: &JobWrapper) -> Result<Self::Handle>;

    /// Poll one watched job. Returns the state to keep watching, or `None`
    /// when the job left the watch-list.
    async fn check_watched_item(
        &self,
        state: WatchedJobState<Self::Handle>,
        work: &WorkQueue<Self::Handle>,
    ) -> Option<WatchedJobState<Self::Handle>> {
        check_watched_item(self, state, work).await
    }

    async fn finish_job(&self, state: WatchedJobState<Self::Handle>) {
        finish_job(self, state).await
    }

    async fn fail_job(&self, state: WatchedJobState<Self::Handle>) {
        fail_job(self, state).await
    }
}

/// Default watch-list step: honour external cancellation, poll, and hand
/// finished or failed jobs to the worker pool.
pub async fn check_watched_item<B: PollingBackend + ?Sized>(
    backend: &B,
    mut state: WatchedJobState<B::Handle>,
    work: &WorkQueue<B::Handle>,
) -> Option<WatchedJobState<B::Handle>> {
    match state.wrapper.load_job().await {
        Ok(job) if job.state.is_terminal() || job.state.is_deleted() => {
            debug!(job_id = %state.job_id, state = %job.state, "job left the watch-list");
            return None;
        }
        Ok(_) => {}
        Err(e) => {
            warn!(job_id = %state.job_id, error = %e, "could not re-read watched job");
            return Some(state);
        }
    }

    let status = match backend.poll(&state).await {
        Ok(status) => status,
        Err(e) => {
            state.poll_errors += 1;
            warn!(
                job_id = %state.job_id,
                external_id = %state.external_id,
                attempt = state.poll_errors,
                error = %e,
                "status poll failed"
            );
            if state.poll_errors >= MAX_POLL_ERRORS {
                state.failure = Some(FailureKind::Unknown);
                state.message = Some(GENERIC_REMOTE_ERROR.to_string());
                work.put(WorkItem::Fail(state));
                return None;
            }
            return Some(state);
        }
    };

    state.poll_errors = 0;
    if state.old_state.as_ref() != Some(&status) {
        debug!(job_id = %state.job_id, external_id = %state.external_id, status = ?status, "remote status changed");
        state.old_state = Some(status.clone());
    }

    match status {
        RemoteStatus::Queued => Some(state),
        RemoteStatus::Running => {
            if !state.running {
                state.running = true;
                if let Err(e) = state.wrapper.mark_running().await {
                    warn!(job_id = %state.job_id, error = %e, "could not mark job running");
                }
            }
            Some(state)
        }
        RemoteStatus::Finished => {
            work.put(WorkItem::Finish(state));
            None
        }
        RemoteStatus::Failed { failure, message } => {
            state.failure = Some(failure);
            state.message = message;
            work.put(WorkItem::Fail(state));
            None
        }
    }
}

pub async fn finish_job<B: PollingBackend + ?Sized>(backend: &B, state: WatchedJobState<B::Handle>) {
    let outcome = match backend.collect(&state).await {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(job_id = %state.job_id, error = %e, "could not collect job output");
            if let Err(e) = state.wrapper.fail(GENERIC_REMOTE_ERROR, Some(FailureKind::Unknown)).await {
                error!(job_id = %state.job_id, error = %e, "could not fail job");
            }
            return;
        }
    };
    if let Err(e) = state.wrapper.finish(&outcome).await {
        error!(job_id = %state.job_id, error = %e, "could not finish job");
    }
}

/// Settle a job the backend reported as failed. Output is collected on a
/// best-effort basis to refine an unclassified failure.
pub async fn fail_job<B: PollingBackend + ?Sized>(backend: &B, state: WatchedJobState<B::Handle>) {
    let mut failure = state.failure.unwrap_or(FailureKind::Unknown);
    if failure == FailureKind::Unknown && state.message.is_none() {
        if let Ok(outcome) = backend.collect(&state).await {
            if let Some(kind) =
                FailureKind::from_log(&outcome.stderr).or_else(|| FailureKind::from_log(&outcome.stdout))
            {
                failure = kind;
            }
        }
    }

    let message = state
        .message
        .clone()
        .unwrap_or_else(|| failure.user_message().to_string());
    match state.wrapper.fail(&message, Some(failure)).await {
        Ok(settled) => debug!(job_id = %state.job_id, settled = ?settled, "failed job settled"),
        Err(e) => error!(job_id = %state.job_id, error = %e, "could not fail job"),
    }
}

/// Whether a recovered job was already running before the restart.
pub(crate) fn was_running(job: &Job) -> bool {
    job.state == JobState::Running
}
