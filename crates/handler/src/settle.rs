//! Job state changes made by the handler itself, outside any runner.

use gantry_core::{DatasetState, Job, JobEvent, JobEventKind, JobState, JobStore};
use tracing::warn;

use crate::error::Result;

/// Fail a job that never reached a backend (or cannot be resumed on one).
pub(crate) async fn fail_job(store: &dyn JobStore, job: &Job, message: &str) -> Result<()> {
    store
        .update_state(job.id, JobState::Error, Some(message.to_string()))
        .await?;
    store
        .append_history(
            job.id,
            JobEvent::now(JobEventKind::Failed { failure: None }).with_message(message),
        )
        .await?;
    set_outputs(store, job, DatasetState::Error, Some(message)).await?;
    warn!(job_id = job.id, tool = %job.tool_id, "job failed: {}", message);
    Ok(())
}

pub(crate) async fn set_outputs(
    store: &dyn JobStore,
    job: &Job,
    state: DatasetState,
    info: Option<&str>,
) -> Result<()> {
    for assoc in &job.outputs {
        store
            .update_dataset_state(assoc.dataset_id, state, info.map(str::to_string))
            .await?;
    }
    Ok(())
}
