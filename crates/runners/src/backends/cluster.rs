//! Container cluster reached through a JSON HTTP API.
//!
//! Endpoints, relative to the `url` param:
//! - `POST jobs` creates a job and answers `{"id": ...}`
//! - `GET jobs/{id}` answers `{"state", "reason", "exit_code"}`
//! - `GET jobs/{id}/logs` answers `{"stdout", "stderr"}`
//! - `DELETE jobs/{id}` removes it

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use gantry_core::{FailureKind, Job, JobDestination};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use super::{authorized, base_url, poll_interval, RunnerParams};
use crate::error::{Result, RunnerError};
use crate::monitor::{PollingBackend, RemoteStatus, Submission, WatchedJobState};
use crate::wrapper::{JobOutcome, JobWrapper, PreparedJob};

#[derive(Debug, Serialize)]
pub struct CreateJob<'a> {
    pub name: String,
    pub command: &'a str,
    pub working_directory: String,
    /// Destination params, passed through for image/resources selection.
    pub params: &'a BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
pub struct Created {
    pub id: String,
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ClusterStatus {
    pub state: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub exit_code: Option<i32>,
}

#[derive(Debug, Default, Deserialize, Serialize)]
pub struct ClusterLogs {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
}

/// Normalize a termination reason reported by the cluster.
pub fn classify_reason(reason: &str) -> Option<FailureKind> {
    match reason {
        "DeadlineExceeded" => Some(FailureKind::WalltimeExceeded),
        "OOMKilled" => Some(FailureKind::MemoryLimitExceeded),
        "NodeLost" | "Evicted" => Some(FailureKind::NodeFailure),
        "Cancelled" => Some(FailureKind::Cancelled),
        _ => None,
    }
}

/// Map a status document to a [`RemoteStatus`].
pub fn to_remote_status(status: &ClusterStatus) -> Result<RemoteStatus> {
    let remote = match status.state.to_ascii_lowercase().as_str() {
        "pending" => RemoteStatus::Queued,
        "running" => RemoteStatus::Running,
        "succeeded" => RemoteStatus::Finished,
        "failed" => match status.reason.as_deref().and_then(classify_reason) {
            Some(failure) => RemoteStatus::Failed {
                failure,
                message: None,
            },
            // A plain non-zero exit: the tool failed, not the cluster.
            None => RemoteStatus::Finished,
        },
        other => {
            return Err(RunnerError::Communication(format!(
                "unknown cluster job state '{}'",
                other
            )))
        }
    };
    Ok(remote)
}

pub struct ClusterBackend {
    name: String,
    client: reqwest::Client,
    base: Url,
    token: Option<String>,
    poll_interval: Duration,
}

impl ClusterBackend {
    pub fn new(name: impl Into<String>, base: Url, token: Option<String>, poll_interval: Duration) -> Self {
        Self {
            name: name.into(),
            client: reqwest::Client::new(),
            base,
            token,
            poll_interval,
        }
    }

    /// Params: `url` (required), `token`, `poll_interval`.
    pub fn from_params(name: &str, params: &RunnerParams) -> Result<Self> {
        Ok(Self::new(
            name,
            base_url(params, name)?,
            params.get("token").cloned(),
            poll_interval(params, 5),
        ))
    }

    fn job_url(&self, external_id: &str, suffix: &str) -> Result<Url> {
        Ok(self.base.join(&format!("jobs/{}{}", external_id, suffix))?)
    }

    async fn status(&self, external_id: &str) -> Result<ClusterStatus> {
        let response = authorized(self.client.get(self.job_url(external_id, "")?), self.token.as_deref())
            .send()
            .await?
            .error_for_status()?;
        Ok(response.json().await?)
    }
}

#[async_trait]
impl PollingBackend for ClusterBackend {
    type Handle = ();

    fn name(&self) -> &str {
        &self.name
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    async fn submit(&self, job: &PreparedJob, destination: &JobDestination) -> Result<Submission<()>> {
        let body = CreateJob {
            name: format!("gantry-{}", job.job.id),
            command: &job.command,
            working_directory: job.working_directory.to_string_lossy().to_string(),
            params: &destination.params,
        };
        let response = authorized(self.client.post(self.base.join("jobs")?), self.token.as_deref())
            .json(&body)
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(RunnerError::Submission(format!("cluster answered {}: {}", status, text.trim())));
        }
        let created: Created = response.json().await?;
        info!(job_id = job.job.id, external_id = %created.id, "cluster job created");
        Ok(Submission {
            external_id: created.id,
            handle: (),
        })
    }

    async fn poll(&self, state: &WatchedJobState<()>) -> Result<RemoteStatus> {
        let status = self.status(&state.external_id).await?;
        debug!(external_id = %state.external_id, state = %status.state, reason = ?status.reason, "cluster status");
        to_remote_status(&status)
    }

    async fn collect(&self, state: &WatchedJobState<()>) -> Result<JobOutcome> {
        let status = self.status(&state.external_id).await?;
        let logs: ClusterLogs = authorized(
            self.client.get(self.job_url(&state.external_id, "/logs")?),
            self.token.as_deref(),
        )
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;
        let exit_code = status.exit_code.or(match status.state.to_ascii_lowercase().as_str() {
            "succeeded" => Some(0),
            "failed" => Some(1),
            _ => None,
        });
        Ok(JobOutcome {
            stdout: logs.stdout,
            stderr: logs.stderr,
            exit_code,
        })
    }

    async fn kill(&self, job: &Job) -> Result<()> {
        let Some(external_id) = job.external_id.as_deref() else {
            return Ok(());
        };
        let response = authorized(self.client.delete(self.job_url(external_id, "")?), self.token.as_deref())
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(external_id, "cluster job already gone");
            return Ok(());
        }
        response.error_for_status()?;
        Ok(())
    }

    fn reattach(&self, _job: &Job, _wrapper: &JobWrapper) -> Result<()> {
        Ok(())
    }
}
