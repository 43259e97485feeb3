//! Remote staging agent: the job runs on a host that shares no filesystem
//! with the handler.
//!
//! Submission asks the agent for a remote layout, uploads inputs and the
//! working directory (text files rewritten through a [`PathMapper`]), then
//! submits the rewritten command. Once the job stops, declared outputs and
//! working-directory side outputs are downloaded back before the job is
//! settled. Agent endpoints, relative to the `url` param:
//!
//! - `POST jobs/{id}/setup` answers a [`RemoteLayout`]
//! - `PUT jobs/{id}/files?kind=input|workdir&name=...` uploads a file
//! - `POST jobs/{id}/submit` starts the command
//! - `GET jobs/{id}/status` answers a [`AgentStatus`]
//! - `GET jobs/{id}/files?kind=output|workdir&name=...` downloads a file
//! - `POST jobs/{id}/cancel` and `POST jobs/{id}/clean`

mod paths;

pub use paths::{remote_name, PathMapper};

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use gantry_core::{FailureKind, Job, JobDestination, JobState};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use url::Url;

use super::{authorized, base_url, poll_interval, RunnerParams};
use crate::error::{Result, RunnerError};
use crate::monitor::{self, PollingBackend, RemoteStatus, Submission, WatchedJobState};
use crate::wrapper::{JobOutcome, JobWrapper, PreparedJob};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteLayout {
    pub job_id: String,
    pub working_directory: String,
    pub inputs_directory: String,
    pub outputs_directory: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStatus {
    /// `queued`, `running`, `complete`, `failed` or `lost`.
    pub status: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    /// Declared outputs present in the remote outputs directory.
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Side outputs left in the remote working directory.
    #[serde(default)]
    pub working_directory_contents: Vec<String>,
}

#[derive(Debug, Serialize)]
struct SubmitRequest<'a> {
    command: &'a str,
    params: &'a std::collections::BTreeMap<String, String>,
}

/// When the agent is told to discard a job's remote state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Cleanup {
    #[default]
    Always,
    OnSuccess,
    Never,
}

impl FromStr for Cleanup {
    type Err = RunnerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "always" => Ok(Cleanup::Always),
            "onsuccess" | "on_success" => Ok(Cleanup::OnSuccess),
            "never" => Ok(Cleanup::Never),
            other => Err(RunnerError::Configuration(format!(
                "unknown cleanup_job value '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for Cleanup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cleanup::Always => write!(f, "always"),
            Cleanup::OnSuccess => write!(f, "onsuccess"),
            Cleanup::Never => write!(f, "never"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StagingHandle {
    pub cleanup: Cleanup,
}

/// `cleanup_job` destination param; unknown values keep remote state.
fn cleanup_param(raw: Option<&str>) -> Cleanup {
    match raw {
        None => Cleanup::Always,
        Some(raw) => raw.parse().unwrap_or_else(|e| {
            warn!(error = %e, "keeping remote job state");
            Cleanup::Never
        }),
    }
}

fn cleanup_for(destination: &JobDestination) -> Cleanup {
    cleanup_param(destination.param("cleanup_job"))
}

/// Same as [`cleanup_for`], from the params persisted on the job.
fn cleanup_for_job(job: &Job) -> Cleanup {
    cleanup_param(job.destination_params.get("cleanup_job").map(String::as_str))
}

/// Plain file name, so an agent answer can never escape the target directory.
fn safe_name(name: &str) -> Option<&str> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains('/')
        && !name.contains('\\');
    valid.then_some(name)
}

pub struct StagingBackend {
    name: String,
    client: reqwest::Client,
    base: Url,
    token: Option<String>,
    poll_interval: Duration,
}

impl StagingBackend {
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

    fn url(&self, job: &str, action: &str) -> Result<Url> {
        Ok(self.base.join(&format!("jobs/{}/{}", job, action))?)
    }

    fn file_url(&self, job: &str, kind: &str, name: &str) -> Result<Url> {
        let mut url = self.url(job, "files")?;
        url.query_pairs_mut()
            .append_pair("kind", kind)
            .append_pair("name", name);
        Ok(url)
    }

    async fn post(&self, job: &str, action: &str) -> Result<reqwest::Response> {
        Ok(authorized(self.client.post(self.url(job, action)?), self.token.as_deref())
            .send()
            .await?
            .error_for_status()?)
    }

    async fn upload(&self, job: &str, kind: &str, name: &str, body: Vec<u8>) -> Result<()> {
        authorized(self.client.put(self.file_url(job, kind, name)?), self.token.as_deref())
            .body(body)
            .send()
            .await?
            .error_for_status()?;
        debug!(job, kind, name, "file staged");
        Ok(())
    }

    async fn download(&self, job: &str, kind: &str, name: &str, target: &Path) -> Result<()> {
        let bytes = authorized(self.client.get(self.file_url(job, kind, name)?), self.token.as_deref())
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(target, &bytes).await?;
        debug!(job, kind, name, target = %target.display(), "file retrieved");
        Ok(())
    }

    async fn status(&self, job: &str) -> Result<AgentStatus> {
        Ok(authorized(self.client.get(self.url(job, "status")?), self.token.as_deref())
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?)
    }

    /// Upload every regular file of the local working directory. Text files
    /// go through the path mapper; anything else is sent verbatim.
    async fn stage_working_directory(&self, job: &str, dir: &Path, mapper: &PathMapper) -> Result<usize> {
        let mut staged = 0;
        let mut entries = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            let raw = tokio::fs::read(entry.path()).await?;
            let body = match String::from_utf8(raw) {
                Ok(text) => mapper.apply(&text).into_bytes(),
                Err(e) => e.into_bytes(),
            };
            self.upload(job, "workdir", &name, body).await?;
            staged += 1;
        }
        Ok(staged)
    }

    /// Upload inputs and working directory files, then start the command.
    /// Returns how many working directory files were staged.
    async fn stage(&self, job: &PreparedJob, destination: &JobDestination, layout: &RemoteLayout) -> Result<usize> {
        let mapper = PathMapper::for_job(job, layout);

        for dataset in &job.inputs {
            let bytes = tokio::fs::read(&dataset.file_path).await.map_err(|e| {
                RunnerError::Submission(format!(
                    "input {} ({}) is not readable: {}",
                    dataset.hid,
                    dataset.file_path.display(),
                    e
                ))
            })?;
            self.upload(&layout.job_id, "input", &remote_name(dataset), bytes)
                .await?;
        }
        let configs = self
            .stage_working_directory(&layout.job_id, &job.working_directory, &mapper)
            .await?;

        let command = mapper.apply(&job.command);
        let request = SubmitRequest {
            command: &command,
            params: &destination.params,
        };
        authorized(self.client.post(self.url(&layout.job_id, "submit")?), self.token.as_deref())
            .json(&request)
            .send()
            .await?
            .error_for_status()?;
        Ok(configs)
    }

    async fn clean(&self, external_id: &str) {
        match self.post(external_id, "clean").await {
            Ok(_) => debug!(external_id, "remote job state discarded"),
            Err(e) => warn!(external_id, error = %e, "could not clean remote job"),
        }
    }
}

#[async_trait]
impl PollingBackend for StagingBackend {
    type Handle = StagingHandle;

    fn name(&self) -> &str {
        &self.name
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    async fn submit(&self, job: &PreparedJob, destination: &JobDestination) -> Result<Submission<StagingHandle>> {
        let job_key = job.job.id.to_string();
        let layout: RemoteLayout = self.post(&job_key, "setup").await?.json().await?;
        let configs = match self.stage(job, destination, &layout).await {
            Ok(configs) => configs,
            Err(e) => {
                self.clean(&layout.job_id).await;
                return Err(e);
            }
        };
        info!(
            job_id = job.job.id,
            remote_job = %layout.job_id,
            inputs = job.inputs.len(),
            configs,
            "job staged and submitted"
        );
        Ok(Submission {
            external_id: layout.job_id,
            handle: StagingHandle {
                cleanup: cleanup_for(destination),
            },
        })
    }

    async fn poll(&self, state: &WatchedJobState<StagingHandle>) -> Result<RemoteStatus> {
        let status = self.status(&state.external_id).await?;
        let remote = match status.status.as_str() {
            "queued" | "preprocessing" => RemoteStatus::Queued,
            "running" | "postprocessing" => RemoteStatus::Running,
            "complete" => RemoteStatus::Finished,
            "failed" => match FailureKind::from_log(&status.stderr) {
                Some(failure) => RemoteStatus::Failed {
                    failure,
                    message: None,
                },
                None => RemoteStatus::Finished,
            },
            "lost" => RemoteStatus::Failed {
                failure: FailureKind::Unknown,
                message: Some("The remote agent lost track of this job.".into()),
            },
            other => {
                return Err(RunnerError::Communication(format!(
                    "unknown agent status '{}'",
                    other
                )))
            }
        };
        Ok(remote)
    }

    async fn collect(&self, state: &WatchedJobState<StagingHandle>) -> Result<JobOutcome> {
        let remote = &state.external_id;
        let status = self.status(remote).await?;
        let job = state.wrapper.load_job().await?;

        for assoc in &job.outputs {
            let dataset = state.wrapper.store().get_dataset(assoc.dataset_id).await?;
            let name = remote_name(&dataset);
            if status.outputs.contains(&name) {
                self.download(remote, "output", &name, &dataset.file_path).await?;
            } else {
                warn!(job_id = job.id, output = %name, "declared output missing on agent");
            }
        }

        let working_directory = state.wrapper.working_directory();
        for name in &status.working_directory_contents {
            match safe_name(name) {
                Some(name) => {
                    self.download(remote, "workdir", name, &working_directory.join(name))
                        .await?
                }
                None => warn!(job_id = job.id, name = %name, "skipping unsafe working directory entry"),
            }
        }

        Ok(JobOutcome {
            stdout: status.stdout,
            stderr: status.stderr,
            exit_code: status.exit_code,
        })
    }

    async fn kill(&self, job: &Job) -> Result<()> {
        let Some(external_id) = job.external_id.as_deref() else {
            return Ok(());
        };
        self.post(external_id, "cancel").await?;
        if cleanup_for_job(job) == Cleanup::Always {
            self.clean(external_id).await;
        }
        Ok(())
    }

    fn reattach(&self, job: &Job, _wrapper: &JobWrapper) -> Result<StagingHandle> {
        Ok(StagingHandle {
            cleanup: cleanup_for_job(job),
        })
    }

    async fn finish_job(&self, state: WatchedJobState<StagingHandle>) {
        let external_id = state.external_id.clone();
        let cleanup = state.handle.cleanup;
        let wrapper = state.wrapper.clone();
        monitor::finish_job(self, state).await;

        let succeeded = matches!(wrapper.load_job().await, Ok(job) if job.state == JobState::Ok);
        if cleanup == Cleanup::Always || (cleanup == Cleanup::OnSuccess && succeeded) {
            self.clean(&external_id).await;
        }
    }

    async fn fail_job(&self, state: WatchedJobState<StagingHandle>) {
        let external_id = state.external_id.clone();
        let cleanup = state.handle.cleanup;
        monitor::fail_job(self, state).await;
        if cleanup == Cleanup::Always {
            self.clean(&external_id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cleanup_parses_known_values() {
        assert_eq!("always".parse::<Cleanup>().unwrap(), Cleanup::Always);
        assert_eq!("OnSuccess".parse::<Cleanup>().unwrap(), Cleanup::OnSuccess);
        assert!("sometimes".parse::<Cleanup>().is_err());

        let dest = JobDestination::new("remote", "staging").with_param("cleanup_job", "sometimes");
        assert_eq!(cleanup_for(&dest), Cleanup::Never);
        assert_eq!(cleanup_for(&JobDestination::new("remote", "staging")), Cleanup::Always);
    }

    #[test]
    fn agent_names_cannot_escape() {
        assert_eq!(safe_name("metrics.json"), Some("metrics.json"));
        assert_eq!(safe_name("../etc/passwd"), None);
        assert_eq!(safe_name(".."), None);
        assert_eq!(safe_name(""), None);
    }
}
