//! Slurm backend driven through the scheduler's CLI.
//!
//! The working directory is assumed to be on a filesystem shared with the
//! compute nodes, so the job script and its output files are read and
//! written locally while `sbatch`/`squeue`/`sacct`/`scancel` run through a
//! [`CommandShell`].

mod script;
mod state;


pub use script::{format_walltime, render, JobFiles};
pub use state::{classify, classify_all, normalize, parse_job_id, parse_states};

use std::time::Duration;

use async_trait::async_trait;
use gantry_core::{FailureKind, Job, JobDestination};
use tracing::{debug, info};

use super::shell::{self, CommandShell};
use super::{poll_interval, RunnerParams};
use crate::error::{Result, RunnerError};
use crate::monitor::{PollingBackend, RemoteStatus, Submission, WatchedJobState};
use crate::wrapper::{JobOutcome, JobWrapper, PreparedJob};

pub struct SlurmBackend {
    name: String,
    shell: Box<dyn CommandShell>,
    poll_interval: Duration,
}

impl SlurmBackend {
    pub fn new(name: impl Into<String>, shell: Box<dyn CommandShell>, poll_interval: Duration) -> Self {
        Self {
            name: name.into(),
            shell,
            poll_interval,
        }
    }

    pub fn from_params(name: &str, params: &RunnerParams) -> Self {
        Self::new(name, shell::from_params(params), poll_interval(params, 5))
    }

    async fn run(&self, argv: &[&str]) -> Result<shell::ShellOutput> {
        let argv: Vec<String> = argv.iter().map(|a| a.to_string()).collect();
        self.shell.run(&argv, None).await
    }

    /// Live state from `squeue`; `None` once the job left the queue.
    async fn squeue(&self, external_id: &str) -> Result<Option<RemoteStatus>> {
        let out = self.run(&["squeue", "-h", "-j", external_id, "-o", "%T"]).await?;
        if !out.success() {
            // Slurm answers "Invalid job id specified" for purged jobs.
            debug!(external_id, stderr = %out.stderr.trim(), "squeue did not list job");
            return Ok(None);
        }
        Ok(classify_all(&parse_states(&out.stdout)))
    }

    async fn sacct(&self, external_id: &str) -> Result<Option<RemoteStatus>> {
        let out = self
            .run(&["sacct", "-n", "-P", "-j", external_id, "-o", "State"])
            .await?;
        if !out.success() {
            return Err(RunnerError::Communication(format!(
                "sacct failed: {}",
                out.stderr.trim()
            )));
        }
        Ok(classify_all(&parse_states(&out.stdout)))
    }
}

#[async_trait]
impl PollingBackend for SlurmBackend {
    type Handle = JobFiles;

    fn name(&self) -> &str {
        &self.name
    }

    fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    async fn submit(&self, job: &PreparedJob, destination: &JobDestination) -> Result<Submission<JobFiles>> {
        let files = JobFiles::new(&job.working_directory, job.job.id);
        let script = render(
            job.job.id,
            &job.command,
            &job.working_directory,
            &files,
            destination,
        );
        tokio::fs::write(&files.script, script).await?;

        let script_path = files.script.to_string_lossy().to_string();
        let out = self.run(&["sbatch", &script_path]).await?;
        if !out.success() {
            return Err(RunnerError::Submission(format!(
                "sbatch exited with {}: {}",
                out.status,
                out.stderr.trim()
            )));
        }
        let external_id = parse_job_id(&out.stdout).ok_or_else(|| {
            RunnerError::Submission(format!("unexpected sbatch output: {}", out.stdout.trim()))
        })?;
        info!(job_id = job.job.id, external_id = %external_id, "batch job submitted");
        Ok(Submission {
            external_id,
            handle: files,
        })
    }

    async fn poll(&self, state: &WatchedJobState<JobFiles>) -> Result<RemoteStatus> {
        let status = match self.squeue(&state.external_id).await? {
            Some(status) => status,
            // Gone from both: let the exit code file decide.
            None => self.sacct(&state.external_id).await?.unwrap_or(RemoteStatus::Finished),
        };

        // Time limits and OOM kills also show up as CANCELLED; the job's
        // stderr tells them apart from a real cancellation.
        if let RemoteStatus::Failed {
            failure: FailureKind::Cancelled,
            ..
        } = status
        {
            let stderr = tokio::fs::read_to_string(&state.handle.stderr)
                .await
                .unwrap_or_default();
            if let Some(failure) = FailureKind::from_log(&stderr) {
                return Ok(RemoteStatus::Failed {
                    failure,
                    message: None,
                });
            }
        }
        Ok(status)
    }

    async fn collect(&self, state: &WatchedJobState<JobFiles>) -> Result<JobOutcome> {
        let files = &state.handle;
        let stdout = tokio::fs::read_to_string(&files.stdout).await.unwrap_or_default();
        let stderr = tokio::fs::read_to_string(&files.stderr).await.unwrap_or_default();
        let exit_code = tokio::fs::read_to_string(&files.exit_code)
            .await
            .ok()
            .and_then(|s| s.trim().parse::<i32>().ok());
        Ok(JobOutcome {
            stdout,
            stderr,
            exit_code,
        })
    }

    async fn kill(&self, job: &Job) -> Result<()> {
        let Some(external_id) = job.external_id.as_deref() else {
            return Ok(());
        };
        let out = self.run(&["scancel", external_id]).await?;
        if !out.success() {
            return Err(RunnerError::Communication(format!(
                "scancel {} failed: {}",
                external_id,
                out.stderr.trim()
            )));
        }
        Ok(())
    }

    fn reattach(&self, job: &Job, wrapper: &JobWrapper) -> Result<JobFiles> {
        Ok(JobFiles::new(&wrapper.working_directory(), job.id))
    }
}
