//! Per-job handle passed to runners.
//!
//! A [`JobWrapper`] pairs a job id with its resolved destination and the
//! shared collaborators (store, command producer, declared destinations).
//! Every state change a runner makes goes through it, and it re-reads the
//! job from the store each time so external changes are respected.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use gantry_core::{
    CommandContext, CommandProducer, Dataset, DatasetAssociation, DatasetState, FailureKind, Job,
    JobDestination, JobEvent, JobEventKind, JobId, JobState, JobStore,
};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::Result;
use crate::resubmit::select_rule;

/// Message shown when the backend gives nothing better.
pub const GENERIC_REMOTE_ERROR: &str =
    "Unable to communicate with the execution backend. Please contact an administrator if the problem persists.";

/// Collaborators shared by every wrapper of a handler.
#[derive(Clone)]
pub struct RunnerContext {
    pub store: Arc<dyn JobStore>,
    pub commands: Arc<dyn CommandProducer>,
    /// Parent of per-job working directories.
    pub working_root: PathBuf,
    /// Declared destinations, used to resolve resubmission targets.
    pub destinations: Arc<BTreeMap<String, JobDestination>>,
    /// Jobs to dispatch again after a resubmission.
    pub requeue: mpsc::UnboundedSender<JobId>,
}

/// Everything needed to submit a job.
#[derive(Debug, Clone)]
pub struct PreparedJob {
    pub job: Job,
    pub inputs: Vec<Dataset>,
    pub outputs: Vec<Dataset>,
    pub command: String,
    pub working_directory: PathBuf,
}

/// Raw result collected from a backend once a job stops running.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOutcome {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

/// How a job was settled by [`JobWrapper::finish`] or [`JobWrapper::fail`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settled {
    Succeeded,
    Failed,
    /// Requeued on the named destination.
    Resubmitted(String),
    /// The job was already deleted or stopped; nothing was written.
    Ignored,
}

#[derive(Clone)]
pub struct JobWrapper {
    ctx: RunnerContext,
    job_id: JobId,
    destination: JobDestination,
}

impl JobWrapper {
    pub fn new(ctx: RunnerContext, job_id: JobId, destination: JobDestination) -> Self {
        Self {
            ctx,
            job_id,
            destination,
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn destination(&self) -> &JobDestination {
        &self.destination
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.ctx.store
    }

    pub fn working_directory(&self) -> PathBuf {
        self.ctx.working_root.join(self.job_id.to_string())
    }

    pub async fn load_job(&self) -> Result<Job> {
        Ok(self.ctx.store.get_job(self.job_id).await?)
    }

    /// Whether the job was deleted or stopped since it was handed over.
    pub async fn is_cancelled(&self) -> Result<bool> {
        let job = self.load_job().await?;
        Ok(is_cancelled_state(job.state))
    }

    async fn datasets(&self, assocs: &[DatasetAssociation]) -> Result<Vec<Dataset>> {
        let mut out = Vec::with_capacity(assocs.len());
        for assoc in assocs {
            out.push(self.ctx.store.get_dataset(assoc.dataset_id).await?);
        }
        Ok(out)
    }

    /// Load datasets, create the working directory and build the command.
    pub async fn prepare(&self) -> Result<PreparedJob> {
        let job = self.load_job().await?;
        let inputs = self.datasets(&job.inputs).await?;
        let outputs = self.datasets(&job.outputs).await?;
        let working_directory = self.working_directory();
        tokio::fs::create_dir_all(&working_directory).await?;

        let command = self.ctx.commands.build(&CommandContext {
            job: &job,
            inputs: &inputs,
            outputs: &outputs,
            destination: &self.destination,
            working_directory: &working_directory,
        })?;

        Ok(PreparedJob {
            job,
            inputs,
            outputs,
            command,
            working_directory,
        })
    }

    /// Record the backend handle and move the job to QUEUED.
    pub async fn mark_queued(&self, runner_name: &str, external_id: &str) -> Result<()> {
        let store = &self.ctx.store;
        store
            .set_external(
                self.job_id,
                Some(runner_name.to_string()),
                Some(external_id.to_string()),
            )
            .await?;
        store.update_state(self.job_id, JobState::Queued, None).await?;
        store
            .append_history(
                self.job_id,
                JobEvent::now(JobEventKind::Submitted {
                    external_id: external_id.to_string(),
                }),
            )
            .await?;
        info!(job_id = %self.job_id, runner = %runner_name, external_id = %external_id, "job submitted");
        Ok(())
    }

    pub async fn mark_running(&self) -> Result<()> {
        let job = self.load_job().await?;
        if is_cancelled_state(job.state) {
            return Ok(());
        }
        self.ctx
            .store
            .update_state(self.job_id, JobState::Running, None)
            .await?;
        self.set_outputs(&job, DatasetState::Running, None).await
    }

    /// Settle a job that stopped running on its own.
    ///
    /// Exit code zero means success. Otherwise log markers decide whether
    /// the failure is classified (and possibly resubmitted) or a plain tool
    /// error.
    pub async fn finish(&self, outcome: &JobOutcome) -> Result<Settled> {
        if outcome.exit_code == Some(0) {
            let job = self.load_job().await?;
            if is_cancelled_state(job.state) {
                return Ok(Settled::Ignored);
            }
            self.ctx
                .store
                .update_state(self.job_id, JobState::Ok, None)
                .await?;
            self.set_outputs(&job, DatasetState::Ok, None).await?;
            info!(job_id = %self.job_id, "job finished");
            return Ok(Settled::Succeeded);
        }

        let failure = FailureKind::from_log(&outcome.stderr)
            .or_else(|| FailureKind::from_log(&outcome.stdout));
        let message = match failure {
            Some(kind) => kind.user_message().to_string(),
            None => tool_error_message(outcome),
        };
        self.fail(&message, failure).await
    }

    /// Fail the job, or requeue it when a resubmit rule matches `failure`.
    pub async fn fail(&self, message: &str, failure: Option<FailureKind>) -> Result<Settled> {
        let job = self.load_job().await?;
        if is_cancelled_state(job.state) {
            return Ok(Settled::Ignored);
        }

        if let Some(kind) = failure {
            if let Some((key, rule)) = select_rule(&job, &self.destination, kind) {
                let target_id = rule
                    .environment
                    .clone()
                    .unwrap_or_else(|| self.destination.id.clone());
                let target = if target_id == self.destination.id {
                    Some(self.destination.clone())
                } else {
                    self.ctx.destinations.get(&target_id).cloned()
                };
                match target {
                    Some(target) => {
                        self.resubmit(&job, target, key, kind, rule.delay).await?;
                        return Ok(Settled::Resubmitted(target_id));
                    }
                    None => warn!(
                        job_id = %self.job_id,
                        destination = %target_id,
                        "resubmit target is not a declared destination"
                    ),
                }
            }
        }

        let store = &self.ctx.store;
        store
            .update_state(self.job_id, JobState::Error, Some(message.to_string()))
            .await?;
        store
            .append_history(
                self.job_id,
                JobEvent::now(JobEventKind::Failed { failure }).with_message(message),
            )
            .await?;
        self.set_outputs(&job, DatasetState::Error, Some(message)).await?;
        warn!(job_id = %self.job_id, failure = ?failure, "job failed: {}", message);
        Ok(Settled::Failed)
    }

    async fn resubmit(
        &self,
        job: &Job,
        target: JobDestination,
        key: String,
        failure: FailureKind,
        delay: Option<u64>,
    ) -> Result<()> {
        let store = &self.ctx.store;
        store.set_destination(self.job_id, &target).await?;
        store
            .set_external(self.job_id, Some(target.runner.clone()), None)
            .await?;
        store
            .update_state(
                self.job_id,
                JobState::Queued,
                Some(format!("{} Resubmitted to '{}'.", failure.user_message(), target.id)),
            )
            .await?;
        store
            .append_history(
                self.job_id,
                JobEvent::now(JobEventKind::Resubmitted {
                    destination: target.id.clone(),
                    rule: key.clone(),
                }),
            )
            .await?;
        self.set_outputs(job, DatasetState::Queued, None).await?;
        info!(
            job_id = %self.job_id,
            from = %self.destination.id,
            to = %target.id,
            rule = %key,
            failure = %failure,
            "resubmitting job"
        );

        let requeue = self.ctx.requeue.clone();
        let job_id = self.job_id;
        match delay.filter(|d| *d > 0) {
            Some(secs) => {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_secs(secs)).await;
                    let _ = requeue.send(job_id);
                });
            }
            None => {
                let _ = requeue.send(job_id);
            }
        }
        Ok(())
    }

    async fn set_outputs(&self, job: &Job, state: DatasetState, info: Option<&str>) -> Result<()> {
        for assoc in &job.outputs {
            self.ctx
                .store
                .update_dataset_state(assoc.dataset_id, state, info.map(str::to_string))
                .await?;
        }
        Ok(())
    }
}

fn is_cancelled_state(state: JobState) -> bool {
    state.is_deleted() || state == JobState::Stopped
}

fn tool_error_message(outcome: &JobOutcome) -> String {
    let tail: String = outcome
        .stderr
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or_default()
        .chars()
        .take(200)
        .collect();
    match (outcome.exit_code, tail.is_empty()) {
        (Some(code), true) => format!("Tool exited with code {}.", code),
        (Some(code), false) => format!("Tool exited with code {}: {}", code, tail),
        (None, _) => "Job output could not be collected.".to_string(),
    }
}
