//! Routes jobs to runner plugins by name.

use std::collections::BTreeMap;
use std::sync::Arc;

use gantry_core::{Job, JobEvent, JobEventKind, JobStore};
use gantry_runners::{JobRunner, JobWrapper, RunnerError};
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::settle::fail_job;

/// Runner that receives splittable jobs when tasked jobs are enabled.
pub const TASKS_RUNNER: &str = "tasks";

pub const MISCONFIGURED: &str =
    "Unable to run job due to a misconfiguration of the job handler. Please contact an administrator.";

pub struct Dispatcher {
    runners: BTreeMap<String, Arc<dyn JobRunner>>,
    tasked_jobs: bool,
    store: Arc<dyn JobStore>,
}

impl Dispatcher {
    pub fn new(
        runners: BTreeMap<String, Arc<dyn JobRunner>>,
        tasked_jobs: bool,
        store: Arc<dyn JobStore>,
    ) -> Self {
        Self {
            runners,
            tasked_jobs,
            store,
        }
    }

    pub fn runner_names(&self) -> Vec<&str> {
        self.runners.keys().map(String::as_str).collect()
    }

    pub fn runner(&self, name: &str) -> Option<&Arc<dyn JobRunner>> {
        self.runners.get(name)
    }

    /// Plugin name a ready job goes to.
    pub fn runner_name_for<'a>(&self, job: &Job, wrapper: &'a JobWrapper) -> &'a str {
        if self.tasked_jobs && job.splittable {
            TASKS_RUNNER
        } else {
            &wrapper.destination().runner
        }
    }

    /// Hand a ready job to its runner.
    pub async fn put(&self, job: &Job, wrapper: JobWrapper) -> Result<()> {
        let name = self.runner_name_for(job, &wrapper).to_string();
        let Some(runner) = self.runners.get(&name) else {
            error!(job_id = job.id, runner = %name, "job requires an unavailable runner plugin");
            return fail_job(self.store.as_ref(), job, MISCONFIGURED).await;
        };

        self.store
            .append_history(job.id, JobEvent::now(JobEventKind::Dispatched { runner: name.clone() }))
            .await?;
        match runner.queue_job(wrapper).await {
            Ok(()) => {
                debug!(job_id = job.id, runner = %name, "job dispatched");
                Ok(())
            }
            // Left QUEUED without a backend handle; reset and re-admitted on restart.
            Err(RunnerError::ShuttingDown) => {
                warn!(job_id = job.id, runner = %name, "runner is shutting down; job not queued");
                Ok(())
            }
            Err(e) => {
                error!(job_id = job.id, runner = %name, error = %e, "runner refused job");
                fail_job(self.store.as_ref(), job, MISCONFIGURED).await
            }
        }
    }

    /// Terminate a job on the runner recorded for it.
    pub async fn stop(&self, job: &Job) {
        let Some(name) = job.runner_name.as_deref() else {
            debug!(job_id = job.id, "job never reached a runner; nothing to stop");
            return;
        };
        match self.runners.get(name) {
            Some(runner) => {
                if let Err(e) = runner.stop_job(job).await {
                    warn!(job_id = job.id, runner = %name, error = %e, "failed to stop job");
                }
            }
            None => warn!(job_id = job.id, runner = %name, "cannot stop job: runner plugin not loaded"),
        }
    }

    /// Reattach a job submitted before a restart.
    pub async fn recover(&self, job: &Job, wrapper: JobWrapper) -> Result<()> {
        let name = job
            .runner_name
            .clone()
            .unwrap_or_else(|| wrapper.destination().runner.clone());
        let Some(runner) = self.runners.get(&name) else {
            error!(job_id = job.id, runner = %name, "cannot recover job: runner plugin not loaded");
            return fail_job(self.store.as_ref(), job, MISCONFIGURED).await;
        };
        match runner.recover(job, wrapper).await {
            Ok(()) => Ok(()),
            Err(RunnerError::Unrecoverable(_, reason)) => {
                warn!(job_id = job.id, runner = %name, reason = %reason, "job cannot be recovered");
                fail_job(self.store.as_ref(), job, &reason).await
            }
            Err(e) => {
                error!(job_id = job.id, runner = %name, error = %e, "job recovery failed");
                fail_job(self.store.as_ref(), job, MISCONFIGURED).await
            }
        }
    }

    pub async fn shutdown(&self) {
        for (name, runner) in &self.runners {
            runner.shutdown().await;
            info!(runner = %name, "runner plugin stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use gantry_core::{JobDestination, JobState, MemoryJobStore};

    use super::*;
    use crate::jobconf::JobConf;
    use crate::test_support::{anonymous, context, dispatcher, RecordingRunner};

    fn setup(
        tasked: bool,
        runners: &[Arc<RecordingRunner>],
    ) -> (Arc<Dispatcher>, Arc<MemoryJobStore>, gantry_runners::RunnerContext) {
        let store = Arc::new(MemoryJobStore::new());
        let (ctx, _requeued) = context(store.clone(), &JobConf::default());
        (dispatcher(store.clone(), runners, tasked), store, ctx)
    }

    #[tokio::test]
    async fn put_routes_by_destination_runner() {
        let slurm = RecordingRunner::new("slurm");
        let (dispatcher, store, ctx) = setup(false, &[slurm.clone()]);
        let job = Job::new(1, "cat1", anonymous("s1")).with_state(JobState::Queued);
        store.insert_job(job.clone());

        let wrapper = JobWrapper::new(ctx, 1, JobDestination::new("slurm_normal", "slurm"));
        dispatcher.put(&job, wrapper).await.unwrap();

        assert_eq!(slurm.queued(), vec![1]);
        let job = store.get_job(1).await.unwrap();
        assert!(matches!(
            job.history.last().map(|e| &e.kind),
            Some(JobEventKind::Dispatched { runner }) if runner == "slurm"
        ));
    }

    #[tokio::test]
    async fn splittable_jobs_go_to_tasks_runner() {
        let local = RecordingRunner::new("local");
        let tasks = RecordingRunner::new(TASKS_RUNNER);
        let (dispatcher, store, ctx) = setup(true, &[local.clone(), tasks.clone()]);
        let mut job = Job::new(1, "cat1", anonymous("s1"));
        job.splittable = true;
        store.insert_job(job.clone());

        let wrapper = JobWrapper::new(ctx, 1, JobDestination::new("local_default", "local"));
        dispatcher.put(&job, wrapper).await.unwrap();

        assert_eq!(tasks.queued(), vec![1]);
        assert!(local.queued().is_empty());
    }

    #[tokio::test]
    async fn missing_plugin_fails_the_job() {
        let (dispatcher, store, ctx) = setup(false, &[]);
        let job = Job::new(1, "cat1", anonymous("s1")).with_state(JobState::Queued);
        store.insert_job(job.clone());

        let wrapper = JobWrapper::new(ctx, 1, JobDestination::new("pulsar", "pulsar"));
        dispatcher.put(&job, wrapper).await.unwrap();

        let job = store.get_job(1).await.unwrap();
        assert_eq!(job.state, JobState::Error);
        assert_eq!(job.info.as_deref(), Some(MISCONFIGURED));
    }

    #[tokio::test]
    async fn stop_uses_persisted_runner_name() {
        let slurm = RecordingRunner::new("slurm");
        let (dispatcher, _store, _ctx) = setup(false, &[slurm.clone()]);
        let mut job = Job::new(1, "cat1", anonymous("s1"));
        dispatcher.stop(&job).await;

        job.runner_name = Some("slurm".into());
        job.external_id = Some("42".into());
        dispatcher.stop(&job).await;

        job.runner_name = Some("gone".into());
        dispatcher.stop(&job).await;

        assert_eq!(slurm.stopped(), vec![1]);
    }

    #[tokio::test]
    async fn recover_reattaches_on_recorded_runner() {
        let slurm = RecordingRunner::new("slurm");
        let (dispatcher, store, ctx) = setup(false, &[slurm.clone()]);
        let mut job = Job::new(1, "cat1", anonymous("s1")).with_state(JobState::Running);
        job.runner_name = Some("slurm".into());
        job.external_id = Some("42".into());
        store.insert_job(job.clone());

        let wrapper = JobWrapper::new(ctx, 1, JobDestination::new("slurm_normal", "slurm"));
        dispatcher.recover(&job, wrapper).await.unwrap();
        assert_eq!(slurm.recovered(), vec![1]);
        assert_eq!(store.get_job(1).await.unwrap().state, JobState::Running);
    }

    #[tokio::test]
    async fn unrecoverable_job_is_failed_with_runner_reason() {
        let local = RecordingRunner::unrecoverable("local");
        let (dispatcher, store, ctx) = setup(false, &[local]);
        let mut job = Job::new(1, "cat1", anonymous("s1")).with_state(JobState::Running);
        job.runner_name = Some("local".into());
        job.external_id = Some("1234".into());
        store.insert_job(job.clone());

        let wrapper = JobWrapper::new(ctx, 1, JobDestination::new("local_default", "local"));
        dispatcher.recover(&job, wrapper).await.unwrap();

        let job = store.get_job(1).await.unwrap();
        assert_eq!(job.state, JobState::Error);
        assert_eq!(job.info.as_deref(), Some("lost on restart"));
    }
}
