//! Startup recovery of jobs left unfinished by a previous process.
//!
//! Every NEW, QUEUED or RUNNING job owned by this handler is re-triaged:
//! jobs whose tool is gone are failed, jobs that never reached a backend go
//! back through admission, and submitted jobs are reattached to their
//! runner without being submitted again.

use std::collections::BTreeSet;
use std::sync::Arc;

use gantry_core::{Job, JobFilter, JobState, JobStore};
use gantry_runners::{JobWrapper, RunnerContext};
use tracing::{error, info, warn};

use crate::admission::AdmissionQueue;
use crate::dispatcher::{Dispatcher, MISCONFIGURED};
use crate::error::Result;
use crate::jobconf::JobConf;
use crate::settle::fail_job;

pub const TOOL_UNAVAILABLE: &str =
    "This job could not be resumed because its tool is no longer available.";

/// Which tools are still installed.
pub trait ToolCatalog: Send + Sync {
    fn contains(&self, tool_id: &str) -> bool;
}

/// Catalog that knows every tool; used when no tool list is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyTool;

impl ToolCatalog for AnyTool {
    fn contains(&self, _tool_id: &str) -> bool {
        true
    }
}

impl ToolCatalog for BTreeSet<String> {
    fn contains(&self, tool_id: &str) -> bool {
        BTreeSet::contains(self, tool_id)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    pub readmitted: usize,
    pub reattached: usize,
    pub failed: usize,
}

pub struct Recovery<'a> {
    pub handler_id: &'a str,
    pub store: &'a Arc<dyn JobStore>,
    pub tools: &'a dyn ToolCatalog,
    pub jobconf: &'a JobConf,
    pub dispatcher: &'a Dispatcher,
    pub ctx: &'a RunnerContext,
    pub admission: &'a AdmissionQueue,
}

impl Recovery<'_> {
    pub async fn run(&self) -> Result<RecoverySummary> {
        let filter = JobFilter::states(&[JobState::New, JobState::Queued, JobState::Running])
            .handler(self.handler_id);
        let jobs = self.store.find_jobs(&filter).await?;
        let mut summary = RecoverySummary::default();
        for job in jobs {
            if let Err(e) = self.recover_job(&job, &mut summary).await {
                error!(job_id = job.id, error = %e, "failed to recover job");
                summary.failed += 1;
            }
        }
        info!(
            handler = %self.handler_id,
            readmitted = summary.readmitted,
            reattached = summary.reattached,
            failed = summary.failed,
            "startup recovery complete"
        );
        Ok(summary)
    }

    async fn recover_job(&self, job: &Job, summary: &mut RecoverySummary) -> Result<()> {
        let store = self.store.as_ref();
        if !self.tools.contains(&job.tool_id) {
            warn!(job_id = job.id, tool = %job.tool_id, "tool is gone; failing job");
            fail_job(store, job, TOOL_UNAVAILABLE).await?;
            summary.failed += 1;
            return Ok(());
        }

        if job.state == JobState::New {
            self.admission.put(job.id);
            summary.readmitted += 1;
            return Ok(());
        }

        if !job.was_submitted() {
            // Never reached a backend: back to admission with a clean slate.
            store.set_external(job.id, None, None).await?;
            store.update_state(job.id, JobState::New, None).await?;
            self.admission.put(job.id);
            info!(job_id = job.id, state = %job.state, "job was never submitted; re-admitting");
            summary.readmitted += 1;
            return Ok(());
        }

        let Some(mut destination) = job.persisted_destination() else {
            warn!(job_id = job.id, "submitted job has no recorded destination");
            fail_job(store, job, MISCONFIGURED).await?;
            summary.failed += 1;
            return Ok(());
        };
        if let Some(declared) = self.jobconf.destination(&destination.id) {
            destination.resubmit = declared.resubmit.clone();
        }
        info!(
            job_id = job.id,
            destination = %destination.id,
            runner = %destination.runner,
            external_id = job.external_id.as_deref().unwrap_or_default(),
            "reattaching job"
        );
        let wrapper = JobWrapper::new(self.ctx.clone(), job.id, destination);
        self.dispatcher.recover(job, wrapper).await?;
        summary.reattached += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use gantry_core::MemoryJobStore;

    use super::*;
    use crate::admission::{AdmissionController, AdmissionSettings};
    use crate::destinations::DestinationResolver;
    use crate::test_support::{context, dispatcher, user, RecordingRunner};
    use gantry_core::config::TrackingMode;
    use std::time::Duration;

    const CONF: &str = r#"
runners:
  slurm: { load: slurm }
destinations:
  - id: slurm_normal
    runner: slurm
    resubmit:
      - { condition: walltime_reached }
default_destination: slurm_normal
"#;

    fn submitted(id: u64, tool: &str) -> Job {
        let mut job = Job::new(id, tool, user(1))
            .with_handler("main")
            .with_state(JobState::Running);
        job.destination_id = Some("slurm_normal".into());
        job.runner_name = Some("slurm".into());
        job.external_id = Some("9001".into());
        job
    }

    #[tokio::test]
    async fn triages_each_unfinished_job() {
        let conf = Arc::new(JobConf::from_yaml(CONF).unwrap());
        let store = Arc::new(MemoryJobStore::new());
        let slurm = RecordingRunner::new("slurm");
        let dispatcher = dispatcher(store.clone(), &[slurm.clone()], false);
        let (ctx, _requeued) = context(store.clone(), &conf);
        let (mut controller, queue) = AdmissionController::new(
            AdmissionSettings {
                handler_id: "main".into(),
                interval: Duration::from_millis(10),
                tracking: TrackingMode::Memory,
                quota_enabled: false,
            },
            store.clone(),
            DestinationResolver::new(conf.clone(), None),
            dispatcher.clone(),
            ctx.clone(),
            conf.limits.clone(),
        );

        store.insert_job(Job::new(1, "cat1", user(1)).with_handler("main"));
        let mut queued = Job::new(2, "cat1", user(1))
            .with_handler("main")
            .with_state(JobState::Queued);
        queued.runner_name = Some("slurm".into());
        store.insert_job(queued);
        store.insert_job(submitted(3, "cat1"));
        store.insert_job(submitted(4, "retired_tool"));
        store.insert_job(submitted(5, "cat1").with_handler("other"));
        store.insert_job(submitted(6, "cat1").with_state(JobState::Ok));

        let tools: BTreeSet<String> = ["cat1".to_string()].into();
        let store_dyn: Arc<dyn JobStore> = store.clone();
        let summary = Recovery {
            handler_id: "main",
            store: &store_dyn,
            tools: &tools,
            jobconf: &conf,
            dispatcher: &dispatcher,
            ctx: &ctx,
            admission: &queue,
        }
        .run()
        .await
        .unwrap();

        assert_eq!(
            summary,
            RecoverySummary {
                readmitted: 2,
                reattached: 1,
                failed: 1
            }
        );
        assert_eq!(slurm.recovered(), vec![3]);
        assert!(slurm.queued().is_empty());

        let reset = store.get_job(2).await.unwrap();
        assert_eq!(reset.state, JobState::New);
        assert_eq!(reset.runner_name, None);

        let gone = store.get_job(4).await.unwrap();
        assert_eq!(gone.state, JobState::Error);
        assert_eq!(gone.info.as_deref(), Some(TOOL_UNAVAILABLE));

        // Re-admitted jobs are dispatched by the next scan.
        assert_eq!(controller.scan().await.unwrap(), 2);
        assert_eq!(slurm.queued(), vec![1, 2]);
    }

    #[tokio::test]
    async fn broken_job_does_not_stop_the_others() {
        let conf = Arc::new(JobConf::from_yaml(CONF).unwrap());
        let store = Arc::new(MemoryJobStore::new());
        let slurm = RecordingRunner::new("slurm");
        let dispatcher = dispatcher(store.clone(), &[slurm.clone()], false);
        let (ctx, _requeued) = context(store.clone(), &conf);
        let (_controller, queue) = AdmissionController::new(
            AdmissionSettings {
                handler_id: "main".into(),
                interval: Duration::from_millis(10),
                tracking: TrackingMode::Memory,
                quota_enabled: false,
            },
            store.clone(),
            DestinationResolver::new(conf.clone(), None),
            dispatcher.clone(),
            ctx.clone(),
            conf.limits.clone(),
        );

        // Failing job 1 trips over its missing output dataset.
        store.insert_job(submitted(1, "retired_tool").with_output("out", 77));
        store.insert_job(submitted(2, "cat1"));

        let tools: BTreeSet<String> = ["cat1".to_string()].into();
        let store_dyn: Arc<dyn JobStore> = store.clone();
        let summary = Recovery {
            handler_id: "main",
            store: &store_dyn,
            tools: &tools,
            jobconf: &conf,
            dispatcher: &dispatcher,
            ctx: &ctx,
            admission: &queue,
        }
        .run()
        .await
        .unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.reattached, 1);
        assert_eq!(slurm.recovered(), vec![2]);
    }
}
