//! Fixtures shared by the unit tests.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use gantry_core::{Job, JobId, JobOwner, MemoryJobStore, TemplateCommandProducer, UserId};
use gantry_runners::{JobRunner, JobWrapper, RunnerContext, RunnerError};
use tokio::sync::mpsc;

use crate::dispatcher::Dispatcher;
use crate::jobconf::JobConf;

/// Runner that only records what it was asked to do.
#[derive(Default)]
pub(crate) struct RecordingRunner {
    pub name: String,
    pub queued: Mutex<Vec<JobId>>,
    pub stopped: Mutex<Vec<JobId>>,
    pub recovered: Mutex<Vec<JobId>>,
    pub unrecoverable: bool,
}

impl RecordingRunner {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            ..Self::default()
        })
    }

    pub fn unrecoverable(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            unrecoverable: true,
            ..Self::default()
        })
    }

    pub fn queued(&self) -> Vec<JobId> {
        self.queued.lock().unwrap().clone()
    }

    pub fn stopped(&self) -> Vec<JobId> {
        self.stopped.lock().unwrap().clone()
    }

    pub fn recovered(&self) -> Vec<JobId> {
        self.recovered.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobRunner for RecordingRunner {
    fn name(&self) -> &str {
        &self.name
    }

    async fn queue_job(&self, wrapper: JobWrapper) -> gantry_runners::Result<()> {
        self.queued.lock().unwrap().push(wrapper.job_id());
        Ok(())
    }

    async fn stop_job(&self, job: &Job) -> gantry_runners::Result<()> {
        self.stopped.lock().unwrap().push(job.id);
        Ok(())
    }

    async fn recover(&self, job: &Job, _wrapper: JobWrapper) -> gantry_runners::Result<()> {
        if self.unrecoverable {
            return Err(RunnerError::Unrecoverable(job.id, "lost on restart".into()));
        }
        self.recovered.lock().unwrap().push(job.id);
        Ok(())
    }

    async fn shutdown(&self) {}
}

pub(crate) fn context(
    store: Arc<MemoryJobStore>,
    conf: &JobConf,
) -> (RunnerContext, mpsc::UnboundedReceiver<JobId>) {
    let (requeue, requeued) = mpsc::unbounded_channel();
    let ctx = RunnerContext {
        store,
        commands: Arc::new(TemplateCommandProducer::new()),
        working_root: PathBuf::from("jobs"),
        destinations: Arc::new(conf.destination_map()),
        requeue,
    };
    (ctx, requeued)
}

pub(crate) fn dispatcher(
    store: Arc<MemoryJobStore>,
    runners: &[Arc<RecordingRunner>],
    tasked_jobs: bool,
) -> Arc<Dispatcher> {
    let map: BTreeMap<String, Arc<dyn JobRunner>> = runners
        .iter()
        .map(|r| (r.name.clone(), r.clone() as Arc<dyn JobRunner>))
        .collect();
    Arc::new(Dispatcher::new(map, tasked_jobs, store))
}

pub(crate) fn user(id: UserId) -> JobOwner {
    JobOwner::User {
        id,
        email: format!("user{}@example.org", id),
    }
}

pub(crate) fn anonymous(session: &str) -> JobOwner {
    JobOwner::Anonymous {
        session_id: session.into(),
    }
}
