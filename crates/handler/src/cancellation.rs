//! Cancellation queue: settles deleted jobs and stops them on their runner.
//!
//! Requests arrive as `(job id, optional message)`. Without a message the
//! user deleted the job and it ends DELETED; with one an administrator (or
//! an error path) killed it and it ends ERROR carrying the message. In
//! store tracking mode each pass also picks up jobs left in DELETED_NEW.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use gantry_core::config::TrackingMode;
use gantry_core::{
    DatasetState, JobEvent, JobEventKind, JobFilter, JobId, JobState, JobStore, StoreError,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::dispatcher::Dispatcher;
use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CancelRequest {
    pub job_id: JobId,
    /// Set for administrative kills; shown to the user.
    pub message: Option<String>,
}

#[derive(Clone)]
pub struct CancellationQueue {
    tx: mpsc::UnboundedSender<CancelRequest>,
}

impl CancellationQueue {
    pub fn put(&self, job_id: JobId, message: Option<String>) {
        if self.tx.send(CancelRequest { job_id, message }).is_err() {
            error!(job_id, "cancellation queue is gone; request dropped");
        }
    }
}

pub struct CancellationLoop {
    handler_id: String,
    tracking: TrackingMode,
    interval: Duration,
    store: Arc<dyn JobStore>,
    dispatcher: Arc<Dispatcher>,
    inbox: mpsc::UnboundedReceiver<CancelRequest>,
}

impl CancellationLoop {
    pub fn new(
        handler_id: impl Into<String>,
        tracking: TrackingMode,
        interval: Duration,
        store: Arc<dyn JobStore>,
        dispatcher: Arc<Dispatcher>,
    ) -> (Self, CancellationQueue) {
        let (tx, inbox) = mpsc::unbounded_channel();
        let worker = Self {
            handler_id: handler_id.into(),
            tracking,
            interval,
            store,
            dispatcher,
            inbox,
        };
        (worker, CancellationQueue { tx })
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(handler = %self.handler_id, "cancellation queue started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let first = tokio::select! {
                request = self.inbox.recv() => match request {
                    Some(request) => Some(request),
                    None => break,
                },
                _ = tokio::time::sleep(self.interval) => None,
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            };
            if let Err(e) = self.process(first).await {
                error!(error = %e, "cancellation pass failed");
            }
        }
        info!("cancellation queue stopped");
    }

    /// Drain pending requests (plus `first`, already received) and settle
    /// each job. Returns how many jobs were settled.
    pub async fn process(&mut self, first: Option<CancelRequest>) -> Result<usize> {
        let mut requests: BTreeMap<JobId, Option<String>> = BTreeMap::new();
        let mut add = |request: CancelRequest| {
            let entry = requests.entry(request.job_id).or_default();
            if request.message.is_some() {
                *entry = request.message;
            }
        };
        if let Some(request) = first {
            add(request);
        }
        while let Ok(request) = self.inbox.try_recv() {
            add(request);
        }
        if self.tracking == TrackingMode::Store {
            let filter = JobFilter::states(&[JobState::DeletedNew]).handler(self.handler_id.clone());
            for job in self.store.find_jobs(&filter).await? {
                add(CancelRequest {
                    job_id: job.id,
                    message: None,
                });
            }
        }

        let mut settled = 0;
        for (job_id, message) in requests {
            match self.cancel(job_id, message).await {
                Ok(true) => settled += 1,
                Ok(false) => {}
                Err(e) => error!(job_id, error = %e, "failed to cancel job"),
            }
        }
        Ok(settled)
    }

    async fn cancel(&self, job_id: JobId, message: Option<String>) -> Result<bool> {
        let mut job = match self.store.get_job(job_id).await {
            Ok(job) => job,
            Err(StoreError::JobNotFound(_)) => {
                debug!(job_id, "cancel requested for unknown job");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        // A deleted job can still be running on its backend.
        if matches!(job.state, JobState::Ok | JobState::Error | JobState::Stopped) {
            debug!(job_id, state = %job.state, "job already finished; nothing to cancel");
            return Ok(false);
        }

        let store = self.store.as_ref();
        let (state, output_state) = match &message {
            Some(_) => (JobState::Error, DatasetState::Error),
            None => (JobState::Deleted, DatasetState::Discarded),
        };
        store.update_state(job_id, state, message.clone()).await?;
        job.state = state;

        // The state is flipped; the backend job must be stopped even if the
        // bookkeeping below fails.
        if job.was_submitted() {
            self.dispatcher.stop(&job).await;
        }

        let mut event = JobEvent::now(JobEventKind::Stopped);
        event.message = message.clone();
        if let Err(e) = store.append_history(job_id, event).await {
            warn!(job_id, error = %e, "could not record cancellation");
        }
        for assoc in &job.outputs {
            if let Err(e) = store
                .update_dataset_state(assoc.dataset_id, output_state, message.clone())
                .await
            {
                warn!(job_id, dataset_id = assoc.dataset_id, error = %e, "could not settle output dataset");
            }
        }
        info!(job_id, state = %state, submitted = job.was_submitted(), "job cancelled");
        Ok(true)
    }
}
