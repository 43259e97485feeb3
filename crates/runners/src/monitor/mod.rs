//! Shared monitor loop and worker pool for polling backends.
//!
//! An [`AsyncRunner`] owns one monitor task and a fixed pool of workers.
//! The monitor keeps the watch-list and polls each job once per interval;
//! anything slow (submission, output collection, kill) goes to the workers
//! through an unbounded queue. The watch-list is only ever touched by the
//! monitor task, so backends never need to lock it.

mod backend;
mod state;

#[cfg(test)]
mod tests;

pub use backend::{check_watched_item, fail_job, finish_job, PollingBackend, MAX_POLL_ERRORS};
pub use state::{RemoteStatus, Submission, WatchedJobState, WorkItem, WorkQueue};

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use gantry_core::{Job, JobEvent, JobEventKind};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use self::state::MonitorMsg;
use crate::error::{Result, RunnerError};
use crate::runner::JobRunner;
use crate::wrapper::{JobWrapper, GENERIC_REMOTE_ERROR};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// [`JobRunner`] built from a [`PollingBackend`].
pub struct AsyncRunner<B: PollingBackend> {
    backend: Arc<B>,
    monitor: mpsc::UnboundedSender<MonitorMsg<B::Handle>>,
    work: WorkQueue<B::Handle>,
    workers: usize,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutting_down: AtomicBool,
}

impl<B: PollingBackend> AsyncRunner<B> {
    /// Spawn the monitor and `workers` worker tasks. Must be called inside a
    /// tokio runtime.
    pub fn start(backend: B, workers: usize) -> Self {
        let workers = workers.max(1);
        let backend = Arc::new(backend);
        let (monitor_tx, monitor_rx) = mpsc::unbounded_channel();
        let (work_tx, work_rx) = mpsc::unbounded_channel();
        let work = WorkQueue::new(work_tx);
        let work_rx = Arc::new(Mutex::new(work_rx));

        let mut tasks = Vec::with_capacity(workers + 1);
        tasks.push(tokio::spawn(monitor_loop(
            backend.clone(),
            monitor_rx,
            work.clone(),
        )));
        for worker_id in 0..workers {
            tasks.push(tokio::spawn(worker_loop(
                worker_id,
                backend.clone(),
                work_rx.clone(),
                monitor_tx.clone(),
            )));
        }
        info!(runner = backend.name(), workers, "runner started");

        Self {
            backend,
            monitor: monitor_tx,
            work,
            workers,
            tasks: Mutex::new(tasks),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    fn ensure_running(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(RunnerError::ShuttingDown);
        }
        Ok(())
    }
}

#[async_trait]
impl<B: PollingBackend> JobRunner for AsyncRunner<B> {
    fn name(&self) -> &str {
        self.backend.name()
    }

    async fn queue_job(&self, wrapper: JobWrapper) -> Result<()> {
        self.ensure_running()?;
        if !self.work.put(WorkItem::Submit(wrapper)) {
            return Err(RunnerError::ShuttingDown);
        }
        Ok(())
    }

    async fn stop_job(&self, job: &Job) -> Result<()> {
        self.ensure_running()?;
        if job.external_id.is_none() {
            debug!(job_id = job.id, "job never reached the backend, nothing to kill");
            return Ok(());
        }
        if !self.work.put(WorkItem::Kill(job.clone())) {
            return Err(RunnerError::ShuttingDown);
        }
        Ok(())
    }

    async fn recover(&self, job: &Job, wrapper: JobWrapper) -> Result<()> {
        self.ensure_running()?;
        let external_id = job
            .external_id
            .clone()
            .ok_or_else(|| RunnerError::Unrecoverable(job.id, "no external id recorded".into()))?;
        let handle = self.backend.reattach(job, &wrapper)?;

        let mut state = WatchedJobState::new(wrapper, external_id.clone(), handle);
        state.running = backend::was_running(job);
        state
            .wrapper
            .store()
            .append_history(
                job.id,
                JobEvent::now(JobEventKind::Recovered {
                    runner: self.name().to_string(),
                }),
            )
            .await?;
        if self.monitor.send(MonitorMsg::Watch(state)).is_err() {
            return Err(RunnerError::ShuttingDown);
        }
        info!(job_id = job.id, runner = self.name(), external_id = %external_id, "job recovered");
        Ok(())
    }

    async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.monitor.send(MonitorMsg::Stop);
        for _ in 0..self.workers {
            self.work.put(WorkItem::Stop);
        }

        let tasks: Vec<_> = self.tasks.lock().await.drain(..).collect();
        let joined = tokio::time::timeout(SHUTDOWN_TIMEOUT, futures::future::join_all(tasks)).await;
        match joined {
            Ok(_) => info!(runner = self.name(), "runner stopped"),
            Err(_) => warn!(runner = self.name(), "runner tasks did not stop in time"),
        }
    }
}

// ── Monitor ─────────────────────────────────────────────────────────

async fn monitor_loop<B: PollingBackend>(
    backend: Arc<B>,
    mut inbox: mpsc::UnboundedReceiver<MonitorMsg<B::Handle>>,
    work: WorkQueue<B::Handle>,
) {
    let interval = backend.poll_interval();
    let mut watched: Vec<WatchedJobState<B::Handle>> = Vec::new();

    loop {
        // Accept everything queued since the last pass.
        loop {
            match inbox.try_recv() {
                Ok(MonitorMsg::Watch(state)) => watched.push(state),
                Ok(MonitorMsg::Stop) | Err(mpsc::error::TryRecvError::Disconnected) => {
                    debug!(runner = backend.name(), watched = watched.len(), "monitor stopping");
                    return;
                }
                Err(mpsc::error::TryRecvError::Empty) => break,
            }
        }

        let mut still_watched = Vec::with_capacity(watched.len());
        for state in watched.drain(..) {
            let job_id = state.job_id;
            let wrapper = state.wrapper.clone();
            let checked = AssertUnwindSafe(backend.check_watched_item(state, &work))
                .catch_unwind()
                .await;
            match checked {
                Ok(Some(state)) => still_watched.push(state),
                Ok(None) => {}
                Err(_) => {
                    error!(runner = backend.name(), job_id, "panic while checking watched job");
                    work.put(WorkItem::Abort {
                        wrapper,
                        message: GENERIC_REMOTE_ERROR.to_string(),
                    });
                }
            }
        }
        watched = still_watched;

        // Sleep, but keep accepting new jobs so a Stop is noticed promptly.
        let deadline = Instant::now() + interval;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                msg = inbox.recv() => match msg {
                    Some(MonitorMsg::Watch(state)) => watched.push(state),
                    Some(MonitorMsg::Stop) | None => {
                        debug!(runner = backend.name(), watched = watched.len(), "monitor stopping");
                        return;
                    }
                },
            }
        }
    }
}

// ── Workers ─────────────────────────────────────────────────────────

async fn worker_loop<B: PollingBackend>(
    worker_id: usize,
    backend: Arc<B>,
    queue: Arc<Mutex<mpsc::UnboundedReceiver<WorkItem<B::Handle>>>>,
    monitor: mpsc::UnboundedSender<MonitorMsg<B::Handle>>,
) {
    loop {
        let item = { queue.lock().await.recv().await };
        let item = match item {
            Some(WorkItem::Stop) | None => break,
            Some(item) => item,
        };

        let label = item.label();
        let wrapper = item.wrapper().cloned();
        let result = AssertUnwindSafe(process(&*backend, item, &monitor))
            .catch_unwind()
            .await;

        let failure = match result {
            Ok(Ok(())) => None,
            // Submitted but not watched; recovery picks it up on restart.
            Ok(Err(RunnerError::ShuttingDown)) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some("worker panicked".to_string()),
        };
        if let Some(reason) = failure {
            error!(runner = backend.name(), worker_id, item = label, error = %reason, "work item failed");
            if let Some(wrapper) = wrapper {
                if let Err(e) = wrapper.fail(GENERIC_REMOTE_ERROR, None).await {
                    error!(job_id = wrapper.job_id(), error = %e, "could not fail job");
                }
            }
        }
    }
    debug!(runner = backend.name(), worker_id, "worker stopped");
}

async fn process<B: PollingBackend>(
    backend: &B,
    item: WorkItem<B::Handle>,
    monitor: &mpsc::UnboundedSender<MonitorMsg<B::Handle>>,
) -> Result<()> {
    match item {
        WorkItem::Submit(wrapper) => submit(backend, wrapper, monitor).await,
        WorkItem::Finish(state) => {
            backend.finish_job(state).await;
            Ok(())
        }
        WorkItem::Fail(state) => {
            backend.fail_job(state).await;
            Ok(())
        }
        WorkItem::Kill(job) => {
            backend.kill(&job).await?;
            info!(job_id = job.id, runner = backend.name(), "job killed");
            Ok(())
        }
        WorkItem::Abort { wrapper, message } => {
            wrapper.fail(&message, None).await?;
            Ok(())
        }
        WorkItem::Stop => Ok(()),
    }
}

async fn submit<B: PollingBackend>(
    backend: &B,
    wrapper: JobWrapper,
    monitor: &mpsc::UnboundedSender<MonitorMsg<B::Handle>>,
) -> Result<()> {
    if wrapper.is_cancelled().await? {
        debug!(job_id = wrapper.job_id(), "job cancelled before submission");
        return Ok(());
    }

    let prepared = match wrapper.prepare().await {
        Ok(prepared) => prepared,
        Err(e) => {
            warn!(job_id = wrapper.job_id(), error = %e, "job preparation failed");
            wrapper
                .fail(&format!("Unable to prepare job: {}", e), None)
                .await?;
            return Ok(());
        }
    };

    let submission = match backend.submit(&prepared, wrapper.destination()).await {
        Ok(submission) => submission,
        Err(e) => {
            warn!(job_id = wrapper.job_id(), runner = backend.name(), error = %e, "job submission failed");
            wrapper
                .fail("Unable to submit job to the execution backend.", None)
                .await?;
            return Ok(());
        }
    };

    wrapper
        .mark_queued(backend.name(), &submission.external_id)
        .await?;
    let state = WatchedJobState::new(wrapper, submission.external_id, submission.handle);
    if monitor.send(MonitorMsg::Watch(state)).is_err() {
        return Err(RunnerError::ShuttingDown);
    }
    Ok(())
}
