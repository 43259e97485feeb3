//! Admission controller: holds NEW jobs until they are ready to run.
//!
//! One task owns the waiting list. Each scan it resumes jobs paused for
//! quota whose owner is back under quota, recounts active jobs, then checks
//! every waiting job: inputs, destination, concurrency gates and quota.
//! Ready jobs are persisted as QUEUED on their destination and handed to
//! the [`Dispatcher`].

pub mod readiness;


use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use gantry_core::config::TrackingMode;
use gantry_core::{
    Dataset, DatasetState, Job, JobEvent, JobEventKind, JobFilter, JobId, JobState, JobStore,
    PauseReason, StoreError,
};
use gantry_runners::{JobWrapper, RunnerContext};
use tokio::sync::{mpsc, watch, Notify};
use tracing::{debug, error, info, warn};

use crate::destinations::{DestinationResolver, Resolution};
use crate::dispatcher::{Dispatcher, MISCONFIGURED};
use crate::error::Result;
use crate::jobconf::Limits;
use crate::settle::{fail_job, set_outputs};

use readiness::{check_if_ready_to_run, ActiveCounts, QuotaStatus, Readiness, ReadinessInput};

pub const OVER_QUOTA_MESSAGE: &str =
    "Execution of this job is paused because you were over your disk quota at the time it was ready to run.";

#[derive(Debug, Clone)]
pub struct AdmissionSettings {
    pub handler_id: String,
    pub interval: Duration,
    pub tracking: TrackingMode,
    pub quota_enabled: bool,
}

/// Sender side of the admission queue.
#[derive(Clone)]
pub struct AdmissionQueue {
    tx: mpsc::UnboundedSender<JobId>,
    wake: Arc<Notify>,
}

impl AdmissionQueue {
    /// Enqueue a NEW job and wake the controller.
    pub fn put(&self, job_id: JobId) {
        if self.tx.send(job_id).is_err() {
            warn!(job_id, "admission controller is gone; job not enqueued");
        }
        self.wake.notify_one();
    }
}

pub struct AdmissionController {
    settings: AdmissionSettings,
    store: Arc<dyn JobStore>,
    resolver: DestinationResolver,
    dispatcher: Arc<Dispatcher>,
    ctx: RunnerContext,
    limits: Limits,
    inbox: mpsc::UnboundedReceiver<JobId>,
    wake: Arc<Notify>,
    waiting: Vec<JobId>,
}

/// What happens to a job after one check.
enum Step {
    Keep,
    Dispatched,
    Drop,
}

impl AdmissionController {
    pub fn new(
        settings: AdmissionSettings,
        store: Arc<dyn JobStore>,
        resolver: DestinationResolver,
        dispatcher: Arc<Dispatcher>,
        ctx: RunnerContext,
        limits: Limits,
    ) -> (Self, AdmissionQueue) {
        let (tx, inbox) = mpsc::unbounded_channel();
        let wake = Arc::new(Notify::new());
        let queue = AdmissionQueue {
            tx,
            wake: wake.clone(),
        };
        let controller = Self {
            settings,
            store,
            resolver,
            dispatcher,
            ctx,
            limits,
            inbox,
            wake,
            waiting: Vec::new(),
        };
        (controller, queue)
    }

    /// Jobs currently held back (memory tracking only).
    pub fn waiting(&self) -> &[JobId] {
        &self.waiting
    }

    /// Scan until `shutdown` flips to true.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            handler = %self.settings.handler_id,
            tracking = %self.settings.tracking,
            interval_ms = self.settings.interval.as_millis() as u64,
            "admission controller started"
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.scan().await {
                error!(error = %e, "admission scan failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.settings.interval) => {}
                _ = self.wake.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!(waiting = self.waiting.len(), "admission controller stopped");
    }

    /// One pass over the waiting jobs. Returns how many were dispatched.
    pub async fn scan(&mut self) -> Result<usize> {
        if self.settings.quota_enabled {
            self.resume_under_quota().await?;
        }

        let candidates = self.candidates().await?;
        if candidates.is_empty() {
            return Ok(0);
        }

        let active = self
            .store
            .find_jobs(&JobFilter::states(&[JobState::Queued, JobState::Running]))
            .await?;
        let mut counts = ActiveCounts::from_jobs(&active);

        let mut still_waiting = Vec::new();
        let mut dispatched = 0;
        for job_id in candidates {
            match self.check(job_id, &mut counts).await {
                Ok(Step::Keep) => still_waiting.push(job_id),
                Ok(Step::Dispatched) => dispatched += 1,
                Ok(Step::Drop) => {}
                Err(e) => {
                    error!(job_id, error = %e, "readiness check failed; retrying next scan");
                    still_waiting.push(job_id);
                }
            }
        }
        debug!(dispatched, waiting = still_waiting.len(), "admission scan complete");
        if self.settings.tracking == TrackingMode::Memory {
            self.waiting = still_waiting;
        }
        Ok(dispatched)
    }

    async fn candidates(&mut self) -> Result<Vec<JobId>> {
        let mut queued = Vec::new();
        while let Ok(job_id) = self.inbox.try_recv() {
            queued.push(job_id);
        }
        match self.settings.tracking {
            TrackingMode::Memory => {
                let mut seen: HashSet<JobId> = self.waiting.iter().copied().collect();
                for job_id in queued {
                    if seen.insert(job_id) {
                        self.waiting.push(job_id);
                    }
                }
                Ok(self.waiting.clone())
            }
            TrackingMode::Store => {
                let filter = JobFilter::states(&[JobState::New]).handler(self.settings.handler_id.clone());
                Ok(self.store.find_jobs(&filter).await?.into_iter().map(|j| j.id).collect())
            }
        }
    }

    async fn check(&self, job_id: JobId, counts: &mut ActiveCounts) -> Result<Step> {
        let job = match self.store.get_job(job_id).await {
            Ok(job) => job,
            Err(StoreError::JobNotFound(_)) => {
                warn!(job_id, "waiting job disappeared from the store");
                return Ok(Step::Drop);
            }
            Err(e) => return Err(e.into()),
        };
        if let Some(verdict) = readiness::check_job_state(&job) {
            debug!(job_id, verdict = %verdict, "job left the waiting list");
            return Ok(Step::Drop);
        }
        if job.state != JobState::New {
            debug!(job_id, state = %job.state, "job is no longer new");
            return Ok(Step::Drop);
        }

        let inputs = self.inputs(&job).await?;
        if let Some(verdict) = readiness::check_inputs(&inputs) {
            return self.settle(&job, verdict).await;
        }

        let destination = match self.resolver.resolve(&job, &inputs) {
            Resolution::Destination(dest) => dest,
            Resolution::Rejected(message) => {
                fail_job(self.store.as_ref(), &job, &message).await?;
                return Ok(Step::Drop);
            }
            Resolution::Misconfigured(reason) => {
                error!(job_id, tool = %job.tool_id, reason = %reason, "cannot resolve destination");
                fail_job(self.store.as_ref(), &job, MISCONFIGURED).await?;
                return Ok(Step::Drop);
            }
        };

        let verdict = check_if_ready_to_run(&ReadinessInput {
            job: &job,
            inputs: &inputs,
            destination_id: Some(&destination.id),
            limits: &self.limits,
            counts,
            quota: self.quota_status(&job).await?,
        });
        if verdict != Readiness::Ready {
            return self.settle(&job, verdict).await;
        }

        self.store.set_destination(job.id, &destination).await?;
        self.store
            .append_history(
                job.id,
                JobEvent::now(JobEventKind::DestinationResolved {
                    destination: destination.id.clone(),
                }),
            )
            .await?;
        self.store.update_state(job.id, JobState::Queued, None).await?;
        counts.record(&job.owner, Some(&destination.id));
        info!(job_id, tool = %job.tool_id, destination = %destination.id, "job ready to run");

        let wrapper = JobWrapper::new(self.ctx.clone(), job.id, destination);
        if let Err(e) = self.dispatcher.put(&job, wrapper).await {
            error!(job_id, error = %e, "dispatch failed");
            return self.undo_dispatch(job_id).await;
        }
        Ok(Step::Dispatched)
    }

    /// Return a job whose dispatch failed to NEW so the next scan retries
    /// it, unless the dispatcher already settled or submitted it.
    async fn undo_dispatch(&self, job_id: JobId) -> Result<Step> {
        let job = self.store.get_job(job_id).await?;
        if job.state != JobState::Queued || job.was_submitted() {
            return Ok(Step::Drop);
        }
        self.store.update_state(job_id, JobState::New, None).await?;
        warn!(job_id, "job returned to new after a failed dispatch");
        Ok(Step::Keep)
    }

    /// Act on a verdict other than READY.
    async fn settle(&self, job: &Job, verdict: Readiness) -> Result<Step> {
        match verdict {
            Readiness::Wait => Ok(Step::Keep),
            Readiness::InputDeleted { .. } | Readiness::InputError { .. } => {
                let message = verdict.failure_message().unwrap_or_default();
                fail_job(self.store.as_ref(), job, &message).await?;
                Ok(Step::Drop)
            }
            Readiness::UserOverQuota => {
                self.pause_for_quota(job).await?;
                Ok(Step::Drop)
            }
            Readiness::Deleted | Readiness::AdminDeleted | Readiness::Ready => Ok(Step::Drop),
        }
    }

    async fn inputs(&self, job: &Job) -> Result<Vec<Dataset>> {
        let mut inputs = Vec::with_capacity(job.inputs.len());
        for assoc in &job.inputs {
            inputs.push(self.store.get_dataset(assoc.dataset_id).await?);
        }
        Ok(inputs)
    }

    async fn quota_status(&self, job: &Job) -> Result<QuotaStatus> {
        if !self.settings.quota_enabled {
            return Ok(QuotaStatus::NotApplicable);
        }
        let Some(user_id) = job.owner.user_id() else {
            return Ok(QuotaStatus::NotApplicable);
        };
        let usage = self.store.user_disk_usage(user_id).await?;
        let quota = self.store.user_quota(user_id).await?;
        Ok(QuotaStatus::from_usage(usage, quota))
    }

    async fn pause_for_quota(&self, job: &Job) -> Result<()> {
        let store = self.store.as_ref();
        store
            .update_state(job.id, JobState::Paused, Some(OVER_QUOTA_MESSAGE.to_string()))
            .await?;
        store
            .append_history(
                job.id,
                JobEvent::now(JobEventKind::Paused {
                    reason: PauseReason::OverQuota,
                }),
            )
            .await?;
        set_outputs(store, job, DatasetState::Paused, Some(OVER_QUOTA_MESSAGE)).await?;
        info!(job_id = job.id, "job paused: owner is over quota");
        Ok(())
    }

    /// Put jobs paused by the quota gate back in line once their owner has
    /// room again.
    async fn resume_under_quota(&mut self) -> Result<()> {
        let filter = JobFilter::states(&[JobState::Paused]).handler(self.settings.handler_id.clone());
        for job in self.store.find_jobs(&filter).await? {
            if !job.paused_for_quota() || self.quota_status(&job).await? == QuotaStatus::OverQuota {
                continue;
            }
            let store = self.store.as_ref();
            store
                .update_state(job.id, JobState::New, Some(String::new()))
                .await?;
            store.append_history(job.id, JobEvent::now(JobEventKind::Resumed)).await?;
            set_outputs(store, &job, DatasetState::Queued, Some("")).await?;
            info!(job_id = job.id, "job resumed: owner is back under quota");
            if self.settings.tracking == TrackingMode::Memory && !self.waiting.contains(&job.id) {
                self.waiting.push(job.id);
            }
        }
        Ok(())
    }
}
