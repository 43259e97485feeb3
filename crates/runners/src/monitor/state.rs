use gantry_core::{FailureKind, Job, JobId};
use tokio::sync::mpsc;

use crate::wrapper::JobWrapper;

/// Normalized answer to "what is this job doing right now?".
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteStatus {
    Queued,
    Running,
    /// Stopped on its own; the collected exit code decides success.
    Finished,
    /// The backend itself reports a failure.
    Failed {
        failure: FailureKind,
        message: Option<String>,
    },
}

/// Handle returned by a successful submission.
#[derive(Debug, Clone)]
pub struct Submission<H> {
    pub external_id: String,
    pub handle: H,
}

/// A job on a runner's watch-list. Owned by the monitor task until it is
/// dropped or handed to a worker.
#[derive(Clone)]
pub struct WatchedJobState<H> {
    pub job_id: JobId,
    pub external_id: String,
    pub running: bool,
    pub old_state: Option<RemoteStatus>,
    /// Backend-specific handle (file paths, remote directories).
    pub handle: H,
    pub wrapper: JobWrapper,
    /// Consecutive failed polls.
    pub poll_errors: u32,
    pub failure: Option<FailureKind>,
    pub message: Option<String>,
}

impl<H> WatchedJobState<H> {
    pub fn new(wrapper: JobWrapper, external_id: impl Into<String>, handle: H) -> Self {
        Self {
            job_id: wrapper.job_id(),
            external_id: external_id.into(),
            running: false,
            old_state: None,
            handle,
            wrapper,
            poll_errors: 0,
            failure: None,
            message: None,
        }
    }
}

// ── Queues ──────────────────────────────────────────────────────────

pub(crate) enum MonitorMsg<H> {
    Watch(WatchedJobState<H>),
    Stop,
}

/// Blocking operations delegated to the worker pool.
pub enum WorkItem<H> {
    Submit(JobWrapper),
    Finish(WatchedJobState<H>),
    Fail(WatchedJobState<H>),
    Kill(Job),
    /// Fail a job whose watch state was lost (e.g. a panic while checking it).
    Abort { wrapper: JobWrapper, message: String },
    Stop,
}

impl<H> WorkItem<H> {
    pub(crate) fn wrapper(&self) -> Option<&JobWrapper> {
        match self {
            WorkItem::Submit(w) | WorkItem::Abort { wrapper: w, .. } => Some(w),
            WorkItem::Finish(s) | WorkItem::Fail(s) => Some(&s.wrapper),
            WorkItem::Kill(_) | WorkItem::Stop => None,
        }
    }

    pub(crate) fn label(&self) -> &'static str {
        match self {
            WorkItem::Submit(_) => "submit",
            WorkItem::Finish(_) => "finish",
            WorkItem::Fail(_) => "fail",
            WorkItem::Kill(_) => "kill",
            WorkItem::Abort { .. } => "abort",
            WorkItem::Stop => "stop",
        }
    }
}

/// Sender side of a runner's work queue.
pub struct WorkQueue<H> {
    tx: mpsc::UnboundedSender<WorkItem<H>>,
}

impl<H> Clone for WorkQueue<H> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<H> WorkQueue<H> {
    pub(crate) fn new(tx: mpsc::UnboundedSender<WorkItem<H>>) -> Self {
        Self { tx }
    }

    /// Enqueue work; returns `false` once the pool has shut down.
    pub fn put(&self, item: WorkItem<H>) -> bool {
        self.tx.send(item).is_ok()
    }
}
