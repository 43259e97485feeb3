//! In-process runner: executes job commands as child processes of the
//! handler.
//!
//! A semaphore bounds how many commands run at once. The pid is recorded as
//! the external id for the record only; local jobs cannot be reattached after
//! a restart.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use gantry_core::{FailureKind, Job, JobId};
use tokio::process::Command;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::RunnerParams;
use crate::error::{Result, RunnerError};
use crate::runner::JobRunner;
use crate::wrapper::{JobOutcome, JobWrapper};

const DEFAULT_WORKERS: usize = 4;
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

pub const LOST_ON_RESTART: &str =
    "This job was killed when the server restarted. Please retry the job.";

type KillSwitches = Arc<Mutex<HashMap<JobId, Arc<Notify>>>>;

pub struct LocalRunner {
    name: String,
    slots: Arc<Semaphore>,
    kills: KillSwitches,
    tasks: tokio::sync::Mutex<JoinSet<()>>,
    shutting_down: AtomicBool,
}

impl LocalRunner {
    pub fn new(name: impl Into<String>, workers: usize) -> Self {
        Self {
            name: name.into(),
            slots: Arc::new(Semaphore::new(workers.max(1))),
            kills: Arc::new(Mutex::new(HashMap::new())),
            tasks: tokio::sync::Mutex::new(JoinSet::new()),
            shutting_down: AtomicBool::new(false),
        }
    }

    /// `workers` sets the number of concurrent commands.
    pub fn from_params(name: &str, params: &RunnerParams) -> Self {
        let workers = params
            .get("workers")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(DEFAULT_WORKERS);
        Self::new(name, workers)
    }

    /// Commands currently executing.
    pub fn running(&self) -> usize {
        self.kills.lock().expect("kill map poisoned").len()
    }
}

#[async_trait]
impl JobRunner for LocalRunner {
    fn name(&self) -> &str {
        &self.name
    }

    async fn queue_job(&self, wrapper: JobWrapper) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(RunnerError::ShuttingDown);
        }
        let run = LocalJob {
            runner: self.name.clone(),
            slots: self.slots.clone(),
            kills: self.kills.clone(),
            wrapper,
        };
        let mut tasks = self.tasks.lock().await;
        // Reap finished tasks so the set does not grow without bound.
        while tasks.try_join_next().is_some() {}
        tasks.spawn(run.execute());
        Ok(())
    }

    async fn stop_job(&self, job: &Job) -> Result<()> {
        let switch = self
            .kills
            .lock()
            .expect("kill map poisoned")
            .get(&job.id)
            .cloned();
        match switch {
            Some(switch) => {
                switch.notify_one();
                info!(job_id = job.id, runner = %self.name, "kill requested");
            }
            None => debug!(job_id = job.id, runner = %self.name, "job is not running here"),
        }
        Ok(())
    }

    async fn recover(&self, job: &Job, wrapper: JobWrapper) -> Result<()> {
        warn!(job_id = job.id, runner = %self.name, "local job cannot be reattached");
        wrapper.fail(LOST_ON_RESTART, None).await?;
        Ok(())
    }

    async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.slots.close();
        let switches: Vec<_> = self
            .kills
            .lock()
            .expect("kill map poisoned")
            .values()
            .cloned()
            .collect();
        for switch in switches {
            switch.notify_one();
        }

        let mut tasks = self.tasks.lock().await;
        let drained = tokio::time::timeout(SHUTDOWN_TIMEOUT, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(runner = %self.name, "local jobs did not stop in time");
            tasks.abort_all();
        }
        info!(runner = %self.name, "runner stopped");
    }
}

// ── Execution ───────────────────────────────────────────────────────

enum Exit {
    Completed(std::io::Result<std::process::Output>),
    Walltime(Duration),
    Killed,
}

struct LocalJob {
    runner: String,
    slots: Arc<Semaphore>,
    kills: KillSwitches,
    wrapper: JobWrapper,
}

impl LocalJob {
    async fn execute(self) {
        let job_id = self.wrapper.job_id();
        let Ok(_permit) = self.slots.clone().acquire_owned().await else {
            debug!(job_id, "runner closed before the job started");
            return;
        };
        if let Err(e) = self.run().await {
            error!(job_id, runner = %self.runner, error = %e, "local job failed");
            if let Err(e) = self.wrapper.fail("Unable to run job.", None).await {
                error!(job_id, error = %e, "could not fail job");
            }
        }
        self.kills.lock().expect("kill map poisoned").remove(&job_id);
    }

    async fn run(&self) -> Result<()> {
        let job_id = self.wrapper.job_id();
        if self.wrapper.is_cancelled().await? {
            debug!(job_id, "job cancelled before it started");
            return Ok(());
        }

        let prepared = match self.wrapper.prepare().await {
            Ok(prepared) => prepared,
            Err(e) => {
                warn!(job_id, error = %e, "job preparation failed");
                self.wrapper
                    .fail(&format!("Unable to prepare job: {}", e), None)
                    .await?;
                return Ok(());
            }
        };

        // Register before spawning so a stop that races the spawn is kept.
        let switch = Arc::new(Notify::new());
        self.kills
            .lock()
            .expect("kill map poisoned")
            .insert(job_id, switch.clone());
        // A stop that landed while preparing found no switch to trip.
        if self.wrapper.is_cancelled().await? {
            debug!(job_id, "job cancelled while it was being prepared");
            return Ok(());
        }

        let child = Command::new("sh")
            .arg("-c")
            .arg(&prepared.command)
            .current_dir(&prepared.working_directory)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let pid = child.id().map(|p| p.to_string()).unwrap_or_default();
        self.wrapper.mark_queued(&self.runner, &pid).await?;
        self.wrapper.mark_running().await?;
        debug!(job_id, pid = %pid, command = %prepared.command, "command started");

        let walltime = self
            .wrapper
            .destination()
            .param_as::<u64>("walltime")
            .map(Duration::from_secs);
        let output = child.wait_with_output();
        // Dropping `output` drops the child, which kills it.
        let exit = tokio::select! {
            result = async {
                match walltime {
                    Some(limit) => match tokio::time::timeout(limit, output).await {
                        Ok(result) => Exit::Completed(result),
                        Err(_) => Exit::Walltime(limit),
                    },
                    None => Exit::Completed(output.await),
                }
            } => result,
            _ = switch.notified() => Exit::Killed,
        };

        match exit {
            Exit::Completed(Ok(output)) => {
                let outcome = JobOutcome {
                    stdout: String::from_utf8_lossy(&output.stdout).to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                    exit_code: output.status.code(),
                };
                info!(job_id, exit_code = ?outcome.exit_code, "command exited");
                self.wrapper.finish(&outcome).await?;
            }
            Exit::Completed(Err(e)) => return Err(e.into()),
            Exit::Walltime(limit) => {
                warn!(job_id, walltime_secs = limit.as_secs(), "walltime exceeded, command killed");
                self.wrapper
                    .fail(
                        FailureKind::WalltimeExceeded.user_message(),
                        Some(FailureKind::WalltimeExceeded),
                    )
                    .await?;
            }
            Exit::Killed => info!(job_id, "command killed"),
        }
        Ok(())
    }
}
