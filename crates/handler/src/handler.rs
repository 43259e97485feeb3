//! Handler process wiring.
//!
//! [`JobHandler::builder`] loads the runner plugins, builds the dispatcher
//! and the runner context, optionally recovers unfinished jobs, then spawns
//! three loops sharing one shutdown signal: admission, cancellation and the
//! requeue loop that re-dispatches resubmitted jobs.

use std::sync::Arc;
use std::time::Duration;

use gantry_core::{CommandProducer, Config, JobId, JobState, JobStore, StoreError, TemplateCommandProducer};
use gantry_routing::PolicyLoader;
use gantry_runners::{JobWrapper, RunnerContext};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::admission::{AdmissionController, AdmissionQueue, AdmissionSettings};
use crate::cancellation::{CancellationLoop, CancellationQueue};
use crate::destinations::DestinationResolver;
use crate::dispatcher::{Dispatcher, MISCONFIGURED};
use crate::error::Result;
use crate::jobconf::JobConf;
use crate::recovery::{AnyTool, Recovery, RecoverySummary, ToolCatalog};
use crate::registry::RunnerRegistry;
use crate::settle::fail_job;

pub struct JobHandlerBuilder {
    config: Config,
    jobconf: Arc<JobConf>,
    store: Arc<dyn JobStore>,
    registry: RunnerRegistry,
    commands: Arc<dyn CommandProducer>,
    tools: Arc<dyn ToolCatalog>,
    policy: Option<PolicyLoader>,
}

impl JobHandlerBuilder {
    pub fn registry(mut self, registry: RunnerRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn commands(mut self, commands: Arc<dyn CommandProducer>) -> Self {
        self.commands = commands;
        self
    }

    /// Installed tools, consulted by startup recovery.
    pub fn tools(mut self, tools: Arc<dyn ToolCatalog>) -> Self {
        self.tools = tools;
        self
    }

    /// Route through a loaded routing policy instead of the static tool map.
    pub fn policy(mut self, loader: PolicyLoader) -> Self {
        self.policy = Some(loader);
        self
    }

    pub async fn start(self) -> Result<JobHandler> {
        let Self {
            config,
            jobconf,
            store,
            registry,
            commands,
            tools,
            policy,
        } = self;
        let handler_id = config.handler.id.clone();

        let runners = registry.build(&jobconf.runners);
        let dispatcher = Arc::new(Dispatcher::new(runners, jobconf.tasked_jobs, store.clone()));

        let (requeue_tx, requeue_rx) = mpsc::unbounded_channel();
        let ctx = RunnerContext {
            store: store.clone(),
            commands,
            working_root: config.paths.working_root.clone(),
            destinations: Arc::new(jobconf.destination_map()),
            requeue: requeue_tx,
        };

        let resolver = DestinationResolver::new(jobconf.clone(), policy.as_ref().map(PolicyLoader::handle));
        let (admission, admission_queue) = AdmissionController::new(
            AdmissionSettings {
                handler_id: handler_id.clone(),
                interval: Duration::from_millis(config.handler.admission_interval_ms),
                tracking: config.handler.tracking,
                quota_enabled: config.quota.enabled,
            },
            store.clone(),
            resolver,
            dispatcher.clone(),
            ctx.clone(),
            jobconf.limits.clone(),
        );
        let (cancellation, cancellation_queue) = CancellationLoop::new(
            handler_id.clone(),
            config.handler.tracking,
            Duration::from_millis(config.handler.cancellation_interval_ms),
            store.clone(),
            dispatcher.clone(),
        );

        let recovery = if config.handler.recover_on_startup {
            let summary = Recovery {
                handler_id: &handler_id,
                store: &store,
                tools: tools.as_ref(),
                jobconf: &jobconf,
                dispatcher: &dispatcher,
                ctx: &ctx,
                admission: &admission_queue,
            }
            .run()
            .await?;
            Some(summary)
        } else {
            None
        };

        let (shutdown, stopped) = watch::channel(false);
        let requeue = Requeue {
            store: store.clone(),
            jobconf: jobconf.clone(),
            dispatcher: dispatcher.clone(),
            ctx,
        };
        let tasks = vec![
            tokio::spawn(admission.run(stopped.clone())),
            tokio::spawn(cancellation.run(stopped.clone())),
            tokio::spawn(requeue.run(requeue_rx, stopped)),
        ];
        let routing = if policy.is_some() { "policy" } else { "static" };
        info!(
            handler = %handler_id,
            runners = ?dispatcher.runner_names(),
            routing,
            "job handler started"
        );

        Ok(JobHandler {
            handler_id,
            dispatcher,
            admission: admission_queue,
            cancellation: cancellation_queue,
            shutdown,
            tasks,
            recovery,
            _policy: policy,
        })
    }
}

/// A running handler. Dropping it stops the loops but not the runner
/// plugins; call [`JobHandler::shutdown`] for an orderly stop.
pub struct JobHandler {
    handler_id: String,
    dispatcher: Arc<Dispatcher>,
    admission: AdmissionQueue,
    cancellation: CancellationQueue,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    recovery: Option<RecoverySummary>,
    /// Held so a policy file watcher stays alive.
    _policy: Option<PolicyLoader>,
}

impl JobHandler {
    pub fn builder(config: Config, jobconf: JobConf, store: Arc<dyn JobStore>) -> JobHandlerBuilder {
        JobHandlerBuilder {
            config,
            jobconf: Arc::new(jobconf),
            store,
            registry: RunnerRegistry::with_builtin(),
            commands: Arc::new(TemplateCommandProducer::new()),
            tools: Arc::new(AnyTool),
            policy: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.handler_id
    }

    /// Announce a NEW job to admission.
    pub fn submit(&self, job_id: JobId) {
        self.admission.put(job_id);
    }

    /// Request cancellation; a message marks an administrative kill.
    pub fn cancel(&self, job_id: JobId, message: Option<String>) {
        self.cancellation.put(job_id, message);
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// What startup recovery did, when it ran.
    pub fn recovery(&self) -> Option<RecoverySummary> {
        self.recovery
    }

    /// Stop the loops, waiting up to `timeout` for them, then shut down
    /// every runner plugin.
    pub async fn shutdown(self, timeout: Duration) {
        info!(handler = %self.handler_id, "job handler shutting down");
        let _ = self.shutdown.send(true);
        match tokio::time::timeout(timeout, futures::future::join_all(self.tasks)).await {
            Ok(results) => {
                for e in results.into_iter().filter_map(|r| r.err()) {
                    error!(error = %e, "handler loop panicked");
                }
            }
            Err(_) => warn!(timeout_ms = timeout.as_millis() as u64, "handler loops did not stop in time"),
        }
        self.dispatcher.shutdown().await;
        info!(handler = %self.handler_id, "job handler stopped");
    }
}

// ── Requeue ───────────────────────────────────────────────────

/// Re-dispatches jobs a runner resubmitted to another (or the same)
/// destination.
struct Requeue {
    store: Arc<dyn JobStore>,
    jobconf: Arc<JobConf>,
    dispatcher: Arc<Dispatcher>,
    ctx: RunnerContext,
}

impl Requeue {
    async fn run(self, mut jobs: mpsc::UnboundedReceiver<JobId>, mut shutdown: watch::Receiver<bool>) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                job_id = jobs.recv() => match job_id {
                    Some(job_id) => {
                        if let Err(e) = self.requeue(job_id).await {
                            error!(job_id, error = %e, "failed to requeue job");
                        }
                    }
                    None => break,
                },
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("requeue loop stopped");
    }

    async fn requeue(&self, job_id: JobId) -> Result<()> {
        let job = match self.store.get_job(job_id).await {
            Ok(job) => job,
            Err(StoreError::JobNotFound(_)) => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        if job.state != JobState::Queued {
            debug!(job_id, state = %job.state, "resubmitted job is no longer queued");
            return Ok(());
        }
        let destination = job
            .destination_id
            .as_deref()
            .and_then(|id| self.jobconf.destination(id))
            .cloned()
            .or_else(|| job.persisted_destination());
        let Some(destination) = destination else {
            error!(job_id, "resubmitted job has no usable destination");
            return fail_job(self.store.as_ref(), &job, MISCONFIGURED).await;
        };
        info!(job_id, destination = %destination.id, "dispatching resubmitted job");
        let wrapper = JobWrapper::new(self.ctx.clone(), job_id, destination);
        self.dispatcher.put(&job, wrapper).await
    }
}
