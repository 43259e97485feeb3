use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use gantry_core::{
    Dataset, DatasetState, FailureKind, Job, JobDestination, JobEventKind, JobId, JobOwner,
    JobState, JobStore, MemoryJobStore, ResubmitCondition, ResubmitRule, TemplateCommandProducer,
};
use tempfile::TempDir;
use tokio::sync::mpsc;

use super::*;
use crate::error::{Result, RunnerError};
use crate::wrapper::{JobOutcome, PreparedJob, RunnerContext};

// ── Fake backend ────────────────────────────────────────────────────

enum Scripted {
    Status(RemoteStatus),
    Error,
    Panic,
}

#[derive(Default)]
struct FakeBackend {
    submits: AtomicUsize,
    polls: AtomicUsize,
    kills: AtomicUsize,
    /// Per external id; the last entry repeats forever.
    script: Mutex<HashMap<String, VecDeque<Scripted>>>,
    outcome: Mutex<JobOutcome>,
}

impl FakeBackend {
    fn script(&self, external_id: &str, steps: Vec<Scripted>) {
        self.script
            .lock()
            .unwrap()
            .insert(external_id.to_string(), steps.into());
    }
}

#[async_trait]
impl PollingBackend for FakeBackend {
    type Handle = String;

    fn name(&self) -> &str {
        "fake"
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(10)
    }

    async fn submit(&self, job: &PreparedJob, _: &JobDestination) -> Result<Submission<String>> {
        self.submits.fetch_add(1, Ordering::SeqCst);
        let external_id = format!("ext-{}", job.job.id);
        Ok(Submission {
            external_id: external_id.clone(),
            handle: external_id,
        })
    }

    async fn poll(&self, state: &WatchedJobState<String>) -> Result<RemoteStatus> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        let step = {
            let mut script = self.script.lock().unwrap();
            let steps = script.entry(state.handle.clone()).or_default();
            if steps.len() > 1 {
                steps.pop_front()
            } else {
                steps.front().map(|s| match s {
                    Scripted::Status(st) => Scripted::Status(st.clone()),
                    Scripted::Error => Scripted::Error,
                    Scripted::Panic => Scripted::Panic,
                })
            }
        };
        match step {
            Some(Scripted::Status(status)) => Ok(status),
            None => Ok(RemoteStatus::Queued),
            Some(Scripted::Error) => Err(RunnerError::Communication("connection refused".into())),
            Some(Scripted::Panic) => panic!("backend exploded"),
        }
    }

    async fn collect(&self, _: &WatchedJobState<String>) -> Result<JobOutcome> {
        Ok(self.outcome.lock().unwrap().clone())
    }

    async fn kill(&self, _: &Job) -> Result<()> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn reattach(&self, job: &Job, _: &JobWrapper) -> Result<String> {
        Ok(job.external_id.clone().unwrap_or_default())
    }
}

// ── Fixtures ────────────────────────────────────────────────────────

struct Fixture {
    _dir: TempDir,
    store: Arc<MemoryJobStore>,
    ctx: RunnerContext,
    requeued: mpsc::UnboundedReceiver<JobId>,
}

fn fixture(destinations: Vec<JobDestination>) -> Fixture {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryJobStore::new());
    let (tx, rx) = mpsc::unbounded_channel();
    let ctx = RunnerContext {
        store: store.clone(),
        commands: Arc::new(TemplateCommandProducer::new()),
        working_root: dir.path().join("jobs"),
        destinations: Arc::new(
            destinations
                .into_iter()
                .map(|d| (d.id.clone(), d))
                .collect::<BTreeMap<_, _>>(),
        ),
        requeue: tx,
    };
    Fixture {
        _dir: dir,
        store,
        ctx,
        requeued: rx,
    }
}

fn insert_job(store: &MemoryJobStore, id: JobId, state: JobState) {
    store.insert_dataset(Dataset::new(id * 10, 1, "out", DatasetState::New));
    let job = Job::new(
        id,
        "cat1",
        JobOwner::User {
            id: 1,
            email: "ada@example.org".into(),
        },
    )
    .with_output("out_file1", id * 10)
    .with_command("echo hi > $output_0")
    .with_state(state);
    store.insert_job(job);
}

async fn wait_for_state(store: &MemoryJobStore, id: JobId, state: JobState) -> Job {
    for _ in 0..300 {
        let job = store.get_job(id).await.unwrap();
        if job.state == state {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {id} never reached {state}");
}

fn started(fake: FakeBackend) -> AsyncRunner<FakeBackend> {
    AsyncRunner::start(fake, 2)
}

// ── Tests ───────────────────────────────────────────────────────────

#[tokio::test]
async fn submitted_job_runs_to_completion() {
    let fx = fixture(vec![]);
    insert_job(&fx.store, 1, JobState::Queued);

    let fake = FakeBackend::default();
    fake.script(
        "ext-1",
        vec![
            Scripted::Status(RemoteStatus::Queued),
            Scripted::Status(RemoteStatus::Running),
            Scripted::Status(RemoteStatus::Finished),
        ],
    );
    *fake.outcome.lock().unwrap() = JobOutcome {
        exit_code: Some(0),
        ..Default::default()
    };
    let runner = started(fake);

    let dest = JobDestination::new("fake_dest", "fake");
    runner
        .queue_job(JobWrapper::new(fx.ctx.clone(), 1, dest))
        .await
        .unwrap();

    let job = wait_for_state(&fx.store, 1, JobState::Ok).await;
    assert_eq!(job.runner_name.as_deref(), Some("fake"));
    assert_eq!(job.external_id.as_deref(), Some("ext-1"));
    assert_eq!(fx.store.get_dataset(10).await.unwrap().state, DatasetState::Ok);
    assert_eq!(runner.backend().submits.load(Ordering::SeqCst), 1);
    runner.shutdown().await;
}

#[tokio::test]
async fn recovery_reattaches_without_resubmitting() {
    let fx = fixture(vec![]);
    insert_job(&fx.store, 2, JobState::Running);
    {
        let store: &dyn JobStore = fx.store.as_ref();
        store
            .set_external(2, Some("fake".into()), Some("ext-2".into()))
            .await
            .unwrap();
    }

    let fake = FakeBackend::default();
    fake.script(
        "ext-2",
        vec![
            Scripted::Status(RemoteStatus::Running),
            Scripted::Status(RemoteStatus::Running),
            Scripted::Status(RemoteStatus::Finished),
        ],
    );
    *fake.outcome.lock().unwrap() = JobOutcome {
        exit_code: Some(0),
        ..Default::default()
    };
    let runner = started(fake);

    let job = fx.store.get_job(2).await.unwrap();
    let wrapper = JobWrapper::new(fx.ctx.clone(), 2, JobDestination::new("fake_dest", "fake"));
    runner.recover(&job, wrapper).await.unwrap();

    let job = wait_for_state(&fx.store, 2, JobState::Ok).await;
    assert_eq!(runner.backend().submits.load(Ordering::SeqCst), 0);
    assert!(runner.backend().polls.load(Ordering::SeqCst) >= 3);
    assert!(job
        .history
        .iter()
        .any(|e| matches!(e.kind, JobEventKind::Recovered { .. })));
    runner.shutdown().await;
}

#[tokio::test]
async fn recovery_requires_external_id() {
    let fx = fixture(vec![]);
    insert_job(&fx.store, 3, JobState::Queued);
    let runner = started(FakeBackend::default());

    let job = fx.store.get_job(3).await.unwrap();
    let wrapper = JobWrapper::new(fx.ctx.clone(), 3, JobDestination::new("d", "fake"));
    let err = runner.recover(&job, wrapper).await.unwrap_err();
    assert!(matches!(err, RunnerError::Unrecoverable(3, _)));
    runner.shutdown().await;
}

#[tokio::test]
async fn walltime_failure_resubmits_to_longer_destination() {
    let long = JobDestination::new("long", "fake").with_param("walltime", "86400");
    let short = JobDestination::new("short", "fake").with_resubmit(
        ResubmitRule::new(ResubmitCondition::WalltimeReached).to_environment("long"),
    );
    let mut fx = fixture(vec![short.clone(), long]);
    insert_job(&fx.store, 4, JobState::Queued);

    let fake = FakeBackend::default();
    fake.script(
        "ext-4",
        vec![Scripted::Status(RemoteStatus::Failed {
            failure: FailureKind::WalltimeExceeded,
            message: None,
        })],
    );
    let runner = started(fake);
    runner
        .queue_job(JobWrapper::new(fx.ctx.clone(), 4, short))
        .await
        .unwrap();

    let requeued = tokio::time::timeout(Duration::from_secs(3), fx.requeued.recv())
        .await
        .unwrap();
    assert_eq!(requeued, Some(4));

    let job = fx.store.get_job(4).await.unwrap();
    assert_eq!(job.state, JobState::Queued);
    assert_eq!(job.destination_id.as_deref(), Some("long"));
    assert_eq!(job.external_id, None);
    assert_eq!(job.consumed_resubmits().collect::<Vec<_>>(), vec!["short:0"]);
    runner.shutdown().await;
}

#[tokio::test]
async fn failure_without_rule_is_terminal() {
    let fx = fixture(vec![]);
    insert_job(&fx.store, 5, JobState::Queued);

    let fake = FakeBackend::default();
    fake.script(
        "ext-5",
        vec![Scripted::Status(RemoteStatus::Failed {
            failure: FailureKind::MemoryLimitExceeded,
            message: None,
        })],
    );
    let runner = started(fake);
    runner
        .queue_job(JobWrapper::new(fx.ctx.clone(), 5, JobDestination::new("d", "fake")))
        .await
        .unwrap();

    let job = wait_for_state(&fx.store, 5, JobState::Error).await;
    assert_eq!(
        job.info.as_deref(),
        Some(FailureKind::MemoryLimitExceeded.user_message())
    );
    assert_eq!(fx.store.get_dataset(50).await.unwrap().state, DatasetState::Error);
    runner.shutdown().await;
}

#[tokio::test]
async fn deleted_job_is_dropped_from_watch_list() {
    let fx = fixture(vec![]);
    insert_job(&fx.store, 6, JobState::Queued);
    let fake = FakeBackend::default();
    fake.script("ext-6", vec![Scripted::Status(RemoteStatus::Running)]);
    let runner = started(fake);
    runner
        .queue_job(JobWrapper::new(fx.ctx.clone(), 6, JobDestination::new("d", "fake")))
        .await
        .unwrap();
    wait_for_state(&fx.store, 6, JobState::Running).await;

    fx.store
        .update_state(6, JobState::Deleted, None)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let polls = runner.backend().polls.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(runner.backend().polls.load(Ordering::SeqCst), polls);
    assert_eq!(fx.store.get_job(6).await.unwrap().state, JobState::Deleted);
    runner.shutdown().await;
}

#[tokio::test]
async fn repeated_poll_errors_fail_the_job() {
    let fx = fixture(vec![]);
    insert_job(&fx.store, 7, JobState::Queued);
    let fake = FakeBackend::default();
    fake.script("ext-7", vec![Scripted::Error]);
    let runner = started(fake);
    runner
        .queue_job(JobWrapper::new(fx.ctx.clone(), 7, JobDestination::new("d", "fake")))
        .await
        .unwrap();

    let job = wait_for_state(&fx.store, 7, JobState::Error).await;
    assert_eq!(job.info.as_deref(), Some(GENERIC_REMOTE_ERROR));
    assert!(runner.backend().polls.load(Ordering::SeqCst) >= MAX_POLL_ERRORS as usize);
    runner.shutdown().await;
}

#[tokio::test]
async fn panic_fails_one_job_and_monitor_keeps_going() {
    let fx = fixture(vec![]);
    insert_job(&fx.store, 8, JobState::Queued);
    insert_job(&fx.store, 9, JobState::Queued);
    let fake = FakeBackend::default();
    fake.script("ext-8", vec![Scripted::Panic]);
    fake.script(
        "ext-9",
        vec![
            Scripted::Status(RemoteStatus::Running),
            Scripted::Status(RemoteStatus::Finished),
        ],
    );
    *fake.outcome.lock().unwrap() = JobOutcome {
        exit_code: Some(0),
        ..Default::default()
    };
    let runner = started(fake);
    for id in [8, 9] {
        runner
            .queue_job(JobWrapper::new(fx.ctx.clone(), id, JobDestination::new("d", "fake")))
            .await
            .unwrap();
    }

    wait_for_state(&fx.store, 8, JobState::Error).await;
    wait_for_state(&fx.store, 9, JobState::Ok).await;
    runner.shutdown().await;
}

#[tokio::test]
async fn cancelled_job_is_not_submitted() {
    let fx = fixture(vec![]);
    insert_job(&fx.store, 11, JobState::DeletedNew);
    let runner = started(FakeBackend::default());
    runner
        .queue_job(JobWrapper::new(fx.ctx.clone(), 11, JobDestination::new("d", "fake")))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(runner.backend().submits.load(Ordering::SeqCst), 0);
    runner.shutdown().await;
}

#[tokio::test]
async fn stop_kills_only_submitted_jobs() {
    let fx = fixture(vec![]);
    insert_job(&fx.store, 12, JobState::Queued);
    let runner = started(FakeBackend::default());

    let mut job = fx.store.get_job(12).await.unwrap();
    runner.stop_job(&job).await.unwrap();
    job.external_id = Some("ext-12".into());
    runner.stop_job(&job).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(runner.backend().kills.load(Ordering::SeqCst), 1);

    runner.shutdown().await;
    assert!(matches!(
        runner.stop_job(&job).await,
        Err(RunnerError::ShuttingDown)
    ));
}
