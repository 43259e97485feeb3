//! Cluster and staging backends against in-process fake HTTP services.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path as UrlPath, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use gantry_core::{
    Dataset, DatasetState, FailureKind, Job, JobDestination, JobId, JobOwner, JobState, JobStore,
    MemoryJobStore, ResubmitCondition, ResubmitRule, TemplateCommandProducer,
};
use gantry_runners::{
    AsyncRunner, ClusterBackend, JobRunner, JobWrapper, RunnerContext, RunnerParams,
    StagingBackend,
};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::mpsc;

// ── Helpers ─────────────────────────────────────────────────────────

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}/api", addr)
}

fn params(url: &str) -> RunnerParams {
    let mut params = RunnerParams::new();
    params.insert("url".into(), url.into());
    params.insert("poll_interval".into(), "1".into());
    params
}

fn context(
    root: &Path,
    store: Arc<MemoryJobStore>,
    destinations: Vec<JobDestination>,
) -> (RunnerContext, mpsc::UnboundedReceiver<JobId>) {
    let (requeue, requeued) = mpsc::unbounded_channel();
    let ctx = RunnerContext {
        store,
        commands: Arc::new(TemplateCommandProducer::new()),
        working_root: root.join("jobs"),
        destinations: Arc::new(
            destinations
                .into_iter()
                .map(|d| (d.id.clone(), d))
                .collect::<BTreeMap<_, _>>(),
        ),
        requeue,
    };
    (ctx, requeued)
}

fn user() -> JobOwner {
    JobOwner::User {
        id: 3,
        email: "grace@example.org".into(),
    }
}

async fn settled(store: &MemoryJobStore, id: JobId) -> Job {
    for _ in 0..1000 {
        let job = store.get_job(id).await.unwrap();
        if job.state.is_terminal() {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {id} did not settle");
}

// ── Cluster ─────────────────────────────────────────────────────────

#[derive(Default)]
struct ClusterState {
    created: Vec<Value>,
    polls: usize,
}

type SharedCluster = Arc<Mutex<ClusterState>>;

async fn create_job(State(state): State<SharedCluster>, Json(body): Json<Value>) -> Json<Value> {
    state.lock().unwrap().created.push(body);
    Json(json!({ "id": "c-1" }))
}

async fn job_status(State(state): State<SharedCluster>, UrlPath(id): UrlPath<String>) -> Json<Value> {
    assert_eq!(id, "c-1");
    let mut state = state.lock().unwrap();
    state.polls += 1;
    if state.polls < 3 {
        Json(json!({ "state": "running" }))
    } else {
        Json(json!({ "state": "failed", "reason": "OOMKilled", "exit_code": 137 }))
    }
}

async fn job_logs() -> Json<Value> {
    Json(json!({ "stdout": "", "stderr": "Killed" }))
}

async fn delete_job() -> StatusCode {
    StatusCode::NOT_FOUND
}

#[tokio::test]
async fn cluster_oom_kill_resubmits_to_bigger_destination() {
    let shared = SharedCluster::default();
    let app = Router::new()
        .route("/api/jobs", post(create_job))
        .route("/api/jobs/{id}", get(job_status).delete(delete_job))
        .route("/api/jobs/{id}/logs", get(job_logs))
        .with_state(shared.clone());
    let url = serve(app).await;

    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryJobStore::new());
    store.insert_job(
        Job::new(1, "spades", user())
            .with_command("spades.py -o $working_directory")
            .with_state(JobState::Queued),
    );
    let small = JobDestination::new("k8s_small", "cluster")
        .with_param("memory", "4G")
        .with_resubmit(
            ResubmitRule::new(ResubmitCondition::MemoryLimitReached).to_environment("k8s_big"),
        );
    let big = JobDestination::new("k8s_big", "cluster").with_param("memory", "64G");
    let (ctx, mut requeued) = context(dir.path(), store.clone(), vec![small.clone(), big]);

    let backend = ClusterBackend::from_params("cluster", &params(&url)).unwrap();
    let runner = AsyncRunner::start(backend, 2);
    runner.queue_job(JobWrapper::new(ctx, 1, small)).await.unwrap();

    let id = tokio::time::timeout(Duration::from_secs(10), requeued.recv())
        .await
        .unwrap();
    assert_eq!(id, Some(1));

    let job = store.get_job(1).await.unwrap();
    assert_eq!(job.state, JobState::Queued);
    assert_eq!(job.destination_id.as_deref(), Some("k8s_big"));
    assert_eq!(job.destination_params.get("memory").map(String::as_str), Some("64G"));
    assert!(job
        .info
        .as_deref()
        .unwrap()
        .starts_with(FailureKind::MemoryLimitExceeded.user_message()));

    let created = shared.lock().unwrap().created.clone();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0]["name"], "gantry-1");
    assert_eq!(created[0]["params"]["memory"], "4G");

    // The cluster already forgot the job; a 404 on delete is not an error.
    let mut job = store.get_job(1).await.unwrap();
    job.external_id = Some("c-1".into());
    runner.stop_job(&job).await.unwrap();
    runner.shutdown().await;
}

// ── Staging agent ───────────────────────────────────────────────────

#[derive(Default)]
struct AgentState {
    uploads: HashMap<(String, String), Vec<u8>>,
    command: Option<String>,
    polls: usize,
    cleaned: Vec<String>,
}

type SharedAgent = Arc<Mutex<AgentState>>;

async fn setup(UrlPath(id): UrlPath<String>) -> Json<Value> {
    Json(json!({
        "job_id": id,
        "working_directory": format!("/remote/{}/working", id),
        "inputs_directory": format!("/remote/{}/inputs", id),
        "outputs_directory": format!("/remote/{}/outputs", id),
    }))
}

async fn upload(
    State(state): State<SharedAgent>,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> StatusCode {
    let key = (query["kind"].clone(), query["name"].clone());
    state.lock().unwrap().uploads.insert(key, body.to_vec());
    StatusCode::NO_CONTENT
}

async fn submit(State(state): State<SharedAgent>, Json(body): Json<Value>) -> StatusCode {
    state.lock().unwrap().command = body["command"].as_str().map(str::to_string);
    StatusCode::ACCEPTED
}

async fn agent_status(State(state): State<SharedAgent>) -> Json<Value> {
    let mut state = state.lock().unwrap();
    state.polls += 1;
    if state.polls < 2 {
        return Json(json!({ "status": "running" }));
    }
    Json(json!({
        "status": "complete",
        "exit_code": 0,
        "stdout": "ok",
        "stderr": "",
        "outputs": ["2_dataset_2.dat"],
        "working_directory_contents": ["metrics.json", "../escape"],
    }))
}

async fn download(Query(query): Query<HashMap<String, String>>) -> Vec<u8> {
    match (query["kind"].as_str(), query["name"].as_str()) {
        ("output", "2_dataset_2.dat") => b"remote result".to_vec(),
        ("workdir", "metrics.json") => b"{\"runtime\": 3}".to_vec(),
        _ => Vec::new(),
    }
}

async fn clean(State(state): State<SharedAgent>, UrlPath(id): UrlPath<String>) -> StatusCode {
    state.lock().unwrap().cleaned.push(id);
    StatusCode::NO_CONTENT
}

#[tokio::test]
async fn staging_rewrites_paths_and_retrieves_outputs() {
    let shared = SharedAgent::default();
    let app = Router::new()
        .route("/api/jobs/{id}/setup", post(setup))
        .route("/api/jobs/{id}/files", put(upload).get(download))
        .route("/api/jobs/{id}/submit", post(submit))
        .route("/api/jobs/{id}/status", get(agent_status))
        .route("/api/jobs/{id}/clean", post(clean))
        .with_state(shared.clone());
    let url = serve(app).await;

    let dir = TempDir::new().unwrap();
    let data = dir.path().join("data");
    std::fs::create_dir_all(&data).unwrap();
    let input = data.join("dataset_1.dat");
    let output = data.join("dataset_2.dat");
    std::fs::write(&input, "ACGT\n").unwrap();

    let store = Arc::new(MemoryJobStore::new());
    store.insert_dataset(Dataset::new(1, 1, "reads", DatasetState::Ok).with_path(&input));
    store.insert_dataset(Dataset::new(2, 2, "copy", DatasetState::Queued).with_path(&output));
    store.insert_job(
        Job::new(1, "cat1", user())
            .with_input("input1", 1)
            .with_output("out_file1", 2)
            .with_command("cat $input_0 > $output_0 && cp $working_directory/tool.conf .")
            .with_state(JobState::Queued),
    );
    let (ctx, _requeued) = context(dir.path(), store.clone(), vec![]);

    // A config file the command producer left behind.
    let working = dir.path().join("jobs").join("1");
    std::fs::create_dir_all(&working).unwrap();
    std::fs::write(working.join("tool.conf"), format!("input={}\n", input.display())).unwrap();

    let backend = StagingBackend::from_params("staging", &params(&url)).unwrap();
    let runner = AsyncRunner::start(backend, 1);
    let dest = JobDestination::new("remote_cluster", "staging");
    runner.queue_job(JobWrapper::new(ctx, 1, dest)).await.unwrap();

    let job = settled(&store, 1).await;
    assert_eq!(job.state, JobState::Ok, "{:?}", job.info);
    assert_eq!(job.external_id.as_deref(), Some("1"));

    // Cleanup runs right after the job is settled.
    for _ in 0..300 {
        if !shared.lock().unwrap().cleaned.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    {
        let agent = shared.lock().unwrap();
        assert_eq!(
            agent.command.as_deref(),
            Some("cat /remote/1/inputs/1_dataset_1.dat > /remote/1/outputs/2_dataset_2.dat && cp /remote/1/working/tool.conf .")
        );
        assert_eq!(
            agent.uploads[&("input".to_string(), "1_dataset_1.dat".to_string())],
            b"ACGT\n"
        );
        assert_eq!(
            agent.uploads[&("workdir".to_string(), "tool.conf".to_string())],
            b"input=/remote/1/inputs/1_dataset_1.dat\n"
        );
        assert_eq!(agent.cleaned, vec!["1".to_string()]);
    }

    assert_eq!(std::fs::read_to_string(&output).unwrap(), "remote result");
    assert_eq!(
        std::fs::read_to_string(working.join("metrics.json")).unwrap(),
        "{\"runtime\": 3}"
    );
    assert!(!dir.path().join("jobs").join("escape").exists());
    runner.shutdown().await;
}

#[tokio::test]
async fn staging_cleans_remote_job_when_an_upload_fails() {
    let shared = SharedAgent::default();
    let app = Router::new()
        .route("/api/jobs/{id}/setup", post(setup))
        .route("/api/jobs/{id}/files", put(upload).get(download))
        .route("/api/jobs/{id}/submit", post(submit))
        .route("/api/jobs/{id}/status", get(agent_status))
        .route("/api/jobs/{id}/clean", post(clean))
        .with_state(shared.clone());
    let url = serve(app).await;

    let dir = TempDir::new().unwrap();
    let store = Arc::new(MemoryJobStore::new());
    // Input file was never written.
    store.insert_dataset(
        Dataset::new(1, 1, "reads", DatasetState::Ok).with_path(dir.path().join("gone.dat")),
    );
    store.insert_job(
        Job::new(2, "cat1", user())
            .with_input("input1", 1)
            .with_command("cat $input_0")
            .with_state(JobState::Queued),
    );
    let (ctx, _requeued) = context(dir.path(), store.clone(), vec![]);

    let backend = StagingBackend::from_params("staging", &params(&url)).unwrap();
    let runner = AsyncRunner::start(backend, 1);
    let dest = JobDestination::new("remote_cluster", "staging");
    runner.queue_job(JobWrapper::new(ctx, 2, dest)).await.unwrap();

    let job = settled(&store, 2).await;
    assert_eq!(job.state, JobState::Error);
    {
        let agent = shared.lock().unwrap();
        assert_eq!(agent.cleaned, vec!["2".to_string()]);
        assert!(agent.command.is_none());
    }
    runner.shutdown().await;
}
