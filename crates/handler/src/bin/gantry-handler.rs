//! gantry-handler - job admission and dispatch process.
//!
//! Subcommands:
//! - `run`: start the handler against a JSON store snapshot
//! - `check-policy`: validate a routing policy file
//! - `route`: show where a job with the given features would go

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use gantry_core::config::{self, Config};
use gantry_core::{MemoryJobStore, StoreSnapshot};
use gantry_handler::{JobConf, JobHandler};
use gantry_routing::loader::parse_policy;
use gantry_routing::{str_to_bytes, validate_yaml, JobFeatures, PolicyLoader, RouteRequest};

// ── CLI ─────────────────────────────────────────────────────────────

/// Gantry job handler: admission, routing and dispatch of jobs.
#[derive(Parser, Debug)]
#[command(name = "gantry-handler", version, about)]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
}

#[derive(Subcommand, Debug)]
enum Cmd {
    /// Run the handler until SIGINT/SIGTERM.
    Run(RunArgs),
    /// Validate a routing policy file.
    CheckPolicy(CheckPolicyArgs),
    /// Resolve a destination without running anything.
    Route(RouteArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    /// JSON store snapshot, loaded at start and written back on exit.
    #[arg(long, env = "GANTRY_SNAPSHOT")]
    snapshot: Option<PathBuf>,

    /// Job configuration file (overrides JOB_CONFIG).
    #[arg(long)]
    job_config: Option<PathBuf>,

    /// Seconds to wait for each loop on shutdown.
    #[arg(long, env = "GANTRY_SHUTDOWN_TIMEOUT", default_value_t = 10)]
    shutdown_timeout: u64,
}

#[derive(Args, Debug)]
struct CheckPolicyArgs {
    /// Routing policy file (defaults to ROUTING_POLICY).
    #[arg(long)]
    policy: Option<PathBuf>,

    /// Job configuration whose destinations references are checked against.
    #[arg(long)]
    job_config: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct RouteArgs {
    #[arg(long)]
    policy: Option<PathBuf>,

    #[arg(long)]
    job_config: Option<PathBuf>,

    #[arg(long)]
    tool: String,

    /// User email.
    #[arg(long)]
    user: Option<String>,

    /// Aggregate input size, e.g. "500 MB".
    #[arg(long)]
    file_size: Option<String>,

    /// Number of input datasets.
    #[arg(long)]
    inputs: Option<u64>,

    #[arg(long)]
    records: Option<u64>,

    /// Tool parameters as a JSON object.
    #[arg(long)]
    params: Option<String>,

    /// Job resource priority.
    #[arg(long)]
    priority: Option<String>,
}

// ── Commands ────────────────────────────────────────────────────────

fn policy_path(arg: Option<PathBuf>, config: &Config) -> anyhow::Result<PathBuf> {
    arg.or_else(|| config.paths.routing_policy.clone())
        .context("no routing policy given (use --policy or ROUTING_POLICY)")
}

fn known_destinations(arg: Option<PathBuf>, config: &Config) -> Vec<String> {
    let path = arg.unwrap_or_else(|| config.paths.job_config.clone());
    match JobConf::load(&path) {
        Ok(conf) => conf.destination_ids(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "job configuration unavailable; destination references not checked");
            Vec::new()
        }
    }
}

fn check_policy(args: CheckPolicyArgs, config: &Config) -> anyhow::Result<()> {
    let path = policy_path(args.policy, config)?;
    let yaml = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    let known = known_destinations(args.job_config, config);
    let validated = validate_yaml(&yaml, &known);
    let report = validated.result;

    for e in &report.errors {
        match &e.suggestion {
            Some(s) => println!("error   {}: {} (did you mean '{}'?)", e.path, e.message, s),
            None => println!("error   {}: {}", e.path, e.message),
        }
    }
    for w in &report.warnings {
        println!("warning {}: {}", w.path, w.message);
    }
    if !report.valid {
        bail!("{} is invalid ({} errors)", path.display(), report.errors.len());
    }
    println!("{} is valid ({} warnings)", path.display(), report.warnings.len());
    Ok(())
}

fn route(args: RouteArgs, config: &Config) -> anyhow::Result<()> {
    let path = policy_path(args.policy, config)?;
    let yaml = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    let known = known_destinations(args.job_config, config);
    let (policy, report) = parse_policy(&yaml, &known)?;
    report.log();

    let file_size = match args.file_size.as_deref() {
        Some(text) => str_to_bytes(text)?.finite(),
        None => None,
    };
    let params = match args.params.as_deref() {
        Some(json) => serde_json::from_str(json).context("--params is not valid JSON")?,
        None => serde_json::Value::Null,
    };
    let request = RouteRequest {
        tool_id: &args.tool,
        user_email: args.user.as_deref(),
        features: JobFeatures {
            file_size,
            num_input_datasets: args.inputs,
            records: args.records,
            params,
        },
        workflow_priority: None,
        resource_priority: args.priority.as_deref(),
    };
    let decision = policy.resolve(&request)?;
    println!("destination: {}", decision.destination_id);
    if let Some(priority) = decision.priority {
        println!("priority:    {}", priority);
    }
    println!("source:      {:?}", decision.source);
    Ok(())
}

fn load_store(path: Option<&Path>) -> anyhow::Result<MemoryJobStore> {
    let Some(path) = path.filter(|p| p.exists()) else {
        return Ok(MemoryJobStore::new());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let snapshot: StoreSnapshot = serde_json::from_str(&text)
        .with_context(|| format!("parsing {}", path.display()))?;
    info!(path = %path.display(), jobs = snapshot.jobs.len(), "loaded store snapshot");
    Ok(MemoryJobStore::from_snapshot(snapshot))
}

async fn run(args: RunArgs, config: Config) -> anyhow::Result<()> {
    let conf_path = args.job_config.unwrap_or_else(|| config.paths.job_config.clone());
    let jobconf = JobConf::load(&conf_path)
        .with_context(|| format!("loading job configuration {}", conf_path.display()))?;
    info!(
        path = %conf_path.display(),
        runners = jobconf.runners.len(),
        destinations = jobconf.destinations.len(),
        "loaded job configuration"
    );

    let store = Arc::new(load_store(args.snapshot.as_deref())?);
    let mut builder = JobHandler::builder(config.clone(), jobconf.clone(), store.clone());
    if let Some(path) = &config.paths.routing_policy {
        let mut loader = PolicyLoader::new(path.clone(), jobconf.destination_ids());
        loader.load()?;
        if config.paths.watch_policy {
            loader.watch()?;
        }
        builder = builder.policy(loader);
    }

    let handler = builder.start().await?;
    if let Some(summary) = handler.recovery() {
        info!(?summary, "recovered jobs");
    }
    info!(handler = %handler.id(), "gantry-handler running");

    shutdown_signal().await;
    handler
        .shutdown(Duration::from_secs(args.shutdown_timeout))
        .await;

    if let Some(path) = &args.snapshot {
        let json = serde_json::to_string_pretty(&store.snapshot())?;
        std::fs::write(path, json).with_context(|| format!("writing {}", path.display()))?;
        info!(path = %path.display(), "store snapshot saved");
    }
    Ok(())
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {},
            _ = sigterm.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.expect("failed to listen for ctrl_c");
    }
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    config::load_dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.cmd {
        Cmd::Run(args) => {
            config.log_summary();
            run(args, config).await
        }
        Cmd::CheckPolicy(args) => check_policy(args, &config),
        Cmd::Route(args) => route(args, &config),
    }
}
