//! Concrete runner backends.
//!
//! `local` implements [`JobRunner`](crate::JobRunner) directly. The others
//! are [`PollingBackend`](crate::monitor::PollingBackend)s driven by an
//! [`AsyncRunner`](crate::monitor::AsyncRunner).

pub mod cluster;
pub mod local;
pub mod shell;
pub mod slurm;
pub mod staging;

use std::collections::BTreeMap;
use std::time::Duration;

use url::Url;

use crate::error::{Result, RunnerError};

pub use cluster::ClusterBackend;
pub use local::LocalRunner;
pub use shell::{CommandShell, LocalShell, ShellOutput, SshShell};
pub use slurm::SlurmBackend;
pub use staging::{PathMapper, StagingBackend};

/// Plugin-level params from the job configuration's `runners` section.
pub type RunnerParams = BTreeMap<String, String>;

const MIN_POLL_SECS: u64 = 1;
const MAX_POLL_SECS: u64 = 15;

/// `poll_interval` param in seconds, clamped to 1..=15.
pub(crate) fn poll_interval(params: &RunnerParams, default_secs: u64) -> Duration {
    let secs = params
        .get("poll_interval")
        .and_then(|v| v.trim().parse::<u64>().ok())
        .unwrap_or(default_secs)
        .clamp(MIN_POLL_SECS, MAX_POLL_SECS);
    Duration::from_secs(secs)
}

/// Required `url` param, normalized with a trailing slash so relative joins
/// append instead of replacing the last segment.
pub(crate) fn base_url(params: &RunnerParams, runner: &str) -> Result<Url> {
    let raw = params
        .get("url")
        .ok_or_else(|| RunnerError::Configuration(format!("runner '{}' needs a 'url' param", runner)))?;
    let mut url = Url::parse(raw.trim())?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

pub(crate) fn authorized(
    request: reqwest::RequestBuilder,
    token: Option<&str>,
) -> reqwest::RequestBuilder {
    match token {
        Some(token) => request.bearer_auth(token),
        None => request,
    }
}
