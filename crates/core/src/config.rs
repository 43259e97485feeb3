use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

fn profiled_env_or(profile: &str, key: &str, default: &str) -> String {
    profiled_env_opt(profile, key).unwrap_or_else(|| default.to_string())
}

fn profiled_env_u64(profile: &str, key: &str, default: u64) -> u64 {
    profiled_env_opt(profile, key)
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn profiled_env_bool(profile: &str, key: &str, default: bool) -> bool {
    match profiled_env_opt(profile, key) {
        Some(v) => matches!(v.to_ascii_lowercase().as_str(), "true" | "1" | "yes" | "on"),
        None => default,
    }
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    pub profile: String,
    pub handler: HandlerConfig,
    pub quota: QuotaConfig,
    pub paths: PathsConfig,
}

/// Well-known env keys that identify a profile when prefixed.
const PROFILE_MARKER_KEYS: &[&str] = &["HANDLER_ID", "JOB_CONFIG", "ROUTING_POLICY"];

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `GANTRY_PROFILE`. When set (e.g. `PROD`), every
    /// key is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("GANTRY_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        let p = p.as_str();
        Self {
            profile: p.to_string(),
            handler: HandlerConfig::from_env_profiled(p),
            quota: QuotaConfig::from_env_profiled(p),
            paths: PathsConfig::from_env_profiled(p),
        }
    }

    /// Discover available profiles by scanning env vars for `{PREFIX}_{MARKER_KEY}` patterns.
    /// Always includes "default" (the unprefixed config).
    pub fn available_profiles() -> Vec<String> {
        let mut profiles = std::collections::BTreeSet::new();
        profiles.insert("default".to_string());

        for (key, _) in env::vars() {
            for marker in PROFILE_MARKER_KEYS {
                if let Some(prefix) = key.strip_suffix(&format!("_{}", marker)) {
                    if !prefix.is_empty()
                        && prefix.chars().all(|c| c.is_ascii_uppercase() || c == '_')
                    {
                        profiles.insert(prefix.to_string());
                    }
                }
            }
        }

        profiles.into_iter().collect()
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!(
            "  handler:     id={}, tracking={}, scan={}ms, cancel={}ms, recover={}",
            self.handler.id,
            self.handler.tracking,
            self.handler.admission_interval_ms,
            self.handler.cancellation_interval_ms,
            self.handler.recover_on_startup
        );
        tracing::info!("  quota:       enabled={}", self.quota.enabled);
        tracing::info!(
            "  paths:       job_config={}, routing={}, watch={}, working_root={}",
            self.paths.job_config.display(),
            self.paths
                .routing_policy
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "(none)".to_string()),
            self.paths.watch_policy,
            self.paths.working_root.display()
        );
    }
}

// ── Handler ───────────────────────────────────────────────────

/// How the admission and cancellation loops learn about work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingMode {
    /// New job ids are pushed through in-process queues.
    Memory,
    /// Every pass re-queries the job store.
    Store,
}

impl std::fmt::Display for TrackingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TrackingMode::Memory => write!(f, "memory"),
            TrackingMode::Store => write!(f, "store"),
        }
    }
}

impl FromStr for TrackingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(TrackingMode::Memory),
            "store" | "db" | "db-skip-locked" => Ok(TrackingMode::Store),
            other => Err(format!("unknown tracking mode: '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandlerConfig {
    /// Identity of this handler process; jobs are owned per handler.
    pub id: String,
    pub admission_interval_ms: u64,
    pub cancellation_interval_ms: u64,
    pub tracking: TrackingMode,
    pub recover_on_startup: bool,
}

impl HandlerConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            id: profiled_env_or(p, "HANDLER_ID", "main"),
            admission_interval_ms: profiled_env_u64(p, "ADMISSION_INTERVAL_MS", 1000),
            cancellation_interval_ms: profiled_env_u64(p, "CANCELLATION_INTERVAL_MS", 1000),
            tracking: profiled_env_opt(p, "JOB_TRACKING")
                .and_then(|v| v.parse().ok())
                .unwrap_or(TrackingMode::Memory),
            recover_on_startup: profiled_env_bool(p, "RECOVER_ON_STARTUP", true),
        }
    }
}

// ── Quota ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    pub enabled: bool,
}

impl QuotaConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            enabled: profiled_env_bool(p, "QUOTA_ENABLED", false),
        }
    }
}

// ── Paths ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    pub job_config: PathBuf,
    pub routing_policy: Option<PathBuf>,
    /// Reload the routing policy when the file changes.
    pub watch_policy: bool,
    /// Parent of per-job working directories.
    pub working_root: PathBuf,
}

impl PathsConfig {
    fn from_env_profiled(p: &str) -> Self {
        Self {
            job_config: PathBuf::from(profiled_env_or(p, "JOB_CONFIG", "config/job_conf.yml")),
            routing_policy: profiled_env_opt(p, "ROUTING_POLICY").map(PathBuf::from),
            watch_policy: profiled_env_bool(p, "ROUTING_WATCH", false),
            working_root: PathBuf::from(profiled_env_or(p, "JOB_WORKING_ROOT", "data/jobs")),
        }
    }
}
