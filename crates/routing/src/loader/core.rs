//! Core [`PolicyLoader`] struct: file-backed policy loading with optional hot-reload.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tracing::{info, warn};

use crate::schema::RoutingPolicy;
use crate::validation::{validate_yaml, ValidationResult};

use super::error::{PolicyError, Result};
use super::watcher::handle_fs_event;

/// Shared, swappable view of the current policy.
///
/// Readers take a cheap `Arc` snapshot; a reload swaps the whole policy.
#[derive(Clone, Default)]
pub struct PolicyHandle {
    inner: Arc<RwLock<Arc<RoutingPolicy>>>,
}

impl PolicyHandle {
    pub fn new(policy: RoutingPolicy) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(policy))),
        }
    }

    pub fn current(&self) -> Arc<RoutingPolicy> {
        Arc::clone(&self.inner.read().expect("policy lock poisoned"))
    }

    pub(super) fn replace(&self, policy: RoutingPolicy) {
        *self.inner.write().expect("policy lock poisoned") = Arc::new(policy);
    }
}

/// Validate YAML in corrective mode and return the repaired policy.
///
/// Fails only when nothing usable can be built (unparseable YAML, or a
/// document that is not a mapping).
pub fn parse_policy(yaml: &str, known_destinations: &[String]) -> Result<(RoutingPolicy, ValidationResult)> {
    let validated = validate_yaml(yaml, known_destinations);
    match validated.policy {
        Some(policy) => Ok((policy, validated.result)),
        None => Err(PolicyError::Invalid(validated.result)),
    }
}

/// File-backed routing policy loader with optional hot-reload.
pub struct PolicyLoader {
    path: PathBuf,
    /// Destination ids references are validated against.
    known: Arc<Vec<String>>,
    handle: PolicyHandle,
    /// Active filesystem watcher (held to keep it alive).
    _watcher: Option<RecommendedWatcher>,
}

impl PolicyLoader {
    pub fn new(path: PathBuf, known_destinations: Vec<String>) -> Self {
        Self {
            path,
            known: Arc::new(known_destinations),
            handle: PolicyHandle::default(),
            _watcher: None,
        }
    }

    /// Read, validate and publish the policy file.
    ///
    /// The validation report is logged and returned; repairs do not make
    /// the load fail.
    pub fn load(&self) -> Result<ValidationResult> {
        let (policy, report) = read_policy(&self.path, &self.known)?;
        report.log();
        info!(
            path = %self.path.display(),
            tools = policy.tools.len(),
            valid = report.valid,
            "loaded routing policy"
        );
        self.handle.replace(policy);
        Ok(report)
    }

    /// Start a filesystem watcher on the policy file's directory.
    ///
    /// On create/modify the policy is re-read and swapped in. Parse errors
    /// are logged as warnings; the previous policy is kept.
    pub fn watch(&mut self) -> Result<()> {
        let handle = self.handle.clone();
        let known = Arc::clone(&self.known);
        let path = self.path.clone();

        let mut watcher = notify::recommended_watcher(move |res: std::result::Result<notify::Event, notify::Error>| {
            match res {
                Ok(event) => handle_fs_event(&event, &path, &known, &handle),
                Err(e) => warn!(error = %e, "filesystem watcher error"),
            }
        })?;

        let dir = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;

        let _ = watcher.configure(notify::Config::default().with_poll_interval(Duration::from_millis(500)));

        info!(path = %self.path.display(), "watching routing policy for changes");
        self._watcher = Some(watcher);
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Shared handle that always yields the latest policy.
    pub fn handle(&self) -> PolicyHandle {
        self.handle.clone()
    }

    pub fn policy(&self) -> Arc<RoutingPolicy> {
        self.handle.current()
    }
}

pub(super) fn read_policy(path: &Path, known: &[String]) -> Result<(RoutingPolicy, ValidationResult)> {
    let contents = fs::read_to_string(path)?;
    parse_policy(&contents, known)
}
