//! Job configuration file: runner plugins, destinations and limits.
//!
//! ```yaml
//! runners:
//!   local: { load: local, workers: 4 }
//!   slurm:
//!     load: slurm
//!     workers: 2
//!     params: { ssh_host: login.example.org, poll_interval: 10 }
//! destinations:
//!   - id: local_default
//!     runner: local
//!   - id: slurm_normal
//!     runner: slurm
//!     params: { partition: normal, walltime: 3600 }
//!     resubmit:
//!       - { condition: walltime_reached, environment: slurm_long }
//! default_destination: local_default
//! tools:
//!   bwa_mem: slurm_normal
//! limits:
//!   registered_user_concurrent_jobs: 8
//!   destination_total_concurrent_jobs: { "slurm_*": 200 }
//! tasked_jobs: false
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use gantry_core::JobDestination;
use serde::{Deserialize, Deserializer};

use crate::dispatcher::TASKS_RUNNER;
use crate::error::{HandlerError, Result};

/// One `runners` entry.
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerSpec {
    /// Plugin kind, looked up in the [`RunnerRegistry`](crate::RunnerRegistry).
    pub load: String,
    /// Worker tasks (or concurrent local commands).
    #[serde(default)]
    pub workers: Option<usize>,
    #[serde(default, deserialize_with = "scalar_map")]
    pub params: BTreeMap<String, String>,
}

impl RunnerSpec {
    pub fn new(load: impl Into<String>) -> Self {
        Self {
            load: load.into(),
            workers: None,
            params: BTreeMap::new(),
        }
    }

    /// Params as handed to the plugin; `workers` is folded in when set.
    pub fn plugin_params(&self) -> BTreeMap<String, String> {
        let mut params = self.params.clone();
        if let Some(workers) = self.workers {
            params.insert("workers".into(), workers.to_string());
        }
        params
    }
}

/// Concurrency limits. A limit of zero is the same as no limit.
///
/// Destination keys are destination ids or glob patterns; a pattern counts
/// every active job on any destination it matches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Limits {
    #[serde(default)]
    pub registered_user_concurrent_jobs: Option<usize>,
    #[serde(default)]
    pub anonymous_user_concurrent_jobs: Option<usize>,
    #[serde(default)]
    pub destination_total_concurrent_jobs: BTreeMap<String, usize>,
    #[serde(default)]
    pub destination_user_concurrent_jobs: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JobConf {
    #[serde(default)]
    pub runners: BTreeMap<String, RunnerSpec>,
    #[serde(default)]
    pub destinations: Vec<JobDestination>,
    #[serde(default)]
    pub default_destination: Option<String>,
    /// Static tool id → destination id mapping, used without a routing policy.
    #[serde(default)]
    pub tools: BTreeMap<String, String>,
    #[serde(default)]
    pub limits: Limits,
    /// Send splittable jobs to the runner named `tasks`.
    #[serde(default)]
    pub tasked_jobs: bool,
}

impl JobConf {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        let conf: JobConf = serde_yaml::from_str(text)?;
        conf.validate()?;
        Ok(conf)
    }

    /// Every cross reference must point at something declared.
    pub fn validate(&self) -> Result<()> {
        if self.destinations.is_empty() {
            return Err(HandlerError::JobConf("no destinations declared".into()));
        }

        let mut seen = BTreeSet::new();
        for dest in &self.destinations {
            if !seen.insert(dest.id.as_str()) {
                return Err(HandlerError::JobConf(format!(
                    "destination '{}' is declared twice",
                    dest.id
                )));
            }
            if !self.runners.contains_key(&dest.runner) {
                return Err(HandlerError::JobConf(format!(
                    "destination '{}' uses undeclared runner '{}'",
                    dest.id, dest.runner
                )));
            }
        }

        for dest in &self.destinations {
            for rule in &dest.resubmit {
                if let Some(target) = &rule.environment {
                    self.require_destination(target, &format!("resubmit rule of '{}'", dest.id))?;
                }
            }
        }
        if let Some(id) = &self.default_destination {
            self.require_destination(id, "default_destination")?;
        }
        for (tool, id) in &self.tools {
            self.require_destination(id, &format!("tool '{}'", tool))?;
        }
        if self.tasked_jobs && !self.runners.contains_key(TASKS_RUNNER) {
            return Err(HandlerError::JobConf(format!(
                "tasked_jobs needs a runner named '{}'",
                TASKS_RUNNER
            )));
        }
        Ok(())
    }

    fn require_destination(&self, id: &str, context: &str) -> Result<()> {
        if self.destination(id).is_some() {
            Ok(())
        } else {
            Err(HandlerError::JobConf(format!(
                "{} refers to undeclared destination '{}'",
                context, id
            )))
        }
    }

    pub fn destination(&self, id: &str) -> Option<&JobDestination> {
        self.destinations.iter().find(|d| d.id == id)
    }

    pub fn destination_ids(&self) -> Vec<String> {
        self.destinations.iter().map(|d| d.id.clone()).collect()
    }

    pub fn destination_map(&self) -> BTreeMap<String, JobDestination> {
        self.destinations
            .iter()
            .map(|d| (d.id.clone(), d.clone()))
            .collect()
    }

    /// Static choice for a tool: its `tools` entry, else the default.
    pub fn static_destination(&self, tool_id: &str) -> Option<&JobDestination> {
        self.tools
            .get(tool_id)
            .or(self.default_destination.as_ref())
            .and_then(|id| self.destination(id))
    }
}

/// Accept any YAML scalar as a string param (`poll_interval: 10`).
fn scalar_map<'de, D>(deserializer: D) -> std::result::Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: BTreeMap<String, serde_yaml::Value> = BTreeMap::deserialize(deserializer)?;
    raw.into_iter()
        .map(|(k, v)| {
            let value = match v {
                serde_yaml::Value::String(s) => s,
                serde_yaml::Value::Bool(b) => b.to_string(),
                serde_yaml::Value::Number(n) => n.to_string(),
                serde_yaml::Value::Null => String::new(),
                other => {
                    return Err(serde::de::Error::custom(format!(
                        "param '{}' must be a scalar, got {:?}",
                        k, other
                    )))
                }
            };
            Ok((k, value))
        })
        .collect()
}
