//! Explicit runner plugin registry: `load` kind → factory.

use std::collections::BTreeMap;
use std::sync::Arc;

use gantry_runners::{
    AsyncRunner, ClusterBackend, JobRunner, LocalRunner, SlurmBackend, StagingBackend,
};
use tracing::{error, info, warn};

use crate::jobconf::RunnerSpec;

/// Worker tasks per polling runner when the job configuration gives none.
const DEFAULT_WORKERS: usize = 4;

pub type RunnerFactory =
    Box<dyn Fn(&str, &RunnerSpec) -> gantry_runners::Result<Arc<dyn JobRunner>> + Send + Sync>;

pub struct RunnerRegistry {
    factories: BTreeMap<String, RunnerFactory>,
}

impl RunnerRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// The shipped backends: `local`, `slurm`, `cluster`, `staging`.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register("local", |name, spec| {
            Ok(Arc::new(LocalRunner::from_params(name, &spec.plugin_params())) as Arc<dyn JobRunner>)
        });
        registry.register("slurm", |name, spec| {
            let backend = SlurmBackend::from_params(name, &spec.params);
            Ok(Arc::new(AsyncRunner::start(backend, workers(spec))) as Arc<dyn JobRunner>)
        });
        registry.register("cluster", |name, spec| {
            let backend = ClusterBackend::from_params(name, &spec.params)?;
            Ok(Arc::new(AsyncRunner::start(backend, workers(spec))) as Arc<dyn JobRunner>)
        });
        registry.register("staging", |name, spec| {
            let backend = StagingBackend::from_params(name, &spec.params)?;
            Ok(Arc::new(AsyncRunner::start(backend, workers(spec))) as Arc<dyn JobRunner>)
        });
        registry
    }

    /// Register (or replace) the factory for a `load` kind.
    pub fn register<F>(&mut self, kind: impl Into<String>, factory: F)
    where
        F: Fn(&str, &RunnerSpec) -> gantry_runners::Result<Arc<dyn JobRunner>> + Send + Sync + 'static,
    {
        self.factories.insert(kind.into(), Box::new(factory));
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Construct every configured plugin. A plugin whose kind is unknown or
    /// whose factory fails is logged and left out.
    pub fn build(&self, specs: &BTreeMap<String, RunnerSpec>) -> BTreeMap<String, Arc<dyn JobRunner>> {
        let mut runners = BTreeMap::new();
        for (name, spec) in specs {
            let Some(factory) = self.factories.get(&spec.load) else {
                warn!(runner = %name, load = %spec.load, "unknown runner kind; plugin not loaded");
                continue;
            };
            match factory(name, spec) {
                Ok(runner) => {
                    info!(runner = %name, load = %spec.load, "runner plugin loaded");
                    runners.insert(name.clone(), runner);
                }
                Err(e) => error!(runner = %name, load = %spec.load, error = %e, "failed to load runner plugin"),
            }
        }
        runners
    }
}

impl Default for RunnerRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

fn workers(spec: &RunnerSpec) -> usize {
    spec.workers.unwrap_or(DEFAULT_WORKERS).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::RecordingRunner;
    use gantry_runners::RunnerError;

    fn specs(pairs: &[(&str, RunnerSpec)]) -> BTreeMap<String, RunnerSpec> {
        pairs
            .iter()
            .map(|(name, spec)| (name.to_string(), spec.clone()))
            .collect()
    }

    #[test]
    fn builtin_kinds() {
        assert_eq!(
            RunnerRegistry::with_builtin().kinds(),
            vec!["cluster", "local", "slurm", "staging"]
        );
    }

    #[tokio::test]
    async fn failed_and_unknown_plugins_are_absent() {
        let mut registry = RunnerRegistry::new();
        registry.register("fake", |name, _| Ok(RecordingRunner::new(name) as Arc<dyn JobRunner>));
        registry.register("broken", |_, _| Err(RunnerError::Configuration("no url".into())));

        let runners = registry.build(&specs(&[
            ("one", RunnerSpec::new("fake")),
            ("two", RunnerSpec::new("broken")),
            ("three", RunnerSpec::new("pbs")),
        ]));
        assert_eq!(runners.keys().collect::<Vec<_>>(), vec!["one"]);
        assert_eq!(runners["one"].name(), "one");
    }

    #[tokio::test]
    async fn builtin_local_and_cluster_without_url() {
        let runners = RunnerRegistry::with_builtin().build(&specs(&[
            ("local", RunnerSpec::new("local")),
            ("k8s", RunnerSpec::new("cluster")),
        ]));
        assert!(runners.contains_key("local"));
        assert!(!runners.contains_key("k8s"));
    }
}
