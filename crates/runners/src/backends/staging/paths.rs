use std::path::Path;

use gantry_core::Dataset;

use super::RemoteLayout;
use crate::wrapper::PreparedJob;

/// Local to remote path rewriting, applied by plain string substitution.
///
/// Built once per job. Longer local paths are tried first so a directory
/// never shadows a file beneath it, and every position of the input is
/// rewritten at most once.
#[derive(Debug, Clone, Default)]
pub struct PathMapper {
    rules: Vec<(String, String)>,
}

impl PathMapper {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, local: impl AsRef<Path>, remote: impl Into<String>) {
        let local = local.as_ref().to_string_lossy().to_string();
        if local.is_empty() {
            return;
        }
        self.rules.retain(|(l, _)| *l != local);
        self.rules.push((local, remote.into()));
        self.rules.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    }

    /// Map inputs, outputs and the working directory of `job` into `layout`.
    pub fn for_job(job: &PreparedJob, layout: &RemoteLayout) -> Self {
        let mut mapper = Self::new();
        mapper.add(&job.working_directory, layout.working_directory.clone());
        for dataset in &job.inputs {
            mapper.add(&dataset.file_path, remote_join(&layout.inputs_directory, &remote_name(dataset)));
        }
        for dataset in &job.outputs {
            mapper.add(&dataset.file_path, remote_join(&layout.outputs_directory, &remote_name(dataset)));
        }
        mapper
    }

    pub fn remote_for(&self, local: impl AsRef<Path>) -> Option<&str> {
        let local = local.as_ref().to_string_lossy();
        self.rules
            .iter()
            .find(|(l, _)| *l == local)
            .map(|(_, r)| r.as_str())
    }

    pub fn apply(&self, text: &str) -> String {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        'scan: while !rest.is_empty() {
            for (local, remote) in &self.rules {
                if let Some(tail) = rest.strip_prefix(local.as_str()) {
                    out.push_str(remote);
                    rest = tail;
                    continue 'scan;
                }
            }
            let mut chars = rest.chars();
            if let Some(c) = chars.next() {
                out.push(c);
            }
            rest = chars.as_str();
        }
        out
    }
}

/// File name a dataset gets on the remote side. Prefixed with the dataset
/// id since inputs from different directories may share a file name.
pub fn remote_name(dataset: &Dataset) -> String {
    match dataset.file_path.file_name() {
        Some(name) => format!("{}_{}", dataset.id, name.to_string_lossy()),
        None => format!("dataset_{}.dat", dataset.id),
    }
}

fn remote_join(dir: &str, name: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), name)
}
