//! Job features fed to the routing policy.

use std::collections::BTreeSet;

use gantry_core::{Dataset, Job};
use gantry_routing::{JobFeatures, RuleType};
use serde_json::Value;

/// Compute only the features the tool's rules inspect.
///
/// Deleted inputs do not count towards the size. Record counts aggregate
/// only when every input knows its count; otherwise the feature is absent
/// and `records` rules do not match.
pub fn job_features(job: &Job, inputs: &[Dataset], required: &BTreeSet<RuleType>) -> JobFeatures {
    let live = || inputs.iter().filter(|d| !d.deleted);
    JobFeatures {
        file_size: required
            .contains(&RuleType::FileSize)
            .then(|| live().map(|d| d.file_size).sum()),
        num_input_datasets: required
            .contains(&RuleType::NumInputDatasets)
            .then(|| inputs.len() as u64),
        records: if required.contains(&RuleType::Records) {
            live().map(|d| d.records).sum::<Option<u64>>()
        } else {
            None
        },
        params: if required.contains(&RuleType::Arguments) {
            job.params.clone()
        } else {
            Value::Null
        },
    }
}
