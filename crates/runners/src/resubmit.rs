//! Rule-driven resubmission of failed jobs.
//!
//! Each rule on a destination may fire at most once per job. Consumed rules
//! are recorded in the job history under a `destination:index` key.

use gantry_core::{FailureKind, Job, JobDestination, ResubmitRule};

pub fn resubmit_key(destination_id: &str, index: usize) -> String {
    format!("{}:{}", destination_id, index)
}

/// First rule on `destination` that matches `failure` and has not fired for
/// this job yet.
pub fn select_rule<'a>(
    job: &Job,
    destination: &'a JobDestination,
    failure: FailureKind,
) -> Option<(String, &'a ResubmitRule)> {
    destination
        .resubmit
        .iter()
        .enumerate()
        .filter(|(_, rule)| rule.condition.matches(failure))
        .map(|(i, rule)| (resubmit_key(&destination.id, i), rule))
        .find(|(key, _)| !job.consumed_resubmits().any(|used| used == key))
}
