//! Readiness verdicts and concurrency gates.
//!
//! Everything here is a pure function of the job, its input datasets, the
//! configured limits, the active-job counts of the current scan and the
//! owner's quota status. The controller gathers those and acts on the
//! verdict.

use std::collections::HashMap;
use std::fmt;

use gantry_core::{Dataset, DatasetState, Job, JobOwner, JobState, UserId};

use crate::glob::{glob_match, is_pattern};
use crate::jobconf::Limits;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Wait,
    Ready,
    InputError { hid: u32, state: DatasetState },
    InputDeleted { hid: u32 },
    Deleted,
    AdminDeleted,
    UserOverQuota,
}

impl Readiness {
    /// Message recorded on a job failed because of this verdict.
    pub fn failure_message(&self) -> Option<String> {
        match self {
            Readiness::InputDeleted { hid } => Some(format!(
                "Input dataset {} was deleted before the job started.",
                hid
            )),
            Readiness::InputError {
                hid,
                state: DatasetState::FailedMetadata,
            } => Some(format!("Input dataset {} failed to properly set metadata.", hid)),
            Readiness::InputError { hid, .. } => {
                Some(format!("Input dataset {} is in an error state.", hid))
            }
            _ => None,
        }
    }
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Readiness::Wait => write!(f, "wait"),
            Readiness::Ready => write!(f, "ready"),
            Readiness::InputError { .. } => write!(f, "input_error"),
            Readiness::InputDeleted { .. } => write!(f, "input_deleted"),
            Readiness::Deleted => write!(f, "deleted"),
            Readiness::AdminDeleted => write!(f, "admin_deleted"),
            Readiness::UserOverQuota => write!(f, "user_over_quota"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QuotaStatus {
    /// Quota accounting is off, or the owner is anonymous or unlimited.
    #[default]
    NotApplicable,
    WithinQuota,
    OverQuota,
}

impl QuotaStatus {
    pub fn from_usage(usage: u64, quota: Option<u64>) -> Self {
        match quota {
            Some(limit) if usage > limit => QuotaStatus::OverQuota,
            Some(_) => QuotaStatus::WithinQuota,
            None => QuotaStatus::NotApplicable,
        }
    }
}

// ── Active job counts ───────────────────────────────────────────────

/// QUEUED and RUNNING jobs, counted once per scan and bumped as the scan
/// dispatches more. Approximate under concurrent handlers.
#[derive(Debug, Clone, Default)]
pub struct ActiveCounts {
    by_user: HashMap<UserId, usize>,
    by_session: HashMap<String, usize>,
    by_destination: HashMap<String, usize>,
    by_user_destination: HashMap<(UserId, String), usize>,
}

impl ActiveCounts {
    pub fn from_jobs<'a>(jobs: impl IntoIterator<Item = &'a Job>) -> Self {
        let mut counts = Self::default();
        for job in jobs.into_iter().filter(|j| j.state.is_active()) {
            counts.record(&job.owner, job.destination_id.as_deref());
        }
        counts
    }

    /// Count one more active job.
    pub fn record(&mut self, owner: &JobOwner, destination_id: Option<&str>) {
        match owner {
            JobOwner::User { id, .. } => {
                *self.by_user.entry(*id).or_default() += 1;
                if let Some(dest) = destination_id {
                    *self
                        .by_user_destination
                        .entry((*id, dest.to_string()))
                        .or_default() += 1;
                }
            }
            JobOwner::Anonymous { session_id } => {
                *self.by_session.entry(session_id.clone()).or_default() += 1;
            }
        }
        if let Some(dest) = destination_id {
            *self.by_destination.entry(dest.to_string()).or_default() += 1;
        }
    }

    pub fn user(&self, user_id: UserId) -> usize {
        self.by_user.get(&user_id).copied().unwrap_or(0)
    }

    pub fn session(&self, session_id: &str) -> usize {
        self.by_session.get(session_id).copied().unwrap_or(0)
    }

    /// Active jobs on the destination `key`, or on every destination the
    /// pattern `key` matches.
    pub fn destination(&self, key: &str) -> usize {
        if is_pattern(key) {
            self.by_destination
                .iter()
                .filter(|(dest, _)| glob_match(key, dest))
                .map(|(_, n)| n)
                .sum()
        } else {
            self.by_destination.get(key).copied().unwrap_or(0)
        }
    }

    pub fn user_destination(&self, user_id: UserId, key: &str) -> usize {
        if is_pattern(key) {
            self.by_user_destination
                .iter()
                .filter(|((user, dest), _)| *user == user_id && glob_match(key, dest))
                .map(|(_, n)| n)
                .sum()
        } else {
            self.by_user_destination
                .get(&(user_id, key.to_string()))
                .copied()
                .unwrap_or(0)
        }
    }
}

// ── Checks ──────────────────────────────────────────────────────────

/// Everything [`check_if_ready_to_run`] looks at.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessInput<'a> {
    pub job: &'a Job,
    pub inputs: &'a [Dataset],
    /// Resolved destination; destination gates are skipped without one.
    pub destination_id: Option<&'a str>,
    pub limits: &'a Limits,
    pub counts: &'a ActiveCounts,
    pub quota: QuotaStatus,
}

/// Deleted while waiting, or moved to ERROR by an administrator.
pub fn check_job_state(job: &Job) -> Option<Readiness> {
    match job.state {
        JobState::Deleted | JobState::DeletedNew => Some(Readiness::Deleted),
        JobState::AdminDeleted | JobState::Error => Some(Readiness::AdminDeleted),
        _ => None,
    }
}

/// Inputs in association order; the first one that is not ready decides.
pub fn check_inputs(inputs: &[Dataset]) -> Option<Readiness> {
    for dataset in inputs {
        if dataset.deleted {
            return Some(Readiness::InputDeleted { hid: dataset.hid });
        }
        if dataset.state.is_error() {
            return Some(Readiness::InputError {
                hid: dataset.hid,
                state: dataset.state,
            });
        }
        if !dataset.state.is_ready() {
            return Some(Readiness::Wait);
        }
    }
    None
}

fn limit(value: Option<usize>) -> Option<usize> {
    value.filter(|n| *n > 0)
}

/// Limit entries whose key names or matches `destination_id`.
fn applicable<'a>(
    limits: &'a std::collections::BTreeMap<String, usize>,
    destination_id: &'a str,
) -> impl Iterator<Item = (&'a str, usize)> + 'a {
    limits
        .iter()
        .filter(move |(key, n)| **n > 0 && (*key == destination_id || glob_match(key, destination_id)))
        .map(|(key, n)| (key.as_str(), *n))
}

/// Whether starting `job` on `destination_id` stays within every limit.
pub fn within_limits(
    job: &Job,
    destination_id: Option<&str>,
    limits: &Limits,
    counts: &ActiveCounts,
) -> bool {
    if let (Some(user_id), Some(max)) = (
        job.owner.user_id(),
        limit(limits.registered_user_concurrent_jobs),
    ) {
        if counts.user(user_id) >= max {
            return false;
        }
    }

    if let Some(dest) = destination_id {
        if applicable(&limits.destination_total_concurrent_jobs, dest)
            .any(|(key, max)| counts.destination(key) >= max)
        {
            return false;
        }
        if let Some(user_id) = job.owner.user_id() {
            if applicable(&limits.destination_user_concurrent_jobs, dest)
                .any(|(key, max)| counts.user_destination(user_id, key) >= max)
            {
                return false;
            }
        }
    }

    if let (Some(session), Some(max)) = (
        job.owner.session_id(),
        limit(limits.anonymous_user_concurrent_jobs),
    ) {
        if counts.session(session) >= max {
            return false;
        }
    }
    true
}

/// Full verdict for one job.
pub fn check_if_ready_to_run(input: &ReadinessInput<'_>) -> Readiness {
    if let Some(verdict) = check_job_state(input.job) {
        return verdict;
    }
    if let Some(verdict) = check_inputs(input.inputs) {
        return verdict;
    }
    if !within_limits(input.job, input.destination_id, input.limits, input.counts) {
        return Readiness::Wait;
    }
    if input.quota == QuotaStatus::OverQuota {
        return Readiness::UserOverQuota;
    }
    Readiness::Ready
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;

    fn user(id: UserId) -> JobOwner {
        JobOwner::User {
            id,
            email: format!("user{}@example.org", id),
        }
    }

    fn anonymous(session: &str) -> JobOwner {
        JobOwner::Anonymous {
            session_id: session.into(),
        }
    }

    fn active(id: u64, owner: JobOwner, dest: &str) -> Job {
        let mut job = Job::new(id, "cat1", owner).with_state(JobState::Running);
        job.destination_id = Some(dest.into());
        job
    }

    fn ok_input(id: u64) -> Dataset {
        Dataset::new(id, id as u32, "in", DatasetState::Ok)
    }

    fn verdict(job: &Job, inputs: &[Dataset], dest: Option<&str>, limits: &Limits, counts: &ActiveCounts) -> Readiness {
        check_if_ready_to_run(&ReadinessInput {
            job,
            inputs,
            destination_id: dest,
            limits,
            counts,
            quota: QuotaStatus::NotApplicable,
        })
    }

    #[test]
    fn running_input_waits() {
        let job = Job::new(1, "cat1", user(1));
        let inputs = [ok_input(1), Dataset::new(2, 2, "in", DatasetState::Running)];
        assert_eq!(
            verdict(&job, &inputs, None, &Limits::default(), &ActiveCounts::default()),
            Readiness::Wait
        );
    }

    #[test]
    fn deleted_input_names_its_hid() {
        let job = Job::new(1, "cat1", user(1));
        let inputs = [Dataset::new(9, 4, "reads", DatasetState::Ok).deleted()];
        let readiness = verdict(&job, &inputs, None, &Limits::default(), &ActiveCounts::default());
        assert_eq!(readiness, Readiness::InputDeleted { hid: 4 });
        assert!(readiness.failure_message().unwrap().contains('4'));
    }

    #[test]
    fn errored_inputs_fail_and_first_problem_wins() {
        let job = Job::new(1, "cat1", user(1));
        let inputs = [
            Dataset::new(1, 1, "a", DatasetState::FailedMetadata),
            Dataset::new(2, 2, "b", DatasetState::Ok).deleted(),
        ];
        let readiness = verdict(&job, &inputs, None, &Limits::default(), &ActiveCounts::default());
        assert_eq!(
            readiness,
            Readiness::InputError {
                hid: 1,
                state: DatasetState::FailedMetadata
            }
        );
        assert!(readiness.failure_message().unwrap().contains("metadata"));

        let inputs = [Dataset::new(1, 1, "a", DatasetState::Queued), Dataset::new(2, 2, "b", DatasetState::Error)];
        assert_eq!(
            verdict(&job, &inputs, None, &Limits::default(), &ActiveCounts::default()),
            Readiness::Wait
        );
    }

    #[test]
    fn empty_inputs_are_ready() {
        let job = Job::new(1, "cat1", user(1));
        let inputs = [Dataset::new(1, 1, "a", DatasetState::Empty)];
        assert_eq!(
            verdict(&job, &inputs, Some("local"), &Limits::default(), &ActiveCounts::default()),
            Readiness::Ready
        );
    }

    #[test]
    fn deleted_and_admin_states_short_circuit() {
        let job = Job::new(1, "cat1", user(1)).with_state(JobState::DeletedNew);
        assert_eq!(check_job_state(&job), Some(Readiness::Deleted));
        let job = Job::new(1, "cat1", user(1)).with_state(JobState::Error);
        assert_eq!(check_job_state(&job), Some(Readiness::AdminDeleted));
        assert_eq!(check_job_state(&Job::new(1, "cat1", user(1))), None);
    }

    #[test]
    fn per_user_limit_holds_the_third_job() {
        let limits = Limits {
            registered_user_concurrent_jobs: Some(2),
            ..Limits::default()
        };
        let running = [active(1, user(1), "local"), active(2, user(1), "local")];
        let counts = ActiveCounts::from_jobs(&running);
        let third = Job::new(3, "cat1", user(1));
        assert_eq!(verdict(&third, &[], Some("local"), &limits, &counts), Readiness::Wait);

        // Another user is unaffected.
        let other = Job::new(4, "cat1", user(2));
        assert_eq!(verdict(&other, &[], Some("local"), &limits, &counts), Readiness::Ready);

        // One finishes: the next scan recounts.
        let counts = ActiveCounts::from_jobs(&running[..1]);
        assert_eq!(verdict(&third, &[], Some("local"), &limits, &counts), Readiness::Ready);
    }

    #[test]
    fn zero_means_unlimited() {
        let limits = Limits {
            registered_user_concurrent_jobs: Some(0),
            ..Limits::default()
        };
        let counts = ActiveCounts::from_jobs(&[active(1, user(1), "local")]);
        assert_eq!(verdict(&Job::new(2, "cat1", user(1)), &[], None, &limits, &counts), Readiness::Ready);
    }

    #[test]
    fn destination_limits_aggregate_over_patterns() {
        let limits = Limits {
            destination_total_concurrent_jobs: BTreeMap::from([("slurm_*".to_string(), 2)]),
            ..Limits::default()
        };
        let running = [
            active(1, user(1), "slurm_normal"),
            active(2, user(2), "slurm_long"),
            active(3, user(3), "local"),
        ];
        let counts = ActiveCounts::from_jobs(&running);
        assert_eq!(counts.destination("slurm_*"), 2);

        let job = Job::new(4, "cat1", user(4));
        assert_eq!(verdict(&job, &[], Some("slurm_normal"), &limits, &counts), Readiness::Wait);
        assert_eq!(verdict(&job, &[], Some("local"), &limits, &counts), Readiness::Ready);
    }

    #[test]
    fn per_user_destination_limit() {
        let limits = Limits {
            destination_user_concurrent_jobs: BTreeMap::from([("big".to_string(), 1)]),
            ..Limits::default()
        };
        let counts = ActiveCounts::from_jobs(&[active(1, user(1), "big")]);
        assert_eq!(verdict(&Job::new(2, "cat1", user(1)), &[], Some("big"), &limits, &counts), Readiness::Wait);
        assert_eq!(verdict(&Job::new(3, "cat1", user(2)), &[], Some("big"), &limits, &counts), Readiness::Ready);
    }

    #[test]
    fn anonymous_sessions_are_limited_separately() {
        let limits = Limits {
            anonymous_user_concurrent_jobs: Some(1),
            registered_user_concurrent_jobs: Some(1),
            ..Limits::default()
        };
        let counts = ActiveCounts::from_jobs(&[active(1, anonymous("s1"), "local")]);
        assert_eq!(verdict(&Job::new(2, "cat1", anonymous("s1")), &[], None, &limits, &counts), Readiness::Wait);
        assert_eq!(verdict(&Job::new(3, "cat1", anonymous("s2")), &[], None, &limits, &counts), Readiness::Ready);
        assert_eq!(verdict(&Job::new(4, "cat1", user(1)), &[], None, &limits, &counts), Readiness::Ready);
    }

    #[test]
    fn over_quota_only_after_gates_pass() {
        let job = Job::new(1, "cat1", user(1));
        let input = ReadinessInput {
            job: &job,
            inputs: &[],
            destination_id: Some("local"),
            limits: &Limits::default(),
            counts: &ActiveCounts::default(),
            quota: QuotaStatus::from_usage(11, Some(10)),
        };
        assert_eq!(check_if_ready_to_run(&input), Readiness::UserOverQuota);

        let limits = Limits {
            registered_user_concurrent_jobs: Some(1),
            ..Limits::default()
        };
        let counts = ActiveCounts::from_jobs(&[active(2, user(1), "local")]);
        let input = ReadinessInput {
            limits: &limits,
            counts: &counts,
            ..input
        };
        assert_eq!(check_if_ready_to_run(&input), Readiness::Wait);
        assert_eq!(QuotaStatus::from_usage(10, Some(10)), QuotaStatus::WithinQuota);
        assert_eq!(QuotaStatus::from_usage(10, None), QuotaStatus::NotApplicable);
    }

    #[test]
    fn only_active_jobs_are_counted() {
        let done = Job::new(1, "cat1", user(1)).with_state(JobState::Ok);
        let waiting = Job::new(2, "cat1", user(1));
        let counts = ActiveCounts::from_jobs(&[done, waiting]);
        assert_eq!(counts.user(1), 0);
    }
}
