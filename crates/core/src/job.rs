//! Job records, ownership, and lifecycle history.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::dataset::DatasetAssociation;
use crate::destination::JobDestination;
use crate::failure::FailureKind;

pub type JobId = u64;
pub type DatasetId = u64;
pub type UserId = u64;

/// Persisted lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    New,
    Queued,
    Running,
    Ok,
    Error,
    Paused,
    Stopped,
    Deleted,
    /// Deletion requested; the cancellation queue has not processed it yet.
    DeletedNew,
    AdminDeleted,
}

impl JobState {
    /// Whether the job has reached a state it never leaves on its own.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Ok
                | JobState::Error
                | JobState::Stopped
                | JobState::Deleted
                | JobState::AdminDeleted
        )
    }

    /// Jobs counted against concurrency limits.
    pub fn is_active(&self) -> bool {
        matches!(self, JobState::Queued | JobState::Running)
    }

    pub fn is_deleted(&self) -> bool {
        matches!(
            self,
            JobState::Deleted | JobState::DeletedNew | JobState::AdminDeleted
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::New => write!(f, "new"),
            JobState::Queued => write!(f, "queued"),
            JobState::Running => write!(f, "running"),
            JobState::Ok => write!(f, "ok"),
            JobState::Error => write!(f, "error"),
            JobState::Paused => write!(f, "paused"),
            JobState::Stopped => write!(f, "stopped"),
            JobState::Deleted => write!(f, "deleted"),
            JobState::DeletedNew => write!(f, "deleted_new"),
            JobState::AdminDeleted => write!(f, "admin_deleted"),
        }
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(JobState::New),
            "queued" => Ok(JobState::Queued),
            "running" => Ok(JobState::Running),
            "ok" => Ok(JobState::Ok),
            "error" => Ok(JobState::Error),
            "paused" => Ok(JobState::Paused),
            "stopped" => Ok(JobState::Stopped),
            "deleted" => Ok(JobState::Deleted),
            "deleted_new" => Ok(JobState::DeletedNew),
            "admin_deleted" => Ok(JobState::AdminDeleted),
            other => Err(format!("unknown job state: '{}'", other)),
        }
    }
}

/// Who a job runs on behalf of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobOwner {
    User { id: UserId, email: String },
    Anonymous { session_id: String },
}

impl JobOwner {
    pub fn user_id(&self) -> Option<UserId> {
        match self {
            JobOwner::User { id, .. } => Some(*id),
            JobOwner::Anonymous { .. } => None,
        }
    }

    pub fn email(&self) -> Option<&str> {
        match self {
            JobOwner::User { email, .. } => Some(email),
            JobOwner::Anonymous { .. } => None,
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        match self {
            JobOwner::User { .. } => None,
            JobOwner::Anonymous { session_id } => Some(session_id),
        }
    }
}

/// Why a job was paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PauseReason {
    OverQuota,
}

/// One entry in a job's lifecycle history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: JobEventKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum JobEventKind {
    DestinationResolved { destination: String },
    Dispatched { runner: String },
    Submitted { external_id: String },
    Recovered { runner: String },
    Failed { failure: Option<FailureKind> },
    /// Automatic re-queue; `rule` identifies the resubmit rule that fired.
    Resubmitted { destination: String, rule: String },
    Paused { reason: PauseReason },
    Resumed,
    Stopped,
}

impl JobEvent {
    pub fn now(kind: JobEventKind) -> Self {
        Self {
            at: Utc::now(),
            kind,
            message: None,
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// A persisted job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub tool_id: String,
    pub owner: JobOwner,
    pub state: JobState,
    /// Handler instance that owns this job.
    #[serde(default)]
    pub handler: Option<String>,
    #[serde(default)]
    pub destination_id: Option<String>,
    /// Params of the resolved destination, kept so a restarted handler can
    /// rebuild the destination even if the configuration changed.
    #[serde(default)]
    pub destination_params: BTreeMap<String, String>,
    #[serde(default)]
    pub runner_name: Option<String>,
    #[serde(default)]
    pub external_id: Option<String>,
    #[serde(default)]
    pub inputs: Vec<DatasetAssociation>,
    #[serde(default)]
    pub outputs: Vec<DatasetAssociation>,
    /// Resolved tool parameter tree.
    #[serde(default)]
    pub params: serde_json::Value,
    /// Job resource parameters selected at submission (e.g. `priority`).
    #[serde(default)]
    pub resource_params: BTreeMap<String, String>,
    /// Priority supplied by a workflow invocation, if any.
    #[serde(default)]
    pub workflow_priority: Option<String>,
    /// Command template handed to the command producer.
    #[serde(default)]
    pub command_template: Option<String>,
    /// Whether the job may be split into sub-tasks.
    #[serde(default)]
    pub splittable: bool,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    /// Short user-visible message (failure reason, pause reason).
    #[serde(default)]
    pub info: Option<String>,
    #[serde(default)]
    pub history: Vec<JobEvent>,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
}

impl Job {
    pub fn new(id: JobId, tool_id: impl Into<String>, owner: JobOwner) -> Self {
        let now = Utc::now();
        Self {
            id,
            tool_id: tool_id.into(),
            owner,
            state: JobState::New,
            handler: None,
            destination_id: None,
            destination_params: BTreeMap::new(),
            runner_name: None,
            external_id: None,
            inputs: Vec::new(),
            outputs: Vec::new(),
            params: serde_json::Value::Null,
            resource_params: BTreeMap::new(),
            workflow_priority: None,
            command_template: None,
            splittable: false,
            working_directory: None,
            info: None,
            history: Vec::new(),
            create_time: now,
            update_time: now,
        }
    }

    pub fn with_input(mut self, name: impl Into<String>, dataset_id: DatasetId) -> Self {
        self.inputs.push(DatasetAssociation::new(name, dataset_id));
        self
    }

    pub fn with_output(mut self, name: impl Into<String>, dataset_id: DatasetId) -> Self {
        self.outputs.push(DatasetAssociation::new(name, dataset_id));
        self
    }

    pub fn with_handler(mut self, handler: impl Into<String>) -> Self {
        self.handler = Some(handler.into());
        self
    }

    pub fn with_state(mut self, state: JobState) -> Self {
        self.state = state;
        self
    }

    pub fn with_command(mut self, template: impl Into<String>) -> Self {
        self.command_template = Some(template.into());
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    /// Rebuild the destination this job was dispatched to from persisted
    /// fields. Resubmit rules are not persisted and come back empty.
    pub fn persisted_destination(&self) -> Option<JobDestination> {
        let id = self.destination_id.clone()?;
        let runner = self.runner_name.clone()?;
        Some(JobDestination {
            id,
            runner,
            params: self.destination_params.clone(),
            resubmit: Vec::new(),
        })
    }

    /// Whether the job was ever handed to a backend.
    pub fn was_submitted(&self) -> bool {
        self.runner_name.is_some() && self.external_id.is_some()
    }

    /// Resubmit rule keys already consumed by this job.
    pub fn consumed_resubmits(&self) -> impl Iterator<Item = &str> {
        self.history.iter().filter_map(|e| match &e.kind {
            JobEventKind::Resubmitted { rule, .. } => Some(rule.as_str()),
            _ => None,
        })
    }

    /// Whether the most recent pause was caused by the quota gate.
    pub fn paused_for_quota(&self) -> bool {
        self.state == JobState::Paused
            && self
                .history
                .iter()
                .rev()
                .find(|e| matches!(e.kind, JobEventKind::Paused { .. } | JobEventKind::Resumed))
                .is_some_and(|e| {
                    matches!(
                        e.kind,
                        JobEventKind::Paused {
                            reason: PauseReason::OverQuota
                        }
                    )
                })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> JobOwner {
        JobOwner::User {
            id: 7,
            email: "ada@example.org".to_string(),
        }
    }

    #[test]
    fn state_roundtrip_through_str() {
        for s in ["new", "queued", "running", "deleted_new", "admin_deleted"] {
            let state: JobState = s.parse().unwrap();
            assert_eq!(state.to_string(), s);
        }
        assert!("finished".parse::<JobState>().is_err());
    }

    #[test]
    fn active_and_terminal_are_disjoint() {
        for state in [
            JobState::New,
            JobState::Queued,
            JobState::Running,
            JobState::Ok,
            JobState::Error,
            JobState::Paused,
            JobState::Stopped,
            JobState::Deleted,
            JobState::DeletedNew,
            JobState::AdminDeleted,
        ] {
            assert!(!(state.is_active() && state.is_terminal()), "{state}");
        }
    }

    #[test]
    fn persisted_destination_needs_runner() {
        let mut job = Job::new(1, "cat1", user());
        job.destination_id = Some("slurm_long".to_string());
        assert!(job.persisted_destination().is_none());

        job.runner_name = Some("slurm".to_string());
        job.destination_params.insert("partition".into(), "long".into());
        let dest = job.persisted_destination().unwrap();
        assert_eq!(dest.id, "slurm_long");
        assert_eq!(dest.param("partition"), Some("long"));
    }

    #[test]
    fn paused_for_quota_looks_at_latest_pause() {
        let mut job = Job::new(1, "cat1", user()).with_state(JobState::Paused);
        assert!(!job.paused_for_quota());

        job.history.push(JobEvent::now(JobEventKind::Paused {
            reason: PauseReason::OverQuota,
        }));
        assert!(job.paused_for_quota());

        job.history.push(JobEvent::now(JobEventKind::Resumed));
        assert!(!job.paused_for_quota());
    }

    #[test]
    fn owner_accessors() {
        let anon = JobOwner::Anonymous {
            session_id: "s-1".into(),
        };
        assert_eq!(anon.user_id(), None);
        assert_eq!(anon.session_id(), Some("s-1"));
        assert_eq!(user().email(), Some("ada@example.org"));
    }
}
