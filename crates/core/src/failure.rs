//! Normalized failure taxonomy shared by every backend.

use std::fmt;

use serde::{Deserialize, Serialize};

/// A backend failure signal, normalized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    WalltimeExceeded,
    MemoryLimitExceeded,
    /// Node or infrastructure failure; the job itself may be fine.
    NodeFailure,
    /// Killed by an administrator or the owner.
    Cancelled,
    Unknown,
}

impl FailureKind {
    /// Short message attached to the job record.
    pub fn user_message(&self) -> &'static str {
        match self {
            FailureKind::WalltimeExceeded => {
                "This job was terminated because it ran longer than the maximum allowed job run time."
            }
            FailureKind::MemoryLimitExceeded => {
                "This job was terminated because it used more memory than it was allocated."
            }
            FailureKind::NodeFailure => {
                "This job failed due to a cluster node failure."
            }
            FailureKind::Cancelled => "This job was cancelled.",
            FailureKind::Unknown => {
                "This job failed for an unknown reason. Please contact an administrator if the problem persists."
            }
        }
    }

    /// Look for well-known failure markers in job or scheduler output.
    pub fn from_log(text: &str) -> Option<FailureKind> {
        const MEMORY: &[&str] = &[
            "MemoryError",
            "std::bad_alloc",
            "java.lang.OutOfMemoryError",
            "Out of memory",
            "Exceeded job memory limit",
            "oom-kill",
            "oom_kill",
        ];
        const WALLTIME: &[&str] = &["DUE TO TIME LIMIT", "walltime exceeded", "Job exceeded walltime"];
        const NODE: &[&str] = &["DUE TO NODE FAILURE", "node failure"];

        let contains_any = |needles: &[&str]| needles.iter().any(|n| text.contains(n));
        if contains_any(MEMORY) {
            Some(FailureKind::MemoryLimitExceeded)
        } else if contains_any(WALLTIME) {
            Some(FailureKind::WalltimeExceeded)
        } else if contains_any(NODE) {
            Some(FailureKind::NodeFailure)
        } else {
            None
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::WalltimeExceeded => write!(f, "walltime_exceeded"),
            FailureKind::MemoryLimitExceeded => write!(f, "memory_limit_exceeded"),
            FailureKind::NodeFailure => write!(f, "node_failure"),
            FailureKind::Cancelled => write!(f, "cancelled"),
            FailureKind::Unknown => write!(f, "unknown"),
        }
    }
}
