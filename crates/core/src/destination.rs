//! Resolved execution targets and their resubmission rules.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

use crate::failure::FailureKind;

/// A named execution target: a runner plus its parameter bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDestination {
    pub id: String,
    pub runner: String,
    #[serde(default, deserialize_with = "string_map")]
    pub params: BTreeMap<String, String>,
    #[serde(default)]
    pub resubmit: Vec<ResubmitRule>,
}

impl JobDestination {
    pub fn new(id: impl Into<String>, runner: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            runner: runner.into(),
            params: BTreeMap::new(),
            resubmit: Vec::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_resubmit(mut self, rule: ResubmitRule) -> Self {
        self.resubmit.push(rule);
        self
    }

    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.get(key).map(String::as_str)
    }

    /// Parse a param, returning `None` when absent or malformed.
    pub fn param_as<T: FromStr>(&self, key: &str) -> Option<T> {
        self.param(key).and_then(|v| v.trim().parse().ok())
    }

    pub fn param_bool(&self, key: &str) -> bool {
        matches!(
            self.param(key).map(|v| v.trim().to_ascii_lowercase()).as_deref(),
            Some("true" | "yes" | "1" | "on")
        )
    }
}

/// Named failure class a resubmit rule reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResubmitCondition {
    AnyFailure,
    WalltimeReached,
    MemoryLimitReached,
    NodeFailure,
    UnknownError,
}

impl ResubmitCondition {
    pub fn matches(&self, failure: FailureKind) -> bool {
        match self {
            ResubmitCondition::AnyFailure => failure != FailureKind::Cancelled,
            ResubmitCondition::WalltimeReached => failure == FailureKind::WalltimeExceeded,
            ResubmitCondition::MemoryLimitReached => failure == FailureKind::MemoryLimitExceeded,
            ResubmitCondition::NodeFailure => failure == FailureKind::NodeFailure,
            ResubmitCondition::UnknownError => failure == FailureKind::Unknown,
        }
    }
}

impl fmt::Display for ResubmitCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResubmitCondition::AnyFailure => write!(f, "any_failure"),
            ResubmitCondition::WalltimeReached => write!(f, "walltime_reached"),
            ResubmitCondition::MemoryLimitReached => write!(f, "memory_limit_reached"),
            ResubmitCondition::NodeFailure => write!(f, "node_failure"),
            ResubmitCondition::UnknownError => write!(f, "unknown_error"),
        }
    }
}

/// Re-queue a failed job, optionally on another destination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResubmitRule {
    pub condition: ResubmitCondition,
    /// Destination id to resubmit to; `None` keeps the current destination.
    #[serde(default)]
    pub environment: Option<String>,
    /// Seconds to wait before the job becomes eligible again.
    #[serde(default)]
    pub delay: Option<u64>,
}

impl ResubmitRule {
    pub fn new(condition: ResubmitCondition) -> Self {
        Self {
            condition,
            environment: None,
            delay: None,
        }
    }

    pub fn to_environment(mut self, destination: impl Into<String>) -> Self {
        self.environment = Some(destination.into());
        self
    }
}

/// Accept YAML scalars of any type as string params (`walltime: 3600`).
fn string_map<'de, D>(deserializer: D) -> Result<BTreeMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: BTreeMap<String, serde_json::Value> = BTreeMap::deserialize(deserializer)?;
    Ok(raw
        .into_iter()
        .map(|(k, v)| {
            let value = match v {
                serde_json::Value::String(s) => s,
                serde_json::Value::Null => String::new(),
                other => other.to_string(),
            };
            (k, value)
        })
        .collect())
}
