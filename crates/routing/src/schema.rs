//! Typed routing policy, produced by validation from the raw YAML document.
//!
//! A [`RoutingPolicy`] is immutable once built. Reloads build a new one and
//! swap the `Arc`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::bytes::Bound;

/// Destination id that rejects the job instead of dispatching it.
pub const FAIL_DESTINATION: &str = "fail";

/// Top-level keys accepted in a policy document.
pub const TOP_LEVEL_KEYS: &[&str] = &[
    "verbose",
    "default_destination",
    "default_priority",
    "users",
    "tools",
];

/// Keys accepted inside a tool entry.
pub const TOOL_KEYS: &[&str] = &["default_destination", "rules"];

/// Keys accepted inside a rule entry.
pub const RULE_KEYS: &[&str] = &[
    "rule_type",
    "nice_value",
    "lower_bound",
    "upper_bound",
    "destination",
    "fail_message",
    "users",
    "arguments",
];

/// The job feature a rule inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleType {
    /// Aggregate size of all input datasets, in bytes.
    FileSize,
    NumInputDatasets,
    /// Aggregate record (line/sequence) count of all inputs.
    Records,
    /// Exact values of the tool's resolved parameters.
    Arguments,
}

impl RuleType {
    pub const ALL: &'static [&'static str] =
        &["file_size", "num_input_datasets", "records", "arguments"];

    pub fn is_bounded(&self) -> bool {
        !matches!(self, RuleType::Arguments)
    }
}

impl FromStr for RuleType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file_size" => Ok(RuleType::FileSize),
            "num_input_datasets" => Ok(RuleType::NumInputDatasets),
            "records" => Ok(RuleType::Records),
            "arguments" => Ok(RuleType::Arguments),
            other => Err(format!("unknown rule_type '{}'", other)),
        }
    }
}

impl fmt::Display for RuleType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuleType::FileSize => write!(f, "file_size"),
            RuleType::NumInputDatasets => write!(f, "num_input_datasets"),
            RuleType::Records => write!(f, "records"),
            RuleType::Arguments => write!(f, "arguments"),
        }
    }
}

/// Where a rule or default sends a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DestinationRef {
    Id(String),
    /// One destination per priority level.
    ByPriority(BTreeMap<String, String>),
}

impl DestinationRef {
    /// Every destination id this reference can produce.
    pub fn ids(&self) -> Vec<&str> {
        match self {
            DestinationRef::Id(id) => vec![id.as_str()],
            DestinationRef::ByPriority(map) => map.values().map(String::as_str).collect(),
        }
    }

    pub fn is_fail(&self) -> bool {
        matches!(self, DestinationRef::Id(id) if id == FAIL_DESTINATION)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationRule {
    pub rule_type: RuleType,
    /// Inclusive. Unused by `arguments` rules.
    pub lower_bound: u64,
    /// Exclusive. Unused by `arguments` rules.
    pub upper_bound: Bound,
    pub nice_value: i32,
    /// Email allow-list; `None` applies to everyone.
    pub users: Option<Vec<String>>,
    pub destination: DestinationRef,
    pub fail_message: Option<String>,
    /// Parameter sub-tree that must match the job's parameters.
    pub arguments: Option<serde_json::Value>,
}

impl DestinationRule {
    pub fn applies_to(&self, email: Option<&str>) -> bool {
        match (&self.users, email) {
            (None, _) => true,
            (Some(users), Some(email)) => users.iter().any(|u| u == email),
            (Some(_), None) => false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolPolicy {
    pub default_destination: Option<DestinationRef>,
    pub rules: Vec<DestinationRule>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UserPolicy {
    pub priority: Option<String>,
}

/// Validated, repaired routing policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingPolicy {
    pub verbose: bool,
    pub default_destination: Option<DestinationRef>,
    pub default_priority: Option<String>,
    /// Priority vocabulary, taken from the global default priority map.
    pub priorities: BTreeSet<String>,
    pub users: BTreeMap<String, UserPolicy>,
    pub tools: BTreeMap<String, ToolPolicy>,
}

impl RoutingPolicy {
    pub fn tool(&self, tool_id: &str) -> Option<&ToolPolicy> {
        self.tools.get(tool_id)
    }

    /// Rule types used by a tool, so callers compute only what is needed.
    pub fn required_features(&self, tool_id: &str) -> BTreeSet<RuleType> {
        self.tool(tool_id)
            .map(|t| t.rules.iter().map(|r| r.rule_type).collect())
            .unwrap_or_default()
    }

    pub fn is_priority(&self, name: &str) -> bool {
        self.priorities.contains(name)
    }
}
