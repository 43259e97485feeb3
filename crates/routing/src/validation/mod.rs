//! Routing policy validation with structured errors and suggestions.
//!
//! A single walk over the raw YAML both reports problems and builds a
//! repaired [`RoutingPolicy`]. Strict mode only asks whether the report is
//! clean; corrective mode takes the repaired policy and logs the report.
//! Errors make the document invalid; warnings are advisory, including the
//! repairs applied in corrective mode.

mod policy_checks;
mod rule_checks;

pub mod fuzzy;


use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::schema::RoutingPolicy;

// ── Result types ────────────────────────────────────────────────────

/// Overall validation outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

/// A validation error; strict mode rejects the document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationError {
    /// Dotted location, e.g. `"tools.bwa.rules[0].destination"`.
    pub path: String,
    pub message: String,
    /// Optional "Did you mean …?" suggestion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

/// A non-blocking advisory warning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationWarning {
    pub path: String,
    pub message: String,
}

impl ValidationResult {
    pub(crate) fn new() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub(crate) fn error(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.valid = false;
        self.errors.push(ValidationError {
            path: path.into(),
            message: message.into(),
            suggestion: None,
        });
    }

    pub(crate) fn error_with_suggestion(
        &mut self,
        path: impl Into<String>,
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) {
        self.valid = false;
        self.errors.push(ValidationError {
            path: path.into(),
            message: message.into(),
            suggestion: Some(suggestion.into()),
        });
    }

    pub(crate) fn warn(&mut self, path: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ValidationWarning {
            path: path.into(),
            message: message.into(),
        });
    }

    /// Emit every entry through `tracing`.
    pub fn log(&self) {
        for e in &self.errors {
            match &e.suggestion {
                Some(s) => warn!(path = %e.path, suggestion = %s, "routing policy: {}", e.message),
                None => warn!(path = %e.path, "routing policy: {}", e.message),
            }
        }
        for w in &self.warnings {
            warn!(path = %w.path, "routing policy: {}", w.message);
        }
    }
}

/// Report plus the repaired policy.
#[derive(Debug, Clone)]
pub struct Validated {
    pub result: ValidationResult,
    /// `None` only when the document is not a mapping at all.
    pub policy: Option<RoutingPolicy>,
}

/// Names the checks resolve destination references against.
#[derive(Debug, Clone, Default)]
pub(crate) struct Context {
    /// Empty means references are not checked.
    pub known: BTreeSet<String>,
    pub priorities: BTreeSet<String>,
}

// ── Public API ──────────────────────────────────────────────────────

/// Validate an already-parsed document.
pub fn validate_document(doc: &serde_yaml::Value, known_destinations: &[String]) -> Validated {
    let mut result = ValidationResult::new();
    let ctx = Context {
        known: known_destinations.iter().cloned().collect(),
        priorities: BTreeSet::new(),
    };
    let policy = policy_checks::check_policy(doc, ctx, &mut result);
    Validated { result, policy }
}

/// Parse raw YAML and validate. Parse errors become validation errors.
pub fn validate_yaml(yaml: &str, known_destinations: &[String]) -> Validated {
    match serde_yaml::from_str::<serde_yaml::Value>(yaml) {
        Ok(doc) => validate_document(&doc, known_destinations),
        Err(e) => {
            let mut result = ValidationResult::new();
            result.error("", format!("YAML parse error: {e}"));
            Validated {
                result,
                policy: None,
            }
        }
    }
}

/// Strict mode: whether the document is valid as written.
pub fn is_valid(yaml: &str, known_destinations: &[String]) -> bool {
    validate_yaml(yaml, known_destinations).result.valid
}

/// Build a child path, e.g. `join("tools", "bwa")` -> `"tools.bwa"`.
pub(crate) fn join(parent: &str, key: &str) -> String {
    if parent.is_empty() {
        key.to_string()
    } else {
        format!("{parent}.{key}")
    }
}

/// Render a YAML mapping key for messages.
pub(crate) fn key_str(key: &serde_yaml::Value) -> String {
    match key {
        serde_yaml::Value::String(s) => s.clone(),
        serde_yaml::Value::Number(n) => n.to_string(),
        serde_yaml::Value::Bool(b) => b.to_string(),
        other => format!("{other:?}"),
    }
}
