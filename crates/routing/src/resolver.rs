//! Destination resolution: (tool, user, job features) -> destination id.

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::RoutingError;
use crate::schema::*;

/// Job-derived inputs to rule matching. A rule whose feature is absent
/// does not match.
#[derive(Debug, Clone, Default)]
pub struct JobFeatures {
    /// Aggregate input size in bytes.
    pub file_size: Option<u64>,
    pub num_input_datasets: Option<u64>,
    /// Aggregate record count of all inputs.
    pub records: Option<u64>,
    /// Resolved tool parameter tree.
    pub params: Value,
}

impl JobFeatures {
    fn bounded(&self, rule_type: RuleType) -> Option<u64> {
        match rule_type {
            RuleType::FileSize => self.file_size,
            RuleType::NumInputDatasets => self.num_input_datasets,
            RuleType::Records => self.records,
            RuleType::Arguments => None,
        }
    }
}

/// One routing question.
#[derive(Debug, Clone, Default)]
pub struct RouteRequest<'a> {
    pub tool_id: &'a str,
    pub user_email: Option<&'a str>,
    pub features: JobFeatures,
    /// Priority supplied by a workflow invocation.
    pub workflow_priority: Option<&'a str>,
    /// Priority chosen through the job's resource parameters.
    pub resource_priority: Option<&'a str>,
}

/// What decided the destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteSource {
    /// Index into the tool's rule list.
    Rule(usize),
    ToolDefault,
    GlobalDefault,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub destination_id: String,
    pub priority: Option<String>,
    pub source: RouteSource,
}

impl RoutingPolicy {
    /// Pick a destination for the request.
    ///
    /// Among matching rules the lowest `nice_value` wins, first declared on
    /// ties. Without a match the tool default, then the global default is
    /// used. A `fail` destination yields [`RoutingError::Rejected`].
    pub fn resolve(&self, req: &RouteRequest<'_>) -> Result<RouteDecision, RoutingError> {
        let priority = self.effective_priority(req);
        let tool = self.tool(req.tool_id);

        let mut winner: Option<(usize, &DestinationRule)> = None;
        if let Some(tool) = tool {
            for (i, rule) in tool.rules.iter().enumerate() {
                if !rule.applies_to(req.user_email) || !rule_matches(rule, &req.features) {
                    continue;
                }
                self.trace(req.tool_id, format_args!("rule {i} ({}) matched", rule.rule_type));
                match winner {
                    Some((_, best)) if best.nice_value <= rule.nice_value => {}
                    _ => winner = Some((i, rule)),
                }
            }
        }

        let (dest, source, fail_message) = match (winner, tool.and_then(|t| t.default_destination.as_ref())) {
            (Some((i, rule)), _) => (&rule.destination, RouteSource::Rule(i), rule.fail_message.as_deref()),
            (None, Some(default)) => (default, RouteSource::ToolDefault, None),
            (None, None) => match self.default_destination.as_ref() {
                Some(default) => (default, RouteSource::GlobalDefault, None),
                None => {
                    return Err(RoutingError::Configuration(format!(
                        "no destination for tool '{}' and no global default",
                        req.tool_id
                    )))
                }
            },
        };

        if dest.is_fail() {
            let message = fail_message
                .unwrap_or("This tool is not available under the current routing policy.")
                .to_string();
            self.trace(req.tool_id, format_args!("rejected: {message}"));
            return Err(RoutingError::Rejected { message });
        }

        let destination_id = self.pick(dest, priority.as_deref(), req.tool_id)?;
        self.trace(
            req.tool_id,
            format_args!("routed to '{destination_id}' via {source:?}"),
        );
        Ok(RouteDecision {
            destination_id,
            priority,
            source,
        })
    }

    /// Workflow > resource parameter > per-user > default priority.
    /// Names outside the vocabulary are skipped.
    pub fn effective_priority(&self, req: &RouteRequest<'_>) -> Option<String> {
        let user_priority = req
            .user_email
            .and_then(|email| self.users.get(email))
            .and_then(|u| u.priority.as_deref());

        [req.workflow_priority, req.resource_priority, user_priority]
            .into_iter()
            .flatten()
            .find(|p| {
                let known = self.is_priority(p);
                if !known {
                    warn!(tool_id = %req.tool_id, priority = %p, "ignoring undeclared priority");
                }
                known
            })
            .map(str::to_string)
            .or_else(|| self.default_priority.clone())
    }

    fn pick(
        &self,
        dest: &DestinationRef,
        priority: Option<&str>,
        tool_id: &str,
    ) -> Result<String, RoutingError> {
        match dest {
            DestinationRef::Id(id) => Ok(id.clone()),
            DestinationRef::ByPriority(map) => priority
                .and_then(|p| map.get(p))
                .or_else(|| self.default_priority.as_ref().and_then(|p| map.get(p)))
                .cloned()
                .ok_or_else(|| {
                    RoutingError::Configuration(format!(
                        "tool '{}': no destination for priority '{}'",
                        tool_id,
                        priority.unwrap_or("(none)")
                    ))
                }),
        }
    }

    fn trace(&self, tool_id: &str, msg: std::fmt::Arguments<'_>) {
        if self.verbose {
            info!(tool_id = %tool_id, "{}", msg);
        } else {
            debug!(tool_id = %tool_id, "{}", msg);
        }
    }
}

fn rule_matches(rule: &DestinationRule, features: &JobFeatures) -> bool {
    match rule.rule_type {
        RuleType::Arguments => rule
            .arguments
            .as_ref()
            .is_some_and(|args| arguments_match(args, &features.params)),
        bounded => features
            .bounded(bounded)
            .is_some_and(|v| rule.lower_bound <= v && rule.upper_bound.above(v)),
    }
}

/// Every leaf of `expected` must equal the value at the same path in
/// `actual`. Scalars compare by their string form so `"5"` equals `5`.
pub fn arguments_match(expected: &Value, actual: &Value) -> bool {
    match (expected, actual) {
        (Value::Object(want), Value::Object(have)) => want
            .iter()
            .all(|(k, v)| have.get(k).is_some_and(|h| arguments_match(v, h))),
        (Value::Object(_), _) => false,
        (Value::Array(want), Value::Array(have)) => {
            want.len() == have.len() && want.iter().zip(have).all(|(w, h)| arguments_match(w, h))
        }
        (want, have) => scalar_str(want) == scalar_str(have),
    }
}

fn scalar_str(v: &Value) -> Option<String> {
    match v {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => Some(String::new()),
        _ => None,
    }
}
