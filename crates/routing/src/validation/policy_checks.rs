//! Document-level checks: top-level keys, priorities, users, tools and
//! destination references.

use std::collections::BTreeMap;

use serde_yaml::{Mapping, Value};

use super::fuzzy::{is_email, suggest};
use super::rule_checks::check_rule;
use super::{join, key_str, Context, ValidationResult};
use crate::schema::*;

pub(super) fn check_policy(
    doc: &Value,
    mut ctx: Context,
    result: &mut ValidationResult,
) -> Option<RoutingPolicy> {
    let Some(map) = doc.as_mapping() else {
        result.error("", "routing policy must be a mapping");
        return None;
    };

    check_unknown_keys(map, "", TOP_LEVEL_KEYS, result);
    if ctx.known.is_empty() {
        result.warn("", "no destinations declared; destination references are not checked");
    }

    let mut policy = RoutingPolicy::default();

    match map.get("verbose") {
        None => {}
        Some(Value::Bool(b)) => policy.verbose = *b,
        Some(_) => result.error("verbose", "verbose must be true or false"),
    }

    // The priority vocabulary comes from the global default map, so it is
    // read before any other destination reference is checked.
    if let Some(keys) = map
        .get("default_destination")
        .and_then(|d| d.get("priority"))
        .and_then(Value::as_mapping)
    {
        ctx.priorities = keys
            .keys()
            .filter_map(|k| k.as_str().map(str::to_string))
            .collect();
    }
    policy.priorities = ctx.priorities.clone();

    match map.get("default_destination") {
        Some(value) => {
            policy.default_destination =
                check_destination_ref(value, "default_destination", &ctx, result);
        }
        None => result.warn(
            "default_destination",
            "no global default destination; tools without a match will be rejected",
        ),
    }

    policy.default_priority = check_default_priority(map.get("default_priority"), &ctx, result);

    if let Some(users) = map.get("users") {
        policy.users = check_users(users, &ctx, result);
    }

    if let Some(tools) = map.get("tools") {
        match tools.as_mapping() {
            Some(tools) => {
                for (key, value) in tools {
                    let tool_id = key_str(key);
                    let path = join("tools", &tool_id);
                    if let Some(tool) = check_tool(value, &path, &ctx, result) {
                        policy.tools.insert(tool_id, tool);
                    }
                }
            }
            None => result.error("tools", "tools must be a mapping of tool id to tool policy"),
        }
    }

    Some(policy)
}

fn check_default_priority(
    value: Option<&Value>,
    ctx: &Context,
    result: &mut ValidationResult,
) -> Option<String> {
    let fallback = || {
        if ctx.priorities.contains("med") {
            Some("med".to_string())
        } else {
            ctx.priorities.iter().next().cloned()
        }
    };

    match value {
        None => {
            let picked = fallback();
            if let Some(ref p) = picked {
                result.warn("default_priority", format!("not set, using '{p}'"));
            }
            picked
        }
        Some(Value::String(p)) if ctx.priorities.contains(p) => Some(p.clone()),
        Some(Value::String(p)) => {
            let picked = fallback();
            let msg = format!("'{p}' is not a declared priority");
            match suggest(p, ctx.priorities.iter().map(String::as_str)) {
                Some(s) => result.error_with_suggestion("default_priority", msg, s),
                None => result.error("default_priority", msg),
            }
            if let Some(ref fb) = picked {
                result.warn("default_priority", format!("falling back to '{fb}'"));
            }
            picked
        }
        Some(_) => {
            result.error("default_priority", "default_priority must be a string");
            fallback()
        }
    }
}

fn check_users(
    value: &Value,
    ctx: &Context,
    result: &mut ValidationResult,
) -> BTreeMap<String, UserPolicy> {
    let mut users = BTreeMap::new();
    let Some(map) = value.as_mapping() else {
        result.error("users", "users must be a mapping of email to user policy");
        return users;
    };

    for (key, entry) in map {
        let email = key_str(key);
        let path = join("users", &email);
        if !is_email(&email) {
            result.error(&path, format!("'{email}' is not a valid email address"));
            continue;
        }
        let mut user = UserPolicy::default();
        match entry.get("priority") {
            Some(Value::String(p)) if ctx.is_priority(p) => user.priority = Some(p.clone()),
            Some(Value::String(p)) => result.error(
                join(&path, "priority"),
                format!("'{p}' is not a declared priority"),
            ),
            Some(_) => result.error(join(&path, "priority"), "priority must be a string"),
            None => result.warn(&path, "user entry has no priority"),
        }
        users.insert(email, user);
    }
    users
}

fn check_tool(
    value: &Value,
    path: &str,
    ctx: &Context,
    result: &mut ValidationResult,
) -> Option<ToolPolicy> {
    let Some(map) = value.as_mapping() else {
        result.error(path, "tool entry must be a mapping");
        return None;
    };
    check_unknown_keys(map, path, TOOL_KEYS, result);

    let mut tool = ToolPolicy::default();
    if let Some(dest) = map.get("default_destination") {
        tool.default_destination =
            check_destination_ref(dest, &join(path, "default_destination"), ctx, result);
    }

    match map.get("rules") {
        None | Some(Value::Null) => {}
        Some(Value::Sequence(rules)) => {
            for (i, rule) in rules.iter().enumerate() {
                let rule_path = format!("{}[{}]", join(path, "rules"), i);
                if let Some(rule) = check_rule(rule, &rule_path, ctx, result) {
                    tool.rules.push(rule);
                } else {
                    result.warn(&rule_path, "rule dropped");
                }
            }
        }
        Some(_) => result.error(join(path, "rules"), "rules must be a list"),
    }

    if tool.default_destination.is_none() && tool.rules.is_empty() {
        result.warn(path, "tool has no usable rules or default destination");
    }
    Some(tool)
}

/// Check a string id or a `priority:` map of ids.
pub(super) fn check_destination_ref(
    value: &Value,
    path: &str,
    ctx: &Context,
    result: &mut ValidationResult,
) -> Option<DestinationRef> {
    match value {
        Value::String(id) => check_id(id, path, ctx, result).then(|| DestinationRef::Id(id.clone())),
        Value::Mapping(map) => {
            let Some(entries) = map.get("priority").and_then(Value::as_mapping) else {
                result.error(path, "destination map must contain a 'priority' mapping");
                return None;
            };
            let mut by_priority = BTreeMap::new();
            for (key, id) in entries {
                let priority = key_str(key);
                let entry_path = format!("{path}.priority.{priority}");
                if !ctx.priorities.contains(&priority) {
                    result.error(&entry_path, format!("'{priority}' is not a declared priority"));
                    continue;
                }
                let Some(id) = id.as_str() else {
                    result.error(&entry_path, "destination id must be a string");
                    continue;
                };
                if check_id(id, &entry_path, ctx, result) {
                    by_priority.insert(priority, id.to_string());
                }
            }
            for missing in ctx.priorities.iter().filter(|p| !by_priority.contains_key(*p)) {
                result.warn(path, format!("no destination for priority '{missing}'"));
            }
            if by_priority.is_empty() {
                None
            } else {
                Some(DestinationRef::ByPriority(by_priority))
            }
        }
        _ => {
            result.error(path, "destination must be an id or a priority mapping");
            None
        }
    }
}

fn check_id(id: &str, path: &str, ctx: &Context, result: &mut ValidationResult) -> bool {
    if id == FAIL_DESTINATION || ctx.known.is_empty() || ctx.known.contains(id) {
        return true;
    }
    let msg = format!("unknown destination '{id}'");
    match suggest(id, ctx.known.iter().map(String::as_str)) {
        Some(s) => result.error_with_suggestion(path, msg, format!("did you mean '{s}'?")),
        None => result.error(path, msg),
    }
    false
}

pub(super) fn check_unknown_keys(
    map: &Mapping,
    path: &str,
    allowed: &[&str],
    result: &mut ValidationResult,
) {
    for key in map.keys() {
        let name = key_str(key);
        if allowed.contains(&name.as_str()) {
            continue;
        }
        let key_path = join(path, &name);
        let msg = format!("unknown key '{name}', ignored");
        match suggest(&name, allowed.iter().copied()) {
            Some(s) => result.error_with_suggestion(key_path, msg, format!("did you mean '{s}'?")),
            None => result.error(key_path, msg),
        }
    }
}

impl Context {
    pub(super) fn is_priority(&self, name: &str) -> bool {
        self.priorities.contains(name)
    }
}
