//! Per-rule checks: rule type, bounds, nice value, users, destination.

use serde_yaml::Value;

use super::fuzzy::{is_email, suggest};
use super::policy_checks::{check_destination_ref, check_unknown_keys};
use super::{join, Context, ValidationResult};
use crate::bytes::{bytes_to_str, str_to_bytes, Bound};
use crate::schema::*;

const NICE_RANGE: std::ops::RangeInclusive<i64> = -20..=20;

/// Returns `None` when the rule cannot be repaired.
pub(super) fn check_rule(
    value: &Value,
    path: &str,
    ctx: &Context,
    result: &mut ValidationResult,
) -> Option<DestinationRule> {
    let Some(map) = value.as_mapping() else {
        result.error(path, "rule must be a mapping");
        return None;
    };
    check_unknown_keys(map, path, RULE_KEYS, result);

    let rule_type = check_rule_type(map.get("rule_type"), path, result)?;
    let nice_value = check_nice_value(map.get("nice_value"), path, result);

    let (lower_bound, upper_bound) = if rule_type.is_bounded() {
        check_bounds(
            rule_type,
            map.get("lower_bound"),
            map.get("upper_bound"),
            path,
            result,
        )?
    } else {
        (0, Bound::Unbounded)
    };

    let arguments = match (rule_type, map.get("arguments")) {
        (RuleType::Arguments, Some(args)) if args.is_mapping() => {
            match serde_json::to_value(args) {
                Ok(json) => Some(json),
                Err(e) => {
                    result.error(join(path, "arguments"), format!("unsupported arguments: {e}"));
                    return None;
                }
            }
        }
        (RuleType::Arguments, Some(_)) => {
            result.error(join(path, "arguments"), "arguments must be a mapping");
            return None;
        }
        (RuleType::Arguments, None) => {
            result.error(path, "arguments rule has no 'arguments'");
            return None;
        }
        (_, Some(_)) => {
            result.warn(
                join(path, "arguments"),
                format!("ignored by a {rule_type} rule"),
            );
            None
        }
        (_, None) => None,
    };

    let Some(dest_value) = map.get("destination") else {
        result.error(path, "rule has no destination");
        return None;
    };
    let destination = check_destination_ref(dest_value, &join(path, "destination"), ctx, result)?;

    let fail_message = match map.get("fail_message") {
        Some(Value::String(m)) if !m.trim().is_empty() => Some(m.clone()),
        Some(Value::String(_)) | None => None,
        Some(_) => {
            result.error(join(path, "fail_message"), "fail_message must be a string");
            None
        }
    };
    if destination.is_fail() && fail_message.is_none() {
        result.error(path, "destination 'fail' requires a fail_message");
        return None;
    }
    if !destination.is_fail() && fail_message.is_some() {
        result.warn(
            join(path, "fail_message"),
            "ignored because the destination is not 'fail'",
        );
    }

    let users = match map.get("users") {
        None => None,
        Some(value) => Some(check_users(value, &join(path, "users"), result)?),
    };

    Some(DestinationRule {
        rule_type,
        lower_bound,
        upper_bound,
        nice_value,
        users,
        destination,
        fail_message,
        arguments,
    })
}

fn check_rule_type(
    value: Option<&Value>,
    path: &str,
    result: &mut ValidationResult,
) -> Option<RuleType> {
    let type_path = join(path, "rule_type");
    let Some(value) = value else {
        result.error(type_path, "rule has no rule_type");
        return None;
    };
    let Some(name) = value.as_str() else {
        result.error(type_path, "rule_type must be a string");
        return None;
    };
    match name.parse() {
        Ok(rule_type) => Some(rule_type),
        Err(msg) => {
            match suggest(name, RuleType::ALL.iter().copied()) {
                Some(s) => result.error_with_suggestion(type_path, msg, format!("did you mean '{s}'?")),
                None => result.error(type_path, msg),
            }
            None
        }
    }
}

fn check_nice_value(value: Option<&Value>, path: &str, result: &mut ValidationResult) -> i32 {
    let nice_path = join(path, "nice_value");
    match value {
        None => {
            result.warn(nice_path, "no nice_value, using 0");
            0
        }
        Some(v) => match v.as_i64() {
            Some(n) if NICE_RANGE.contains(&n) => n as i32,
            Some(n) => {
                result.error(&nice_path, format!("nice_value {n} is outside [-20, 20]"));
                result.warn(nice_path, "nice_value reset to 0");
                0
            }
            None => {
                result.error(&nice_path, "nice_value must be an integer");
                result.warn(nice_path, "nice_value reset to 0");
                0
            }
        },
    }
}

fn check_bounds(
    rule_type: RuleType,
    lower: Option<&Value>,
    upper: Option<&Value>,
    path: &str,
    result: &mut ValidationResult,
) -> Option<(u64, Bound)> {
    let lower_path = join(path, "lower_bound");
    let upper_path = join(path, "upper_bound");

    let (Some(lower), Some(upper)) = (lower, upper) else {
        result.error(path, format!("{rule_type} rule needs lower_bound and upper_bound"));
        return None;
    };

    let lower = match parse_bound(rule_type, lower) {
        Ok(Bound::Finite(v)) => v,
        Ok(Bound::Unbounded) => {
            result.error(lower_path, "lower_bound cannot be Infinity");
            return None;
        }
        Err(msg) => {
            result.error(lower_path, msg);
            return None;
        }
    };
    let upper = match parse_bound(rule_type, upper) {
        Ok(b) => b,
        Err(msg) => {
            result.error(upper_path, msg);
            return None;
        }
    };

    match upper {
        Bound::Finite(u) if lower > u => {
            let render = |v: u64| match rule_type {
                RuleType::FileSize => bytes_to_str(v, None),
                _ => v.to_string(),
            };
            result.error(
                path,
                format!(
                    "lower_bound {} exceeds upper_bound {}",
                    render(lower),
                    render(u)
                ),
            );
            result.warn(path, "swapped lower_bound and upper_bound");
            Some((u, Bound::Finite(lower)))
        }
        _ => Some((lower, upper)),
    }
}

/// Byte strings for `file_size`, plain counts otherwise. `Infinity` is open.
fn parse_bound(rule_type: RuleType, value: &Value) -> Result<Bound, String> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .map(Bound::Finite)
            .ok_or_else(|| format!("bound must be a non-negative integer, got {n}")),
        Value::String(s) if rule_type == RuleType::FileSize => {
            str_to_bytes(s).map_err(|e| e.to_string())
        }
        Value::String(s) if s.trim().eq_ignore_ascii_case(crate::bytes::INFINITY) => {
            Ok(Bound::Unbounded)
        }
        Value::String(s) => s
            .trim()
            .parse::<u64>()
            .map(Bound::Finite)
            .map_err(|_| format!("bound must be a non-negative integer, got '{s}'")),
        _ => Err("bound must be a number or a string".to_string()),
    }
}

fn check_users(value: &Value, path: &str, result: &mut ValidationResult) -> Option<Vec<String>> {
    let Some(entries) = value.as_sequence() else {
        result.error(path, "users must be a list of email addresses");
        return None;
    };
    let mut users = Vec::new();
    for (i, entry) in entries.iter().enumerate() {
        match entry.as_str() {
            Some(email) if is_email(email) => users.push(email.to_string()),
            Some(email) => result.error(
                format!("{path}[{i}]"),
                format!("'{email}' is not a valid email address"),
            ),
            None => result.error(format!("{path}[{i}]"), "user must be a string"),
        }
    }
    if users.is_empty() {
        result.error(path, "no valid users left in the allow-list");
        return None;
    }
    Some(users)
}
