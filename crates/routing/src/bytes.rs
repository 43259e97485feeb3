//! Human-readable byte sizes with binary (1024) multipliers.

use std::fmt;

use serde::{Deserialize, Serialize};

const UNITS: &[&str] = &["bytes", "KB", "MB", "GB", "TB", "PB", "EB"];

/// Token that denotes an open upper bound.
pub const INFINITY: &str = "Infinity";

/// A numeric rule bound, possibly open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bound {
    Finite(u64),
    Unbounded,
}

impl Bound {
    /// Whether `value` lies strictly below this bound.
    pub fn above(&self, value: u64) -> bool {
        match self {
            Bound::Finite(upper) => value < *upper,
            Bound::Unbounded => true,
        }
    }

    pub fn finite(&self) -> Option<u64> {
        match self {
            Bound::Finite(v) => Some(*v),
            Bound::Unbounded => None,
        }
    }
}

impl From<u64> for Bound {
    fn from(v: u64) -> Self {
        Bound::Finite(v)
    }
}

impl fmt::Display for Bound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Bound::Finite(v) => write!(f, "{}", v),
            Bound::Unbounded => write!(f, "{}", INFINITY),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid byte size '{input}': {reason}")]
pub struct BytesError {
    pub input: String,
    pub reason: String,
}

fn multiplier(unit: &str) -> Option<u64> {
    let exp = match unit.to_ascii_uppercase().as_str() {
        "" | "B" | "BYTE" | "BYTES" => 0,
        "K" | "KB" | "KIB" => 1,
        "M" | "MB" | "MIB" => 2,
        "G" | "GB" | "GIB" => 3,
        "T" | "TB" | "TIB" => 4,
        "P" | "PB" | "PIB" => 5,
        "E" | "EB" | "EIB" => 6,
        _ => return None,
    };
    Some(1024u64.pow(exp))
}

/// Parse `"10 GB"`, `"512"`, `"1.5 tb"` or `"Infinity"`.
pub fn str_to_bytes(text: &str) -> Result<Bound, BytesError> {
    let err = |reason: &str| BytesError {
        input: text.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = text.trim();
    if trimmed.eq_ignore_ascii_case(INFINITY) {
        return Ok(Bound::Unbounded);
    }

    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    if number.is_empty() {
        return Err(err("missing number"));
    }
    let mult = multiplier(unit.trim()).ok_or_else(|| err("unknown unit"))?;

    if let Ok(whole) = number.parse::<u64>() {
        return whole
            .checked_mul(mult)
            .map(Bound::Finite)
            .ok_or_else(|| err("overflow"));
    }
    let value: f64 = number.parse().map_err(|_| err("not a number"))?;
    let bytes = value * mult as f64;
    if !bytes.is_finite() || bytes >= u64::MAX as f64 {
        return Err(err("overflow"));
    }
    Ok(Bound::Finite(bytes as u64))
}

/// Render with two decimals, scaling up until the value drops below 1024 or
/// `max_unit` is reached. Open bounds render as `Infinity`.
pub fn bytes_to_str(bytes: impl Into<Bound>, max_unit: Option<&str>) -> String {
    let bytes = match bytes.into() {
        Bound::Finite(b) => b,
        Bound::Unbounded => return INFINITY.to_string(),
    };
    let cap = max_unit
        .and_then(|u| UNITS.iter().position(|x| x.eq_ignore_ascii_case(u)))
        .unwrap_or(UNITS.len() - 1);

    let mut size = bytes as f64;
    let mut i = 0;
    while size >= 1024.0 && i < cap {
        size /= 1024.0;
        i += 1;
    }
    format!("{:.2} {}", size, UNITS[i])
}
