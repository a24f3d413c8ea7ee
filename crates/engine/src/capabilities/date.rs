//! `date` capability: UTC timestamps via chrono.
//!
//! Timestamps cross the sandbox boundary as epoch milliseconds (integers) or
//! as strings that [`parse_timestamp`] accepts.

use std::fmt::Write;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, SecondsFormat, Timelike, Utc};
use mlua::{Lua, Table, Value};

use super::{cap_error, number_arg};

const CAP: &str = "date";

/// Units accepted by `date.add` and `date.diff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Milliseconds,
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
}

impl Unit {
    /// Singular and plural spellings are both accepted.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "milliseconds" | "millisecond" | "ms" => Some(Unit::Milliseconds),
            "seconds" | "second" => Some(Unit::Seconds),
            "minutes" | "minute" => Some(Unit::Minutes),
            "hours" | "hour" => Some(Unit::Hours),
            "days" | "day" => Some(Unit::Days),
            "weeks" | "week" => Some(Unit::Weeks),
            _ => None,
        }
    }

    pub fn millis(self) -> i64 {
        match self {
            Unit::Milliseconds => 1,
            Unit::Seconds => 1_000,
            Unit::Minutes => 60_000,
            Unit::Hours => 3_600_000,
            Unit::Days => 86_400_000,
            Unit::Weeks => 604_800_000,
        }
    }
}

/// Parse RFC 3339, `YYYY-MM-DD HH:MM:SS`, `YYYY-MM-DDTHH:MM:SS` or `YYYY-MM-DD` (all UTC).
pub fn parse_timestamp(input: &str) -> Option<DateTime<Utc>> {
    let s = input.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Format a timestamp with a strftime pattern, or RFC 3339 when `fmt` is `None`.
///
/// An invalid pattern is an error, not a panic.
pub fn format_timestamp(t: DateTime<Utc>, fmt: Option<&str>) -> Result<String, String> {
    match fmt {
        None => Ok(t.to_rfc3339_opts(SecondsFormat::Millis, true)),
        Some(pattern) => {
            let mut out = String::new();
            write!(out, "{}", t.format(pattern))
                .map_err(|_| format!("invalid format string '{}'", pattern))?;
            Ok(out)
        }
    }
}

/// Shift `t` by `amount` units. Fractional amounts are kept to the millisecond.
pub fn add(t: DateTime<Utc>, amount: f64, unit: Unit) -> Option<DateTime<Utc>> {
    let millis = amount * unit.millis() as f64;
    // `i64::MAX as f64` rounds up to 2^63, which no i64 holds
    if !millis.is_finite() || millis.abs() >= i64::MAX as f64 {
        return None;
    }
    Duration::try_milliseconds(millis.round() as i64).and_then(|d| t.checked_add_signed(d))
}

/// `b - a` expressed in `unit`.
pub fn diff(a: DateTime<Utc>, b: DateTime<Utc>, unit: Unit) -> f64 {
    let millis = (b - a).num_milliseconds();
    millis as f64 / unit.millis() as f64
}

fn timestamp_arg(what: &str, value: &Value) -> mlua::Result<DateTime<Utc>> {
    match value {
        Value::Integer(ms) => DateTime::from_timestamp_millis(*ms)
            .ok_or_else(|| cap_error(CAP, format!("{} is out of range", what))),
        Value::Number(ms) if ms.is_finite() => DateTime::from_timestamp_millis(*ms as i64)
            .ok_or_else(|| cap_error(CAP, format!("{} is out of range", what))),
        Value::String(s) => {
            let text = s.to_string_lossy().to_string();
            parse_timestamp(&text).ok_or_else(|| cap_error(CAP, format!("cannot parse '{}'", text)))
        }
        other => Err(cap_error(
            CAP,
            format!("{} must be a timestamp or date string, got {}", what, other.type_name()),
        )),
    }
}

fn unit_arg(name: &str) -> mlua::Result<Unit> {
    Unit::from_name(name).ok_or_else(|| cap_error(CAP, format!("unknown unit '{}'", name)))
}

pub(crate) fn create_table(lua: &Lua) -> mlua::Result<Table> {
    let date = lua.create_table()?;

    date.set(
        "now",
        lua.create_function(|_, ()| Ok(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)))?,
    )?;

    date.set(
        "timestamp",
        lua.create_function(|_, ()| Ok(Utc::now().timestamp_millis()))?,
    )?;

    date.set(
        "parse",
        lua.create_function(|_, s: String| match parse_timestamp(&s) {
            Some(dt) => Ok(Value::Integer(dt.timestamp_millis())),
            None => Ok(Value::Nil),
        })?,
    )?;

    date.set(
        "format",
        lua.create_function(|_, (t, fmt): (Value, Option<String>)| {
            let dt = timestamp_arg("t", &t)?;
            format_timestamp(dt, fmt.as_deref()).map_err(|e| cap_error(CAP, e))
        })?,
    )?;

    date.set(
        "add",
        lua.create_function(|_, (t, amount, unit): (Value, Value, String)| {
            let dt = timestamp_arg("t", &t)?;
            let amount = number_arg(CAP, "amount", &amount)?;
            let shifted = add(dt, amount, unit_arg(&unit)?)
                .ok_or_else(|| cap_error(CAP, "result is out of range"))?;
            Ok(shifted.timestamp_millis())
        })?,
    )?;

    date.set(
        "diff",
        lua.create_function(|_, (a, b, unit): (Value, Value, Option<String>)| {
            let a = timestamp_arg("a", &a)?;
            let b = timestamp_arg("b", &b)?;
            match unit {
                None => Ok(Value::Integer((b - a).num_milliseconds())),
                Some(name) => Ok(Value::Number(diff(a, b, unit_arg(&name)?))),
            }
        })?,
    )?;

    date.set(
        "parts",
        lua.create_function(|lua, t: Value| {
            let dt = timestamp_arg("t", &t)?;
            let parts = lua.create_table()?;
            parts.set("year", dt.year())?;
            parts.set("month", dt.month())?;
            parts.set("day", dt.day())?;
            parts.set("hour", dt.hour())?;
            parts.set("minute", dt.minute())?;
            parts.set("second", dt.second())?;
            // ISO numbering: 1 = Monday
            parts.set("weekday", dt.weekday().number_from_monday())?;
            Ok(parts)
        })?,
    )?;

    Ok(date)
}
