//! Typed cell values, canonical rendering, and the permissive date/time
//! parsers used during import normalization.
//!
//! Imported spreadsheets carry dates in whatever shape the upstream tool
//! produced (`4/23/2019 3:06pm PST`, `2019-04-23 15:06:51 UTC`, ISO with
//! `T`, and so on). The loose parsers below accept the common variants
//! and everything re-renders canonically: dates as `%Y-%m-%d`, times as
//! `%H:%M:%S`, datetimes as `%Y-%m-%d %H:%M:%S`.

use std::fmt;

use anyhow::{Result, anyhow};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum Value {
    Text(String),
    Integer(i64),
    Number(f64),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
}

impl Value {
    pub fn as_display(&self) -> String {
        match self {
            Value::Text(s) => s.clone(),
            Value::Integer(i) => i.to_string(),
            Value::Number(f) => {
                if f.fract() == 0.0 {
                    (*f as i64).to_string()
                } else {
                    f.to_string()
                }
            }
            Value::Date(d) => d.format("%Y-%m-%d").to_string(),
            Value::Time(t) => t.format("%H:%M:%S").to_string(),
            Value::DateTime(dt) => dt.format("%Y-%m-%d %H:%M:%S").to_string(),
        }
    }

    /// Conversion for binding into SQLite. Temporal variants are stored
    /// as canonical TEXT so they stay comparable and queryable.
    pub fn to_sqlite(&self) -> rusqlite::types::Value {
        match self {
            Value::Text(s) => rusqlite::types::Value::Text(s.clone()),
            Value::Integer(i) => rusqlite::types::Value::Integer(*i),
            Value::Number(f) => rusqlite::types::Value::Real(*f),
            Value::Date(_) | Value::Time(_) | Value::DateTime(_) => {
                rusqlite::types::Value::Text(self.as_display())
            }
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_display())
    }
}

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%m/%d/%Y",
    "%d/%m/%Y",
    "%Y/%m/%d",
    "%d-%m-%Y",
    "%B %d, %Y",
    "%b %d, %Y",
];

const TIME_FORMATS: &[&str] = &[
    "%H:%M:%S",
    "%H:%M",
    "%I:%M:%S %p",
    "%I:%M %p",
    "%I:%M:%S%p",
    "%I:%M%p",
];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
    "%d/%m/%Y %H:%M:%S",
    "%m/%d/%Y %I:%M:%S %p",
    "%m/%d/%Y %I:%M %p",
    "%m/%d/%Y %I:%M:%S%p",
    "%m/%d/%Y %I:%M%p",
    "%Y-%m-%d %I:%M %p",
    "%Y-%m-%d %I:%M%p",
];

fn trailing_zone_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    // UTC/PST style abbreviations, Z, or numeric offsets. Two-letter
    // tokens are excluded so a bare "pm" is never treated as a zone.
    RE.get_or_init(|| {
        Regex::new(r"(?:\s+[A-Za-z]{3,5}|[Zz]|\s*[+-]\d{2}:?\d{2})$")
            .unwrap_or_else(|_| unreachable!("static regex"))
    })
}

fn without_trailing_zone(value: &str) -> Option<String> {
    let re = trailing_zone_re();
    re.find(value)
        .map(|m| value[..m.start()].trim_end().to_string())
}

/// Parse a datetime in any supported format, tolerating a trailing
/// timezone token (dropped: values normalize to naive local time) and
/// falling back to date-only input at midnight.
pub fn parse_loose_datetime(value: &str) -> Result<NaiveDateTime> {
    let trimmed = value.trim();
    for fmt in DATETIME_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Ok(parsed);
        }
    }
    for fmt in DATE_FORMATS {
        if let Ok(parsed) = NaiveDate::parse_from_str(trimmed, fmt) {
            return Ok(parsed.and_time(NaiveTime::MIN));
        }
    }
    if let Some(stripped) = without_trailing_zone(trimmed) {
        return parse_loose_datetime(&stripped);
    }
    Err(anyhow!("Failed to parse '{value}' as datetime"))
}

/// Parse a date-only value; full datetimes are rejected. Type inference
/// relies on this so a timestamp column never narrows to a date.
pub fn parse_calendar_date(value: &str) -> Result<NaiveDate> {
    let trimmed = value.trim();
    for fmt in DATE_FORMATS {
        if let Ok(parsed) = NaiveDate::parse_from_str(trimmed, fmt) {
            return Ok(parsed);
        }
    }
    Err(anyhow!("Failed to parse '{value}' as date"))
}

/// Parse a date in any supported format, accepting full datetimes and
/// truncating them.
pub fn parse_loose_date(value: &str) -> Result<NaiveDate> {
    if let Ok(parsed) = parse_calendar_date(value) {
        return Ok(parsed);
    }
    parse_loose_datetime(value.trim())
        .map(|dt| dt.date())
        .map_err(|_| anyhow!("Failed to parse '{value}' as date"))
}

pub fn parse_loose_time(value: &str) -> Result<NaiveTime> {
    let trimmed = value.trim();
    for fmt in TIME_FORMATS {
        if let Ok(parsed) = NaiveTime::parse_from_str(trimmed, fmt) {
            return Ok(parsed);
        }
    }
    if let Some(stripped) = without_trailing_zone(trimmed) {
        return parse_loose_time(&stripped);
    }
    Err(anyhow!("Failed to parse '{value}' as time"))
}

/// Fold an arbitrary header into a safe lowercase identifier: ASCII
/// alphanumerics survive, every other run of characters becomes a single
/// underscore, and a leading digit gets a `col_` prefix.
pub fn normalize_identifier(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_was_sep = false;
    for c in name.chars() {
        match c {
            'a'..='z' | '0'..='9' => {
                out.push(c);
                last_was_sep = false;
            }
            'A'..='Z' => {
                out.push(c.to_ascii_lowercase());
                last_was_sep = false;
            }
            _ => {
                if !last_was_sep && !out.is_empty() {
                    out.push('_');
                }
                last_was_sep = true;
            }
        }
    }
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert_str(0, "col_");
    }
    out
}
