//! Timestamp text as produced by PostgreSQL.

use chrono::{DateTime, NaiveDateTime, SecondsFormat, TimeDelta, Utc};

/// Parses server timestamp text into UTC.
///
/// Accepts `2024-01-01 00:00:00[.fff]` (taken as UTC), the same with a numeric
/// offset (`+00`, `+02:00`) or a trailing ` UTC` as written by csvlog, and RFC 3339.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let s = text.trim();
    let s = s.strip_suffix(" UTC").unwrap_or(s);

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z") {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Formats a span timestamp: RFC 3339, UTC, millisecond precision.
pub fn format_span_time(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Adds a millisecond duration with microsecond resolution.
///
/// `None` when the result falls outside the representable date range.
pub(crate) fn add_millis(start: DateTime<Utc>, millis: f64) -> Option<DateTime<Utc>> {
    let micros = (millis * 1000.0).round();
    if !micros.is_finite() || micros.abs() >= i64::MAX as f64 {
        return None;
    }
    start.checked_add_signed(TimeDelta::microseconds(micros as i64))
}
