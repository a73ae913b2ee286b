//! UTC timestamp handling.
//!
//! Timestamps are persisted as RFC 3339 text at fixed microsecond precision.
//! The fixed width keeps lexicographic order identical to chronological
//! order, which the store relies on for `run_at <= now` comparisons in SQL.

use chrono::{DateTime, SecondsFormat, Utc};

/// Current UTC time rendered for storage.
pub fn now_iso() -> String {
    to_iso(Utc::now())
}

/// Render a timestamp in the storage format.
pub fn to_iso(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, false)
}

/// Parse a stored or user-supplied RFC 3339 timestamp.
pub fn parse_iso(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|ts| ts.with_timezone(&Utc))
}
