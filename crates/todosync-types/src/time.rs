//! Timestamp text encoding shared by every table.
//!
//! Timestamps are stored as RFC 3339 in UTC with a fixed
//! nanosecond precision. Nothing is lost on the way to disk, and
//! lexicographic order in SQL matches chronological order.

use chrono::{DateTime, SecondsFormat, Utc};

/// Formats a timestamp for storage.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parses a stored timestamp.
///
/// # Errors
///
/// Returns the chrono parse error if `s` is not RFC 3339.
pub fn parse_timestamp(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(s).map(|ts| ts.with_timezone(&Utc))
}
