//! Date/time utilities for tributary.
//!
//! Timestamps are persisted as epoch milliseconds (BIGINT) so the same SQL
//! works against both SQLite and PostgreSQL.

use chrono::{DateTime, Utc};

/// Convert a UTC datetime to epoch milliseconds for storage.
pub fn to_millis(dt: DateTime<Utc>) -> i64 {
    dt.timestamp_millis()
}

/// Convert stored epoch milliseconds back to a UTC datetime.
///
/// Out-of-range values fall back to the Unix epoch.
pub fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::UNIX_EPOCH)
}

/// Convert a nullable stored timestamp.
pub fn opt_from_millis(ms: Option<i64>) -> Option<DateTime<Utc>> {
    ms.map(from_millis)
}

/// Convert a nullable datetime for storage.
pub fn opt_to_millis(dt: Option<DateTime<Utc>>) -> Option<i64> {
    dt.map(to_millis)
}

/// Format a datetime for log output (e.g. "2024-01-15T10:30:00Z").
pub fn to_rfc3339(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}
