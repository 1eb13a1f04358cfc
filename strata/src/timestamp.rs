//! Scanning for drivers that hand back zone-naive timestamps.
//!
//! SQLite stores whatever text it was given, and MySQL's `TIMESTAMP` comes
//! back without an offset under some configurations. Rows written by this
//! crate use the 19-character `YYYY-MM-DD HH:MM:SS` form in UTC; rows
//! written by other tools may carry an RFC 3339 offset. Both are accepted
//! and normalized to the caller's local zone.

use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};

use crate::{Error, Result};

const NAIVE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Interprets a raw `applied_at` column value. A SQL NULL scans to the Unix
/// epoch rather than an error; an unrecognizable string is an error.
pub(crate) fn scan_text(raw: Option<&str>) -> Result<DateTime<Local>> {
    let Some(raw) = raw else {
        return Ok(DateTime::<Utc>::UNIX_EPOCH.with_timezone(&Local));
    };

    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Local));
    }

    // The zone-naive form is always written as UTC.
    if raw.len() == 19 {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, NAIVE_FORMAT) {
            return Ok(Utc.from_utc_datetime(&naive).with_timezone(&Local));
        }
    }

    Err(Error::Timestamp(raw.to_string()))
}

/// Formats a timestamp into the 19-character UTC form that `scan_text`
/// round-trips.
pub(crate) fn to_naive_utc(value: DateTime<Local>) -> String {
    value.with_timezone(&Utc).format(NAIVE_FORMAT).to_string()
}
