//! Date helpers shared by connectors and the CLI.

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Utc};

use crate::error::ValidationError;

/// Epoch sentinel meaning "all history".
pub fn default_datetime() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// UNIX timestamp with sub-second precision.
pub fn datetime_to_timestamp(dt: &DateTime<Utc>) -> f64 {
    dt.timestamp_micros() as f64 / 1_000_000.0
}

/// Parse the date formats found in mail headers and REST APIs.
///
/// Accepted, in order: RFC 3339, RFC 2822 (a trailing `(comment)` is
/// ignored), `%Y-%m-%dT%H:%M:%S%.f%z`, `%Y-%m-%d %H:%M:%S`, `%Y-%m-%d %H:%M`
/// and `%Y-%m-%d`. Values without an offset are taken as UTC.
pub fn str_to_datetime(value: &str) -> Result<DateTime<Utc>, ValidationError> {
    let trimmed = value.trim();
    let invalid = || ValidationError::InvalidDate {
        value: value.to_string(),
    };
    if trimmed.is_empty() {
        return Err(invalid());
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Some(dt) = parse_rfc2822(trimmed) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%d %H:%M:%S%.f%z"] {
        if let Ok(dt) = DateTime::parse_from_str(trimmed, format) {
            return Ok(dt.with_timezone(&Utc));
        }
    }
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, format) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        if let Some(naive) = date.and_hms_opt(0, 0, 0) {
            return Ok(Utc.from_utc_datetime(&naive));
        }
    }

    Err(invalid())
}

fn parse_rfc2822(value: &str) -> Option<DateTime<FixedOffset>> {
    if let Ok(dt) = DateTime::parse_from_rfc2822(value) {
        return Some(dt);
    }
    // "Tue, 25 Sep 2007 12:30:09 +0200 (CEST)"
    let without_comment = match value.find('(') {
        Some(idx) => value[..idx].trim_end(),
        None => return None,
    };
    DateTime::parse_from_rfc2822(without_comment).ok()
}
