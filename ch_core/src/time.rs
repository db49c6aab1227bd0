// ABOUTME: Utilities for working with times and timestamps.
// ABOUTME: All persisted timestamps are RFC3339 text in UTC.
use chrono::{DateTime, SecondsFormat, Utc};

use crate::{Error, Result};

/// Get the current UTC time
pub fn utc_now() -> DateTime<Utc> {
    Utc::now()
}

/// Convert a timestamp to an RFC3339 string with second precision
///
/// # Examples
///
/// ```
/// use chrono::{TimeZone, Utc};
/// let t = Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap();
/// assert_eq!(ch_core::to_rfc3339(t), "2021-01-01T00:00:00Z");
/// ```
pub fn to_rfc3339(time: DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Get current time as an RFC3339 formatted string
pub fn now_rfc3339() -> String {
    to_rfc3339(utc_now())
}

/// Parse an RFC3339 timestamp back into a UTC time
pub fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::BadRequest(format!("Invalid timestamp '{}': {}", s, e)))
}

/// Parse an optional RFC3339 column
pub fn parse_rfc3339_opt(s: Option<&str>) -> Result<Option<DateTime<Utc>>> {
    s.map(parse_rfc3339).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_rfc3339_roundtrip() {
        let t = Utc.with_ymd_and_hms(2024, 6, 15, 12, 30, 45).unwrap();
        let s = to_rfc3339(t);
        assert_eq!(s, "2024-06-15T12:30:45Z");
        assert_eq!(parse_rfc3339(&s).unwrap(), t);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(parse_rfc3339("not a time").is_err());
        assert!(parse_rfc3339("").is_err());
    }

    #[test]
    fn test_parse_opt() {
        assert_eq!(parse_rfc3339_opt(None).unwrap(), None);
        let t = parse_rfc3339_opt(Some("2021-01-01T00:00:00Z")).unwrap();
        assert_eq!(t, Some(Utc.with_ymd_and_hms(2021, 1, 1, 0, 0, 0).unwrap()));
    }
}
