//! Shared row-mapping helpers.

use crate::domain::errors::{BoardError, BoardResult};
use chrono::{DateTime, Utc};

/// Parse an RFC 3339 timestamp column into `DateTime<Utc>`.
pub fn parse_datetime(s: &str) -> BoardResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| BoardError::Database(format!("invalid timestamp '{s}': {e}")))
}

/// Parse an optional RFC 3339 timestamp column.
pub fn parse_datetime_opt(s: Option<&str>) -> Option<DateTime<Utc>> {
    s.and_then(|v| parse_datetime(v).ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rfc3339() {
        let dt = parse_datetime("2025-01-15T10:30:00+00:00").unwrap();
        assert_eq!(dt.timestamp(), 1_736_937_000);
        assert!(parse_datetime("not a date").is_err());
    }

    #[test]
    fn optional_parse() {
        assert!(parse_datetime_opt(None).is_none());
        assert!(parse_datetime_opt(Some("garbage")).is_none());
        assert!(parse_datetime_opt(Some("2025-01-15T10:30:00Z")).is_some());
    }
}
