//! Timestamp utilities

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Parse an RFC 3339 timestamp, SQLite's `YYYY-MM-DD HH:MM:SS[.fff]` (UTC), or
/// a bare `YYYY-MM-DD` date (midnight UTC)
///
/// Upstream sources disagree on precision; anything else yields `None`.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f") {
        return Some(naive.and_utc());
    }
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

/// Calendar-day key (`YYYY-MM-DD`) of a timestamp, empty when absent
pub fn day_key(timestamp: Option<&DateTime<Utc>>) -> String {
    timestamp
        .map(|t| t.format("%Y-%m-%d").to_string())
        .unwrap_or_default()
}

/// Serde adapter for optional timestamps accepting [`parse_timestamp`] formats
///
/// Unparseable text reads as `None`; a bad date never rejects its record.
pub mod flexible {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};
    use tracing::debug;

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(dt) => serializer.serialize_str(&dt.to_rfc3339()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let parsed = super::parse_timestamp(&raw);
        if parsed.is_none() && !raw.trim().is_empty() {
            debug!("Ignoring unparseable timestamp: {}", raw);
        }
        Ok(parsed)
    }
}
