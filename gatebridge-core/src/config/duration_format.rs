//! Duration parsing for configuration files.
//!
//! Supports two formats:
//! - `humantime`: `30s`, `10m`, `1h 30m`, `24h`
//! - ISO 8601: `PT30S`, `PT10M`, `P1D`

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

/// Parse a duration string.
///
/// Tries humantime first, then ISO 8601.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }

    if let Ok(d) = iso8601_duration::Duration::parse(s)
        && let Some(std_duration) = d.to_std()
    {
        return Ok(std_duration);
    }

    Err(format!(
        "invalid duration '{s}': expected humantime (30s) or ISO 8601 (PT30S)"
    ))
}

/// Deserialize a duration from a string.
pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let s: String = Deserialize::deserialize(deserializer)?;
    parse_duration(&s).map_err(serde::de::Error::custom)
}

/// Serialize a duration to a humantime string.
pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_str(&humantime::format_duration(*duration).to_string())
}

/// Whole milliseconds in `duration`, at least 1, saturating at `u64::MAX`.
///
/// Redis rejects a zero lease or block time.
#[must_use]
pub fn redis_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Serialize;

    #[test]
    fn test_redis_millis_saturates() {
        assert_eq!(redis_millis(Duration::from_millis(1500)), 1500);
        assert_eq!(redis_millis(Duration::ZERO), 1);
        assert_eq!(redis_millis(Duration::from_micros(10)), 1);
        assert_eq!(redis_millis(Duration::MAX), u64::MAX);
    }

    #[test]
    fn test_parse_humantime() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("24h").unwrap(), Duration::from_secs(86400));
        assert_eq!(parse_duration("1h 30m").unwrap(), Duration::from_secs(5400));
    }

    #[test]
    fn test_parse_iso8601() {
        assert_eq!(parse_duration("PT30S").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("PT1H30M").unwrap(), Duration::from_secs(5400));
    }

    #[test]
    fn test_parse_invalid() {
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("").is_err());
    }

    #[test]
    fn test_serde_roundtrip() {
        #[derive(Debug, Deserialize, Serialize, PartialEq)]
        struct Lease {
            #[serde(deserialize_with = "deserialize", serialize_with = "serialize")]
            lease: Duration,
        }

        let parsed: Lease = serde_saphyr::from_str("lease: 90s\n").unwrap();
        assert_eq!(parsed.lease, Duration::from_secs(90));

        let json = serde_json::to_string(&parsed).unwrap();
        assert_eq!(json, r#"{"lease":"1m 30s"}"#);
    }
}
