//! Time utilities for serializing timestamps and durations.
use chrono::{DateTime, Utc};
use serde::{self, Deserialize, Deserializer, Serializer};
use std::time::SystemTime;

/// Serializes a `SystemTime` to an RFC 3339 string.
pub fn serialize<S>(time: &SystemTime, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    let datetime: DateTime<Utc> = (*time).into();
    serializer.serialize_str(&datetime.to_rfc3339())
}

/// Deserializes an RFC 3339 string to a `SystemTime`.
pub fn deserialize<'de, D>(deserializer: D) -> Result<SystemTime, D::Error>
where
    D: Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    DateTime::parse_from_rfc3339(&s)
        .map(SystemTime::from)
        .map_err(serde::de::Error::custom)
}

/// Whole-millisecond (de)serialization for `Duration`, used by config files and results.
pub mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(ms)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use serde::{Deserialize, Serialize};
    use std::time::{Duration, SystemTime};

    #[derive(Serialize, Deserialize)]
    struct Stamped {
        #[serde(with = "super")]
        at: SystemTime,
        #[serde(with = "super::millis")]
        took: Duration,
    }

    #[test]
    fn test_duration_is_plain_milliseconds() {
        let value = Stamped {
            at: SystemTime::UNIX_EPOCH,
            took: Duration::from_millis(1500),
        };
        let json = serde_json::to_value(&value).unwrap();
        assert_eq!(json["took"], 1500);
        assert_eq!(json["at"], "1970-01-01T00:00:00+00:00");
    }

    #[test]
    fn test_rejects_malformed_timestamp() {
        let parsed: Result<Stamped, _> =
            serde_json::from_str(r#"{"at":"yesterday","took":10}"#);
        assert!(parsed.is_err());
    }
}
