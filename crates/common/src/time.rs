//! Timestamp helpers
//!
//! The database stores epoch milliseconds; the HTTP surface emits RFC 3339
//! UTC strings. The serde modules here let domain structs carry `i64` columns
//! while serializing as timestamps.

use chrono::{DateTime, TimeZone, Utc};

/// Current time as epoch milliseconds
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert epoch milliseconds to a UTC datetime.
///
/// Out-of-range values clamp to the epoch rather than panic; they can only
/// come from a corrupted row.
pub fn to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).single().unwrap_or_default())
}

/// Format epoch milliseconds as an RFC 3339 UTC string
pub fn to_rfc3339(ms: i64) -> String {
    to_datetime(ms).to_rfc3339()
}

/// Serde adapter: `i64` epoch milliseconds <-> RFC 3339 string
pub mod rfc3339_ms {
    use chrono::DateTime;
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ms: &i64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&super::to_rfc3339(*ms))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
        let s = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&s)
            .map(|dt| dt.timestamp_millis())
            .map_err(serde::de::Error::custom)
    }
}

/// Serde adapter: `Option<i64>` epoch milliseconds <-> nullable RFC 3339 string
pub mod rfc3339_ms_opt {
    use chrono::DateTime;
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(ms: &Option<i64>, serializer: S) -> Result<S::Ok, S::Error> {
        match ms {
            Some(ms) => serializer.serialize_some(&super::to_rfc3339(*ms)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<i64>, D::Error> {
        let s: Option<String> = Option::deserialize(deserializer)?;
        match s {
            Some(s) => DateTime::parse_from_rfc3339(&s)
                .map(|dt| Some(dt.timestamp_millis()))
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
