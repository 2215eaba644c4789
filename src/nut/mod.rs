pub mod serializer;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A typed document envelope: the unit every trunk stores and returns.
///
/// The payload's shape is opaque to the engines; only the serializer touches
/// it. `timestamp` and `version` ride in the on-disk record header as well,
/// so point reads can rebuild the envelope without parsing the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Nut {
    pub key: String,
    pub payload: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Nut {
    #[must_use]
    pub fn new(key: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            key: key.into(),
            payload,
            timestamp: Utc::now(),
            version: 1,
            expires_at: None,
        }
    }

    #[must_use]
    pub fn with_version(mut self, version: u32) -> Self {
        self.version = version;
        self
    }

    #[must_use]
    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Utc::now())
    }

    /// Timestamp as the little-endian on-disk representation (microseconds
    /// since the Unix epoch).
    #[must_use]
    pub fn timestamp_micros(&self) -> i64 {
        self.timestamp.timestamp_micros()
    }

    /// Rebuild a `DateTime<Utc>` from the on-disk microsecond count.
    /// Out-of-range values clamp to the epoch rather than failing the read.
    #[must_use]
    pub fn datetime_from_micros(micros: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_micros(micros).unwrap_or_default()
    }
}
