//! Unix timestamp utilities for payment expiry windows.
//!
//! This module provides the [`UnixTimestamp`] type used for `expiresAt`, `nonce`
//! bases, multi-signature deadlines and emergency-pause bookkeeping.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Display, Formatter};
use std::ops::Add;
use std::time::SystemTime;

/// A Unix timestamp representing seconds since the Unix epoch (1970-01-01T00:00:00Z).
///
/// # Serialization
///
/// Serialized as a JSON number, which is what payment payloads carry on the wire.
/// Deserialization also accepts a stringified integer, so payloads produced by
/// clients that quote large integers are still understood.
///
/// ```json
/// 1699999999
/// ```
///
/// # Example
///
/// ```
/// use x402_types::timestamp::UnixTimestamp;
///
/// let now = UnixTimestamp::now();
/// let expires = now + 300;
/// assert!(expires > now);
///
/// let specific = UnixTimestamp::from_secs(1699999999);
/// assert_eq!(specific.as_secs(), 1699999999);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Ord, Eq, Hash, Default)]
pub struct UnixTimestamp(u64);

impl Serialize for UnixTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for UnixTimestamp {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Wire {
            Number(u64),
            Text(String),
        }

        match Wire::deserialize(deserializer)? {
            Wire::Number(secs) => Ok(UnixTimestamp(secs)),
            Wire::Text(s) => s
                .parse::<u64>()
                .map(UnixTimestamp)
                .map_err(|_| serde::de::Error::custom("timestamp must be a non-negative integer")),
        }
    }
}

impl Display for UnixTimestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add<u64> for UnixTimestamp {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        UnixTimestamp(self.0.saturating_add(rhs))
    }
}

impl From<u64> for UnixTimestamp {
    fn from(secs: u64) -> Self {
        Self(secs)
    }
}

impl UnixTimestamp {
    /// Creates a new [`UnixTimestamp`] from a raw seconds value.
    pub fn from_secs(secs: u64) -> Self {
        Self(secs)
    }

    /// Returns the current system time as a [`UnixTimestamp`].
    ///
    /// A clock set before the Unix epoch reads as zero.
    pub fn now() -> Self {
        let now = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Self(now)
    }

    /// Returns the timestamp as raw seconds since the Unix epoch.
    pub fn as_secs(&self) -> u64 {
        self.0
    }

    /// Whether this timestamp lies strictly before `now`.
    pub fn is_before(&self, now: UnixTimestamp) -> bool {
        self.0 < now.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_as_number() {
        let ts = UnixTimestamp::from_secs(1_700_000_000);
        assert_eq!(serde_json::to_string(&ts).unwrap(), "1700000000");
    }

    #[test]
    fn accepts_number_or_string() {
        let a: UnixTimestamp = serde_json::from_str("42").unwrap();
        let b: UnixTimestamp = serde_json::from_str("\"42\"").unwrap();
        assert_eq!(a, b);
        assert!(serde_json::from_str::<UnixTimestamp>("\"-1\"").is_err());
        assert!(serde_json::from_str::<UnixTimestamp>("-1").is_err());
    }
}
