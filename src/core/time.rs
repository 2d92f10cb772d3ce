//! Wall-Clock Timestamps
//!
//! All deadlines and fingerprints in the protocol are absolute wall-clock
//! instants exchanged as millisecond-precision ISO-8601 strings.
//! Timestamps are truncated to whole milliseconds on construction so that a
//! value survives a wire round trip unchanged and compares equal afterwards.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// A UTC instant with millisecond precision.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Current wall-clock time.
    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis())
    }

    /// Build from epoch milliseconds.
    pub const fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Epoch milliseconds.
    pub const fn as_millis(self) -> i64 {
        self.0
    }

    /// Shift by a signed number of milliseconds.
    pub const fn offset_millis(self, delta: i64) -> Self {
        Self(self.0 + delta)
    }

    /// Milliseconds elapsed from `earlier` to `self` (negative if `earlier` is later).
    pub const fn millis_since(self, earlier: Timestamp) -> i64 {
        self.0 - earlier.0
    }

    /// Render as `2024-05-01T12:00:00.000Z`.
    pub fn to_iso(self) -> String {
        match Utc.timestamp_millis_opt(self.0).single() {
            Some(dt) => dt.to_rfc3339_opts(SecondsFormat::Millis, true),
            None => self.0.to_string(),
        }
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp_millis())
    }
}

impl FromStr for Timestamp {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let dt = DateTime::parse_from_rfc3339(s)?;
        Ok(Self(dt.timestamp_millis()))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_iso())
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_iso())
    }
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Estimated offset between the server clock and the local clock.
///
/// Only ever grows: a countdown derived from `local + offset` must not
/// visibly jump backward because one message arrived with extra latency.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClockOffset {
    max_offset_ms: Option<i64>,
}

impl ClockOffset {
    /// Record one sample taken when a server message arrived.
    ///
    /// Returns the (possibly unchanged) estimate.
    pub fn observe(&mut self, server_time: Timestamp, local_time: Timestamp) -> i64 {
        let sample = server_time.millis_since(local_time);
        let next = match self.max_offset_ms {
            Some(current) => current.max(sample),
            None => sample,
        };
        self.max_offset_ms = Some(next);
        next
    }

    /// Current estimate in milliseconds (0 before any sample).
    pub fn offset_ms(&self) -> i64 {
        self.max_offset_ms.unwrap_or(0)
    }

    /// Translate a local instant to server time.
    pub fn to_server_time(&self, local: Timestamp) -> Timestamp {
        local.offset_millis(self.offset_ms())
    }
}
