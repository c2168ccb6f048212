//! Core types for BlueChat
//!
//! Newtypes for peer identifiers and timestamps, plus the [`TimeSource`] seam used
//! to stamp messages without reading the wall clock directly.

use core::fmt;
use core::ops::Sub;
use core::str::FromStr;

use chrono::{Local, TimeZone};
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Peer Identifier
// ----------------------------------------------------------------------------

/// Stable, opaque identifier of a remote device (usually its radio address)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    /// Create a new peer identifier
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the identifier as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for PeerId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl FromStr for PeerId {
    type Err = core::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::new(s.trim()))
    }
}

impl AsRef<str> for PeerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ----------------------------------------------------------------------------
// Timestamp
// ----------------------------------------------------------------------------

/// Wall-clock timestamp in milliseconds since the UNIX epoch
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Timestamp(u64);

impl Sub for Timestamp {
    type Output = u64;

    fn sub(self, other: Timestamp) -> u64 {
        self.0.saturating_sub(other.0)
    }
}

impl Timestamp {
    /// Create a new timestamp
    pub fn new(millis: u64) -> Self {
        Self(millis)
    }

    /// Current wall-clock time
    pub fn now() -> Self {
        use std::time::{SystemTime, UNIX_EPOCH};
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self(duration.as_millis() as u64)
    }

    /// Get the raw milliseconds
    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Get duration since another timestamp
    pub fn duration_since(&self, other: Self) -> core::time::Duration {
        core::time::Duration::from_millis(self.0.saturating_sub(other.0))
    }

    /// Hours and minutes in the local time zone, e.g. `"14:05"`
    pub fn display_time(&self) -> String {
        match Local.timestamp_millis_opt(self.0 as i64).single() {
            Some(local) => local.format("%H:%M").to_string(),
            None => "--:--".to_string(),
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

// ----------------------------------------------------------------------------
// Time Source Trait
// ----------------------------------------------------------------------------

/// Provides the current time to components that stamp messages
pub trait TimeSource: Send + Sync {
    /// Get the current timestamp
    fn now(&self) -> Timestamp;
}

/// Reads the system wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemTimeSource;

impl SystemTimeSource {
    pub fn new() -> Self {
        Self
    }
}

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_roundtrip() {
        let peer: PeerId = " AA:BB ".parse().unwrap();
        assert_eq!(peer.as_str(), "AA:BB");
        assert_eq!(peer.to_string(), "AA:BB");
        assert_eq!(peer, PeerId::from("AA:BB"));
    }

    #[test]
    fn test_timestamp_arithmetic() {
        let earlier = Timestamp::new(1_000);
        let later = Timestamp::new(3_500);
        assert_eq!(later - earlier, 2_500);
        assert_eq!(earlier - later, 0);
        assert_eq!(
            later.duration_since(earlier),
            core::time::Duration::from_millis(2_500)
        );
    }

    #[test]
    fn test_display_time_shape() {
        let display = Timestamp::new(1_700_000_000_000).display_time();
        assert_eq!(display.len(), 5);
        assert_eq!(&display[2..3], ":");
    }
}
