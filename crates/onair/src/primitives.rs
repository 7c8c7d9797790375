//! Core primitives shared by every onair component
//!
//! Time is integer milliseconds read from an injected [`Clock`](crate::Clock),
//! never from the wall clock directly.

use std::fmt;
use std::ops::{Add, Sub};

use serde::{Deserialize, Serialize};

/// Timeline layer name.
pub type LayerId = String;

/// Identifier of the timeline object that produced a piece of state.
pub type ObjectId = String;

/// Device instance identifier, as used in mappings and configuration.
pub type DeviceId = String;

// =============================================================================
// TIME
// =============================================================================

/// Milliseconds on the injected clock.
///
/// Signed so that callers can express (and the scheduler can reject) times
/// before the clock origin.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(0);

    pub fn millis(&self) -> i64 {
        self.0
    }

    /// Milliseconds from `self` until `later`, zero if `later` is not later.
    pub fn until(&self, later: Timestamp) -> u64 {
        (later.0 - self.0).max(0) as u64
    }
}

impl Add<i64> for Timestamp {
    type Output = Self;
    fn add(self, rhs: i64) -> Self::Output {
        Timestamp(self.0.saturating_add(rhs))
    }
}

impl Sub for Timestamp {
    type Output = i64;
    fn sub(self, rhs: Self) -> Self::Output {
        self.0.saturating_sub(rhs.0)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

// =============================================================================
// SCHEDULER IDS
// =============================================================================

/// Independently ordered command channel within one device.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LaneId(pub String);

impl LaneId {
    pub const DEFAULT_NAME: &'static str = "default";

    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for LaneId {
    fn default() -> Self {
        Self(Self::DEFAULT_NAME.to_string())
    }
}

impl fmt::Display for LaneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for LaneId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Handle for one queued scheduler entry. Monotonic per scheduler, so it also
/// breaks ties between entries queued for the same time.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(transparent)]
pub struct EntryId(pub u64);

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timestamp_ordering_and_math() {
        let a = Timestamp(100);
        let b = a + 50;
        assert!(b > a);
        assert_eq!(b - a, 50);
        assert_eq!(a - b, -50);
        assert_eq!(a.until(b), 50);
        assert_eq!(b.until(a), 0);
    }

    #[test]
    fn test_default_lane() {
        assert_eq!(LaneId::default().as_str(), "default");
        assert_eq!(LaneId::from("me1"), LaneId::new("me1"));
    }

    #[test]
    fn test_timestamp_serializes_as_integer() {
        let json = serde_json::to_string(&Timestamp(1500)).unwrap();
        assert_eq!(json, "1500");
    }
}
