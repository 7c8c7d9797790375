//! Injected time sources
//!
//! Every component reads time through [`Clock`] so scheduling stays
//! deterministic under test. [`SystemClock`] is monotonic (`Instant` based);
//! [`ManualClock`] only moves when told to.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Instant;

use crate::Timestamp;

/// Source of "now" in milliseconds.
pub trait Clock: Send + Sync {
    fn now(&self) -> Timestamp;
}

/// Monotonic clock that counts milliseconds since construction, shifted by
/// `origin`.
pub struct SystemClock {
    start: Instant,
    origin: Timestamp,
}

impl SystemClock {
    /// Clock that reads zero at construction.
    pub fn new() -> Self {
        Self::with_origin(Timestamp::ZERO)
    }

    /// Clock that reads `origin` at construction.
    pub fn with_origin(origin: Timestamp) -> Self {
        Self {
            start: Instant::now(),
            origin,
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let elapsed = self.start.elapsed().as_millis() as i64;
        self.origin + elapsed
    }
}

/// Clock driven explicitly by tests and offline playback.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start: Timestamp) -> Self {
        Self {
            now: AtomicI64::new(start.0),
        }
    }

    pub fn set(&self, time: Timestamp) {
        self.now.store(time.0, Ordering::SeqCst);
    }

    pub fn advance(&self, millis: i64) -> Timestamp {
        Timestamp(self.now.fetch_add(millis, Ordering::SeqCst) + millis)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.now.load(Ordering::SeqCst))
    }
}
