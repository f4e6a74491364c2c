//! Injectable time source for `lastAccess` stamping and eviction ordering.
//!
//! Mirrors the teacher's `ClockSource`/`SystemClock` split (`hlc.rs`): tests
//! substitute a virtual clock so eviction-ordering assertions don't race the
//! real wall clock.

use std::time::{SystemTime, UNIX_EPOCH};

/// Abstraction over "now", expressed as milliseconds since the Unix epoch.
pub trait Clock {
    /// Returns the current time in milliseconds since the Unix epoch.
    fn now_millis(&self) -> i64;
}

/// Default clock backed by `std::time::SystemTime`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
            .unwrap_or(0)
    }
}
