//! Monotonic time source shared by timers, condition waits, and rate limits.
//!
//! Every duration in this crate is derived from `CLOCK_MONOTONIC` (via
//! [`std::time::Instant`], which the standard library guarantees is backed
//! by a monotonic clock on every platform we run on). Callers must never
//! mix a [`MonotonicClock`] reading with a wall-clock timestamp.

use std::time::{Duration, Instant};

/// A fixed epoch chosen once at process start, so that every component
/// computes deltas against the same reference point.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    /// Capture the epoch. Call this once during daemon init.
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Seconds elapsed since the clock was created.
    pub fn now(&self) -> u64 {
        self.epoch.elapsed().as_secs()
    }

    /// Seconds elapsed since the clock was created, as a float.
    pub fn now_f64(&self) -> f64 {
        self.epoch.elapsed().as_secs_f64()
    }

    /// Sleep for the given duration. A thin wrapper so call sites read the
    /// same regardless of which clock backs them.
    pub fn sleep(&self, d: Duration) {
        std::thread::sleep(d);
    }

    /// `Instant` this many seconds from now, suitable for `Condvar::
    /// wait_timeout` absolute-deadline style call sites.
    pub fn deadline(&self, secs: u64) -> Instant {
        Instant::now() + Duration::from_secs(secs)
    }
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn now_is_monotonic_and_nondecreasing() {
        let clock = MonotonicClock::new();
        let a = clock.now_f64();
        std::thread::sleep(Duration::from_millis(5));
        let b = clock.now_f64();
        assert!(b >= a);
    }

    #[test]
    fn deadline_is_in_the_future() {
        let clock = MonotonicClock::new();
        assert!(clock.deadline(1) > Instant::now());
    }
}
