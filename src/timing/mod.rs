//! Monotonic clock for capture timestamps
//!
//! Every frame's `capture_timestamp` is measured against one shared start
//! instant, so frames from different devices can be ordered against each
//! other.

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Shared capture timebase
#[derive(Debug, Clone)]
pub struct CaptureClock {
    start: Arc<Instant>,
}

impl CaptureClock {
    pub fn new() -> Self {
        Self {
            start: Arc::new(Instant::now()),
        }
    }

    /// Share an existing timebase.
    pub fn from_instant(start: Instant) -> Self {
        Self {
            start: Arc::new(start),
        }
    }

    /// Elapsed time since the clock started.
    #[inline]
    pub fn now(&self) -> Duration {
        self.start.elapsed()
    }

    /// Timestamp for a given instant; instants before the start clamp to zero.
    #[inline]
    pub fn at(&self, instant: Instant) -> Duration {
        instant.saturating_duration_since(*self.start)
    }

    pub fn start_instant(&self) -> Instant {
        *self.start
    }
}

impl Default for CaptureClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_is_monotonic() {
        let clock = CaptureClock::new();
        let mut last = clock.now();
        for _ in 0..1000 {
            let now = clock.now();
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn test_shared_timebase() {
        let clock = CaptureClock::new();
        let shared = CaptureClock::from_instant(clock.start_instant());
        let instant = Instant::now();
        assert_eq!(clock.at(instant), shared.at(instant));
    }

    #[test]
    fn test_instant_before_start_clamps() {
        let before = Instant::now();
        std::thread::sleep(Duration::from_millis(2));
        let clock = CaptureClock::new();
        assert_eq!(clock.at(before), Duration::ZERO);
    }
}
