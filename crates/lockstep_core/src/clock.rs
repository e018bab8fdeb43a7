//! # Monotonic Clock
//!
//! Nanosecond timestamps relative to a fixed epoch, as carried in packets.

use std::time::{Duration, Instant};

/// Monotonic nanosecond clock.
///
/// Timestamps are only comparable between readings of the same clock (or
/// clones of it). They never go backwards.
#[derive(Clone, Copy, Debug)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl MonotonicClock {
    /// Creates a clock whose epoch is now.
    #[must_use]
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    /// Nanoseconds since the epoch. Never returns 0.
    #[must_use]
    pub fn now_ns(&self) -> u64 {
        Self::to_ns(self.epoch.elapsed()).max(1)
    }

    /// Nanoseconds from the epoch to `instant` (0 if it precedes the epoch).
    #[must_use]
    pub fn ns_at(&self, instant: Instant) -> u64 {
        Self::to_ns(instant.saturating_duration_since(self.epoch))
    }

    fn to_ns(elapsed: Duration) -> u64 {
        u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX)
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
    fn test_clock_is_monotonic() {
        let clock = MonotonicClock::new();
        let mut last = clock.now_ns();
        assert!(last >= 1);
        for _ in 0..1000 {
            let now = clock.now_ns();
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn test_copies_share_epoch() {
        let clock = MonotonicClock::new();
        std::thread::sleep(Duration::from_millis(2));
        let copy = clock;
        assert!(copy.now_ns() >= 2_000_000);
        assert_eq!(clock.ns_at(clock.epoch), 0);
    }
}
