//! # Tick Loop
//!
//! Fixed-period scheduler for the two timer loops: tick production on the
//! arbiter and tick dispatch on the client.
//!
//! ## Design
//!
//! - Accumulator based, so a slow tick does not shift the schedule
//! - Sleeps between ticks (no spinning)
//! - A backlog longer than two periods is dropped instead of replayed in a
//!   burst

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Fixed-period tick loop controller.
pub struct TickLoop {
    /// Target tick duration.
    tick_duration: Duration,
    /// Time of last accumulator update.
    last_tick: Instant,
    /// Accumulated time not yet consumed by ticks.
    accumulator: Duration,
    /// Total ticks executed.
    tick_count: u64,
    /// Timing statistics.
    stats: TickStats,
}

/// Tick timing statistics.
#[derive(Clone, Copy, Debug, Default)]
pub struct TickStats {
    /// Minimum tick duration observed.
    pub min_tick_us: u64,
    /// Maximum tick duration observed.
    pub max_tick_us: u64,
    /// Average tick duration (rolling).
    pub avg_tick_us: u64,
    /// Number of late ticks (took longer than the period).
    pub late_ticks: u64,
    /// Periods skipped because the loop fell behind.
    pub skipped_ticks: u64,
    /// Total ticks measured.
    pub total_ticks: u64,
}

impl TickLoop {
    /// Creates a tick loop with the given period.
    #[must_use]
    pub fn new(tick_duration: Duration) -> Self {
        let tick_duration = tick_duration.max(Duration::from_micros(1));
        Self {
            tick_duration,
            last_tick: Instant::now(),
            accumulator: Duration::ZERO,
            tick_count: 0,
            stats: TickStats {
                min_tick_us: u64::MAX,
                ..TickStats::default()
            },
        }
    }

    /// Returns true if it's time to execute a tick.
    ///
    /// Call this in a loop until it returns false.
    #[must_use]
    pub fn should_tick(&mut self) -> bool {
        let now = Instant::now();
        self.accumulator += now.duration_since(self.last_tick);
        self.last_tick = now;

        let backlog_limit = self.tick_duration * 2;
        if self.accumulator > backlog_limit {
            let skipped = self.accumulator.as_nanos() / self.tick_duration.as_nanos() - 1;
            self.stats.skipped_ticks += u64::try_from(skipped).unwrap_or(u64::MAX);
            self.accumulator = self.tick_duration;
        }

        self.accumulator >= self.tick_duration
    }

    /// Marks the start of a tick.
    ///
    /// Returns the tick start time for duration measurement.
    #[must_use]
    pub fn begin_tick(&mut self) -> Instant {
        self.accumulator = self.accumulator.saturating_sub(self.tick_duration);
        self.tick_count += 1;
        Instant::now()
    }

    /// Marks the end of a tick and records its duration.
    pub fn end_tick(&mut self, start: Instant) {
        let duration = start.elapsed();
        let duration_us = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);

        self.stats.total_ticks += 1;
        self.stats.min_tick_us = self.stats.min_tick_us.min(duration_us);
        self.stats.max_tick_us = self.stats.max_tick_us.max(duration_us);
        self.stats.avg_tick_us = (self.stats.avg_tick_us * 15 + duration_us) / 16;

        if duration > self.tick_duration {
            self.stats.late_ticks += 1;
        }
    }

    /// Sleeps until the next tick is due.
    pub fn wait_for_next_tick(&self) {
        let pending = self.accumulator + self.last_tick.elapsed();
        if pending < self.tick_duration {
            std::thread::sleep(self.tick_duration - pending);
        }
    }

    /// Runs `on_tick` once per period until `running` is cleared.
    ///
    /// The flag is checked before every tick, so shutdown takes at most one
    /// period plus the duration of the tick in progress.
    pub fn run(&mut self, running: &AtomicBool, mut on_tick: impl FnMut(u64)) {
        while running.load(Ordering::Acquire) {
            self.wait_for_next_tick();
            while running.load(Ordering::Acquire) && self.should_tick() {
                let start = self.begin_tick();
                on_tick(self.tick_count);
                self.end_tick(start);
            }
        }
    }

    /// Returns the number of ticks executed.
    #[must_use]
    pub const fn tick_count(&self) -> u64 {
        self.tick_count
    }

    /// Returns tick statistics.
    #[must_use]
    pub const fn stats(&self) -> &TickStats {
        &self.stats
    }

    /// Returns the tick period.
    #[must_use]
    pub const fn tick_duration(&self) -> Duration {
        self.tick_duration
    }
}
