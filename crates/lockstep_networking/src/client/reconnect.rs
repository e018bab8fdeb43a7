//! Retry timer for the client's connection state machine.

use std::time::{Duration, Instant};

/// One-shot timer re-armed after every failed attempt.
#[derive(Clone, Copy, Debug)]
pub struct ReconnectTimer {
    interval: Duration,
    deadline: Option<Instant>,
    attempts: u64,
}

impl ReconnectTimer {
    /// Creates a disarmed timer.
    #[must_use]
    pub const fn new(interval: Duration) -> Self {
        Self {
            interval,
            deadline: None,
            attempts: 0,
        }
    }

    /// Schedules the next attempt one interval after `now`.
    pub fn arm(&mut self, now: Instant) {
        self.deadline = Some(now + self.interval);
    }

    /// Disarms the timer and resets the attempt counter.
    pub fn cancel(&mut self) {
        self.deadline = None;
        self.attempts = 0;
    }

    /// Returns true if an attempt is due. Counts the attempt.
    pub fn fire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                self.attempts += 1;
                true
            }
            _ => false,
        }
    }

    /// Time left before the next attempt, if armed.
    #[must_use]
    pub fn remaining(&self, now: Instant) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(now))
    }

    /// Returns true while an attempt is scheduled.
    #[must_use]
    pub const fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    /// Attempts fired since the last successful connection.
    #[must_use]
    pub const fn attempts(&self) -> u64 {
        self.attempts
    }
}
