//! # Jitter Estimation
//!
//! Exponential moving average of inter-arrival period and jitter over a
//! stream of monotonic timestamps.
//!
//! ```text
//! g      = t - last
//! period = period * (1 - α) + α * g
//! jitter = jitter * (1 - α) + α * |g - period|
//! ```
//!
//! The client sizes its tick buffer from these estimates: it holds back
//! `floor(jitter / period)` ticks so that bursty arrival is smoothed out.

use crate::error::JitterError;

/// Exponentially smoothed period and jitter estimator.
#[derive(Clone, Debug)]
pub struct JitterCalculator {
    alpha: f64,
    last_timestamp: Option<u64>,
    period: f64,
    jitter: f64,
    samples: u64,
}

impl JitterCalculator {
    /// Creates an estimator with smoothing factor `alpha`.
    pub fn new(alpha: f64) -> Result<Self, JitterError> {
        Self::with_initial_period(alpha, 0)
    }

    /// Creates an estimator whose period estimate starts at `period_ns`
    /// instead of zero.
    pub fn with_initial_period(alpha: f64, period_ns: u64) -> Result<Self, JitterError> {
        if !(alpha > 0.0 && alpha < 1.0) {
            return Err(JitterError::InvalidAlpha(alpha));
        }
        Ok(Self {
            alpha,
            last_timestamp: None,
            period: period_ns as f64,
            jitter: 0.0,
            samples: 0,
        })
    }

    /// Creates an estimator resuming from known estimates, for example ones
    /// saved from an earlier session.
    pub fn with_estimates(alpha: f64, period_ns: u64, jitter_ns: u64) -> Result<Self, JitterError> {
        let mut calculator = Self::with_initial_period(alpha, period_ns)?;
        calculator.jitter = jitter_ns as f64;
        Ok(calculator)
    }

    /// Records one arrival.
    ///
    /// The first call only seeds the reference timestamp. Timestamps must be
    /// strictly increasing; a non-increasing one is rejected and the state is
    /// left untouched.
    pub fn record_event(&mut self, timestamp_ns: u64) -> Result<(), JitterError> {
        let Some(last) = self.last_timestamp else {
            self.last_timestamp = Some(timestamp_ns);
            return Ok(());
        };
        if timestamp_ns <= last {
            return Err(JitterError::NonMonotonic {
                previous: last,
                current: timestamp_ns,
            });
        }

        let gap = (timestamp_ns - last) as f64;
        self.period = self.period * (1.0 - self.alpha) + self.alpha * gap;
        self.jitter = self.jitter * (1.0 - self.alpha) + self.alpha * (gap - self.period).abs();
        self.last_timestamp = Some(timestamp_ns);
        self.samples += 1;
        Ok(())
    }

    /// Smoothed inter-arrival period in nanoseconds.
    #[inline]
    #[must_use]
    pub const fn period(&self) -> f64 {
        self.period
    }

    /// Smoothed jitter in nanoseconds.
    #[inline]
    #[must_use]
    pub const fn jitter(&self) -> f64 {
        self.jitter
    }

    /// Smoothing factor.
    #[inline]
    #[must_use]
    pub const fn alpha(&self) -> f64 {
        self.alpha
    }

    /// Number of gaps folded into the estimates.
    #[inline]
    #[must_use]
    pub const fn samples(&self) -> u64 {
        self.samples
    }

    /// Number of ticks to hold back: `floor(jitter / period)`, never negative.
    #[must_use]
    pub fn required_buffer_depth(&self) -> usize {
        if self.period <= 0.0 {
            return 0;
        }
        let depth = (self.jitter / self.period).floor();
        if depth.is_finite() && depth > 0.0 {
            #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let depth = depth as usize;
            depth
        } else {
            0
        }
    }
}
