//! Exponential backoff schedule for retried operations
//!
//! Poll loops and client workers share the same retry shape: delay grows as
//! `base * multiplier^attempt`, clamped at a maximum, and a success resets
//! the attempt counter.

use std::time::Duration;

/// Exponential backoff state for one retried operation.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    multiplier: f64,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, multiplier: f64, max: Duration) -> Self {
        Self {
            base,
            multiplier,
            max,
            attempt: 0,
        }
    }

    /// The delay before the next retry, advancing the attempt counter.
    pub fn next_delay(&mut self) -> Duration {
        let factor = self.multiplier.powi(self.attempt as i32);
        let secs = (self.base.as_secs_f64() * factor).min(self.max.as_secs_f64());
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_secs_f64(secs)
    }

    /// Number of failures observed since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Reset after a success.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

impl Default for Backoff {
    /// 10 s base, doubling, clamped at 5 minutes.
    fn default() -> Self {
        Self::new(Duration::from_secs(10), 2.0, Duration::from_secs(300))
    }
}
