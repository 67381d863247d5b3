// src/api/backoff.rs
//! Backoff strategies shared by the connection manager and the cached client.
//!
//! Endpoint failover defaults to a fixed delay, HTTP retries default to an
//! exponential delay. Both are plain values so callers can swap them.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How the delay grows between attempts
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum BackoffKind {
    /// Same delay after every failure
    Fixed,
    /// `base_delay * multiplier^attempt`, capped at `max_delay`
    Exponential,
}

/// Backoff strategy with optional jitter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackoffStrategy {
    pub kind: BackoffKind,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter_percent: f64, // 0.0 - 1.0
    pub enable_jitter: bool,
}

impl BackoffStrategy {
    /// Constant delay between attempts, no jitter
    pub fn fixed(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            base_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
            jitter_percent: 0.0,
            enable_jitter: false,
        }
    }

    /// Doubling delay starting at `base_delay`, no jitter
    pub fn exponential(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            base_delay,
            max_delay,
            backoff_multiplier: 2.0,
            jitter_percent: 0.0,
            enable_jitter: false,
        }
    }

    /// Enable ±`jitter_percent` jitter on every computed delay
    pub fn with_jitter(mut self, jitter_percent: f64) -> Self {
        self.jitter_percent = jitter_percent.clamp(0.0, 1.0);
        self.enable_jitter = self.jitter_percent > 0.0;
        self
    }

    /// Delay to wait after the failure numbered `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = match self.kind {
            BackoffKind::Fixed => self.base_delay,
            BackoffKind::Exponential => {
                let factor = self.backoff_multiplier.powi(attempt.min(32) as i32);
                let millis = (self.base_delay.as_millis() as f64 * factor)
                    .min(self.max_delay.as_millis() as f64);
                Duration::from_millis(millis as u64)
            }
        };

        if self.enable_jitter {
            self.add_jitter(delay)
        } else {
            delay
        }
    }

    /// Scale `delay` by a random factor in `1 ± jitter_percent`
    fn add_jitter(&self, delay: Duration) -> Duration {
        let random_value: f64 = rand::thread_rng().gen();
        let jitter_factor = 1.0 + (random_value - 0.5) * 2.0 * self.jitter_percent;
        let jittered_ms = (delay.as_millis() as f64 * jitter_factor) as u64;
        Duration::from_millis(jittered_ms)
    }
}

impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::exponential(Duration::from_millis(500), Duration::from_secs(30))
    }
}
