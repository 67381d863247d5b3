// src/api/rate_limiter.rs
//! Sliding-window rate limiter for third-party API budgets.
//!
//! Each window key (an upstream name, an endpoint, a client address) keeps
//! the timestamps of the requests counted against it. Timestamps older than
//! the window are pruned lazily on every check; there is no sweeper task.
//! A request that would exceed the budget is rejected and NOT recorded.

use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Rate limit configuration for one upstream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub max_requests_per_window: u32,
}

impl RateLimitConfig {
    pub fn new(window: Duration, max_requests_per_window: u32) -> Self {
        Self {
            window,
            max_requests_per_window,
        }
    }

    /// 60 second window with a small request budget
    pub fn per_minute(max_requests_per_window: u32) -> Self {
        Self::new(Duration::from_secs(60), max_requests_per_window)
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        // Free-tier price feed budget
        Self::per_minute(2)
    }
}

/// Outcome of a limiter check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// Request recorded against the window
    Allowed,
    /// Budget exhausted; the oldest entry leaves the window after `retry_after`
    Limited { retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed)
    }
}

/// Sliding-window limiter shared by every caller of the same instance
#[derive(Clone)]
pub struct SlidingWindowRateLimiter {
    config: RateLimitConfig,
    windows: Arc<Mutex<HashMap<String, VecDeque<Instant>>>>,
    provider_name: String,
}

impl SlidingWindowRateLimiter {
    /// Create a new rate limiter for the specified provider
    pub fn new(provider_name: impl Into<String>, config: RateLimitConfig) -> Self {
        let provider_name = provider_name.into();
        debug!(
            "🚦 Rate limiter for {}: {} req / {:?}",
            provider_name, config.max_requests_per_window, config.window
        );

        Self {
            config,
            windows: Arc::new(Mutex::new(HashMap::new())),
            provider_name,
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Check the window for `key` and record the request if within budget
    pub async fn try_acquire(&self, key: &str) -> RateDecision {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        let window = windows.entry(key.to_string()).or_default();
        Self::prune(window, now, self.config.window);

        if (window.len() as u32) < self.config.max_requests_per_window {
            window.push_back(now);
            debug!(
                "✅ {} request allowed for '{}' ({}/{})",
                self.provider_name,
                key,
                window.len(),
                self.config.max_requests_per_window
            );
            return RateDecision::Allowed;
        }

        let retry_after = Self::retry_after(window, now, self.config.window);
        debug!(
            "⚠️ {} window full for '{}' ({}/{}), retry after {:?}",
            self.provider_name,
            key,
            window.len(),
            self.config.max_requests_per_window,
            retry_after
        );
        RateDecision::Limited { retry_after }
    }

    /// Time until a request for `key` would be allowed, without recording anything
    pub async fn time_until_available(&self, key: &str) -> Duration {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        let Some(window) = windows.get_mut(key) else {
            return Duration::ZERO;
        };
        Self::prune(window, now, self.config.window);

        if (window.len() as u32) < self.config.max_requests_per_window {
            Duration::ZERO
        } else {
            Self::retry_after(window, now, self.config.window)
        }
    }

    /// Get current usage statistics for `key`
    pub async fn usage_stats(&self, key: &str) -> RateLimitStats {
        let now = Instant::now();
        let mut windows = self.windows.lock().await;
        let requests_in_window = match windows.get_mut(key) {
            Some(window) => {
                Self::prune(window, now, self.config.window);
                window.len() as u32
            }
            None => 0,
        };

        RateLimitStats {
            provider_name: self.provider_name.clone(),
            window_key: key.to_string(),
            requests_in_window,
            max_requests_per_window: self.config.max_requests_per_window,
            window: self.config.window,
        }
    }

    fn prune(window: &mut VecDeque<Instant>, now: Instant, size: Duration) {
        while let Some(front) = window.front() {
            if now.duration_since(*front) >= size {
                window.pop_front();
            } else {
                break;
            }
        }
    }

    fn retry_after(window: &VecDeque<Instant>, now: Instant, size: Duration) -> Duration {
        // An empty full window only happens with a zero budget
        match window.front() {
            Some(oldest) => size.saturating_sub(now.duration_since(*oldest)),
            None => size,
        }
    }
}

/// Rate limiting statistics
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitStats {
    pub provider_name: String,
    pub window_key: String,
    pub requests_in_window: u32,
    pub max_requests_per_window: u32,
    pub window: Duration,
}

impl std::fmt::Display for RateLimitStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}[{}]: {}/{} per {}s",
            self.provider_name,
            self.window_key,
            self.requests_in_window,
            self.max_requests_per_window,
            self.window.as_secs()
        )
    }
}

/// Whole seconds a caller should wait, never zero for a rejected request
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
    secs.max(1)
}
