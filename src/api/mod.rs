// src/api/mod.rs
//! HTTP API access for the dashboard
//!
//! - Sliding-window rate limiting per upstream
//! - Two-tier (fresh / stale) response caching
//! - Retries with configurable backoff
//! - Market and explorer clients built from the above

pub mod backoff;
pub mod cache;
pub mod client;
pub mod http;
pub mod market;
pub mod rate_limiter;

pub use backoff::{BackoffKind, BackoffStrategy};
pub use cache::{CacheLookup, CacheMetrics, CachePolicy, Freshness, ResponseCache};
pub use client::{CachedClientConfig, CachedRateLimitedClient, RetryConfig, Served, ServedFrom};
pub use http::{fingerprint, FetchError, HttpResponse, HttpTransport, ReqwestTransport};
pub use market::{MarketDataClient, UpstreamConfig};
pub use rate_limiter::{RateDecision, RateLimitConfig, RateLimitStats, SlidingWindowRateLimiter};
