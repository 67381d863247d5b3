// src/api/client.rs
//! Cached, rate-limited decorator around outbound API calls.
//!
//! Request flow for one fingerprint:
//! 1. fresh cache entry -> served from memory, limiter untouched
//! 2. limiter allows     -> live fetch (with retries), result cached
//! 3. limiter rejects    -> stale entry if any, else `RateLimitExceeded`
//!
//! Upstream 429 responses are treated exactly like step 3 and never retried.
//! Identical concurrent requests are coalesced so only one reaches the network.

use crate::api::backoff::BackoffStrategy;
use crate::api::cache::{CacheLookup, CacheMetrics, CachePolicy, ResponseCache};
use crate::api::http::FetchError;
use crate::api::rate_limiter::{
    retry_after_secs, RateDecision, RateLimitConfig, RateLimitStats, SlidingWindowRateLimiter,
};
use crate::error::DashboardError;
use dashmap::DashMap;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Used when an upstream 429 carries no Retry-After and no local limiter is configured
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Where a response came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ServedFrom {
    Fresh,
    Stale,
    Live,
}

/// Response data tagged with its origin
#[derive(Debug, Clone, PartialEq)]
pub struct Served<T> {
    pub data: T,
    pub served_from: ServedFrom,
}

impl<T> Served<T> {
    pub fn new(data: T, served_from: ServedFrom) -> Self {
        Self { data, served_from }
    }

    pub fn is_possibly_stale(&self) -> bool {
        self.served_from == ServedFrom::Stale
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Served<U> {
        Served {
            data: f(self.data),
            served_from: self.served_from,
        }
    }
}

/// Retry policy for calls that reach the network
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub backoff: BackoffStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff: BackoffStrategy::default(),
        }
    }
}

/// Policy set for one upstream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedClientConfig {
    pub name: String,
    pub cache: CachePolicy,
    /// `None` disables rate limiting for this upstream
    pub rate_limit: Option<RateLimitConfig>,
    pub retry: RetryConfig,
}

/// Claim on one fingerprint's coalescing lock. Dropping it removes the map
/// entry once no other caller holds the lock, even if the request future was
/// abandoned mid-flight.
struct InFlightSlot<'a> {
    in_flight: &'a DashMap<String, Arc<Mutex<()>>>,
    fingerprint: &'a str,
    lock: Arc<Mutex<()>>,
}

impl<'a> InFlightSlot<'a> {
    fn claim(in_flight: &'a DashMap<String, Arc<Mutex<()>>>, fingerprint: &'a str) -> Self {
        let lock = in_flight.entry(fingerprint.to_string()).or_default().clone();
        Self {
            in_flight,
            fingerprint,
            lock,
        }
    }
}

impl Drop for InFlightSlot<'_> {
    fn drop(&mut self) {
        // Two references left means the map's and ours
        self.in_flight.remove_if(self.fingerprint, |_, lock| {
            Arc::ptr_eq(lock, &self.lock) && Arc::strong_count(lock) == 2
        });
    }
}

enum FetchFailure {
    RateLimited(Option<Duration>),
    Failed(DashboardError),
}

/// Cache + limiter + retry wrapper shared by every caller of one upstream
#[derive(Clone)]
pub struct CachedRateLimitedClient<T> {
    name: String,
    cache: ResponseCache<T>,
    limiter: Option<SlidingWindowRateLimiter>,
    retry: RetryConfig,
    in_flight: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl<T: Clone> CachedRateLimitedClient<T> {
    pub fn new(config: CachedClientConfig) -> Self {
        let limiter = config
            .rate_limit
            .map(|rate_limit| SlidingWindowRateLimiter::new(config.name.clone(), rate_limit));

        Self {
            cache: ResponseCache::new(config.cache),
            limiter,
            retry: config.retry,
            in_flight: Arc::new(DashMap::new()),
            name: config.name,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Serve `fingerprint` using the client's own window key
    pub async fn request<F, Fut>(
        &self,
        fingerprint: &str,
        cancel: &CancellationToken,
        fetch: F,
    ) -> Result<Served<T>, DashboardError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let window_key = self.name.clone();
        self.request_keyed(&window_key, fingerprint, cancel, fetch)
            .await
    }

    /// Serve `fingerprint`, counting a live fetch against `window_key`
    pub async fn request_keyed<F, Fut>(
        &self,
        window_key: &str,
        fingerprint: &str,
        cancel: &CancellationToken,
        fetch: F,
    ) -> Result<Served<T>, DashboardError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        if let CacheLookup::Fresh(data) = self.cache.lookup(fingerprint).await {
            return Ok(Served::new(data, ServedFrom::Fresh));
        }

        let slot = InFlightSlot::claim(&self.in_flight, fingerprint);
        let guard = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            guard = slot.lock.lock() => Some(guard),
        };
        match guard {
            Some(_guard) => {
                self.request_exclusive(window_key, fingerprint, cancel, fetch)
                    .await
            }
            None => Err(DashboardError::Cancelled),
        }
    }

    async fn request_exclusive<F, Fut>(
        &self,
        window_key: &str,
        fingerprint: &str,
        cancel: &CancellationToken,
        mut fetch: F,
    ) -> Result<Served<T>, DashboardError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        // A coalesced caller may find the entry its predecessor just stored
        let cached = match self.cache.peek(fingerprint).await {
            CacheLookup::Fresh(data) => return Ok(Served::new(data, ServedFrom::Fresh)),
            CacheLookup::Stale(data) => Some(data),
            CacheLookup::Miss => None,
        };

        if let Some(limiter) = &self.limiter {
            if let RateDecision::Limited { retry_after } = limiter.try_acquire(window_key).await {
                return self.fallback(fingerprint, cached, retry_after);
            }
        }

        match self.fetch_with_retry(fingerprint, cancel, &mut fetch).await {
            Ok(data) => {
                self.cache.store(fingerprint, data.clone()).await;
                Ok(Served::new(data, ServedFrom::Live))
            }
            Err(FetchFailure::RateLimited(upstream_retry_after)) => {
                let local = match &self.limiter {
                    Some(limiter) => Some(limiter.time_until_available(window_key).await),
                    None => None,
                };
                let retry_after = match (upstream_retry_after, local) {
                    (Some(upstream), Some(local)) => upstream.max(local),
                    (Some(upstream), None) => upstream,
                    (None, Some(local)) if !local.is_zero() => local,
                    _ => DEFAULT_RETRY_AFTER,
                };
                self.fallback(fingerprint, cached, retry_after)
            }
            Err(FetchFailure::Failed(err)) => Err(err),
        }
    }

    fn fallback(
        &self,
        fingerprint: &str,
        cached: Option<T>,
        retry_after: Duration,
    ) -> Result<Served<T>, DashboardError> {
        match cached {
            Some(data) => {
                warn!(
                    "🕰️ {} rate limited, serving stale data for {}",
                    self.name, fingerprint
                );
                Ok(Served::new(data, ServedFrom::Stale))
            }
            None => {
                warn!(
                    "🚫 {} rate limited and nothing cached for {} (retry after {:?})",
                    self.name, fingerprint, retry_after
                );
                Err(DashboardError::RateLimitExceeded {
                    retry_after_secs: retry_after_secs(retry_after),
                })
            }
        }
    }

    async fn fetch_with_retry<F, Fut>(
        &self,
        fingerprint: &str,
        cancel: &CancellationToken,
        fetch: &mut F,
    ) -> Result<T, FetchFailure>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchFailure::Failed(DashboardError::Cancelled)),
                result = fetch() => result,
            };

            let err = match result {
                Ok(data) => {
                    debug!("📥 {} live fetch for {} succeeded", self.name, fingerprint);
                    return Ok(data);
                }
                Err(err) if err.is_rate_limited() => {
                    return Err(FetchFailure::RateLimited(err.retry_after));
                }
                Err(err) => err,
            };

            if attempt >= self.retry.max_retries {
                warn!(
                    "❌ {} request {} failed after {} attempts: {}",
                    self.name,
                    fingerprint,
                    attempt + 1,
                    err
                );
                return Err(FetchFailure::Failed(DashboardError::Upstream {
                    status: err.status,
                    message: err.message,
                }));
            }

            let delay = self.retry.backoff.delay_for(attempt);
            warn!(
                "🔄 {} request {} failed (attempt {}/{}), retrying in {:?}: {}",
                self.name,
                fingerprint,
                attempt + 1,
                self.retry.max_retries + 1,
                delay,
                err
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(FetchFailure::Failed(DashboardError::Cancelled)),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    pub async fn invalidate(&self, fingerprint: &str) -> bool {
        self.cache.invalidate(fingerprint).await
    }

    pub async fn purge_expired(&self) -> usize {
        self.cache.purge_expired().await
    }

    pub async fn cache_metrics(&self) -> CacheMetrics {
        self.cache.metrics().await
    }

    /// Window usage for the client's own key, `None` when unlimited
    pub async fn rate_limit_stats(&self) -> Option<RateLimitStats> {
        match &self.limiter {
            Some(limiter) => Some(limiter.usage_stats(&self.name).await),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn strict_config() -> CachedClientConfig {
        CachedClientConfig {
            name: "prices".to_string(),
            cache: CachePolicy::with_stale(Duration::from_secs(300), Duration::from_secs(1800)),
            rate_limit: Some(RateLimitConfig::per_minute(2)),
            retry: RetryConfig {
                max_retries: 3,
                backoff: BackoffStrategy::exponential(
                    Duration::from_millis(100),
                    Duration::from_secs(5),
                ),
            },
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_fresh_hit_skips_network_and_limiter() {
        let client = CachedRateLimitedClient::new(strict_config());
        let calls = &AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let fetch = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, FetchError>(7.1_f64)
        };
        let first = client.request("GET:/price:DOT", &cancel, fetch).await.unwrap();
        assert_eq!(first.served_from, ServedFrom::Live);
        assert_eq!(client.rate_limit_stats().await.unwrap().requests_in_window, 1);

        tokio::time::advance(Duration::from_secs(240)).await;
        let fetch = move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok::<_, FetchError>(9.9_f64)
        };
        let second = client.request("GET:/price:DOT", &cancel, fetch).await.unwrap();
        assert_eq!(second, Served::new(7.1, ServedFrom::Fresh));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        // The fresh hit took no slot, and the first one has slid out of the window
        assert_eq!(client.rate_limit_stats().await.unwrap().requests_in_window, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_errors_retried_then_surfaced() {
        let client = CachedRateLimitedClient::<u32>::new(strict_config());
        let calls = &AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result = client
            .request("GET:/broken", &cancel, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<u32, _>(FetchError::status(503, "unavailable"))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(
            result,
            Err(DashboardError::Upstream {
                status: Some(503),
                message: "unavailable".to_string(),
            })
        );
        // All retries belong to one limiter entry
        assert_eq!(client.rate_limit_stats().await.unwrap().requests_in_window, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_recovers() {
        let client = CachedRateLimitedClient::new(strict_config());
        let calls = &AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let served = client
            .request("GET:/flaky", &cancel, move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(FetchError::network("connection reset"))
                } else {
                    Ok(5_u32)
                }
            })
            .await
            .unwrap();

        assert_eq!(served, Served::new(5, ServedFrom::Live));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_upstream_429_is_not_retried() {
        let client = CachedRateLimitedClient::<u32>::new(strict_config());
        let calls = &AtomicU32::new(0);
        let cancel = CancellationToken::new();

        let result = client
            .request("GET:/limited", &cancel, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<u32, _>(FetchError::too_many_requests(Some(Duration::from_secs(120))))
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            result,
            Err(DashboardError::RateLimitExceeded {
                retry_after_secs: 120
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_upstream_429_falls_back_to_stale() {
        let client = CachedRateLimitedClient::new(strict_config());
        let cancel = CancellationToken::new();

        client
            .request("GET:/price:KSM", &cancel, || async { Ok::<_, FetchError>(30_u32) })
            .await
            .unwrap();
        tokio::time::advance(Duration::from_secs(600)).await;

        let served = client
            .request("GET:/price:KSM", &cancel, || async {
                Err::<u32, _>(FetchError::too_many_requests(None))
            })
            .await
            .unwrap();
        assert_eq!(served, Served::new(30, ServedFrom::Stale));
        assert!(served.is_possibly_stale());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff() {
        let client = CachedRateLimitedClient::<u32>::new(strict_config());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();

        let result = client
            .request("GET:/slow", &cancel, || {
                let trigger = trigger.clone();
                async move {
                    trigger.cancel();
                    Err::<u32, _>(FetchError::network("timeout"))
                }
            })
            .await;

        assert_eq!(result, Err(DashboardError::Cancelled));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_requests_release_coalescing_slots() {
        let client = CachedRateLimitedClient::<u32>::new(CachedClientConfig {
            rate_limit: None,
            ..strict_config()
        });
        let cancel = CancellationToken::new();

        for i in 0..20 {
            let key = format!("GET:/slow:{}", i);
            let slow = client.request(&key, &cancel, || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok::<_, FetchError>(1_u32)
            });
            let result = tokio::time::timeout(Duration::from_millis(10), slow).await;
            assert!(result.is_err());
        }

        assert!(client.in_flight.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_caller_keeps_slot_alive() {
        let client = CachedRateLimitedClient::<u32>::new(strict_config());
        let cancel = CancellationToken::new();
        let slow = || async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok::<_, FetchError>(3_u32)
        };

        let (first, second) = tokio::join!(
            client.request("GET:/shared", &cancel, slow),
            async {
                tokio::task::yield_now().await;
                assert_eq!(client.in_flight.len(), 1);
                client.request("GET:/shared", &cancel, slow).await
            }
        );

        assert_eq!(first.unwrap().served_from, ServedFrom::Live);
        assert_eq!(second.unwrap().served_from, ServedFrom::Fresh);
        assert!(client.in_flight.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unlimited_client_never_rate_limits() {
        let mut config = strict_config();
        config.rate_limit = None;
        config.cache = CachePolicy::ttl_only(Duration::from_secs(300));
        let client = CachedRateLimitedClient::new(config);
        let cancel = CancellationToken::new();

        for i in 0..5_u32 {
            let key = format!("GET:/block:{}", i);
            let served = client
                .request(&key, &cancel, || async move { Ok::<_, FetchError>(i) })
                .await
                .unwrap();
            assert_eq!(served.served_from, ServedFrom::Live);
        }
        assert!(client.rate_limit_stats().await.is_none());
    }
}
