// src/api/market.rs
//! Market and explorer data clients.
//!
//! Each upstream gets its own `CachedRateLimitedClient` with an injected
//! policy. Two presets cover what the dashboard talks to:
//! - price feed: 5 min fresh, 30 min stale, 2 requests / 60 s
//! - explorer:   5 min TTL only, no local rate limit

use crate::api::backoff::BackoffStrategy;
use crate::api::cache::{CacheMetrics, CachePolicy};
use crate::api::client::{CachedClientConfig, CachedRateLimitedClient, RetryConfig, Served};
use crate::api::http::{fingerprint, HttpTransport};
use crate::api::rate_limiter::{RateLimitConfig, RateLimitStats};
use crate::error::DashboardError;
use log::info;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Configuration for one HTTP upstream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamConfig {
    pub name: String,
    pub base_url: String,
    pub cache: CachePolicy,
    pub rate_limit: Option<RateLimitConfig>,
    pub retry: RetryConfig,
}

impl UpstreamConfig {
    /// Rate-limited price API with a stale fallback tier
    pub fn price_feed(base_url: impl Into<String>) -> Self {
        Self {
            name: "price-feed".to_string(),
            base_url: base_url.into(),
            cache: CachePolicy::with_stale(Duration::from_secs(5 * 60), Duration::from_secs(30 * 60)),
            rate_limit: Some(RateLimitConfig::per_minute(2)),
            retry: RetryConfig::default(),
        }
    }

    /// Explorer/analytics API with plain TTL caching
    pub fn explorer(base_url: impl Into<String>) -> Self {
        Self {
            name: "explorer".to_string(),
            base_url: base_url.into(),
            cache: CachePolicy::ttl_only(Duration::from_secs(5 * 60)),
            rate_limit: None,
            retry: RetryConfig {
                max_retries: 3,
                backoff: BackoffStrategy::default(),
            },
        }
    }

    fn client_config(&self) -> CachedClientConfig {
        CachedClientConfig {
            name: self.name.clone(),
            cache: self.cache.clone(),
            rate_limit: self.rate_limit.clone(),
            retry: self.retry.clone(),
        }
    }
}

/// JSON API client for one upstream
#[derive(Clone)]
pub struct MarketDataClient {
    base_url: String,
    transport: Arc<dyn HttpTransport>,
    client: CachedRateLimitedClient<Value>,
}

impl MarketDataClient {
    pub fn new(config: UpstreamConfig, transport: Arc<dyn HttpTransport>) -> Self {
        info!(
            "📈 {} client for {} (fresh {:?}, stale {:?}, limit {:?})",
            config.name,
            config.base_url,
            config.cache.fresh_ttl,
            config.cache.stale_ttl,
            config.rate_limit
        );

        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            client: CachedRateLimitedClient::new(config.client_config()),
            transport,
        }
    }

    pub fn name(&self) -> &str {
        self.client.name()
    }

    /// GET `path` with `params`, through the cache and limiter
    pub async fn get_json(
        &self,
        path: &str,
        params: &[(&str, &str)],
        cancel: &CancellationToken,
    ) -> Result<Served<Value>, DashboardError> {
        let key = fingerprint("GET", path, params);
        let url = format!("{}{}", self.base_url, path);
        let query: Vec<(String, String)> = params
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();

        let transport = &self.transport;
        let url = &url;
        let query = &query;
        self.client
            .request(&key, cancel, move || async move {
                transport
                    .get_json(url, query)
                    .await
                    .map(|response| response.body)
            })
            .await
    }

    /// Simple-price lookup, e.g. `token_price("polkadot", "usd")`
    pub async fn token_price(
        &self,
        token_id: &str,
        vs_currency: &str,
        cancel: &CancellationToken,
    ) -> Result<Served<f64>, DashboardError> {
        let served = self
            .get_json(
                "/simple/price",
                &[("ids", token_id), ("vs_currencies", vs_currency)],
                cancel,
            )
            .await?;

        let price = served
            .data
            .get(token_id)
            .and_then(|prices| prices.get(vs_currency))
            .and_then(Value::as_f64)
            .ok_or_else(|| {
                DashboardError::Parse(format!(
                    "No {} price for {} in response",
                    vs_currency, token_id
                ))
            })?;

        Ok(served.map(|_| price))
    }

    pub async fn cache_metrics(&self) -> CacheMetrics {
        self.client.cache_metrics().await
    }

    pub async fn rate_limit_stats(&self) -> Option<RateLimitStats> {
        self.client.rate_limit_stats().await
    }

    pub async fn purge_expired(&self) -> usize {
        self.client.purge_expired().await
    }
}
