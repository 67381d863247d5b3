// src/config/settings.rs
use crate::api::backoff::{BackoffKind, BackoffStrategy};
use crate::api::cache::CachePolicy;
use crate::api::client::RetryConfig;
use crate::api::market::UpstreamConfig;
use crate::api::rate_limiter::RateLimitConfig;
use crate::chain::manager::ConnectionConfig;
use crate::chain::ws::DEFAULT_REQUIRED_METHODS;
use crate::error::DashboardError;
use std::env;
use std::time::Duration;

const DEFAULT_RPC_ENDPOINTS: &str =
    "wss://rpc.polkadot.io,wss://polkadot-rpc.dwellir.com,wss://polkadot.api.onfinality.io/public-ws";
const DEFAULT_PRICE_API_URL: &str = "https://api.coingecko.com/api/v3";
const DEFAULT_EXPLORER_API_URL: &str = "https://polkadot.api.subscan.io/api";
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(60);
const MAX_HTTP_RETRY_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub rpc_endpoints: Vec<String>,
    pub rpc_max_attempts: u32,
    pub rpc_reconnect_delay_ms: u64,
    pub rpc_reconnect_backoff: BackoffKind,
    pub rpc_handshake_timeout_secs: u64,
    pub rpc_required_methods: Vec<String>,
    pub price_api_url: String,
    pub price_fresh_ttl_secs: u64,
    pub price_stale_ttl_secs: u64,
    pub price_rate_window_secs: u64,
    pub price_max_requests_per_window: u32,
    pub explorer_api_url: String,
    pub explorer_ttl_secs: u64,
    pub http_max_retries: u32,
    pub http_retry_base_delay_ms: u64,
    pub log_level: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from any key/value source. Unparseable values fall back to defaults.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let number = |key: &str, default: u64| -> u64 {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };
        let count = |key: &str, default: u32| -> u32 {
            lookup(key)
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(default)
        };
        let list = |key: &str, default: &str| -> Vec<String> {
            lookup(key)
                .unwrap_or_else(|| default.to_string())
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        };

        Config {
            rpc_endpoints: list("RPC_ENDPOINTS", DEFAULT_RPC_ENDPOINTS),
            rpc_max_attempts: count("RPC_MAX_ATTEMPTS", 5),
            rpc_reconnect_delay_ms: number("RPC_RECONNECT_DELAY_MS", 2000),
            rpc_reconnect_backoff: match lookup("RPC_RECONNECT_BACKOFF")
                .map(|v| v.trim().to_ascii_lowercase())
                .as_deref()
            {
                Some("exponential") => BackoffKind::Exponential,
                _ => BackoffKind::Fixed,
            },
            rpc_handshake_timeout_secs: number("RPC_HANDSHAKE_TIMEOUT_SECS", 60),
            rpc_required_methods: list(
                "RPC_REQUIRED_METHODS",
                &DEFAULT_REQUIRED_METHODS.join(","),
            ),
            price_api_url: lookup("PRICE_API_URL")
                .unwrap_or_else(|| DEFAULT_PRICE_API_URL.to_string()),
            price_fresh_ttl_secs: number("PRICE_FRESH_TTL_SECS", 300),
            price_stale_ttl_secs: number("PRICE_STALE_TTL_SECS", 1800),
            price_rate_window_secs: number("PRICE_RATE_WINDOW_SECS", 60),
            price_max_requests_per_window: count("PRICE_MAX_REQUESTS_PER_WINDOW", 2),
            explorer_api_url: lookup("EXPLORER_API_URL")
                .unwrap_or_else(|| DEFAULT_EXPLORER_API_URL.to_string()),
            explorer_ttl_secs: number("EXPLORER_TTL_SECS", 300),
            http_max_retries: count("HTTP_MAX_RETRIES", 3),
            http_retry_base_delay_ms: number("HTTP_RETRY_BASE_DELAY_MS", 500),
            log_level: lookup("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
        }
    }

    pub fn validate(&self) -> Result<(), DashboardError> {
        if self.rpc_endpoints.is_empty() {
            return Err(DashboardError::Config(
                "RPC_ENDPOINTS cannot be empty".to_string(),
            ));
        }
        for endpoint in &self.rpc_endpoints {
            let parsed = url::Url::parse(endpoint)?;
            if !matches!(parsed.scheme(), "ws" | "wss") {
                return Err(DashboardError::Config(format!(
                    "RPC endpoint {} must use ws:// or wss://",
                    endpoint
                )));
            }
        }
        if self.rpc_max_attempts == 0 {
            return Err(DashboardError::Config(
                "RPC_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        url::Url::parse(&self.price_api_url)?;
        url::Url::parse(&self.explorer_api_url)?;
        if self.price_stale_ttl_secs < self.price_fresh_ttl_secs {
            return Err(DashboardError::Config(format!(
                "PRICE_STALE_TTL_SECS ({}) must not be shorter than PRICE_FRESH_TTL_SECS ({})",
                self.price_stale_ttl_secs, self.price_fresh_ttl_secs
            )));
        }
        if self.price_max_requests_per_window == 0 || self.price_rate_window_secs == 0 {
            return Err(DashboardError::Config(
                "Price rate limit needs a non-zero window and at least 1 request".to_string(),
            ));
        }
        Ok(())
    }

    pub fn validate_and_log(&self) {
        log::info!("Application Configuration Loaded: {:?}", self);
        if let Err(e) = self.validate() {
            log::error!("{}", e);
        }
    }

    pub fn log_level_filter(&self) -> log::LevelFilter {
        self.log_level.parse().unwrap_or(log::LevelFilter::Info)
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        let delay = Duration::from_millis(self.rpc_reconnect_delay_ms);
        let reconnect_backoff = match self.rpc_reconnect_backoff {
            BackoffKind::Fixed => BackoffStrategy::fixed(delay),
            BackoffKind::Exponential => {
                BackoffStrategy::exponential(delay, MAX_RECONNECT_DELAY.max(delay))
            }
        };

        ConnectionConfig {
            endpoints: self.rpc_endpoints.clone(),
            max_attempts: self.rpc_max_attempts,
            reconnect_backoff,
            handshake_timeout: Duration::from_secs(self.rpc_handshake_timeout_secs),
        }
    }

    pub fn price_feed_upstream(&self) -> UpstreamConfig {
        UpstreamConfig {
            cache: CachePolicy::with_stale(
                Duration::from_secs(self.price_fresh_ttl_secs),
                Duration::from_secs(self.price_stale_ttl_secs),
            ),
            rate_limit: Some(RateLimitConfig::new(
                Duration::from_secs(self.price_rate_window_secs),
                self.price_max_requests_per_window,
            )),
            retry: self.retry_config(),
            ..UpstreamConfig::price_feed(self.price_api_url.clone())
        }
    }

    pub fn explorer_upstream(&self) -> UpstreamConfig {
        UpstreamConfig {
            cache: CachePolicy::ttl_only(Duration::from_secs(self.explorer_ttl_secs)),
            retry: self.retry_config(),
            ..UpstreamConfig::explorer(self.explorer_api_url.clone())
        }
    }

    fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.http_max_retries,
            backoff: BackoffStrategy::exponential(
                Duration::from_millis(self.http_retry_base_delay_ms),
                MAX_HTTP_RETRY_DELAY,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]);
        assert_eq!(config.rpc_endpoints.len(), 3);
        assert_eq!(config.rpc_max_attempts, 5);
        assert_eq!(config.rpc_reconnect_backoff, BackoffKind::Fixed);
        assert_eq!(config.price_max_requests_per_window, 2);
        assert!(config.validate().is_ok());

        let connection = config.connection_config();
        assert_eq!(connection.max_attempts, 5);
        assert_eq!(connection.handshake_timeout, Duration::from_secs(60));
        assert_eq!(connection.reconnect_backoff.delay_for(3), Duration::from_secs(2));
    }

    #[test]
    fn test_overrides_and_list_parsing() {
        let config = config_from(&[
            ("RPC_ENDPOINTS", " ws://a:9944 , wss://b ,"),
            ("RPC_RECONNECT_BACKOFF", "Exponential"),
            ("RPC_RECONNECT_DELAY_MS", "100"),
            ("PRICE_FRESH_TTL_SECS", "10"),
            ("PRICE_STALE_TTL_SECS", "20"),
            ("HTTP_MAX_RETRIES", "not-a-number"),
        ]);

        assert_eq!(config.rpc_endpoints, vec!["ws://a:9944", "wss://b"]);
        assert_eq!(config.http_max_retries, 3);

        let backoff = config.connection_config().reconnect_backoff;
        assert_eq!(backoff.delay_for(0), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(400));

        let price = config.price_feed_upstream();
        assert_eq!(price.name, "price-feed");
        assert_eq!(price.cache.fresh_ttl, Duration::from_secs(10));
        assert_eq!(price.cache.stale_ttl, Duration::from_secs(20));
    }

    #[test]
    fn test_explorer_upstream_is_unlimited_with_ttl_only_cache() {
        let config = config_from(&[
            ("EXPLORER_API_URL", "https://explorer.test/api"),
            ("EXPLORER_TTL_SECS", "120"),
            ("HTTP_MAX_RETRIES", "1"),
        ]);

        let explorer = config.explorer_upstream();
        assert_eq!(explorer.base_url, "https://explorer.test/api");
        assert_eq!(explorer.rate_limit, None);
        assert_eq!(explorer.cache, CachePolicy::ttl_only(Duration::from_secs(120)));
        assert_eq!(explorer.retry.max_retries, 1);
    }

    #[test]
    fn test_validation_failures() {
        let http_endpoint = config_from(&[("RPC_ENDPOINTS", "https://rpc.polkadot.io")]);
        assert!(matches!(http_endpoint.validate(), Err(DashboardError::Config(_))));

        let empty = config_from(&[("RPC_ENDPOINTS", " , ")]);
        assert!(matches!(empty.validate(), Err(DashboardError::Config(_))));

        let inverted = config_from(&[
            ("PRICE_FRESH_TTL_SECS", "600"),
            ("PRICE_STALE_TTL_SECS", "60"),
        ]);
        assert!(matches!(inverted.validate(), Err(DashboardError::Config(_))));

        let unlimited = config_from(&[("PRICE_MAX_REQUESTS_PER_WINDOW", "0")]);
        assert!(unlimited.validate().is_err());
    }
}
