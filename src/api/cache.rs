// src/api/cache.rs
//! In-memory response cache with a fresh tier and an optional stale tier.
//!
//! Entry freshness is a pure function of its age:
//! - `Fresh`   when `age <  fresh_ttl`
//! - `Stale`   when `fresh_ttl <= age < stale_ttl`
//! - `Expired` when `age >= stale_ttl` (removed on the next lookup)
//!
//! A TTL-only policy sets `stale_ttl == fresh_ttl`, so entries go straight
//! from `Fresh` to `Expired`.

use log::debug;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Cache policy for one upstream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachePolicy {
    pub fresh_ttl: Duration,
    pub stale_ttl: Duration,
}

impl CachePolicy {
    /// Fresh-only caching, no stale fallback
    pub fn ttl_only(fresh_ttl: Duration) -> Self {
        Self {
            fresh_ttl,
            stale_ttl: fresh_ttl,
        }
    }

    /// Fresh tier plus a stale-but-usable tier; `stale_ttl` is clamped to at least `fresh_ttl`
    pub fn with_stale(fresh_ttl: Duration, stale_ttl: Duration) -> Self {
        Self {
            fresh_ttl,
            stale_ttl: stale_ttl.max(fresh_ttl),
        }
    }

    pub fn has_stale_tier(&self) -> bool {
        self.stale_ttl > self.fresh_ttl
    }

    /// Classify an entry of the given age
    pub fn freshness(&self, age: Duration) -> Freshness {
        if age < self.fresh_ttl {
            Freshness::Fresh
        } else if age < self.stale_ttl {
            Freshness::Stale
        } else {
            Freshness::Expired
        }
    }
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self::with_stale(Duration::from_secs(5 * 60), Duration::from_secs(30 * 60))
    }
}

/// Age tier of a cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale,
    Expired,
}

/// Cached value with the time it was stored
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
    pub data: T,
    pub stored_at: Instant,
}

impl<T> CacheEntry<T> {
    pub fn new(data: T) -> Self {
        Self {
            data,
            stored_at: Instant::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.stored_at.elapsed()
    }
}

/// Result of a cache lookup
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup<T> {
    Fresh(T),
    Stale(T),
    Miss,
}

/// Cache metrics for monitoring
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub stale_hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub total_entries: usize,
}

impl CacheMetrics {
    /// Fraction of lookups answered with fresh data
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.stale_hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct CacheStorage<T> {
    entries: HashMap<String, CacheEntry<T>>,
    metrics: CacheMetrics,
}

/// Process-wide response cache keyed by request fingerprint
#[derive(Clone)]
pub struct ResponseCache<T> {
    policy: CachePolicy,
    storage: Arc<Mutex<CacheStorage<T>>>,
}

impl<T: Clone> ResponseCache<T> {
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            policy,
            storage: Arc::new(Mutex::new(CacheStorage {
                entries: HashMap::new(),
                metrics: CacheMetrics::default(),
            })),
        }
    }

    pub fn policy(&self) -> &CachePolicy {
        &self.policy
    }

    /// Look up `key`, evicting it first if it has expired
    pub async fn lookup(&self, key: &str) -> CacheLookup<T> {
        let mut storage = self.storage.lock().await;
        let freshness = storage
            .entries
            .get(key)
            .map(|entry| self.policy.freshness(entry.age()));

        match freshness {
            Some(Freshness::Fresh) => {
                storage.metrics.hits += 1;
                debug!("🎯 Cache HIT for {}", key);
                CacheLookup::Fresh(storage.entries[key].data.clone())
            }
            Some(Freshness::Stale) => {
                storage.metrics.stale_hits += 1;
                debug!("🕰️ Cache STALE for {}", key);
                CacheLookup::Stale(storage.entries[key].data.clone())
            }
            Some(Freshness::Expired) => {
                storage.entries.remove(key);
                storage.metrics.evictions += 1;
                storage.metrics.misses += 1;
                debug!("⏰ Cache entry expired for {}", key);
                CacheLookup::Miss
            }
            None => {
                storage.metrics.misses += 1;
                debug!("📡 Cache MISS for {}", key);
                CacheLookup::Miss
            }
        }
    }

    /// Classify `key` without counting it in the metrics or evicting it
    pub async fn peek(&self, key: &str) -> CacheLookup<T> {
        let storage = self.storage.lock().await;
        match storage.entries.get(key) {
            Some(entry) => match self.policy.freshness(entry.age()) {
                Freshness::Fresh => CacheLookup::Fresh(entry.data.clone()),
                Freshness::Stale => CacheLookup::Stale(entry.data.clone()),
                Freshness::Expired => CacheLookup::Miss,
            },
            None => CacheLookup::Miss,
        }
    }

    /// Only fresh data, without touching stale entries
    pub async fn get_fresh(&self, key: &str) -> Option<T> {
        match self.lookup(key).await {
            CacheLookup::Fresh(data) => Some(data),
            _ => None,
        }
    }

    /// Store or refresh `key` with `stored_at = now`
    pub async fn store(&self, key: &str, data: T) {
        let mut storage = self.storage.lock().await;
        storage.entries.insert(key.to_string(), CacheEntry::new(data));
        debug!("💾 Cached {} (cache size: {})", key, storage.entries.len());
    }

    pub async fn invalidate(&self, key: &str) -> bool {
        self.storage.lock().await.entries.remove(key).is_some()
    }

    /// Drop every expired entry, returning how many were removed
    pub async fn purge_expired(&self) -> usize {
        let mut storage = self.storage.lock().await;
        let before = storage.entries.len();
        let policy = &self.policy;
        storage
            .entries
            .retain(|_, entry| policy.freshness(entry.age()) != Freshness::Expired);
        let removed = before - storage.entries.len();
        storage.metrics.evictions += removed as u64;
        removed
    }

    pub async fn len(&self) -> usize {
        self.storage.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Get current cache metrics
    pub async fn metrics(&self) -> CacheMetrics {
        let storage = self.storage.lock().await;
        let mut metrics = storage.metrics.clone();
        metrics.total_entries = storage.entries.len();
        metrics
    }
}
