//! Cached derived views and their invalidation
//!
//! Grouped views are cached under namespaced keys such as `clients:{viewer}`.
//! After a claim lands (or the detector sees one) every view that might show
//! the stale owner is evicted by pattern. A pattern ending in `*` matches by
//! prefix; anything else must match the key exactly.
//!
//! Invalidation failures are logged and swallowed. They never fail the claim
//! that triggered them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use clientsync_common::config::CacheConfig;
use clientsync_common::Result;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Whether `key` is covered by `pattern`
pub fn pattern_matches(pattern: &str, key: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => key.starts_with(prefix),
        None => key == pattern,
    }
}

/// Store of cached views that supports pattern eviction
#[async_trait]
pub trait ViewCache: Send + Sync {
    /// Remove every entry matching `pattern`, returning how many were removed
    async fn evict(&self, pattern: &str) -> Result<usize>;
}

struct CachedView {
    value: Value,
    stored_at: Instant,
}

/// Process-local view cache with a fixed time-to-live
pub struct InMemoryViewCache {
    entries: RwLock<HashMap<String, CachedView>>,
    ttl: Duration,
}

impl InMemoryViewCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(Duration::from_secs(config.ttl_secs))
    }

    /// Cached value for `key` unless it has expired
    pub async fn get(&self, key: &str) -> Option<Value> {
        let entries = self.entries.read().await;
        entries
            .get(key)
            .filter(|view| view.stored_at.elapsed() < self.ttl)
            .map(|view| view.value.clone())
    }

    /// Store `value` under `key`, purging expired entries first
    pub async fn put(&self, key: impl Into<String>, value: Value) {
        let mut entries = self.entries.write().await;
        let ttl = self.ttl;
        entries.retain(|_, view| view.stored_at.elapsed() < ttl);
        entries.insert(
            key.into(),
            CachedView {
                value,
                stored_at: Instant::now(),
            },
        );
    }

    /// Live entry count; expired entries are purged first
    pub async fn len(&self) -> usize {
        let mut entries = self.entries.write().await;
        let ttl = self.ttl;
        entries.retain(|_, view| view.stored_at.elapsed() < ttl);
        entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl ViewCache for InMemoryViewCache {
    async fn evict(&self, pattern: &str) -> Result<usize> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|key, _| !pattern_matches(pattern, key));
        Ok(before - entries.len())
    }
}

/// Best-effort evictor shared by the claim trigger and the change detector
#[derive(Clone)]
pub struct CacheInvalidator {
    cache: Arc<dyn ViewCache>,
}

impl CacheInvalidator {
    pub fn new(cache: Arc<dyn ViewCache>) -> Self {
        Self { cache }
    }

    /// Evict every pattern; returns the number of entries removed
    ///
    /// A failing pattern is logged and skipped, the rest still run.
    pub async fn invalidate(&self, patterns: &[String]) -> usize {
        let mut removed = 0;
        for pattern in patterns {
            match self.cache.evict(pattern).await {
                Ok(count) => {
                    debug!(pattern = %pattern, count, "Evicted cached views");
                    removed += count;
                }
                Err(e) => warn!(pattern = %pattern, "Cache invalidation failed: {}", e),
            }
        }
        removed
    }
}
