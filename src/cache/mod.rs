//! Response cache for search endpoints.
//!
//! Responses are stored as JSON under deterministic keys of the form
//! `prefix:operation:{sorted params}`. Every backend failure degrades to a
//! cache miss: a broken cache never fails a request.

mod memory;
mod pattern;

pub use memory::{MemoryCacheBackend, DEFAULT_MAX_ENTRIES};
pub use pattern::glob_match;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::error::Result;

/// Snapshot of cache backend health and counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Whether the backend answered at all.
    pub connected: bool,
    pub total_keys: u64,
    pub hits: u64,
    pub misses: u64,
}

impl CacheStats {
    /// Fraction of lookups that hit, in `[0, 1]`.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Storage behind the response cache.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store `value` under `key` for `ttl`, replacing any existing entry.
    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    /// All live keys matching a glob `pattern`.
    async fn keys(&self, pattern: &str) -> Result<Vec<String>>;

    /// Remove `keys`, returning how many existed.
    async fn delete(&self, keys: &[String]) -> Result<usize>;

    async fn stats(&self) -> Result<CacheStats>;
}

/// Builder for deterministic cache keys.
///
/// Parameters are serialized as a JSON object with sorted keys, so the same
/// logical request always maps to the same key regardless of the order the
/// parameters were added in.
#[derive(Debug, Clone)]
pub struct CacheKey {
    prefix: String,
    operation: String,
    params: BTreeMap<String, Value>,
}

impl CacheKey {
    pub fn new(prefix: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            operation: operation.into(),
            params: BTreeMap::new(),
        }
    }

    /// Add a parameter. Values that cannot be represented in JSON become `null`.
    pub fn param(mut self, name: &str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.params.insert(name.to_string(), value);
        self
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params = serde_json::to_string(&self.params).map_err(|_| fmt::Error)?;
        write!(f, "{}:{}:{}", self.prefix, self.operation, params)
    }
}

/// Memoizes serializable results in a [`CacheBackend`].
///
/// A cache built with [`ResponseCache::disabled`] always computes.
#[derive(Clone)]
pub struct ResponseCache {
    backend: Option<Arc<dyn CacheBackend>>,
}

impl ResponseCache {
    pub fn new(backend: Arc<dyn CacheBackend>) -> Self {
        Self {
            backend: Some(backend),
        }
    }

    pub fn disabled() -> Self {
        Self { backend: None }
    }

    pub fn is_enabled(&self) -> bool {
        self.backend.is_some()
    }

    /// Return the cached value for `key`, or run `compute` and store its
    /// result for `ttl`.
    ///
    /// Errors from `compute` propagate and are never stored.
    pub async fn get_or_compute<T, F, Fut>(&self, key: &str, ttl: Duration, compute: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let Some(backend) = &self.backend else {
            return compute().await;
        };

        match backend.get(key).await {
            Ok(Some(body)) => match serde_json::from_str::<T>(&body) {
                Ok(value) => {
                    metrics::counter!("dpo_response_cache_hits_total").increment(1);
                    debug!("Response cache hit: {}", key);
                    return Ok(value);
                }
                Err(e) => warn!("Discarding undecodable cache entry {}: {}", key, e),
            },
            Ok(None) => {}
            Err(e) => warn!("Cache read failed for {}: {}", key, e),
        }
        metrics::counter!("dpo_response_cache_misses_total").increment(1);

        let value = compute().await?;

        match serde_json::to_string(&value) {
            Ok(body) => {
                if let Err(e) = backend.set(key, body, ttl).await {
                    warn!("Cache write failed for {}: {}", key, e);
                }
            }
            Err(e) => warn!("Could not serialize response for {}: {}", key, e),
        }
        Ok(value)
    }

    /// Delete every entry whose key matches `pattern`. Returns the number of
    /// entries removed, or 0 if the backend is unreachable.
    pub async fn invalidate(&self, pattern: &str) -> usize {
        let Some(backend) = &self.backend else {
            return 0;
        };
        let removed = match backend.keys(pattern).await {
            Ok(keys) if keys.is_empty() => Ok(0),
            Ok(keys) => backend.delete(&keys).await,
            Err(e) => Err(e),
        };
        match removed {
            Ok(count) => {
                info!("Invalidated {} cache entries matching '{}'", count, pattern);
                count
            }
            Err(e) => {
                warn!("Cache invalidation failed for '{}': {}", pattern, e);
                0
            }
        }
    }

    /// Backend statistics; a disabled or unreachable backend reports
    /// `connected: false`.
    pub async fn stats(&self) -> CacheStats {
        let Some(backend) = &self.backend else {
            return CacheStats::default();
        };
        backend.stats().await.unwrap_or_else(|e| {
            warn!("Cache stats unavailable: {}", e);
            CacheStats::default()
        })
    }
}
