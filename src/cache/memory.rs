//! In-process cache backend built on moka.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use moka::future::Cache;
use moka::Expiry;

use super::pattern::glob_match;
use super::{CacheBackend, CacheStats};
use crate::error::Result;

/// Default upper bound on stored responses.
pub const DEFAULT_MAX_ENTRIES: u64 = 10_000;

#[derive(Clone)]
struct StoredValue {
    body: String,
    ttl: Duration,
}

/// Expires each entry after the TTL it was written with. Overwrites restart
/// the clock with the new TTL.
struct PerEntryTtl;

impl Expiry<String, StoredValue> for PerEntryTtl {
    fn expire_after_create(
        &self,
        _key: &String,
        value: &StoredValue,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(value.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &String,
        value: &StoredValue,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(value.ttl)
    }
}

/// Bounded key-value store with per-entry TTL.
pub struct MemoryCacheBackend {
    entries: Cache<String, StoredValue>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl MemoryCacheBackend {
    pub fn new(max_entries: u64) -> Self {
        let entries = Cache::builder()
            .max_capacity(max_entries)
            .expire_after(PerEntryTtl)
            .build();
        Self {
            entries,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }
}

impl Default for MemoryCacheBackend {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ENTRIES)
    }
}

#[async_trait]
impl CacheBackend for MemoryCacheBackend {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value = self.entries.get(key).await;
        let counter = if value.is_some() { &self.hits } else { &self.misses };
        counter.fetch_add(1, Ordering::Relaxed);
        Ok(value.map(|v| v.body))
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        self.entries
            .insert(key.to_string(), StoredValue { body: value, ttl })
            .await;
        Ok(())
    }

    async fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        Ok(self
            .entries
            .iter()
            .filter(|(key, _)| glob_match(pattern, key))
            .map(|(key, _)| key.as_ref().clone())
            .collect())
    }

    async fn delete(&self, keys: &[String]) -> Result<usize> {
        let mut removed = 0;
        for key in keys {
            if self.entries.remove(key).await.is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn stats(&self) -> Result<CacheStats> {
        self.entries.run_pending_tasks().await;
        Ok(CacheStats {
            connected: true,
            total_keys: self.entries.entry_count(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_and_get() {
        let backend = MemoryCacheBackend::default();
        backend
            .set("k", "v".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(backend.get("k").await.unwrap().as_deref(), Some("v"));
        assert_eq!(backend.get("missing").await.unwrap(), None);

        let stats = backend.stats().await.unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.total_keys, 1);
    }

    #[tokio::test]
    async fn test_entries_expire_after_ttl() {
        let backend = MemoryCacheBackend::default();
        backend
            .set("short", "v".to_string(), Duration::from_millis(50))
            .await
            .unwrap();
        backend
            .set("long", "v".to_string(), Duration::from_secs(60))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(backend.get("short").await.unwrap(), None);
        assert!(backend.get("long").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_keys_and_delete_by_pattern() {
        let backend = MemoryCacheBackend::default();
        for key in ["search:a", "search:b", "hybrid:a"] {
            backend
                .set(key, "v".to_string(), Duration::from_secs(60))
                .await
                .unwrap();
        }
        let mut keys = backend.keys("search:*").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["search:a", "search:b"]);

        assert_eq!(backend.delete(&keys).await.unwrap(), 2);
        assert_eq!(backend.delete(&keys).await.unwrap(), 0);
        assert!(backend.get("hybrid:a").await.unwrap().is_some());
    }
}
