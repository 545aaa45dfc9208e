#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Two-tier cache for processed image results: a bounded in-memory LRU
//! in front of an optional keyed persistent store.

mod key;
mod lru;
mod store;

use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;

pub use key::cache_key;
pub use store::{CacheRecord, KeyedStore};

use lru::LruCache;

/// Cache configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Bound of the in-memory tier.
    pub max_entries: usize,
    /// Records older than this are evicted on access and by `cleanup`.
    pub expiry_time: Duration,
    /// Location of the persistent tier; `None` keeps the cache purely
    /// in-memory.
    pub store_path: Option<PathBuf>,
}

impl CacheConfig {
    /// Default in-memory bound.
    pub const DEFAULT_MAX_ENTRIES: usize = 100;
    /// Default record lifetime.
    pub const DEFAULT_EXPIRY_TIME: Duration = Duration::from_secs(24 * 60 * 60);
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: Self::DEFAULT_MAX_ENTRIES,
            expiry_time: Self::DEFAULT_EXPIRY_TIME,
            store_path: None,
        }
    }
}

/// Processed-result cache with an in-memory LRU tier and an optional
/// keyed persistent tier.
pub struct ProcessedCache {
    expiry_ms: i64,
    memory: LruCache<Value>,
    store: Option<KeyedStore>,
}

impl ProcessedCache {
    /// Opens the cache; the persistent tier is loaded when configured.
    pub fn open(config: CacheConfig) -> anyhow::Result<Self> {
        let store = match &config.store_path {
            Some(path) => Some(KeyedStore::open(path.clone())?),
            None => None,
        };
        Ok(Self {
            expiry_ms: config.expiry_time.as_millis().min(i64::MAX as u128) as i64,
            memory: LruCache::new(config.max_entries),
            store,
        })
    }

    /// Looks a result up, refreshing its recency in both tiers. Expired
    /// records are evicted instead of returned.
    pub fn get(&mut self, key: &str) -> Option<Value> {
        let now = chrono::Utc::now().timestamp_millis();
        if let Some(value) = self.memory.get(key).cloned() {
            // The memory tier carries no stamps of its own; the store is
            // authoritative for expiry when present.
            match &mut self.store {
                Some(store) => {
                    if store.touch(key, now, self.expiry_ms) {
                        return Some(value);
                    }
                    self.memory.remove(key);
                    return None;
                }
                None => return Some(value),
            }
        }
        if let Some(store) = &mut self.store {
            if let Some(record) = store.get(key, now, self.expiry_ms) {
                let value = record.result.clone();
                self.memory.insert(key.to_string(), value.clone());
                return Some(value);
            }
        }
        None
    }

    /// Stores a processed result in both tiers.
    pub fn insert(&mut self, key: impl Into<String>, result: Value) {
        let key = key.into();
        let now = chrono::Utc::now().timestamp_millis();
        self.memory.insert(key.clone(), result.clone());
        if let Some(store) = &mut self.store {
            store.insert(key, result, now);
        }
    }

    /// Evicts expired persistent records; returns how many were dropped.
    /// Run this from whatever periodic tick the embedder already has.
    pub fn cleanup(&mut self) -> usize {
        let now = chrono::Utc::now().timestamp_millis();
        match &mut self.store {
            Some(store) => {
                let dropped = store.cleanup(now, self.expiry_ms);
                if dropped > 0 {
                    tracing::debug!(dropped, "expired cache records evicted");
                }
                dropped
            }
            None => 0,
        }
    }

    /// Writes the persistent tier to disk.
    pub async fn persist(&self) -> anyhow::Result<()> {
        match &self.store {
            Some(store) => store.persist().await,
            None => Ok(()),
        }
    }

    /// Entries in the in-memory tier.
    pub fn memory_len(&self) -> usize {
        self.memory.len()
    }

    /// Entries in the persistent tier.
    pub fn store_len(&self) -> usize {
        self.store.as_ref().map(KeyedStore::len).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn memory_tier_round_trips_without_a_store() {
        let mut cache = ProcessedCache::open(CacheConfig {
            max_entries: 2,
            ..CacheConfig::default()
        })
        .unwrap();

        cache.insert("a", json!(1));
        cache.insert("b", json!(2));
        assert_eq!(cache.get("a"), Some(json!(1)));

        // "b" is now least recently used and falls out first.
        cache.insert("c", json!(3));
        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(json!(1)));
        assert_eq!(cache.get("c"), Some(json!(3)));
        assert_eq!(cache.memory_len(), 2);
    }
}
