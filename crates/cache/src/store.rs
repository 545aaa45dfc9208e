//! Keyed persistent tier: a JSON file of cache records, written
//! atomically through a temp-file rename.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One persisted cache record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRecord {
    /// The cache key (see [`crate::cache_key`]).
    pub cache_key: String,
    /// The processed result.
    pub result: Value,
    /// Creation stamp, epoch milliseconds.
    pub timestamp: i64,
    /// Last access stamp, epoch milliseconds.
    pub last_accessed: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    records: Vec<CacheRecord>,
}

/// Keyed store of cache records backed by one JSON file.
pub struct KeyedStore {
    path: PathBuf,
    records: BTreeMap<String, CacheRecord>,
}

impl KeyedStore {
    /// Opens the store, loading any existing file. A corrupt file is
    /// discarded rather than treated as fatal.
    pub fn open(path: PathBuf) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self {
                path,
                records: BTreeMap::new(),
            });
        }

        let raw = std::fs::read_to_string(&path)?;
        let file: StoreFile = match serde_json::from_str(&raw) {
            Ok(file) => file,
            Err(err) => {
                tracing::warn!(path = %path.display(), %err, "discarding corrupt cache store");
                StoreFile::default()
            }
        };
        let mut records = BTreeMap::new();
        for record in file.records {
            records.insert(record.cache_key.clone(), record);
        }
        Ok(Self { path, records })
    }

    /// Fetches a record, updating `last_accessed`. An expired record is
    /// evicted and reported as absent.
    pub fn get(&mut self, key: &str, now_ms: i64, expiry_ms: i64) -> Option<&CacheRecord> {
        if self.is_expired(key, now_ms, expiry_ms) {
            self.records.remove(key);
            return None;
        }
        let record = self.records.get_mut(key)?;
        record.last_accessed = now_ms;
        Some(record)
    }

    /// Refreshes `last_accessed` without reading. `false` means the
    /// record is missing or was evicted as expired.
    pub fn touch(&mut self, key: &str, now_ms: i64, expiry_ms: i64) -> bool {
        self.get(key, now_ms, expiry_ms).is_some()
    }

    /// Inserts or replaces a record.
    pub fn insert(&mut self, key: impl Into<String>, result: Value, now_ms: i64) {
        let cache_key = key.into();
        self.records.insert(
            cache_key.clone(),
            CacheRecord {
                cache_key,
                result,
                timestamp: now_ms,
                last_accessed: now_ms,
            },
        );
    }

    /// Drops every record older than the expiry window; returns the
    /// eviction count.
    pub fn cleanup(&mut self, now_ms: i64, expiry_ms: i64) -> usize {
        let before = self.records.len();
        self.records
            .retain(|_, record| now_ms.saturating_sub(record.timestamp) < expiry_ms);
        before - self.records.len()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Writes the store to disk off the async thread.
    pub async fn persist(&self) -> anyhow::Result<()> {
        let path = self.path.clone();
        let file = StoreFile {
            version: 1,
            records: self.records.values().cloned().collect(),
        };
        tokio::task::spawn_blocking(move || persist_file(&path, &file))
            .await
            .map_err(|err| anyhow::anyhow!("persist cache store: {err:#}"))??;
        Ok(())
    }

    fn is_expired(&self, key: &str, now_ms: i64, expiry_ms: i64) -> bool {
        self.records
            .get(key)
            .is_some_and(|record| now_ms.saturating_sub(record.timestamp) >= expiry_ms)
    }
}

fn persist_file(path: &Path, file: &StoreFile) -> anyhow::Result<()> {
    if file.records.is_empty() {
        if path.exists() {
            let _ = std::fs::remove_file(path);
        }
        return Ok(());
    }

    let dir = path
        .parent()
        .ok_or_else(|| anyhow::anyhow!("invalid cache store path: {}", path.display()))?;
    std::fs::create_dir_all(dir)?;

    let json = serde_json::to_string_pretty(file)?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const HOUR_MS: i64 = 60 * 60 * 1000;

    #[tokio::test]
    async fn records_survive_a_persist_reload_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache").join("processed.json");

        let mut store = KeyedStore::open(path.clone()).unwrap();
        store.insert("img-1|64x64|q0.80|webp|ar1", json!({"bytes": 1024}), 1_000);
        store.persist().await.unwrap();

        let mut reloaded = KeyedStore::open(path).unwrap();
        assert_eq!(reloaded.len(), 1);
        let record = reloaded
            .get("img-1|64x64|q0.80|webp|ar1", 2_000, HOUR_MS)
            .unwrap();
        assert_eq!(record.result, json!({"bytes": 1024}));
        assert_eq!(record.last_accessed, 2_000);
    }

    #[test]
    fn expired_records_are_evicted_on_access() {
        let mut store = KeyedStore::open(PathBuf::from("/nonexistent/cache.json")).unwrap();
        store.insert("old", json!(1), 0);
        store.insert("fresh", json!(2), HOUR_MS);

        let now = HOUR_MS + 1;
        assert!(store.get("old", now, HOUR_MS).is_none());
        assert!(store.get("fresh", now, HOUR_MS).is_some());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn cleanup_drops_only_stale_records() {
        let mut store = KeyedStore::open(PathBuf::from("/nonexistent/cache.json")).unwrap();
        for i in 0..4 {
            store.insert(format!("key-{i}"), json!(i), i * HOUR_MS);
        }
        let dropped = store.cleanup(3 * HOUR_MS, 2 * HOUR_MS);
        assert_eq!(dropped, 2);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn persisting_an_empty_store_removes_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("processed.json");

        let mut store = KeyedStore::open(path.clone()).unwrap();
        store.insert("k", json!(1), 0);
        store.persist().await.unwrap();
        assert!(path.exists());

        store.cleanup(HOUR_MS, 1);
        assert!(store.is_empty());
        store.persist().await.unwrap();
        assert!(!path.exists());
    }
}
