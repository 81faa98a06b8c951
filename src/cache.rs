//! Key/value store contract backing the identity cache
//!
//! The gate only needs three primitives from a store: get, set and delete,
//! each individually atomic. Nothing here is transactional across keys and no
//! expiry is enforced by the store; freshness is decided by the gate when it
//! reads an expiration entry.
//!
//! [`InMemoryStore`] is the default single-process implementation.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;

use crate::Result;

/// Store abstraction consumed by [`IdentityCache`](crate::gate::IdentityCache).
///
/// Implementations must be `Send + Sync` because a single store handle is
/// shared by every in-flight request.
#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    /// Read a value. `Ok(None)` when the key is absent.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write (or overwrite) a value.
    async fn set(&self, key: &str, value: String) -> Result<()>;

    /// Delete a key. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// Thread-safe in-memory store
pub struct InMemoryStore {
    entries: DashMap<String, String>,
    stats: StoreStats,
}

/// Store statistics tracked atomically
#[derive(Debug)]
struct StoreStats {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl StoreStats {
    fn new() -> Self {
        Self {
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        }
    }

    #[allow(clippy::cast_precision_loss)]
    fn hit_rate(&self) -> f64 {
        let hits = self.hits.load(Ordering::Relaxed);
        let total = hits + self.misses.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        }
    }
}

impl InMemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            stats: StoreStats::new(),
        }
    }

    /// Number of keys currently held
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store holds no keys
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether `key` is present (does not count as a hit or miss)
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Get store statistics
    pub fn stats(&self) -> StoreStatsSnapshot {
        StoreStatsSnapshot {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            writes: self.stats.writes.load(Ordering::Relaxed),
            deletes: self.stats.deletes.load(Ordering::Relaxed),
            size: self.entries.len(),
            hit_rate: self.stats.hit_rate(),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        if let Some(entry) = self.entries.get(key) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            Ok(Some(entry.value().clone()))
        } else {
            self.stats.misses.fetch_add(1, Ordering::Relaxed);
            Ok(None)
        }
    }

    async fn set(&self, key: &str, value: String) -> Result<()> {
        self.entries.insert(key.to_string(), value);
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        if self.entries.remove(key).is_some() {
            self.stats.deletes.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

/// Snapshot of store statistics
#[derive(Debug, Clone, Serialize)]
pub struct StoreStatsSnapshot {
    /// Reads that found a value
    pub hits: u64,
    /// Reads that found nothing
    pub misses: u64,
    /// Successful writes
    pub writes: u64,
    /// Deletes that removed a key
    pub deletes: u64,
    /// Current number of keys
    pub size: usize,
    /// Hit rate (0.0-1.0)
    pub hit_rate: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_then_get() {
        let store = InMemoryStore::new();
        store.set("key", "value".to_string()).await.unwrap();

        assert_eq!(store.get("key").await.unwrap(), Some("value".to_string()));
        assert_eq!(store.stats().hits, 1);
        assert_eq!(store.stats().writes, 1);
    }

    #[tokio::test]
    async fn test_get_missing() {
        let store = InMemoryStore::new();

        assert_eq!(store.get("nonexistent").await.unwrap(), None);
        assert_eq!(store.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_overwrite() {
        let store = InMemoryStore::new();
        store.set("key", "old".to_string()).await.unwrap();
        store.set("key", "new".to_string()).await.unwrap();

        assert_eq!(store.get("key").await.unwrap(), Some("new".to_string()));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_absent_key_is_ok() {
        let store = InMemoryStore::new();

        assert!(store.delete("never-written").await.is_ok());
        assert_eq!(store.stats().deletes, 0);
    }

    #[tokio::test]
    async fn test_delete_removes_key() {
        let store = InMemoryStore::new();
        store.set("key", "value".to_string()).await.unwrap();
        store.delete("key").await.unwrap();

        assert!(!store.contains("key"));
        assert!(store.is_empty());
        assert_eq!(store.stats().deletes, 1);
    }

    #[tokio::test]
    async fn test_hit_rate() {
        let store = InMemoryStore::new();
        store.set("key1", "1".to_string()).await.unwrap();
        store.set("key2", "2".to_string()).await.unwrap();

        store.get("key1").await.unwrap();
        store.get("key2").await.unwrap();
        store.get("key3").await.unwrap();

        let stats = store.stats();
        assert_eq!(stats.hits, 2);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate - 0.666).abs() < 0.01);
    }

    #[test]
    fn test_default_impl() {
        let store = InMemoryStore::default();
        assert_eq!(store.stats().hits, 0);
        assert!((store.stats().hit_rate - 0.0).abs() < f64::EPSILON);
    }
}
