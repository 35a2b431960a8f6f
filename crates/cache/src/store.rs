use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use schnellru::{ByLength, LruMap};
use std::{fmt, time::Duration};
use tokio::time::Instant;

/// Error from a cache backend. Backend failures never fail a request; the
/// layer degrades them to miss semantics and counts them.
#[derive(Debug, Clone, thiserror::Error)]
#[error("cache backend error: {0}")]
pub struct StoreError(pub String);

/// The key-value capability the cache layer is written against.
///
/// Implementations must be safe for concurrent use; the layer does not
/// serialize calls.
#[async_trait]
pub trait KVStore: Send + Sync + fmt::Debug {
    /// Fetches a value.
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;
    /// Stores a value with an optional time-to-live.
    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), StoreError>;
    /// Removes a value.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

#[derive(Debug)]
struct StoredEntry {
    value: Bytes,
    expires_at: Option<Instant>,
}

/// Bounded in-process LRU store.
#[derive(Debug)]
pub struct MemoryStore {
    entries: Mutex<LruMap<String, StoredEntry, ByLength>>,
}

impl MemoryStore {
    /// Creates a store holding at most `max_items` entries.
    pub fn new(max_items: u32) -> Self {
        Self { entries: Mutex::new(LruMap::new(ByLength::new(max_items))) }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(100_000)
    }
}

#[async_trait]
impl KVStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get(key) else { return Ok(None) };
        if entry.expires_at.is_some_and(|at| Instant::now() >= at) {
            entries.remove(key);
            return Ok(None)
        }
        Ok(Some(entry.value.clone()))
    }

    async fn set(&self, key: &str, value: Bytes, ttl: Option<Duration>) -> Result<(), StoreError> {
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries.lock().insert(key.to_owned(), StoredEntry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trip_and_delete() {
        let store = MemoryStore::new(16);
        store.set("k", Bytes::from_static(b"v"), None).await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(Bytes::from_static(b"v")));
        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expires_entries() {
        let store = MemoryStore::new(16);
        store.set("k", Bytes::from_static(b"v"), Some(Duration::from_secs(5))).await.unwrap();
        assert!(store.get("k").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn lru_evicts_oldest() {
        let store = MemoryStore::new(2);
        store.set("a", Bytes::from_static(b"1"), None).await.unwrap();
        store.set("b", Bytes::from_static(b"2"), None).await.unwrap();
        store.set("c", Bytes::from_static(b"3"), None).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
        assert!(store.get("c").await.unwrap().is_some());
    }
}
