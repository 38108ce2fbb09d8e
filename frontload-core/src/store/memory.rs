//! In-memory cache backend
//!
//! DashMap-backed implementation of the backend contract with lazy TTL
//! expiry: an expired entry is logically absent even while still stored, and
//! a min-heap expiration index is swept on access to reclaim it.
//!
//! Used by the test suite and as an embedded fallback when no cache server
//! is configured.

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use crate::error::BackendError;
use crate::store::backend::{CacheBackend, CacheEntry, KeyTtl};

/// Stored payload with optional expiration
#[derive(Debug, Clone)]
struct StoredValue {
    bytes: Vec<u8>,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn new(bytes: Vec<u8>, ttl: Option<Duration>) -> Self {
        Self {
            bytes,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
        }
    }

    fn is_expired(&self) -> bool {
        matches!(self.expires_at, Some(deadline) if Instant::now() >= deadline)
    }
}

/// Entry in the expiration heap
///
/// Slots are never removed when a key is overwritten or deleted; a stale
/// slot is detected at sweep time by re-checking the live entry.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ExpirySlot {
    key: String,
    deadline: Instant,
}

impl Ord for ExpirySlot {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reverse ordering for min-heap (earliest deadline first)
        other.deadline.cmp(&self.deadline)
    }
}

impl PartialOrd for ExpirySlot {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// In-memory cache backend
pub struct MemoryBackend {
    entries: DashMap<String, StoredValue>,
    expiry: Mutex<BinaryHeap<ExpirySlot>>,
}

impl MemoryBackend {
    /// Create an empty backend
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            expiry: Mutex::new(BinaryHeap::new()),
        }
    }

    /// Number of live (unexpired) keys
    pub fn len(&self) -> usize {
        self.sweep_expired();
        self.entries.len()
    }

    /// Whether the backend holds no live keys
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn store(&self, key: &str, value: StoredValue) {
        if let Some(deadline) = value.expires_at {
            self.expiry.lock().push(ExpirySlot {
                key: key.to_string(),
                deadline,
            });
        }
        self.entries.insert(key.to_string(), value);
    }

    /// Reclaim entries whose deadline has passed. Stale slots (key deleted
    /// or overwritten with a later deadline) only remove the live entry if
    /// it is itself expired.
    fn sweep_expired(&self) {
        let now = Instant::now();
        let mut expiry = self.expiry.lock();
        while let Some(slot) = expiry.peek() {
            if slot.deadline > now {
                break;
            }
            let slot = match expiry.pop() {
                Some(slot) => slot,
                None => break,
            };
            self.entries
                .remove_if(&slot.key, |_, value| value.is_expired());
        }
    }

    fn lookup(&self, key: &str) -> Option<Vec<u8>> {
        self.sweep_expired();
        let entry = self.entries.get(key)?;
        if entry.is_expired() {
            drop(entry);
            self.entries.remove_if(key, |_, value| value.is_expired());
            return None;
        }
        Some(entry.bytes.clone())
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError> {
        Ok(self.lookup(key))
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, BackendError> {
        Ok(keys.iter().map(|key| self.lookup(key)).collect())
    }

    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), BackendError> {
        self.store(key, StoredValue::new(value.to_vec(), ttl));
        Ok(())
    }

    async fn mset(&self, entries: &[CacheEntry]) -> Result<(), BackendError> {
        for entry in entries {
            self.store(&entry.key, StoredValue::new(entry.value.clone(), entry.ttl));
        }
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<u64, BackendError> {
        self.sweep_expired();
        let mut removed = 0;
        for key in keys {
            if let Some((_, value)) = self.entries.remove(key) {
                if !value.is_expired() {
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn exists(&self, key: &str) -> Result<bool, BackendError> {
        Ok(self.lookup(key).is_some())
    }

    async fn ttl(&self, key: &str) -> Result<KeyTtl, BackendError> {
        self.sweep_expired();
        let entry = match self.entries.get(key) {
            Some(entry) if !entry.is_expired() => entry,
            _ => return Ok(KeyTtl::Missing),
        };
        match entry.expires_at {
            Some(deadline) => Ok(KeyTtl::Expires(deadline.saturating_duration_since(Instant::now()))),
            None => Ok(KeyTtl::Persistent),
        }
    }

    async fn incr(&self, key: &str, by: i64) -> Result<i64, BackendError> {
        self.sweep_expired();
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| StoredValue::new(b"0".to_vec(), None));
        if entry.is_expired() {
            *entry = StoredValue::new(b"0".to_vec(), None);
        }
        let current: i64 = std::str::from_utf8(&entry.bytes)
            .ok()
            .and_then(|text| text.parse().ok())
            .ok_or_else(|| {
                BackendError::Protocol(format!("value at '{}' is not an integer", key))
            })?;
        let next = current + by;
        entry.bytes = next.to_string().into_bytes();
        Ok(next)
    }

    async fn ping(&self) -> Result<(), BackendError> {
        Ok(())
    }

    async fn flush(&self) -> Result<(), BackendError> {
        self.entries.clear();
        self.expiry.lock().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_and_get() {
        let backend = MemoryBackend::new();
        backend.set("k1", b"v1", None).await.unwrap();

        assert_eq!(backend.get("k1").await.unwrap(), Some(b"v1".to_vec()));
        assert_eq!(backend.get("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_entry_is_logically_absent() {
        let backend = MemoryBackend::new();
        backend
            .set("k1", b"v1", Some(Duration::from_millis(30)))
            .await
            .unwrap();

        assert!(backend.exists("k1").await.unwrap());

        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(backend.get("k1").await.unwrap(), None);
        assert!(!backend.exists("k1").await.unwrap());
        assert_eq!(backend.ttl("k1").await.unwrap(), KeyTtl::Missing);
    }

    #[tokio::test]
    async fn test_overwrite_extends_lifetime_past_stale_slot() {
        let backend = MemoryBackend::new();
        backend
            .set("k1", b"v1", Some(Duration::from_millis(20)))
            .await
            .unwrap();
        backend
            .set("k1", b"v2", Some(Duration::from_millis(500)))
            .await
            .unwrap();

        // The first slot expires but must not evict the rewritten entry
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(backend.get("k1").await.unwrap(), Some(b"v2".to_vec()));
    }

    #[tokio::test]
    async fn test_mget_preserves_order_and_arity() {
        let backend = MemoryBackend::new();
        backend.set("a", b"1", None).await.unwrap();
        backend.set("c", b"3", None).await.unwrap();

        let keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let values = backend.mget(&keys).await.unwrap();

        assert_eq!(values.len(), 3);
        assert_eq!(values[0], Some(b"1".to_vec()));
        assert_eq!(values[1], None);
        assert_eq!(values[2], Some(b"3".to_vec()));

        assert!(backend.mget(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_mset_bulk_write() {
        let backend = MemoryBackend::new();
        let entries = vec![
            CacheEntry::new("a", b"1".to_vec()),
            CacheEntry::with_ttl("b", b"2".to_vec(), Duration::from_secs(60)),
        ];
        backend.mset(&entries).await.unwrap();

        assert_eq!(backend.get("a").await.unwrap(), Some(b"1".to_vec()));
        assert_eq!(backend.get("b").await.unwrap(), Some(b"2".to_vec()));
        assert!(matches!(backend.ttl("b").await.unwrap(), KeyTtl::Expires(_)));
        assert_eq!(backend.ttl("a").await.unwrap(), KeyTtl::Persistent);
    }

    #[tokio::test]
    async fn test_del_counts_removed_keys() {
        let backend = MemoryBackend::new();
        backend.set("a", b"1", None).await.unwrap();
        backend.set("b", b"2", None).await.unwrap();

        let keys = vec!["a".to_string(), "b".to_string(), "ghost".to_string()];
        assert_eq!(backend.del(&keys).await.unwrap(), 2);
        assert_eq!(backend.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_incr_creates_at_zero() {
        let backend = MemoryBackend::new();
        assert_eq!(backend.incr("hits", 1).await.unwrap(), 1);
        assert_eq!(backend.incr("hits", 4).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_incr_rejects_non_integer_payload() {
        let backend = MemoryBackend::new();
        backend.set("blob", b"not a number", None).await.unwrap();

        let result = backend.incr("blob", 1).await;
        assert!(matches!(result, Err(BackendError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_flush_clears_everything() {
        let backend = MemoryBackend::new();
        backend.set("a", b"1", None).await.unwrap();
        backend
            .set("b", b"2", Some(Duration::from_secs(60)))
            .await
            .unwrap();

        backend.flush().await.unwrap();
        assert!(backend.is_empty());
    }
}
