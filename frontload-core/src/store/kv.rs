//! Fail-open key-value store
//!
//! Wraps a cache backend with per-operation deadlines and operational
//! counters. Every backend fault degrades to the neutral value for the
//! operation (absent / false / zero / empty); no transport error ever
//! crosses this API. The cache is an accelerator, not the source of truth,
//! so unavailability must only cost latency, never correctness.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::CacheSettings;
use crate::error::BackendError;
use crate::store::backend::{CacheBackend, CacheEntry, KeyTtl};

/// Cache service health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
}

/// Result of a liveness probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub latency_ms: u64,
    pub backend: String,
    pub checked_at: DateTime<Utc>,
}

/// Operational counters
///
/// Monotonically incrementing; reset only by explicit operator action.
/// Bookkeeping never affects the outcome or ordering of the primary
/// operation.
#[derive(Debug, Default)]
pub struct OperationalStats {
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    deletes: AtomicU64,
    errors: AtomicU64,
    total_requests: AtomicU64,
}

impl OperationalStats {
    fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    fn record_writes(&self, count: u64) {
        self.writes.fetch_add(count, Ordering::Relaxed);
    }

    fn record_deletes(&self, count: u64) {
        self.deletes.fetch_add(count, Ordering::Relaxed);
    }

    fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of all counters
    pub fn snapshot(&self) -> StatsSnapshot {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let probes = hits + misses;
        StatsSnapshot {
            hits,
            misses,
            writes: self.writes.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            total_requests: self.total_requests.load(Ordering::Relaxed),
            hit_rate: if probes == 0 {
                0.0
            } else {
                hits as f64 / probes as f64
            },
        }
    }

    /// Reset all counters to zero
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.writes.store(0, Ordering::Relaxed);
        self.deletes.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.total_requests.store(0, Ordering::Relaxed);
    }
}

/// Serializable counter snapshot for reporting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub deletes: u64,
    pub errors: u64,
    pub total_requests: u64,
    pub hit_rate: f64,
}

/// Fail-open store over a cache backend
pub struct KeyValueStore {
    backend: Arc<dyn CacheBackend>,
    op_timeout: Duration,
    health_timeout: Duration,
    stats: OperationalStats,
}

impl KeyValueStore {
    /// Create a store using the deadlines from `settings`
    pub fn new(backend: Arc<dyn CacheBackend>, settings: &CacheSettings) -> Self {
        Self::with_timeouts(backend, settings.op_timeout(), settings.health_timeout())
    }

    /// Create a store with explicit deadlines
    pub fn with_timeouts(
        backend: Arc<dyn CacheBackend>,
        op_timeout: Duration,
        health_timeout: Duration,
    ) -> Self {
        Self {
            backend,
            op_timeout,
            health_timeout,
            stats: OperationalStats::default(),
        }
    }

    /// Name of the underlying backend
    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Snapshot of the operational counters
    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Reset the operational counters (operator action)
    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    /// Release the backend's held resources; owned by the composition root
    pub fn close(&self) {
        self.backend.close();
    }

    async fn bounded<T>(
        &self,
        op: impl Future<Output = Result<T, BackendError>>,
    ) -> Result<T, BackendError> {
        match timeout(self.op_timeout, op).await {
            Ok(result) => result,
            Err(_) => Err(BackendError::Timeout(self.op_timeout)),
        }
    }

    /// Fetch a value; `None` for missing, expired, or unreachable
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.stats.record_request();
        match self.bounded(self.backend.get(key)).await {
            Ok(Some(value)) => {
                self.stats.record_hit();
                Some(value)
            }
            Ok(None) => {
                self.stats.record_miss();
                None
            }
            Err(err) => {
                self.stats.record_error();
                warn!(key, error = %err, "cache get degraded to miss");
                None
            }
        }
    }

    /// Fetch and deserialize a JSON value; a corrupt payload is a miss
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let bytes = self.get(key).await?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(err) => {
                debug!(key, error = %err, "discarding corrupt cache payload");
                None
            }
        }
    }

    /// Fetch many values, preserving input order and arity; degrades to
    /// all-miss when the backend is unreachable
    pub async fn mget(&self, keys: &[String]) -> Vec<Option<Vec<u8>>> {
        self.stats.record_request();
        if keys.is_empty() {
            return Vec::new();
        }
        match self.bounded(self.backend.mget(keys)).await {
            Ok(values) => {
                for value in &values {
                    if value.is_some() {
                        self.stats.record_hit();
                    } else {
                        self.stats.record_miss();
                    }
                }
                values
            }
            Err(err) => {
                self.stats.record_error();
                warn!(keys = keys.len(), error = %err, "cache mget degraded to all-miss");
                vec![None; keys.len()]
            }
        }
    }

    /// Store a value; returns whether the write was accepted
    pub async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> bool {
        self.stats.record_request();
        match self.bounded(self.backend.set(key, value, ttl)).await {
            Ok(()) => {
                self.stats.record_writes(1);
                true
            }
            Err(err) => {
                self.stats.record_error();
                warn!(key, error = %err, "cache set failed");
                false
            }
        }
    }

    /// Serialize and store a JSON value
    pub async fn set_json<T: Serialize>(&self, key: &str, value: &T, ttl: Option<Duration>) -> bool {
        match serde_json::to_vec(value) {
            Ok(bytes) => self.set(key, &bytes, ttl).await,
            Err(err) => {
                debug!(key, error = %err, "failed to encode cache payload");
                false
            }
        }
    }

    /// Store many entries in one pipelined round trip
    pub async fn mset(&self, entries: &[CacheEntry]) -> bool {
        self.stats.record_request();
        if entries.is_empty() {
            return true;
        }
        match self.bounded(self.backend.mset(entries)).await {
            Ok(()) => {
                self.stats.record_writes(entries.len() as u64);
                true
            }
            Err(err) => {
                self.stats.record_error();
                warn!(entries = entries.len(), error = %err, "cache mset failed");
                false
            }
        }
    }

    /// Delete a key; returns whether it existed
    pub async fn del(&self, key: &str) -> bool {
        let keys = [key.to_string()];
        self.mdel(&keys).await > 0
    }

    /// Delete many keys; returns how many existed
    pub async fn mdel(&self, keys: &[String]) -> u64 {
        self.stats.record_request();
        if keys.is_empty() {
            return 0;
        }
        match self.bounded(self.backend.del(keys)).await {
            Ok(removed) => {
                self.stats.record_deletes(removed);
                removed
            }
            Err(err) => {
                self.stats.record_error();
                warn!(keys = keys.len(), error = %err, "cache delete failed");
                0
            }
        }
    }

    /// Whether a key exists and is unexpired
    pub async fn exists(&self, key: &str) -> bool {
        self.stats.record_request();
        match self.bounded(self.backend.exists(key)).await {
            Ok(present) => {
                if present {
                    self.stats.record_hit();
                } else {
                    self.stats.record_miss();
                }
                present
            }
            Err(err) => {
                self.stats.record_error();
                warn!(key, error = %err, "cache exists check failed");
                false
            }
        }
    }

    /// Remaining lifetime of a key; `Missing` when unreachable
    pub async fn ttl(&self, key: &str) -> KeyTtl {
        self.stats.record_request();
        match self.bounded(self.backend.ttl(key)).await {
            Ok(ttl) => ttl,
            Err(err) => {
                self.stats.record_error();
                warn!(key, error = %err, "cache ttl lookup failed");
                KeyTtl::Missing
            }
        }
    }

    /// Add `by` to a counter, creating it at zero; returns the new value,
    /// or zero when the backend is unreachable
    pub async fn incr(&self, key: &str, by: i64) -> i64 {
        self.stats.record_request();
        match self.bounded(self.backend.incr(key, by)).await {
            Ok(value) => {
                self.stats.record_writes(1);
                value
            }
            Err(err) => {
                self.stats.record_error();
                warn!(key, error = %err, "cache increment failed");
                0
            }
        }
    }

    /// Remove every key; returns whether the flush was accepted
    pub async fn flush(&self) -> bool {
        self.stats.record_request();
        match self.bounded(self.backend.flush()).await {
            Ok(()) => true,
            Err(err) => {
                self.stats.record_error();
                warn!(error = %err, "cache flush failed");
                false
            }
        }
    }

    /// Liveness probe, bounded by its own deadline
    pub async fn health_check(&self) -> HealthReport {
        let started = Instant::now();
        let outcome = timeout(self.health_timeout, self.backend.ping()).await;
        let latency_ms = started.elapsed().as_millis() as u64;
        let status = match outcome {
            Ok(Ok(())) => HealthStatus::Healthy,
            Ok(Err(err)) => {
                warn!(error = %err, "cache health check failed");
                HealthStatus::Unhealthy
            }
            Err(_) => {
                warn!(deadline = ?self.health_timeout, "cache health check timed out");
                HealthStatus::Unhealthy
            }
        };
        HealthReport {
            status,
            latency_ms,
            backend: self.backend.name().to_string(),
            checked_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryBackend;
    use async_trait::async_trait;

    /// Backend that fails every operation
    struct FailingBackend;

    #[async_trait]
    impl CacheBackend for FailingBackend {
        fn name(&self) -> &'static str {
            "failing"
        }

        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, BackendError> {
            Err(BackendError::Connection("refused".to_string()))
        }

        async fn mget(&self, _keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, BackendError> {
            Err(BackendError::Connection("refused".to_string()))
        }

        async fn set(
            &self,
            _key: &str,
            _value: &[u8],
            _ttl: Option<Duration>,
        ) -> Result<(), BackendError> {
            Err(BackendError::Connection("refused".to_string()))
        }

        async fn mset(&self, _entries: &[CacheEntry]) -> Result<(), BackendError> {
            Err(BackendError::Connection("refused".to_string()))
        }

        async fn del(&self, _keys: &[String]) -> Result<u64, BackendError> {
            Err(BackendError::Connection("refused".to_string()))
        }

        async fn exists(&self, _key: &str) -> Result<bool, BackendError> {
            Err(BackendError::Connection("refused".to_string()))
        }

        async fn ttl(&self, _key: &str) -> Result<KeyTtl, BackendError> {
            Err(BackendError::Connection("refused".to_string()))
        }

        async fn incr(&self, _key: &str, _by: i64) -> Result<i64, BackendError> {
            Err(BackendError::Connection("refused".to_string()))
        }

        async fn ping(&self) -> Result<(), BackendError> {
            Err(BackendError::Connection("refused".to_string()))
        }

        async fn flush(&self) -> Result<(), BackendError> {
            Err(BackendError::Connection("refused".to_string()))
        }
    }

    /// Backend whose reads hang longer than any test deadline
    struct SlowBackend;

    #[async_trait]
    impl CacheBackend for SlowBackend {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>, BackendError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(None)
        }

        async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, BackendError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(vec![None; keys.len()])
        }

        async fn set(
            &self,
            _key: &str,
            _value: &[u8],
            _ttl: Option<Duration>,
        ) -> Result<(), BackendError> {
            Ok(())
        }

        async fn mset(&self, _entries: &[CacheEntry]) -> Result<(), BackendError> {
            Ok(())
        }

        async fn del(&self, _keys: &[String]) -> Result<u64, BackendError> {
            Ok(0)
        }

        async fn exists(&self, _key: &str) -> Result<bool, BackendError> {
            Ok(false)
        }

        async fn ttl(&self, _key: &str) -> Result<KeyTtl, BackendError> {
            Ok(KeyTtl::Missing)
        }

        async fn incr(&self, _key: &str, _by: i64) -> Result<i64, BackendError> {
            Ok(0)
        }

        async fn ping(&self) -> Result<(), BackendError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }

        async fn flush(&self) -> Result<(), BackendError> {
            Ok(())
        }
    }

    fn memory_store() -> KeyValueStore {
        KeyValueStore::with_timeouts(
            Arc::new(MemoryBackend::new()),
            Duration::from_secs(2),
            Duration::from_secs(1),
        )
    }

    #[tokio::test]
    async fn test_get_set_round_trip() {
        let store = memory_store();

        assert!(store.set("k1", b"v1", None).await);
        assert_eq!(store.get("k1").await, Some(b"v1".to_vec()));
        assert_eq!(store.get("missing").await, None);
    }

    #[tokio::test]
    async fn test_counters_track_hits_and_misses() {
        let store = memory_store();
        store.set("k1", b"v1", None).await;

        store.get("k1").await;
        store.get("ghost").await;

        let stats = store.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.hit_rate, 0.5);
    }

    #[tokio::test]
    async fn test_fail_open_returns_neutral_values() {
        let store = KeyValueStore::with_timeouts(
            Arc::new(FailingBackend),
            Duration::from_secs(1),
            Duration::from_millis(100),
        );

        assert_eq!(store.get("k1").await, None);
        assert_eq!(
            store.mget(&["a".to_string(), "b".to_string()]).await,
            vec![None, None]
        );
        assert!(!store.set("k1", b"v1", None).await);
        assert!(!store.mset(&[CacheEntry::new("k1", b"v1".to_vec())]).await);
        assert_eq!(store.mdel(&["k1".to_string()]).await, 0);
        assert!(!store.exists("k1").await);
        assert_eq!(store.ttl("k1").await, KeyTtl::Missing);
        assert_eq!(store.incr("k1", 5).await, 0);
        assert!(!store.flush().await);

        let stats = store.stats();
        assert!(stats.errors >= 9);
    }

    #[tokio::test]
    async fn test_mget_degrades_to_all_miss_with_arity_preserved() {
        let store = KeyValueStore::with_timeouts(
            Arc::new(FailingBackend),
            Duration::from_secs(1),
            Duration::from_millis(100),
        );

        let keys: Vec<String> = (0..5).map(|i| format!("k{}", i)).collect();
        let values = store.mget(&keys).await;
        assert_eq!(values.len(), 5);
        assert!(values.iter().all(|v| v.is_none()));
    }

    #[tokio::test]
    async fn test_slow_backend_hits_deadline() {
        let store = KeyValueStore::with_timeouts(
            Arc::new(SlowBackend),
            Duration::from_millis(20),
            Duration::from_millis(20),
        );

        assert_eq!(store.get("k1").await, None);
        assert_eq!(store.stats().errors, 1);

        let report = store.health_check().await;
        assert_eq!(report.status, HealthStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_health_check_reports_healthy_backend() {
        let store = memory_store();
        let report = store.health_check().await;

        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.backend, "memory");
    }

    #[tokio::test]
    async fn test_json_round_trip_and_corrupt_payload() {
        let store = memory_store();

        #[derive(Debug, PartialEq, Serialize, Deserialize)]
        struct Sample {
            id: u32,
            name: String,
        }

        let sample = Sample {
            id: 7,
            name: "seven".to_string(),
        };
        assert!(store.set_json("sample", &sample, None).await);
        assert_eq!(store.get_json::<Sample>("sample").await, Some(sample));

        // Poisoned entry must read as a miss, not an error
        store.set("sample", b"{not json", None).await;
        assert_eq!(store.get_json::<Sample>("sample").await, None);
    }

    #[tokio::test]
    async fn test_stats_reset() {
        let store = memory_store();
        store.set("k1", b"v1", None).await;
        store.get("k1").await;

        store.reset_stats();
        let stats = store.stats();
        assert_eq!(stats.hits, 0);
        assert_eq!(stats.writes, 0);
        assert_eq!(stats.total_requests, 0);
    }
}
