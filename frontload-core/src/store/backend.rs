//! Cache backend contract
//!
//! Backends speak to the actual cache service and are allowed to fail; the
//! fail-open policy lives one layer up in `KeyValueStore`.

use async_trait::async_trait;
use std::time::Duration;

use crate::error::BackendError;

/// One entry of a pipelined bulk write
#[derive(Debug, Clone)]
pub struct CacheEntry {
    /// Full cache key, prefix included
    pub key: String,
    /// Serialized payload
    pub value: Vec<u8>,
    /// Expiration; `None` means no expiry
    pub ttl: Option<Duration>,
}

impl CacheEntry {
    /// Create an entry without expiration
    pub fn new(key: impl Into<String>, value: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            value,
            ttl: None,
        }
    }

    /// Create an entry that expires after `ttl`
    pub fn with_ttl(key: impl Into<String>, value: Vec<u8>, ttl: Duration) -> Self {
        Self {
            key: key.into(),
            value,
            ttl: Some(ttl),
        }
    }
}

/// Remaining lifetime of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyTtl {
    /// Key does not exist
    Missing,
    /// Key exists and never expires
    Persistent,
    /// Key expires after the given duration
    Expires(Duration),
}

/// Raw operations against a cache service
///
/// Implementations must be safe for concurrent use from many simultaneously
/// resolving batches; no caller may assume exclusive access. `mset` must be
/// a single round trip, not one write per entry.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Backend name for logs and reports
    fn name(&self) -> &'static str;

    /// Fetch a single value; `None` for a missing or expired key
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BackendError>;

    /// Fetch many values, preserving input order and arity
    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, BackendError>;

    /// Store a value, optionally with an expiration
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>) -> Result<(), BackendError>;

    /// Store many values in one pipelined round trip
    async fn mset(&self, entries: &[CacheEntry]) -> Result<(), BackendError>;

    /// Delete keys, returning how many existed
    async fn del(&self, keys: &[String]) -> Result<u64, BackendError>;

    /// Whether a key exists and is unexpired
    async fn exists(&self, key: &str) -> Result<bool, BackendError>;

    /// Remaining lifetime of a key
    async fn ttl(&self, key: &str) -> Result<KeyTtl, BackendError>;

    /// Atomically add `by` to an integer counter, creating it at zero
    async fn incr(&self, key: &str, by: i64) -> Result<i64, BackendError>;

    /// Lightweight liveness round trip
    async fn ping(&self) -> Result<(), BackendError>;

    /// Remove every key
    async fn flush(&self) -> Result<(), BackendError>;

    /// Release held resources (connection pools); further calls may fail
    fn close(&self) {}
}
