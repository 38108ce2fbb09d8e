//! Cache-aside loaders
//!
//! A loader owns a `BatchCoalescer` and resolves each closed batch with
//! cache-aside semantics: consult the key-value store for the whole batch,
//! bulk-fetch only the misses from the backing store, populate the cache for
//! freshly fetched records with the entity's TTL, and report unmatched keys
//! as not-found.
//!
//! Absence is never cached, so a record created moments after a miss is
//! visible on the very next load. A degraded cache only costs latency: every
//! key becomes a miss and population is skipped.

use dashmap::DashMap;
use futures::future::join_all;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Display;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::batch::coalescer::{BatchCoalescer, BatchResolver};
use crate::batch::source::{BackingStore, GroupedBackingStore, Keyed};
use crate::config::LoaderSettings;
use crate::error::LoadError;
use crate::store::backend::CacheEntry;
use crate::store::kv::{KeyValueStore, StatsSnapshot};

use async_trait::async_trait;

/// Ceiling on one backing-store bulk fetch; a slow source must not hold a
/// batch open indefinitely
const SOURCE_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

fn cache_key<K: Display>(prefix: &str, key: &K) -> String {
    format!("{}:{}", prefix, key)
}

/// Split a batch into deserialized cache hits and the ordered miss set
///
/// Corrupt payloads count as misses and are re-fetched; miss order follows
/// the input key order. `payloads` must have the same arity as `keys`, which
/// the store guarantees even when degraded.
fn partition_cached<K, V>(keys: &[K], payloads: Vec<Option<Vec<u8>>>) -> (HashMap<K, V>, Vec<K>)
where
    K: Eq + Hash + Clone + Display,
    V: DeserializeOwned,
{
    let mut hits = HashMap::new();
    let mut misses = Vec::new();
    for (key, payload) in keys.iter().zip(payloads) {
        match payload {
            Some(bytes) => match serde_json::from_slice(&bytes) {
                Ok(value) => {
                    hits.insert(key.clone(), value);
                }
                Err(err) => {
                    debug!(key = %key, error = %err, "discarding corrupt cache payload");
                    misses.push(key.clone());
                }
            },
            None => misses.push(key.clone()),
        }
    }
    (hits, misses)
}

/// Batch resolver with cache-aside semantics for one entity type
struct CacheAsideResolver<K, V> {
    store: Arc<KeyValueStore>,
    source: Arc<dyn BackingStore<K, V>>,
    ttl: Duration,
    prefix: String,
}

#[async_trait]
impl<K, V> BatchResolver<K, V> for CacheAsideResolver<K, V>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
    V: Keyed<K> + Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    async fn resolve(&self, keys: Vec<K>) -> Result<HashMap<K, V>, LoadError> {
        let cache_keys: Vec<String> = keys
            .iter()
            .map(|key| cache_key(&self.prefix, key))
            .collect();
        let payloads = self.store.mget(&cache_keys).await;
        let (mut results, misses) = partition_cached(&keys, payloads);
        if misses.is_empty() {
            return Ok(results);
        }

        let records = match timeout(SOURCE_FETCH_TIMEOUT, self.source.fetch_many(&misses)).await {
            Ok(result) => result.map_err(|err| LoadError::ResolutionFailed(err.to_string()))?,
            Err(_) => {
                return Err(LoadError::ResolutionFailed(format!(
                    "backing store fetch exceeded {:?}",
                    SOURCE_FETCH_TIMEOUT
                )))
            }
        };

        let mut entries = Vec::with_capacity(records.len());
        for record in records {
            let key = record.key();
            match serde_json::to_vec(&record) {
                Ok(bytes) => {
                    entries.push(CacheEntry::with_ttl(
                        cache_key(&self.prefix, &key),
                        bytes,
                        self.ttl,
                    ));
                }
                Err(err) => warn!(key = %key, error = %err, "failed to encode record for caching"),
            }
            results.insert(key, record);
        }
        // Keys the source did not return are left out of the results, so
        // they resolve to not-found; absence is never written to the cache.
        if !entries.is_empty() && !self.store.mset(&entries).await {
            debug!(entries = entries.len(), "cache population skipped, store degraded");
        }
        Ok(results)
    }
}

/// Batched cache-aside loader for one entity type
///
/// Cloning is cheap and shares the coalescer, store, and memo.
pub struct CacheAsideLoader<K, V> {
    coalescer: BatchCoalescer<K, V>,
    store: Arc<KeyValueStore>,
    memo: Arc<DashMap<K, V>>,
}

impl<K, V> Clone for CacheAsideLoader<K, V> {
    fn clone(&self) -> Self {
        Self {
            coalescer: self.coalescer.clone(),
            store: Arc::clone(&self.store),
            memo: Arc::clone(&self.memo),
        }
    }
}

impl<K, V> CacheAsideLoader<K, V>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
    V: Keyed<K> + Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Create a loader for one entity type
    pub fn new(
        settings: &LoaderSettings,
        store: Arc<KeyValueStore>,
        source: Arc<dyn BackingStore<K, V>>,
    ) -> Self {
        let resolver: Arc<dyn BatchResolver<K, V>> = Arc::new(CacheAsideResolver {
            store: Arc::clone(&store),
            source,
            ttl: settings.cache_ttl(),
            prefix: settings.cache_key_prefix.clone(),
        });
        Self {
            coalescer: BatchCoalescer::new(settings.window(), settings.max_batch_size, resolver),
            store,
            memo: Arc::new(DashMap::new()),
        }
    }

    /// Load one record; `Ok(None)` means the record does not exist
    ///
    /// Resolved records are memoized for the life of the request scope;
    /// not-found results are not, so a record created after a miss is found
    /// on the very next call.
    pub async fn load(&self, key: K) -> Result<Option<V>, LoadError> {
        if let Some(memoized) = self.memo.get(&key) {
            return Ok(Some(memoized.clone()));
        }
        let resolved = self.coalescer.load(key.clone()).await?;
        if let Some(value) = &resolved {
            self.memo.insert(key, value.clone());
        }
        Ok(resolved)
    }

    /// Load many records, preserving input order
    pub async fn load_many(&self, keys: Vec<K>) -> Result<Vec<Option<V>>, LoadError> {
        join_all(keys.into_iter().map(|key| self.load(key)))
            .await
            .into_iter()
            .collect()
    }

    /// Purge the request-scoped memo (between isolated request lifecycles)
    pub fn clear_all(&self) {
        self.memo.clear();
    }

    /// Operational counters of the underlying store
    pub fn stats(&self) -> StatsSnapshot {
        self.store.stats()
    }
}

/// Batch resolver for "children by parent key" relations
struct GroupedResolver<K, R> {
    store: Arc<KeyValueStore>,
    source: Arc<dyn GroupedBackingStore<K, R>>,
    ttl: Duration,
    prefix: String,
}

#[async_trait]
impl<K, R> BatchResolver<K, Vec<R>> for GroupedResolver<K, R>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
    R: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    async fn resolve(&self, parents: Vec<K>) -> Result<HashMap<K, Vec<R>>, LoadError> {
        let cache_keys: Vec<String> = parents
            .iter()
            .map(|parent| cache_key(&self.prefix, parent))
            .collect();
        let payloads = self.store.mget(&cache_keys).await;
        let (mut results, misses) = partition_cached(&parents, payloads);
        if misses.is_empty() {
            return Ok(results);
        }

        let mut grouped =
            match timeout(SOURCE_FETCH_TIMEOUT, self.source.fetch_grouped(&misses)).await {
                Ok(result) => result.map_err(|err| LoadError::ResolutionFailed(err.to_string()))?,
                Err(_) => {
                    return Err(LoadError::ResolutionFailed(format!(
                        "backing store fetch exceeded {:?}",
                        SOURCE_FETCH_TIMEOUT
                    )))
                }
            };

        let mut entries = Vec::with_capacity(misses.len());
        for parent in &misses {
            // An absent parent means zero children, a real cacheable value
            let group = grouped.remove(parent).unwrap_or_default();
            match serde_json::to_vec(&group) {
                Ok(bytes) => {
                    entries.push(CacheEntry::with_ttl(
                        cache_key(&self.prefix, parent),
                        bytes,
                        self.ttl,
                    ));
                }
                Err(err) => {
                    warn!(parent = %parent, error = %err, "failed to encode group for caching")
                }
            }
            results.insert(parent.clone(), group);
        }
        if !entries.is_empty() && !self.store.mset(&entries).await {
            debug!(entries = entries.len(), "cache population skipped, store degraded");
        }
        Ok(results)
    }
}

/// Batched cache-aside loader for child records grouped by parent key
pub struct GroupedCacheAsideLoader<K, R> {
    coalescer: BatchCoalescer<K, Vec<R>>,
    store: Arc<KeyValueStore>,
    memo: Arc<DashMap<K, Vec<R>>>,
}

impl<K, R> Clone for GroupedCacheAsideLoader<K, R> {
    fn clone(&self) -> Self {
        Self {
            coalescer: self.coalescer.clone(),
            store: Arc::clone(&self.store),
            memo: Arc::clone(&self.memo),
        }
    }
}

impl<K, R> GroupedCacheAsideLoader<K, R>
where
    K: Eq + Hash + Clone + Display + Send + Sync + 'static,
    R: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Create a grouped loader for one parent/child relation
    pub fn new(
        settings: &LoaderSettings,
        store: Arc<KeyValueStore>,
        source: Arc<dyn GroupedBackingStore<K, R>>,
    ) -> Self {
        let resolver: Arc<dyn BatchResolver<K, Vec<R>>> = Arc::new(GroupedResolver {
            store: Arc::clone(&store),
            source,
            ttl: settings.cache_ttl(),
            prefix: settings.cache_key_prefix.clone(),
        });
        Self {
            coalescer: BatchCoalescer::new(settings.window(), settings.max_batch_size, resolver),
            store,
            memo: Arc::new(DashMap::new()),
        }
    }

    /// Load the children of one parent; a childless parent yields an empty
    /// group, never an error
    pub async fn load(&self, parent: K) -> Result<Vec<R>, LoadError> {
        if let Some(memoized) = self.memo.get(&parent) {
            return Ok(memoized.clone());
        }
        let group = self
            .coalescer
            .load(parent.clone())
            .await?
            .unwrap_or_default();
        self.memo.insert(parent, group.clone());
        Ok(group)
    }

    /// Load the children of many parents, preserving input order
    pub async fn load_many(&self, parents: Vec<K>) -> Result<Vec<Vec<R>>, LoadError> {
        join_all(parents.into_iter().map(|parent| self.load(parent)))
            .await
            .into_iter()
            .collect()
    }

    /// Purge the request-scoped memo
    pub fn clear_all(&self) {
        self.memo.clear();
    }

    /// Operational counters of the underlying store
    pub fn stats(&self) -> StatsSnapshot {
        self.store.stats()
    }
}
