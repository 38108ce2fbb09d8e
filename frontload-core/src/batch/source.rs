//! Backing store contracts
//!
//! The loaders call these adapters for the cache-miss subset of a batch.
//! Adapters are the source of truth: their failures fail the whole batch,
//! unlike cache faults which only degrade latency.

use async_trait::async_trait;
use std::collections::HashMap;
use std::hash::Hash;

/// A record that carries its own lookup key, so bulk-fetched rows can be
/// re-associated with the keys that requested them
pub trait Keyed<K> {
    fn key(&self) -> K;
}

/// Bulk point-lookup adapter
///
/// Must query exactly the given keys; keys with no record are simply absent
/// from the result, which the loader reports as not-found.
#[async_trait]
pub trait BackingStore<K, R>: Send + Sync
where
    K: Send + Sync,
    R: Send,
{
    async fn fetch_many(&self, keys: &[K]) -> anyhow::Result<Vec<R>>;
}

/// Bulk child-lookup adapter for "children by parent key" relations
///
/// A parent with no children may be absent from the map or mapped to an
/// empty group; both mean zero children, which is a valid result distinct
/// from not-found.
#[async_trait]
pub trait GroupedBackingStore<K, R>: Send + Sync
where
    K: Eq + Hash + Send + Sync,
    R: Send,
{
    async fn fetch_grouped(&self, parent_keys: &[K]) -> anyhow::Result<HashMap<K, Vec<R>>>;
}
