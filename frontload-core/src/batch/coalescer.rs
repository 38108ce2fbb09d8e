//! Batch coalescing for point lookups
//!
//! Groups concurrently-arriving `load` calls into one bulk resolution per
//! scheduling window. A batch closes when its window elapses or it reaches
//! the size cap, whichever comes first; exactly one dispatch happens per
//! batch, and every waiter is fanned the result for its key.
//!
//! The open-batch state is guarded by a mutex that is never held across an
//! await, so resolution I/O for one batch never blocks appends to the next:
//! batches pipeline rather than serialize.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::LoadError;

/// Resolves one closed batch of unique keys to a key -> value map
///
/// Keys absent from the returned map resolve to not-found. An error fails
/// every waiter of the batch with the same signal.
#[async_trait]
pub trait BatchResolver<K, V>: Send + Sync
where
    K: Send,
    V: Send,
{
    async fn resolve(&self, keys: Vec<K>) -> Result<HashMap<K, V>, LoadError>;
}

type Waiter<V> = oneshot::Sender<Result<Option<V>, LoadError>>;

/// One open batch: unique keys in insertion order plus every caller
/// waiting on each key
struct OpenBatch<K, V> {
    id: u64,
    keys: Vec<K>,
    waiters: HashMap<K, Vec<Waiter<V>>>,
}

impl<K, V> OpenBatch<K, V> {
    fn new(id: u64) -> Self {
        Self {
            id,
            keys: Vec::new(),
            waiters: HashMap::new(),
        }
    }
}

struct Inner<K, V> {
    window: Duration,
    max_batch_size: usize,
    resolver: Arc<dyn BatchResolver<K, V>>,
    /// Open batch, if any. Append and close-swap must be atomic with
    /// respect to each other; this lock is never held across an await.
    state: Mutex<Option<OpenBatch<K, V>>>,
    next_batch_id: AtomicU64,
}

/// Coalesces individual lookups into batched resolutions for one entity type
pub struct BatchCoalescer<K, V> {
    inner: Arc<Inner<K, V>>,
}

impl<K, V> Clone for BatchCoalescer<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, V> BatchCoalescer<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    /// Create a coalescer that closes batches after `window` or at
    /// `max_batch_size` unique keys
    pub fn new(
        window: Duration,
        max_batch_size: usize,
        resolver: Arc<dyn BatchResolver<K, V>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                window,
                // a zero-size batch could never dispatch
                max_batch_size: max_batch_size.max(1),
                resolver,
                state: Mutex::new(None),
                next_batch_id: AtomicU64::new(0),
            }),
        }
    }

    /// Look up one key, suspending until its batch resolves
    ///
    /// `Ok(None)` means the resolver had no value for the key. Dropping the
    /// returned future abandons the wait without cancelling the shared
    /// batch.
    pub async fn load(&self, key: K) -> Result<Option<V>, LoadError> {
        let (tx, rx) = oneshot::channel();
        let mut opened = None;
        let mut full_batch = None;
        {
            let mut state = self.inner.state.lock();
            let batch = state.get_or_insert_with(|| {
                let id = self.inner.next_batch_id.fetch_add(1, Ordering::Relaxed);
                opened = Some(id);
                OpenBatch::new(id)
            });
            if !batch.waiters.contains_key(&key) {
                batch.keys.push(key.clone());
            }
            batch.waiters.entry(key).or_default().push(tx);
            if batch.keys.len() >= self.inner.max_batch_size {
                full_batch = state.take();
            }
        }

        if let Some(batch) = full_batch {
            self.spawn_dispatch(batch);
        } else if let Some(batch_id) = opened {
            self.arm_window_timer(batch_id);
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(LoadError::Shutdown),
        }
    }

    /// Close the batch with `batch_id` when its window elapses, unless it
    /// already closed by filling up
    fn arm_window_timer(&self, batch_id: u64) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(inner.window).await;
            let batch = {
                let mut state = inner.state.lock();
                match state.as_ref() {
                    Some(open) if open.id == batch_id => state.take(),
                    _ => None,
                }
            };
            if let Some(batch) = batch {
                inner.dispatch(batch).await;
            }
        });
    }

    fn spawn_dispatch(&self, batch: OpenBatch<K, V>) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.dispatch(batch).await;
        });
    }
}

impl<K, V> Inner<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    async fn dispatch(&self, batch: OpenBatch<K, V>) {
        let OpenBatch { id, keys, waiters } = batch;
        debug!(batch_id = id, keys = keys.len(), "dispatching batch");

        match self.resolver.resolve(keys).await {
            Ok(mut results) => {
                for (key, senders) in waiters {
                    let value = results.remove(&key);
                    for sender in senders {
                        let _ = sender.send(Ok(value.clone()));
                    }
                }
            }
            Err(err) => {
                warn!(batch_id = id, error = %err, "batch resolution failed");
                for senders in waiters.into_values() {
                    for sender in senders {
                        let _ = sender.send(Err(err.clone()));
                    }
                }
            }
        }
    }
}
