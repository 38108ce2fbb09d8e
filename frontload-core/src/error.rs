//! Error types for the data access layer
//!
//! Two families with deliberately different reach:
//! - `BackendError` covers cache transport faults and is absorbed by the
//!   fail-open `KeyValueStore`; it never crosses the store's public API
//! - `LoadError` is the uniform batch-failure signal surfaced to `load`
//!   callers when the backing store cannot be reached

use std::time::Duration;
use thiserror::Error;

/// Fault raised by a cache backend.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The cache service could not be reached or the connection dropped.
    #[error("cache connection failed: {0}")]
    Connection(String),

    /// The operation exceeded its deadline.
    #[error("cache operation timed out after {0:?}")]
    Timeout(Duration),

    /// The cache service answered but the exchange was malformed
    /// (wrong type for the command, unparsable reply).
    #[error("cache protocol error: {0}")]
    Protocol(String),
}

/// Outcome surfaced to a `load` caller when its batch cannot resolve.
///
/// Not-found is not an error; it is `Ok(None)` on the load path. These
/// variants exist so a failed bulk fetch resolves every waiter of the batch
/// with the same retryable signal instead of a partial state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LoadError {
    /// The backing-store bulk fetch for the batch failed; the caller may
    /// retry, the data may well exist.
    #[error("batch resolution failed: {0}")]
    ResolutionFailed(String),

    /// The batch was dropped before resolving (loader shut down).
    #[error("batch was dropped before resolving")]
    Shutdown,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_error_is_cloneable_for_fan_out() {
        let err = LoadError::ResolutionFailed("source offline".to_string());
        let copy = err.clone();
        assert_eq!(err, copy);
        assert_eq!(copy.to_string(), "batch resolution failed: source offline");
    }

    #[test]
    fn test_backend_error_display() {
        let err = BackendError::Timeout(Duration::from_millis(250));
        assert!(err.to_string().contains("250ms"));
    }
}
