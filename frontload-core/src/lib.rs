//! Frontload Core - Batched cache-aside data access layer
//!
//! This crate provides the foundational components for frontload:
//! - A fail-open key-value store over pluggable cache backends
//! - Batch coalescing of concurrent point lookups into bulk fetches
//! - Cache-aside loaders with per-entity-type TTL policies
//! - Configuration and operational reporting

pub mod batch;
pub mod config;
pub mod error;
pub mod store;

pub use batch::*;
pub use config::*;
pub use error::*;
pub use store::*;
