//! Query cache with snapshot/restore support and optional persistence.
//!
//! This module provides the single store every reader and writer goes through:
//! - Entity and list entries keyed by `CacheKey`, each with a fresh/stale flag
//! - Cache-first fetching with offline fallback to stale data
//! - Cancellation of pending fetches and invalidation with refetch
//! - Atomic optimistic writes that hand back a `Snapshot` for exact rollback
//! - Write-through of server-confirmed entries to a `CacheStorage` backend

mod entry;
mod error;
mod snapshot;
mod storage;
mod store;
mod traits;

pub use entry::{CacheEntry, CacheKey, CacheValue};
pub use error::CacheError;
pub use snapshot::Snapshot;
pub use storage::{CacheStorage, NoopStorage, SqliteStorage};
pub use store::{Projection, QueryCache};
pub use traits::{CacheResult, CacheSource, Cacheable, QueryKey};
