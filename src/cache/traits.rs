//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};

use crate::portal::types::{Resource, ResourceKind};

/// Typed access to one resource kind stored in the cache.
///
/// The cache itself holds `Resource` values; implementors convert between
/// their concrete type and the tagged representation at the cache boundary.
pub trait Cacheable: Clone + Send + Sync + 'static {
  /// Resource kind used to build cache keys
  fn entity_type() -> ResourceKind;

  fn into_resource(self) -> Resource;

  /// Returns None when the resource is of another kind.
  fn from_resource(resource: &Resource) -> Option<Self>;
}

/// Parameters of a list query.
pub trait QueryKey {
  /// Kind of the resources the query returns
  fn kind(&self) -> ResourceKind;

  /// Stable, fixed-length hash of the normalized parameters
  fn cache_hash(&self) -> String;

  /// Human readable description for logs
  fn description(&self) -> String;
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache, superseded by a newer fetch that started meanwhile
  CacheStale,
  /// Offline mode - network unavailable, serving cached data
  Offline,
}
