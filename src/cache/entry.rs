//! Cache keys, values and entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::traits::QueryKey;
use crate::portal::types::{Resource, ResourceKind};

/// Composite key of a cached value.
///
/// Entity keys address one resource by id; list keys address the result of a
/// query, identified by the hash of its normalized parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum CacheKey {
  Entity { kind: ResourceKind, id: String },
  List { kind: ResourceKind, query: String },
}

impl CacheKey {
  pub fn entity(kind: ResourceKind, id: impl Into<String>) -> Self {
    CacheKey::Entity {
      kind,
      id: id.into(),
    }
  }

  pub fn list(query: &impl QueryKey) -> Self {
    CacheKey::List {
      kind: query.kind(),
      query: query.cache_hash(),
    }
  }

  pub fn kind(&self) -> ResourceKind {
    match self {
      CacheKey::Entity { kind, .. } | CacheKey::List { kind, .. } => *kind,
    }
  }

  pub fn is_list(&self) -> bool {
    matches!(self, CacheKey::List { .. })
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      CacheKey::Entity { kind, id } => write!(f, "{}/{}", kind, id),
      // Hashes are long, the prefix is enough to tell lists apart in logs
      CacheKey::List { kind, query } => {
        let prefix: String = query.chars().take(12).collect();
        write!(f, "{}?{}", kind, prefix)
      }
    }
  }
}

/// The value stored under a key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheValue {
  Entity(Resource),
  List(Vec<Resource>),
}

impl CacheValue {
  /// Check that this value may be stored under `key`.
  pub fn validate_for(&self, key: &CacheKey) -> Result<(), String> {
    match (key, self) {
      (CacheKey::Entity { kind, id }, CacheValue::Entity(resource)) => {
        resource.validate()?;
        if resource.kind() != *kind {
          return Err(format!("expected a {}, got a {}", kind, resource.kind()));
        }
        if resource.id() != id {
          return Err(format!("expected id {}, got {}", id, resource.id()));
        }
        Ok(())
      }
      (CacheKey::List { kind, .. }, CacheValue::List(items)) => {
        for item in items {
          item.validate()?;
          if item.kind() != *kind {
            return Err(format!("list of {} contains a {}", kind, item.kind()));
          }
        }
        Ok(())
      }
      (CacheKey::Entity { .. }, CacheValue::List(_)) => Err("list stored under an entity key".into()),
      (CacheKey::List { .. }, CacheValue::Entity(_)) => Err("entity stored under a list key".into()),
    }
  }

  pub fn contains(&self, id: &str) -> bool {
    match self {
      CacheValue::Entity(r) => r.id() == id,
      CacheValue::List(items) => items.iter().any(|r| r.id() == id),
    }
  }

  pub fn as_entity(&self) -> Option<&Resource> {
    match self {
      CacheValue::Entity(r) => Some(r),
      CacheValue::List(_) => None,
    }
  }

  pub fn as_list(&self) -> Option<&[Resource]> {
    match self {
      CacheValue::List(items) => Some(items),
      CacheValue::Entity(_) => None,
    }
  }
}

/// A cached value with its freshness metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
  pub value: CacheValue,
  /// When the value was last written from server truth
  pub cached_at: DateTime<Utc>,
  /// Set by invalidation, cleared by the next successful fetch
  pub stale: bool,
}

impl CacheEntry {
  pub fn fresh(value: CacheValue) -> Self {
    Self {
      value,
      cached_at: Utc::now(),
      stale: false,
    }
  }
}
