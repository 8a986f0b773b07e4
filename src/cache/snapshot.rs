//! Pre-mutation copies of cache entries.

use std::collections::BTreeMap;

use super::entry::{CacheEntry, CacheKey};

/// Immutable copy of every entry a mutation is about to touch.
///
/// `None` records that the key was absent, so restoring removes whatever the
/// optimistic write put there. A snapshot is not `Clone`: it belongs to exactly
/// one mutation attempt and is consumed by `QueryCache::restore` or dropped
/// on success.
///
/// `targets` are the resource ids the mutation rewrote. Lists are shared by
/// mutations on different resources, so a list is restored slot by slot for
/// these ids only; entity keys are restored whole.
#[derive(Debug, Default)]
pub struct Snapshot {
  entries: BTreeMap<CacheKey, Option<CacheEntry>>,
  targets: Vec<String>,
}

impl Snapshot {
  pub(crate) fn record(&mut self, key: CacheKey, entry: Option<CacheEntry>) {
    self.entries.entry(key).or_insert(entry);
  }

  pub(crate) fn target(&mut self, id: &str) {
    if !self.targets.iter().any(|t| t == id) {
      self.targets.push(id.to_string());
    }
  }

  pub fn targets(&self) -> &[String] {
    &self.targets
  }

  /// The recorded entry, `Some(None)` if the key was recorded as absent.
  pub fn get(&self, key: &CacheKey) -> Option<&Option<CacheEntry>> {
    self.entries.get(key)
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  pub(crate) fn into_parts(self) -> (BTreeMap<CacheKey, Option<CacheEntry>>, Vec<String>) {
    (self.entries, self.targets)
  }
}
