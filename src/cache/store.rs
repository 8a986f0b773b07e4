//! Query cache shared by readers, the mutation coordinator and the status poller.

use chrono::{Duration, Utc};
use color_eyre::{eyre::eyre, Result};
use futures::future::{join_all, BoxFuture};
use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use super::entry::{CacheEntry, CacheKey, CacheValue};
use super::error::CacheError;
use super::snapshot::Snapshot;
use super::storage::{CacheStorage, NoopStorage};
use super::traits::{CacheResult, Cacheable, QueryKey};
use crate::portal::types::{Resource, ResourceKind};

/// Pure function from the current value of a resource to its expected
/// post-mutation value. `Ok(None)` removes the resource, `Err` rejects the
/// mutation before anything is written.
pub type Projection = dyn Fn(&Resource) -> std::result::Result<Option<Resource>, String> + Send + Sync;

type Fetcher = Arc<dyn Fn() -> BoxFuture<'static, Result<CacheValue>> + Send + Sync>;

#[derive(Default)]
struct CacheState {
  entries: HashMap<CacheKey, CacheEntry>,
  /// Bumped whenever pending fetches for a key must be ignored
  generations: HashMap<CacheKey, u64>,
  in_flight: HashMap<CacheKey, AbortHandle>,
  fetchers: HashMap<CacheKey, Fetcher>,
}

impl CacheState {
  fn generation(&self, key: &CacheKey) -> u64 {
    self.generations.get(key).copied().unwrap_or(0)
  }

  fn cancel(&mut self, key: &CacheKey) {
    *self.generations.entry(key.clone()).or_insert(0) += 1;
    if let Some(handle) = self.in_flight.remove(key) {
      handle.abort();
      trace!(%key, "cancelled background fetch");
    }
  }
}

/// In-process cache of server state.
///
/// Reads go memory first, then the persistent backend. All writes go through
/// typed accessors on this type; there is no global instance, callers share
/// one through an `Arc`.
pub struct QueryCache {
  state: Mutex<CacheState>,
  storage: Arc<dyn CacheStorage>,
  /// How long before cached data is considered stale
  stale_time: Duration,
}

impl QueryCache {
  /// Create a cache persisting confirmed entries to `storage`.
  pub fn new(storage: impl CacheStorage + 'static) -> Self {
    Self {
      state: Mutex::new(CacheState::default()),
      storage: Arc::new(storage),
      stale_time: Duration::minutes(5),
    }
  }

  /// Create a cache that keeps everything in memory.
  pub fn in_memory() -> Self {
    Self::new(NoopStorage)
  }

  /// Set the stale time for cached data.
  pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
    self.stale_time = stale_time;
    self
  }

  fn lock(&self) -> MutexGuard<'_, CacheState> {
    // The state is plain data, a panic elsewhere cannot leave it half-written
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn is_fresh(&self, entry: &CacheEntry) -> bool {
    !entry.stale && Utc::now() - entry.cached_at <= self.stale_time
  }

  /// Memory lookup falling back to the persistent backend.
  fn hydrate(&self, state: &mut CacheState, key: &CacheKey) -> Option<CacheEntry> {
    if let Some(entry) = state.entries.get(key) {
      return Some(entry.clone());
    }

    match self.storage.load(key) {
      Ok(Some(entry)) => {
        state.entries.insert(key.clone(), entry.clone());
        Some(entry)
      }
      Ok(None) => None,
      Err(e) => {
        warn!(%key, error = %e, "failed to load cache entry");
        None
      }
    }
  }

  fn persist(&self, key: &CacheKey, entry: &CacheEntry) {
    if let Err(e) = self.storage.store(key, entry) {
      warn!(%key, error = %e, "failed to persist cache entry");
    }
  }

  /// Current entry for a key, if any.
  pub fn get(&self, key: &CacheKey) -> Option<CacheEntry> {
    let mut state = self.lock();
    self.hydrate(&mut state, key)
  }

  /// Typed read of a single entity.
  pub fn get_entity<T: Cacheable>(&self, id: &str) -> Option<T> {
    let entry = self.get(&CacheKey::entity(T::entity_type(), id))?;
    entry.value.as_entity().and_then(T::from_resource)
  }

  /// Typed read of a cached list.
  pub fn get_list<T: Cacheable>(&self, key: &CacheKey) -> Option<Vec<T>> {
    let entry = self.get(key)?;
    let items = entry.value.as_list()?;
    Some(items.iter().filter_map(T::from_resource).collect())
  }

  /// Whether the entry under `key` exists and is fresh.
  pub fn is_key_fresh(&self, key: &CacheKey) -> bool {
    self.get(key).is_some_and(|entry| self.is_fresh(&entry))
  }

  /// Write server-confirmed data.
  pub fn set(&self, key: &CacheKey, value: CacheValue) -> std::result::Result<(), CacheError> {
    validate(key, &value)?;
    let entry = CacheEntry::fresh(value);
    self.lock().entries.insert(key.clone(), entry.clone());
    self.persist(key, &entry);
    Ok(())
  }

  /// Write a fetched resource to its entity key and to every cached list
  /// holding it, so list and entity never disagree.
  pub fn replace_resource(&self, resource: Resource) -> std::result::Result<(), CacheError> {
    let entity_key = CacheKey::entity(resource.kind(), resource.id());
    let entity_value = CacheValue::Entity(resource.clone());
    validate(&entity_key, &entity_value)?;

    let mut written = vec![(entity_key.clone(), CacheEntry::fresh(entity_value))];
    {
      let mut state = self.lock();
      for (key, entry) in state.entries.iter_mut() {
        if !key.is_list() || key.kind() != resource.kind() {
          continue;
        }
        if let CacheValue::List(items) = &mut entry.value {
          let mut touched = false;
          for item in items.iter_mut().filter(|item| item.id() == resource.id()) {
            *item = resource.clone();
            touched = true;
          }
          if touched {
            written.push((key.clone(), entry.clone()));
          }
        }
      }
      state
        .entries
        .insert(entity_key.clone(), written[0].1.clone());
    }

    for (key, entry) in &written {
      self.persist(key, entry);
    }
    Ok(())
  }

  /// Drop a key, e.g. the entity of a resource deleted on the server.
  pub fn remove(&self, key: &CacheKey) {
    {
      let mut state = self.lock();
      state.cancel(key);
      state.entries.remove(key);
      state.fetchers.remove(key);
    }
    if let Err(e) = self.storage.remove(key) {
      warn!(%key, error = %e, "failed to remove persisted cache entry");
    }
  }

  /// Attach the fetcher used to (re)load `key`.
  pub fn register_fetcher<F, Fut>(&self, key: &CacheKey, fetcher: F)
  where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<CacheValue>> + Send + 'static,
  {
    let fetcher: Fetcher =
      Arc::new(move || -> BoxFuture<'static, Result<CacheValue>> { Box::pin(fetcher()) });
    self.lock().fetchers.insert(key.clone(), fetcher);
  }

  /// Fetch with cache-first strategy.
  ///
  /// 1. Check cache - if fresh, return immediately
  /// 2. If stale/missing, fetch from network
  /// 3. On network failure, return stale cache (offline mode)
  /// 4. Update cache with new data, unless the key was cancelled meanwhile
  async fn fetch_value(&self, key: &CacheKey, fetcher: Fetcher) -> Result<CacheResult<CacheValue>> {
    let (cached, generation) = {
      let mut state = self.lock();
      state.fetchers.insert(key.clone(), Arc::clone(&fetcher));
      (self.hydrate(&mut state, key), state.generation(key))
    };

    if let Some(entry) = &cached {
      if self.is_fresh(entry) {
        return Ok(CacheResult::from_cache(
          entry.value.clone(),
          entry.cached_at,
          false,
        ));
      }
    }

    match fetcher().await {
      Ok(value) => {
        if self.accept_fetched(key, value.clone(), generation)? {
          return Ok(CacheResult::from_network(value));
        }
        // A mutation claimed the key while we were fetching; its view wins
        match self.get(key) {
          Some(current) => Ok(CacheResult::from_cache(
            current.value,
            current.cached_at,
            true,
          )),
          None => Ok(CacheResult::from_network(value)),
        }
      }
      Err(e) => match cached {
        Some(entry) => {
          warn!(%key, error = %e, "fetch failed, serving cached data");
          Ok(CacheResult::offline(entry.value, entry.cached_at))
        }
        None => Err(e),
      },
    }
  }

  /// Fetch a single entity with caching.
  pub async fn fetch_entity<T, F, Fut>(&self, id: &str, fetcher: F) -> Result<CacheResult<T>>
  where
    T: Cacheable,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
  {
    let key = CacheKey::entity(T::entity_type(), id);
    let fetcher: Fetcher = Arc::new(move || -> BoxFuture<'static, Result<CacheValue>> {
      let fut = fetcher();
      Box::pin(async move { fut.await.map(|t| CacheValue::Entity(t.into_resource())) })
    });

    let result = self.fetch_value(&key, fetcher).await?;
    let data = result
      .data
      .as_entity()
      .and_then(T::from_resource)
      .ok_or_else(|| eyre!("Cached value for {} has the wrong shape", key))?;

    Ok(CacheResult {
      data,
      source: result.source,
      cached_at: result.cached_at,
    })
  }

  /// Fetch a list query with caching.
  pub async fn fetch_list<T, Q, F, Fut>(&self, query: &Q, fetcher: F) -> Result<CacheResult<Vec<T>>>
  where
    T: Cacheable,
    Q: QueryKey,
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Vec<T>>> + Send + 'static,
  {
    let key = CacheKey::list(query);
    debug!(%key, query = %query.description(), "fetching list");

    let fetcher: Fetcher = Arc::new(move || -> BoxFuture<'static, Result<CacheValue>> {
      let fut = fetcher();
      Box::pin(async move {
        fut
          .await
          .map(|items| CacheValue::List(items.into_iter().map(Cacheable::into_resource).collect()))
      })
    });

    let result = self.fetch_value(&key, fetcher).await?;
    let items = result
      .data
      .as_list()
      .ok_or_else(|| eyre!("Cached value for {} has the wrong shape", key))?
      .iter()
      .filter_map(T::from_resource)
      .collect();

    Ok(CacheResult {
      data: items,
      source: result.source,
      cached_at: result.cached_at,
    })
  }

  /// Store a fetch result unless the key was cancelled after it started.
  fn accept_fetched(
    &self,
    key: &CacheKey,
    value: CacheValue,
    generation: u64,
  ) -> std::result::Result<bool, CacheError> {
    validate(key, &value)?;
    let entry = CacheEntry::fresh(value);
    {
      let mut state = self.lock();
      if state.generation(key) != generation {
        trace!(%key, "discarding superseded fetch result");
        return Ok(false);
      }
      state.in_flight.remove(key);
      state.entries.insert(key.clone(), entry.clone());
    }
    self.persist(key, &entry);
    Ok(true)
  }

  /// Cancel pending fetches so their results cannot overwrite what the
  /// caller is about to write.
  pub fn cancel_queries(&self, keys: &[CacheKey]) {
    let mut state = self.lock();
    for key in keys {
      state.cancel(key);
    }
  }

  /// Refetch `key` in the background with its registered fetcher.
  ///
  /// Returns false if no fetcher is registered. A refetch already in flight
  /// is reused rather than duplicated.
  pub fn spawn_refetch(self: &Arc<Self>, key: &CacheKey) -> bool {
    let mut state = self.lock();
    if state.in_flight.contains_key(key) {
      return true;
    }
    let Some(fetcher) = state.fetchers.get(key).cloned() else {
      return false;
    };

    let generation = state.generation(key);
    let cache = Arc::clone(self);
    let task_key = key.clone();
    let handle = tokio::spawn(async move {
      match fetcher().await {
        Ok(value) => {
          if let Err(e) = cache.accept_fetched(&task_key, value, generation) {
            warn!(key = %task_key, error = %e, "background fetch returned invalid data");
          }
        }
        Err(e) => warn!(key = %task_key, error = %e, "background fetch failed"),
      }
      let mut state = cache.lock();
      if state.generation(&task_key) == generation {
        state.in_flight.remove(&task_key);
      }
    });

    state.in_flight.insert(key.clone(), handle.abort_handle());
    true
  }

  /// Whether a background fetch for `key` is currently running.
  pub fn is_fetching(&self, key: &CacheKey) -> bool {
    self.lock().in_flight.contains_key(key)
  }

  /// Mark keys stale, then refetch those with a registered fetcher.
  ///
  /// Resolves once every refetch has settled. Failed refetches leave the
  /// entry stale so the next read retries.
  pub async fn invalidate(&self, keys: &[CacheKey]) {
    let mut refetches = Vec::new();
    {
      let mut state = self.lock();
      for key in keys {
        if let Some(entry) = state.entries.get_mut(key) {
          entry.stale = true;
        }
        if let Some(fetcher) = state.fetchers.get(key) {
          refetches.push((key.clone(), Arc::clone(fetcher), state.generation(key)));
        }
      }
    }

    for key in keys {
      if let Err(e) = self.storage.mark_stale(key) {
        warn!(%key, error = %e, "failed to mark persisted entry stale");
      }
    }

    debug!(keys = keys.len(), refetches = refetches.len(), "invalidating");

    let results = join_all(refetches.into_iter().map(|(key, fetcher, generation)| async move {
      let result = fetcher().await;
      (key, generation, result)
    }))
    .await;

    for (key, generation, result) in results {
      match result {
        Ok(value) => {
          if let Err(e) = self.accept_fetched(&key, value, generation) {
            warn!(%key, error = %e, "refetch returned invalid data");
          }
        }
        Err(e) => warn!(%key, error = %e, "refetch failed, entry stays stale"),
      }
    }
  }

  /// Invalidate every known key of one resource kind.
  pub async fn invalidate_kind(&self, kind: ResourceKind) {
    let keys: Vec<CacheKey> = {
      let state = self.lock();
      let keys: BTreeSet<CacheKey> = state
        .entries
        .keys()
        .chain(state.fetchers.keys())
        .filter(|key| key.kind() == kind)
        .cloned()
        .collect();
      keys.into_iter().collect()
    };

    if let Err(e) = self.storage.mark_kind_stale(kind) {
      warn!(%kind, error = %e, "failed to mark persisted entries stale");
    }
    self.invalidate(&keys).await;
  }

  /// Keys currently holding the resource: its entity key plus every cached
  /// list of the same kind that contains it.
  pub fn keys_containing(&self, kind: ResourceKind, id: &str) -> Vec<CacheKey> {
    let entity_key = CacheKey::entity(kind, id);
    let mut state = self.lock();
    let mut keys = Vec::new();
    if self.hydrate(&mut state, &entity_key).is_some() {
      keys.push(entity_key);
    }
    let mut lists: Vec<CacheKey> = state
      .entries
      .iter()
      .filter(|(key, entry)| key.is_list() && key.kind() == kind && entry.value.contains(id))
      .map(|(key, _)| key.clone())
      .collect();
    lists.sort();
    keys.extend(lists);
    keys
  }

  /// Cancel, snapshot and optimistically rewrite every cached copy of one
  /// resource, in a single critical section.
  ///
  /// `project` is applied to the entity entry and to matching members of
  /// every list of the same kind. `inserts` prepends new resources to the
  /// given list keys when those lists are cached. Nothing is written if any
  /// projection or validation fails.
  pub fn apply_optimistic(
    &self,
    kind: ResourceKind,
    id: &str,
    project: &Projection,
    inserts: &[(CacheKey, Resource)],
  ) -> std::result::Result<Snapshot, CacheError> {
    let entity_key = CacheKey::entity(kind, id);
    let mut state = self.lock();

    let mut affected = vec![entity_key.clone()];
    affected.extend(
      state
        .entries
        .iter()
        .filter(|(key, entry)| key.is_list() && key.kind() == kind && entry.value.contains(id))
        .map(|(key, _)| key.clone()),
    );
    affected.extend(inserts.iter().map(|(key, _)| key.clone()));
    affected.sort();
    affected.dedup();

    let mut snapshot = Snapshot::default();
    snapshot.target(id);
    for (_, resource) in inserts {
      snapshot.target(resource.id());
    }
    for key in &affected {
      state.cancel(key);
      let current = self.hydrate(&mut state, key);
      snapshot.record(key.clone(), current);
    }

    let mut writes: Vec<(CacheKey, Option<CacheEntry>)> = Vec::new();
    for key in &affected {
      let Some(Some(current)) = snapshot.get(key) else {
        continue;
      };

      let projected = match &current.value {
        CacheValue::Entity(resource) => match project(resource) {
          Ok(next) => next.map(CacheValue::Entity),
          Err(reason) => {
            return Err(CacheError::Projection {
              key: key.clone(),
              reason,
            })
          }
        },
        CacheValue::List(items) => {
          let mut next = Vec::with_capacity(items.len() + 1);
          for (list_key, resource) in inserts {
            if list_key == key && !items.iter().any(|item| item.id() == resource.id()) {
              next.push(resource.clone());
            }
          }
          for item in items {
            if item.id() != id {
              next.push(item.clone());
              continue;
            }
            match project(item) {
              Ok(Some(updated)) => next.push(updated),
              Ok(None) => {}
              Err(reason) => {
                return Err(CacheError::Projection {
                  key: key.clone(),
                  reason,
                })
              }
            }
          }
          Some(CacheValue::List(next))
        }
      };

      let entry = match projected {
        Some(value) => {
          validate(key, &value)?;
          Some(CacheEntry {
            value,
            cached_at: current.cached_at,
            stale: current.stale,
          })
        }
        None => None,
      };
      writes.push((key.clone(), entry));
    }

    for (key, entry) in writes {
      match entry {
        Some(entry) => state.entries.insert(key, entry),
        None => state.entries.remove(&key),
      };
    }

    trace!(%entity_key, keys = snapshot.len(), targets = ?snapshot.targets(), "optimistic write applied");
    Ok(snapshot)
  }

  /// Undo an optimistic write.
  ///
  /// Entity keys get their snapshotted entry back as is. Lists put back only
  /// the slots of the snapshot's target ids, at their old positions, so
  /// optimistic writes of other in-flight mutations sharing the list survive.
  /// With no other writer in between, the result equals the snapshot.
  pub fn restore(&self, snapshot: Snapshot) {
    let mut state = self.lock();
    let (entries, targets) = snapshot.into_parts();
    trace!(keys = entries.len(), ?targets, "restoring snapshot");

    for (key, before) in entries {
      state.cancel(&key);

      if !key.is_list() {
        match before {
          Some(entry) => state.entries.insert(key, entry),
          None => state.entries.remove(&key),
        };
        continue;
      }

      // Nothing was written to a list that was not cached
      let Some(before) = before else {
        continue;
      };
      let merged = match (before.value.as_list(), state.entries.get(&key)) {
        (Some(old), Some(current)) => current.value.as_list().map(|now| CacheEntry {
          value: CacheValue::List(restore_slots(old, now, &targets)),
          cached_at: current.cached_at,
          stale: current.stale,
        }),
        _ => None,
      };
      state.entries.insert(key, merged.unwrap_or(before));
    }
  }
}

/// Rebuild `now` with the `targets` slots taken from `before`.
///
/// Each restored item goes right after the nearest item that preceded it in
/// `before` and is still present, else right before the nearest one that
/// followed it, else at its old index.
fn restore_slots(before: &[Resource], now: &[Resource], targets: &[String]) -> Vec<Resource> {
  let is_target = |item: &Resource| targets.iter().any(|t| t == item.id());

  let mut items: Vec<Resource> = now.iter().filter(|item| !is_target(*item)).cloned().collect();
  for (i, item) in before.iter().enumerate() {
    if !is_target(item) {
      continue;
    }
    let find = |anchor: &Resource, items: &[Resource]| items.iter().position(|r| r.id() == anchor.id());
    let position = before[..i]
      .iter()
      .rev()
      .find_map(|prev| find(prev, &items).map(|p| p + 1))
      .or_else(|| before[i + 1..].iter().find_map(|next| find(next, &items)))
      .unwrap_or_else(|| i.min(items.len()));
    items.insert(position, item.clone());
  }
  items
}

fn validate(key: &CacheKey, value: &CacheValue) -> std::result::Result<(), CacheError> {
  value
    .validate_for(key)
    .map_err(|reason| CacheError::Validation {
      key: key.clone(),
      reason,
    })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheSource;
  use crate::portal::types::{Document, DocumentStatus};
  use crate::testing::{doc, doc_with_status, documents_key};
  use color_eyre::Report;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use tokio::sync::Notify;

  fn entity_key(id: &str) -> CacheKey {
    CacheKey::entity(ResourceKind::Document, id)
  }

  fn seed(cache: &QueryCache, ids: &[&str]) {
    cache
      .set(
        &documents_key(),
        CacheValue::List(ids.iter().map(|id| doc(id).into()).collect()),
      )
      .unwrap();
    for id in ids {
      cache
        .set(&entity_key(id), CacheValue::Entity(doc(id).into()))
        .unwrap();
    }
  }

  fn list_ids(cache: &QueryCache) -> Vec<String> {
    cache
      .get_list::<Document>(&documents_key())
      .unwrap()
      .into_iter()
      .map(|d| d.id)
      .collect()
  }

  fn favorite(resource: &Resource) -> std::result::Result<Option<Resource>, String> {
    match resource {
      Resource::Document(d) => Ok(Some(Resource::Document(Document {
        is_favorite: true,
        ..d.clone()
      }))),
      _ => Err("not a document".to_string()),
    }
  }

  #[tokio::test]
  async fn test_fresh_entry_skips_fetcher() {
    let cache = QueryCache::in_memory();
    seed(&cache, &["a"]);
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = calls.clone();
    let result = cache
      .fetch_entity::<Document, _, _>("a", move || {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok::<_, Report>(doc("a")) }
      })
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::CacheFresh);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }

  #[tokio::test]
  async fn test_missing_entry_is_fetched_and_stored() {
    let cache = QueryCache::in_memory();

    let result = cache
      .fetch_list::<Document, _, _, _>(&crate::portal::cache::PortalQuery::all_documents(), || async {
        Ok::<_, Report>(vec![doc("a"), doc("b")])
      })
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(result.data.len(), 2);
    assert_eq!(list_ids(&cache), vec!["a", "b"]);
  }

  #[tokio::test]
  async fn test_failed_fetch_serves_stale_entry() {
    let cache = QueryCache::in_memory().with_stale_time(Duration::zero());
    seed(&cache, &["a"]);
    std::thread::sleep(std::time::Duration::from_millis(5));

    let result = cache
      .fetch_entity::<Document, _, _>("a", || async {
        Err::<Document, Report>(eyre!("connection refused"))
      })
      .await
      .unwrap();

    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.data, doc("a"));
  }

  #[tokio::test]
  async fn test_failed_fetch_without_cache_is_an_error() {
    let cache = QueryCache::in_memory();
    let result = cache
      .fetch_entity::<Document, _, _>("a", || async {
        Err::<Document, Report>(eyre!("connection refused"))
      })
      .await;
    assert!(result.is_err());
  }

  #[tokio::test]
  async fn test_cancelled_fetch_result_is_discarded() {
    let cache = Arc::new(QueryCache::in_memory());
    let gate = Arc::new(Notify::new());

    let task = {
      let cache = cache.clone();
      let gate = gate.clone();
      tokio::spawn(async move {
        cache
          .fetch_entity::<Document, _, _>("a", move || {
            let gate = gate.clone();
            async move {
              gate.notified().await;
              Ok::<_, Report>(doc("a"))
            }
          })
          .await
      })
    };
    tokio::task::yield_now().await;

    // A write claims the key while the fetch is pending
    cache.cancel_queries(&[entity_key("a")]);
    let mut newer = doc("a");
    newer.is_favorite = true;
    cache
      .set(&entity_key("a"), CacheValue::Entity(newer.clone().into()))
      .unwrap();

    gate.notify_one();
    let result = task.await.unwrap().unwrap();

    assert_eq!(result.source, CacheSource::CacheStale);
    assert_eq!(result.data, newer);
    assert_eq!(cache.get_entity::<Document>("a").unwrap(), newer);
  }

  #[tokio::test]
  async fn test_invalidate_refetches_registered_keys() {
    let cache = QueryCache::in_memory();
    let server = Arc::new(Mutex::new(vec![doc("a")]));

    let source = server.clone();
    cache
      .fetch_list::<Document, _, _, _>(&crate::portal::cache::PortalQuery::all_documents(), move || {
        let items = source.lock().unwrap().clone();
        async move { Ok::<_, Report>(items) }
      })
      .await
      .unwrap();

    server.lock().unwrap().push(doc("b"));
    cache.invalidate_kind(ResourceKind::Document).await;

    assert_eq!(list_ids(&cache), vec!["a", "b"]);
    assert!(cache.is_key_fresh(&documents_key()));
  }

  #[tokio::test]
  async fn test_failed_refetch_leaves_entry_stale() {
    let cache = QueryCache::in_memory();
    seed(&cache, &["a"]);
    cache.register_fetcher(&documents_key(), || async {
      Err::<CacheValue, Report>(eyre!("offline"))
    });

    cache.invalidate(&[documents_key()]).await;

    let entry = cache.get(&documents_key()).unwrap();
    assert!(entry.stale);
    assert_eq!(list_ids(&cache), vec!["a"]);
  }

  #[tokio::test]
  async fn test_optimistic_write_cancels_background_refetch() {
    let cache = Arc::new(QueryCache::in_memory());
    seed(&cache, &["a"]);
    let gate = Arc::new(Notify::new());

    let fetch_gate = gate.clone();
    cache.register_fetcher(&entity_key("a"), move || {
      let gate = fetch_gate.clone();
      async move {
        gate.notified().await;
        Ok::<_, Report>(CacheValue::Entity(doc("a").into()))
      }
    });
    assert!(cache.spawn_refetch(&entity_key("a")));
    assert!(cache.is_fetching(&entity_key("a")));

    let snapshot = cache
      .apply_optimistic(ResourceKind::Document, "a", &favorite, &[])
      .unwrap();
    assert!(!cache.is_fetching(&entity_key("a")));

    gate.notify_one();
    tokio::task::yield_now().await;
    assert!(cache.get_entity::<Document>("a").unwrap().is_favorite);
    drop(snapshot);
  }

  #[test]
  fn test_restore_is_exact() {
    let cache = QueryCache::in_memory();
    seed(&cache, &["a", "b", "c"]);
    let before_list = cache.get(&documents_key());
    let before_entity = cache.get(&entity_key("b"));

    let snapshot = cache
      .apply_optimistic(ResourceKind::Document, "b", &|_: &Resource| Ok(None), &[])
      .unwrap();
    assert_eq!(list_ids(&cache), vec!["a", "c"]);
    assert!(cache.get(&entity_key("b")).is_none());

    cache.restore(snapshot);

    assert_eq!(cache.get(&documents_key()), before_list);
    assert_eq!(cache.get(&entity_key("b")), before_entity);
    assert_eq!(list_ids(&cache), vec!["a", "b", "c"]);
  }

  #[test]
  fn test_restore_keeps_other_optimistic_writes() {
    let cache = QueryCache::in_memory();
    seed(&cache, &["a", "b", "c"]);
    let before = cache.get(&documents_key());

    let remove = |_: &Resource| -> std::result::Result<Option<Resource>, String> { Ok(None) };
    let first = cache
      .apply_optimistic(ResourceKind::Document, "a", &remove, &[])
      .unwrap();
    let second = cache
      .apply_optimistic(ResourceKind::Document, "b", &remove, &[])
      .unwrap();
    assert_eq!(list_ids(&cache), vec!["c"]);

    cache.restore(first);
    assert_eq!(list_ids(&cache), vec!["a", "c"]);

    cache.restore(second);
    assert_eq!(cache.get(&documents_key()), before);
  }

  #[test]
  fn test_restore_keeps_other_optimistic_writes_in_any_order() {
    let cache = QueryCache::in_memory();
    seed(&cache, &["a", "b", "c"]);
    let before = cache.get(&documents_key());

    let remove = |_: &Resource| -> std::result::Result<Option<Resource>, String> { Ok(None) };
    let first = cache
      .apply_optimistic(ResourceKind::Document, "a", &remove, &[])
      .unwrap();
    let second = cache
      .apply_optimistic(ResourceKind::Document, "b", &remove, &[])
      .unwrap();

    cache.restore(second);
    assert_eq!(list_ids(&cache), vec!["b", "c"]);

    cache.restore(first);
    assert_eq!(cache.get(&documents_key()), before);
  }

  #[test]
  fn test_restore_slots_keeps_positions() {
    let before: Vec<Resource> = ["a", "b", "c", "d"].iter().map(|id| doc(id).into()).collect();
    let now: Vec<Resource> = ["x", "a", "d"].iter().map(|id| doc(id).into()).collect();

    let restored = restore_slots(&before, &now, &["b".to_string(), "c".to_string()]);

    let ids: Vec<&str> = restored.iter().map(|r| r.id()).collect();
    assert_eq!(ids, vec!["x", "a", "b", "c", "d"]);
  }

  #[test]
  fn test_projection_applies_to_entity_and_lists() {
    let cache = QueryCache::in_memory();
    seed(&cache, &["a", "b"]);

    let snapshot = cache
      .apply_optimistic(ResourceKind::Document, "b", &favorite, &[])
      .unwrap();

    assert_eq!(snapshot.len(), 2);
    let listed = cache.get_list::<Document>(&documents_key()).unwrap();
    assert!(!listed[0].is_favorite);
    assert!(listed[1].is_favorite);
    assert_eq!(cache.get_entity::<Document>("b").unwrap(), listed[1]);
  }

  #[test]
  fn test_failed_projection_writes_nothing() {
    let cache = QueryCache::in_memory();
    seed(&cache, &["a"]);
    let before = cache.get(&documents_key());

    let result = cache.apply_optimistic(
      ResourceKind::Document,
      "a",
      &|_: &Resource| Err("version is gone".to_string()),
      &[],
    );

    assert!(matches!(result, Err(CacheError::Projection { .. })));
    assert_eq!(cache.get(&documents_key()), before);
  }

  #[test]
  fn test_invalid_projection_is_rejected() {
    let cache = QueryCache::in_memory();
    seed(&cache, &["a"]);

    let result = cache.apply_optimistic(
      ResourceKind::Document,
      "a",
      &|r: &Resource| match r {
        Resource::Document(d) => Ok(Some(Resource::Document(Document {
          title: String::new(),
          ..d.clone()
        }))),
        other => Ok(Some(other.clone())),
      },
      &[],
    );

    assert!(matches!(result, Err(CacheError::Validation { .. })));
    assert_eq!(cache.get_entity::<Document>("a").unwrap(), doc("a"));
  }

  #[test]
  fn test_inserts_prepend_and_restore_removes() {
    let cache = QueryCache::in_memory();
    seed(&cache, &["a"]);

    let snapshot = cache
      .apply_optimistic(
        ResourceKind::Document,
        "new",
        &|r: &Resource| Ok(Some(r.clone())),
        &[(documents_key(), doc("new").into())],
      )
      .unwrap();
    assert_eq!(list_ids(&cache), vec!["new", "a"]);

    cache.restore(snapshot);
    assert_eq!(list_ids(&cache), vec!["a"]);
  }

  #[test]
  fn test_replace_resource_updates_lists() {
    let cache = QueryCache::in_memory();
    seed(&cache, &["a", "b"]);

    cache
      .replace_resource(doc_with_status("b", DocumentStatus::Failed).into())
      .unwrap();

    let listed = cache.get_list::<Document>(&documents_key()).unwrap();
    assert_eq!(listed[1].status, DocumentStatus::Failed);
    assert_eq!(cache.get_entity::<Document>("b").unwrap(), listed[1]);
  }

  #[test]
  fn test_keys_containing() {
    let cache = QueryCache::in_memory();
    seed(&cache, &["a", "b"]);

    let keys = cache.keys_containing(ResourceKind::Document, "b");
    assert_eq!(keys, vec![entity_key("b"), documents_key()]);
    assert!(cache.keys_containing(ResourceKind::Document, "z").is_empty());
  }

  #[test]
  fn test_remove_forgets_fetcher() {
    let cache = Arc::new(QueryCache::in_memory());
    seed(&cache, &["a"]);
    cache.register_fetcher(&entity_key("a"), || async {
      Ok::<_, Report>(CacheValue::Entity(doc("a").into()))
    });

    cache.remove(&entity_key("a"));

    assert!(cache.get(&entity_key("a")).is_none());
    assert!(!cache.spawn_refetch(&entity_key("a")));
  }
}
