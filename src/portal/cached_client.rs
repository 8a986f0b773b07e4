//! Cached portal client that wraps PortalClient with the query cache, the
//! mutation coordinator and the status poller.

use color_eyre::Result;
use std::sync::Arc;

use crate::cache::{CacheResult, QueryCache, SqliteStorage};
use crate::config::{Config, MutationsConfig};
use crate::mutation::{MutationCoordinator, MutationIntent, MutationOutcome, Notifier};
use crate::poller::{PollHandle, StatusPoller};

use super::cache::{DocumentFilter, PortalQuery};
use super::client::PortalClient;
use super::types::{Document, Employee, Permission};

/// Portal client with transparent caching and optimistic writes.
///
/// Reads serve fresh cache entries directly and fall back to stale data when
/// the network is unavailable. Writes go through the coordinator with the
/// retry policy configured for their operation.
pub struct CachedPortal {
  inner: PortalClient,
  cache: Arc<QueryCache>,
  coordinator: MutationCoordinator,
  poller: StatusPoller,
  policies: MutationsConfig,
}

impl CachedPortal {
  pub fn new(config: &Config, notifier: Arc<dyn Notifier>) -> Result<Self> {
    let inner = PortalClient::new(config)?;

    let cache = if config.cache.persist {
      let storage = match &config.cache.path {
        Some(path) => SqliteStorage::open_at(path)?,
        None => SqliteStorage::open()?,
      };
      QueryCache::new(storage)
    } else {
      QueryCache::in_memory()
    };
    let cache = Arc::new(cache.with_stale_time(chrono::Duration::seconds(config.cache.stale_secs)));

    Ok(Self::from_parts(inner, cache, notifier, config))
  }

  fn from_parts(
    inner: PortalClient,
    cache: Arc<QueryCache>,
    notifier: Arc<dyn Notifier>,
    config: &Config,
  ) -> Self {
    let transport = Arc::new(inner.clone());
    let coordinator = MutationCoordinator::new(cache.clone(), transport.clone(), notifier);
    let poller = StatusPoller::new(transport, cache.clone())
      .with_interval(config.poller.interval())
      .with_max_consecutive_failures(config.poller.max_consecutive_failures);

    Self {
      inner,
      cache,
      coordinator,
      poller,
      policies: config.mutations.clone(),
    }
  }

  pub fn cache(&self) -> &Arc<QueryCache> {
    &self.cache
  }

  /// List documents with caching.
  pub async fn documents(&self, filter: DocumentFilter) -> Result<CacheResult<Vec<Document>>> {
    let query = PortalQuery::Documents(filter.clone());
    let inner = self.inner.clone();

    self
      .cache
      .fetch_list(&query, move || {
        let inner = inner.clone();
        let filter = filter.clone();
        async move { inner.list_documents(&filter).await }
      })
      .await
  }

  /// Get a single document with caching.
  pub async fn document(&self, id: &str) -> Result<CacheResult<Document>> {
    let inner = self.inner.clone();
    let owned_id = id.to_string();

    self
      .cache
      .fetch_entity(id, move || {
        let inner = inner.clone();
        let id = owned_id.clone();
        async move { inner.get_document(&id).await }
      })
      .await
  }

  /// Permissions of a document with caching.
  pub async fn permissions(&self, document_id: &str) -> Result<CacheResult<Vec<Permission>>> {
    let query = PortalQuery::permissions_of(document_id);
    let inner = self.inner.clone();
    let document_id = document_id.to_string();

    self
      .cache
      .fetch_list(&query, move || {
        let inner = inner.clone();
        let document_id = document_id.clone();
        async move { inner.list_permissions(&document_id).await }
      })
      .await
  }

  /// Employee directory with caching.
  pub async fn employees(
    &self,
    department: Option<String>,
    search: Option<String>,
  ) -> Result<CacheResult<Vec<Employee>>> {
    let query = PortalQuery::Employees {
      department: department.clone(),
      search: search.clone(),
    };
    let inner = self.inner.clone();

    self
      .cache
      .fetch_list(&query, move || {
        let inner = inner.clone();
        let department = department.clone();
        let search = search.clone();
        async move {
          inner
            .list_employees(department.as_deref(), search.as_deref())
            .await
        }
      })
      .await
  }

  /// Run a write with the retry policy configured for its operation.
  pub async fn mutate(&self, intent: MutationIntent) -> MutationOutcome {
    let policy = self.policies.policy(intent.label());
    self.coordinator.execute(intent.with_retry(policy)).await
  }

  /// Follow a document until processing finishes.
  pub fn watch_status(&self, id: &str) -> PollHandle {
    self.poller.watch(id)
  }
}
