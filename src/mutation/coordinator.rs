//! Optimistic mutation coordinator.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, info, warn};

use super::error::MutationError;
use super::intent::{MutationIntent, Transport};
use super::notify::{Notification, Notifier};
use crate::cache::{CacheKey, QueryCache};

/// Lifecycle of one mutation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationPhase {
  Idle,
  OptimisticApplied,
  SettledSuccess,
  SettledFailure,
}

/// How a mutation attempt ended.
#[derive(Debug, Clone)]
pub struct MutationOutcome {
  /// Always one of the settled phases
  pub phase: MutationPhase,
  /// Number of times the request was sent
  pub attempts: u32,
  /// Response body on success, if the server sent one
  pub response: Option<Value>,
  pub error: Option<MutationError>,
}

impl MutationOutcome {
  pub fn is_success(&self) -> bool {
    self.phase == MutationPhase::SettledSuccess
  }

  fn failure(attempts: u32, error: MutationError) -> Self {
    Self {
      phase: MutationPhase::SettledFailure,
      attempts,
      response: None,
      error: Some(error),
    }
  }
}

/// Runs writes against the server while keeping the cache responsive.
///
/// For each intent the coordinator cancels pending fetches of the affected
/// keys, snapshots them, writes the projected values, sends the request, and
/// then either invalidates (success) or restores the snapshot (failure).
/// Mutations on the same resource are serialized: a later one waits until
/// the earlier has settled, so it never snapshots an optimistic value.
/// Mutations on different resources may share lists; their rollbacks only
/// touch their own list slots.
pub struct MutationCoordinator {
  cache: Arc<QueryCache>,
  transport: Arc<dyn Transport>,
  notifier: Arc<dyn Notifier>,
  locks: Mutex<HashMap<CacheKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl MutationCoordinator {
  pub fn new(
    cache: Arc<QueryCache>,
    transport: Arc<dyn Transport>,
    notifier: Arc<dyn Notifier>,
  ) -> Self {
    Self {
      cache,
      transport,
      notifier,
      locks: Mutex::new(HashMap::new()),
    }
  }

  pub fn cache(&self) -> &Arc<QueryCache> {
    &self.cache
  }

  /// Execute one mutation. Failures never escape: they are rolled back,
  /// reported to the notifier and returned in the outcome.
  pub async fn execute(&self, intent: MutationIntent) -> MutationOutcome {
    let key = intent.key();
    let lock = self.lock_for(&key);

    let outcome = {
      let _guard = lock.lock().await;
      self.run(&intent).await
    };

    self.release_lock(&key, lock);
    outcome
  }

  async fn run(&self, intent: &MutationIntent) -> MutationOutcome {
    let key = intent.key();
    let mut phase = MutationPhase::Idle;

    let snapshot = match self.cache.apply_optimistic(
      intent.kind,
      &intent.id,
      intent.project.as_ref(),
      &intent.inserts,
    ) {
      Ok(snapshot) => snapshot,
      Err(e) => {
        let error = MutationError::from(e);
        self.advance(intent, &mut phase, MutationPhase::SettledFailure);
        self.report_failure(intent, &error);
        return MutationOutcome::failure(0, error);
      }
    };
    self.advance(intent, &mut phase, MutationPhase::OptimisticApplied);

    // Decided before the request goes out: the snapshot still shows
    // whether the projection removed a cached entity
    let removes_entity = matches!(snapshot.get(&key), Some(Some(_))) && self.cache.get(&key).is_none();

    let (result, attempts) = self.send_with_retry(intent).await;

    match result {
      Ok(response) => {
        drop(snapshot);
        if removes_entity {
          self.cache.remove(&key);
        }
        self.cache.invalidate_kind(intent.kind).await;
        self.advance(intent, &mut phase, MutationPhase::SettledSuccess);
        self
          .notifier
          .notify(Notification::success(intent.success_message.clone()));
        MutationOutcome {
          phase,
          attempts,
          response,
          error: None,
        }
      }
      Err(error) => {
        self.cache.restore(snapshot);
        self.advance(intent, &mut phase, MutationPhase::SettledFailure);
        self.report_failure(intent, &error);
        MutationOutcome::failure(attempts, error)
      }
    }
  }

  async fn send_with_retry(
    &self,
    intent: &MutationIntent,
  ) -> (Result<Option<Value>, MutationError>, u32) {
    let mut attempt = 0;
    loop {
      attempt += 1;
      match self.transport.send(&intent.operation).await {
        Ok(response) => return (Ok(response), attempt),
        Err(e) if intent.retry.should_retry(attempt, &e) => {
          let delay = intent.retry.backoff.delay(attempt);
          warn!(
            label = %intent.label,
            attempt,
            error = %e,
            "retrying in {:?}",
            delay
          );
          tokio::time::sleep(delay).await;
        }
        Err(e) => return (Err(e), attempt),
      }
    }
  }

  fn advance(&self, intent: &MutationIntent, phase: &mut MutationPhase, next: MutationPhase) {
    debug!(
      label = %intent.label,
      key = %intent.key(),
      from = ?*phase,
      to = ?next,
      "mutation phase"
    );
    *phase = next;
  }

  fn report_failure(&self, intent: &MutationIntent, error: &MutationError) {
    info!(label = %intent.label, operation = %intent.operation, error = %error, "rolled back");
    self.notifier.notify(Notification::error(
      intent.error_message.clone(),
      error.to_string(),
    ));
  }

  fn lock_for(&self, key: &CacheKey) -> Arc<tokio::sync::Mutex<()>> {
    let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
    Arc::clone(locks.entry(key.clone()).or_default())
  }

  fn release_lock(&self, key: &CacheKey, lock: Arc<tokio::sync::Mutex<()>>) {
    let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
    // Only the map and this call hold it: nobody is queued behind us
    if Arc::strong_count(&lock) == 2 {
      locks.remove(key);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheValue;
  use crate::mutation::{Backoff, Level, RemoteOperation, RetryPolicy};
  use crate::portal::mutations::{delete_document, toggle_favorite};
  use crate::portal::types::{Document, ResourceKind};
  use crate::testing::{doc, documents_key, FakeTransport, RecordingNotifier};
  use color_eyre::Report;

  struct Harness {
    cache: Arc<QueryCache>,
    transport: Arc<FakeTransport>,
    notifier: Arc<RecordingNotifier>,
    coordinator: Arc<MutationCoordinator>,
  }

  fn harness(transport: FakeTransport) -> Harness {
    let cache = Arc::new(QueryCache::in_memory());
    let transport = Arc::new(transport);
    let notifier = Arc::new(RecordingNotifier::default());
    let coordinator = Arc::new(MutationCoordinator::new(
      cache.clone(),
      transport.clone(),
      notifier.clone(),
    ));
    Harness {
      cache,
      transport,
      notifier,
      coordinator,
    }
  }

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

  fn server_error() -> MutationError {
    MutationError::Rejected {
      status: 503,
      message: "unavailable".to_string(),
    }
  }

  #[tokio::test]
  async fn test_failed_delete_restores_list_exactly() {
    let h = harness(FakeTransport::failing(MutationError::Rejected {
      status: 403,
      message: "forbidden".to_string(),
    }));
    seed(&h.cache, &["a", "b", "c"]);
    let list_before = h.cache.get(&documents_key());
    let entity_before = h.cache.get(&entity_key("b"));

    let outcome = h.coordinator.execute(delete_document("b")).await;

    assert_eq!(outcome.phase, MutationPhase::SettledFailure);
    assert_eq!(outcome.attempts, 1);
    assert_eq!(list_ids(&h.cache), vec!["a", "b", "c"]);
    assert_eq!(h.cache.get(&documents_key()), list_before);
    assert_eq!(h.cache.get(&entity_key("b")), entity_before);

    let notes = h.notifier.take();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].level, Level::Error);
    assert!(notes[0].detail.as_deref().unwrap().contains("forbidden"));
  }

  #[tokio::test]
  async fn test_optimistic_value_visible_while_request_in_flight() {
    let h = harness(FakeTransport::ok().gated());
    seed(&h.cache, &["a", "b", "c"]);

    let task = {
      let coordinator = h.coordinator.clone();
      tokio::spawn(async move { coordinator.execute(delete_document("b")).await })
    };
    h.transport.entered().await;

    assert_eq!(list_ids(&h.cache), vec!["a", "c"]);
    assert!(h.cache.get(&entity_key("b")).is_none());

    h.transport.release();
    let outcome = task.await.unwrap();
    assert!(outcome.is_success());
    assert_eq!(list_ids(&h.cache), vec!["a", "c"]);
    assert_eq!(h.notifier.take()[0].level, Level::Success);
  }

  #[tokio::test]
  async fn test_favorite_toggle_survives_refetch() {
    let h = harness(FakeTransport::ok().gated());
    seed(&h.cache, &["a"]);

    // The server flips the flag once it accepts the request
    let server = Arc::new(Mutex::new(doc("a")));
    {
      let server = server.clone();
      h.cache.register_fetcher(&entity_key("a"), move || {
        let current = server.lock().unwrap().clone();
        async move { Ok::<_, Report>(CacheValue::Entity(current.into())) }
      });
    }
    {
      let server = server.clone();
      h.cache.register_fetcher(&documents_key(), move || {
        let current = server.lock().unwrap().clone();
        async move { Ok::<_, Report>(CacheValue::List(vec![current.into()])) }
      });
    }

    let task = {
      let coordinator = h.coordinator.clone();
      tokio::spawn(async move { coordinator.execute(toggle_favorite("a")).await })
    };
    h.transport.entered().await;
    assert!(h.cache.get_entity::<Document>("a").unwrap().is_favorite);

    server.lock().unwrap().is_favorite = true;
    h.transport.release();
    assert!(task.await.unwrap().is_success());

    let entity = h.cache.get_entity::<Document>("a").unwrap();
    let listed = h.cache.get_list::<Document>(&documents_key()).unwrap();
    assert!(entity.is_favorite);
    assert_eq!(listed[0], entity);
    assert!(h.cache.is_key_fresh(&entity_key("a")));
  }

  #[tokio::test]
  async fn test_success_converges_to_server_state() {
    let h = harness(FakeTransport::ok());
    seed(&h.cache, &["a"]);

    // Server renamed the document as a side effect; the projection could not know
    let mut truth = doc("a");
    truth.is_favorite = true;
    truth.title = "Renamed".to_string();
    {
      let truth = truth.clone();
      h.cache.register_fetcher(&entity_key("a"), move || {
        let truth = truth.clone();
        async move { Ok::<_, Report>(CacheValue::Entity(truth.into())) }
      });
    }

    h.coordinator.execute(toggle_favorite("a")).await;

    assert_eq!(h.cache.get_entity::<Document>("a").unwrap(), truth);
  }

  #[tokio::test]
  async fn test_list_and_entity_agree_after_failure() {
    let h = harness(FakeTransport::failing(MutationError::Network(
      "connection reset".to_string(),
    )));
    seed(&h.cache, &["a", "b"]);

    h.coordinator.execute(toggle_favorite("b")).await;

    let listed = h.cache.get_list::<Document>(&documents_key()).unwrap();
    let entity = h.cache.get_entity::<Document>("b").unwrap();
    assert_eq!(listed[1], entity);
    assert!(!entity.is_favorite);
  }

  #[tokio::test]
  async fn test_precondition_failure_never_sends() {
    let h = harness(FakeTransport::ok());
    seed(&h.cache, &["a"]);
    let before = h.cache.get(&entity_key("a"));

    let intent = MutationIntent::new(
      "archive",
      ResourceKind::Document,
      "a",
      RemoteOperation::post(["documents", "a", "archive"], None),
    )
    .project(|_| Err("already archived".to_string()));
    let outcome = h.coordinator.execute(intent).await;

    assert_eq!(outcome.phase, MutationPhase::SettledFailure);
    assert_eq!(outcome.attempts, 0);
    assert_eq!(
      outcome.error,
      Some(MutationError::Precondition("already archived".to_string()))
    );
    assert!(h.transport.calls().is_empty());
    assert_eq!(h.cache.get(&entity_key("a")), before);
    assert_eq!(h.notifier.take()[0].level, Level::Error);
  }

  #[tokio::test(start_paused = true)]
  async fn test_idempotent_operation_is_retried() {
    let h = harness(FakeTransport::new(vec![
      Err(server_error()),
      Err(MutationError::Network("timeout".to_string())),
      Ok(None),
    ]));
    seed(&h.cache, &["a"]);

    let intent = delete_document("a").with_retry(RetryPolicy::idempotent(
      3,
      Backoff::Exponential {
        base_ms: 100,
        max_ms: 1000,
      },
    ));
    let outcome = h.coordinator.execute(intent).await;

    assert!(outcome.is_success());
    assert_eq!(outcome.attempts, 3);
    assert_eq!(h.transport.calls().len(), 3);
  }

  #[tokio::test(start_paused = true)]
  async fn test_retry_budget_is_respected() {
    let h = harness(FakeTransport::new(vec![
      Err(server_error()),
      Err(server_error()),
      Ok(None),
    ]));
    seed(&h.cache, &["a", "b"]);
    let before = h.cache.get(&documents_key());

    let intent = delete_document("a").with_retry(RetryPolicy::idempotent(
      2,
      Backoff::Fixed { delay_ms: 10 },
    ));
    let outcome = h.coordinator.execute(intent).await;

    assert_eq!(outcome.phase, MutationPhase::SettledFailure);
    assert_eq!(outcome.attempts, 2);
    assert_eq!(h.cache.get(&documents_key()), before);
  }

  #[tokio::test]
  async fn test_non_idempotent_operation_is_not_retried() {
    let h = harness(FakeTransport::new(vec![Err(server_error()), Ok(None)]));
    seed(&h.cache, &["a"]);

    let outcome = h.coordinator.execute(toggle_favorite("a")).await;

    assert_eq!(outcome.attempts, 1);
    assert!(!outcome.is_success());
  }

  #[tokio::test]
  async fn test_client_errors_are_not_retried() {
    let h = harness(FakeTransport::new(vec![
      Err(MutationError::Rejected {
        status: 404,
        message: "gone".to_string(),
      }),
      Ok(None),
    ]));
    seed(&h.cache, &["a"]);

    let intent = delete_document("a").with_retry(RetryPolicy::idempotent(
      5,
      Backoff::Fixed { delay_ms: 1 },
    ));
    let outcome = h.coordinator.execute(intent).await;

    assert_eq!(outcome.attempts, 1);
    assert!(list_ids(&h.cache).contains(&"a".to_string()));
  }

  #[tokio::test]
  async fn test_mutations_on_one_key_are_serialized() {
    let h = harness(FakeTransport::new(vec![Err(server_error()), Ok(None)]).gated());
    seed(&h.cache, &["a"]);

    let first = {
      let coordinator = h.coordinator.clone();
      tokio::spawn(async move { coordinator.execute(toggle_favorite("a")).await })
    };
    h.transport.entered().await;

    let second = {
      let coordinator = h.coordinator.clone();
      tokio::spawn(async move { coordinator.execute(toggle_favorite("a")).await })
    };
    tokio::task::yield_now().await;

    // The second toggle waits for the first to settle
    assert_eq!(h.transport.calls().len(), 1);
    h.transport.release();
    assert!(!first.await.unwrap().is_success());

    h.transport.entered().await;
    assert!(h.cache.get_entity::<Document>("a").unwrap().is_favorite);
    h.transport.release();
    assert!(second.await.unwrap().is_success());

    // Had the second snapshotted the first's optimistic value it would end at false
    assert!(h.cache.get_entity::<Document>("a").unwrap().is_favorite);
    assert!(h.coordinator.locks.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_mutations_on_different_keys_run_concurrently() {
    let h = harness(FakeTransport::ok().gated());
    seed(&h.cache, &["a", "b"]);

    let tasks: Vec<_> = ["a", "b"]
      .into_iter()
      .map(|id| {
        let coordinator = h.coordinator.clone();
        tokio::spawn(async move { coordinator.execute(toggle_favorite(id)).await })
      })
      .collect();

    h.transport.entered().await;
    tokio::task::yield_now().await;
    tokio::task::yield_now().await;
    assert_eq!(h.transport.calls().len(), 2);

    h.transport.release();
    h.transport.release();
    for task in tasks {
      assert!(task.await.unwrap().is_success());
    }
  }

  #[tokio::test]
  async fn test_overlapping_failures_on_a_shared_list_restore_it() {
    let h = harness(FakeTransport::new(vec![Err(server_error()), Err(server_error())]).gated());
    seed(&h.cache, &["a", "b"]);
    let list_before = h.cache.get(&documents_key());
    let entity_before = h.cache.get(&entity_key("a"));

    let first = {
      let coordinator = h.coordinator.clone();
      tokio::spawn(async move { coordinator.execute(toggle_favorite("a")).await })
    };
    h.transport.entered().await;
    let second = {
      let coordinator = h.coordinator.clone();
      tokio::spawn(async move { coordinator.execute(toggle_favorite("b")).await })
    };
    h.transport.entered().await;

    h.transport.release();
    assert!(!first.await.unwrap().is_success());

    // Rolling back `a` keeps the optimistic value of `b`, still in flight
    let listed = h.cache.get_list::<Document>(&documents_key()).unwrap();
    assert!(!listed[0].is_favorite);
    assert!(listed[1].is_favorite);

    h.transport.release();
    assert!(!second.await.unwrap().is_success());

    assert_eq!(h.cache.get(&documents_key()), list_before);
    assert_eq!(h.cache.get(&entity_key("a")), entity_before);
    let listed = h.cache.get_list::<Document>(&documents_key()).unwrap();
    assert_eq!(h.cache.get_entity::<Document>("a").unwrap(), listed[0]);
    assert_eq!(h.cache.get_entity::<Document>("b").unwrap(), listed[1]);
  }

  #[tokio::test]
  async fn test_mutation_on_uncached_resource_still_runs() {
    let h = harness(FakeTransport::failing(server_error()));

    let outcome = h.coordinator.execute(delete_document("zzz")).await;

    assert_eq!(outcome.phase, MutationPhase::SettledFailure);
    assert!(h.cache.get(&entity_key("zzz")).is_none());
    assert_eq!(h.transport.calls()[0].path(), "/documents/zzz");
  }
}
