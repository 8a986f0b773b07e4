//! Background polling of document processing status.
//!
//! A document that was just uploaded or asked to re-process moves through
//! `PENDING`/`QUEUED`/`PROCESSING` until the server settles it as
//! `COMPLETED` or `FAILED`. The poller re-fetches it until then, writing
//! every result through the query cache so lists and the detail view agree.

use async_trait::async_trait;
use color_eyre::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::QueryCache;
use crate::portal::types::{Document, DocumentStatus};

/// Where the poller reads documents from.
#[async_trait]
pub trait DocumentSource: Send + Sync {
  async fn fetch_document(&self, id: &str) -> Result<Document>;
}

/// How long to wait between two fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollInterval {
  /// Same delay whatever the status
  Fixed(Duration),
  /// `active` while the server is processing, `waiting` while the document
  /// sits in the queue or its status is not known yet
  ByStatus { active: Duration, waiting: Duration },
}

impl Default for PollInterval {
  fn default() -> Self {
    PollInterval::Fixed(Duration::from_secs(3))
  }
}

impl PollInterval {
  pub fn next(&self, status: Option<DocumentStatus>) -> Duration {
    match *self {
      PollInterval::Fixed(every) => every,
      PollInterval::ByStatus { active, waiting } => match status {
        Some(DocumentStatus::Processing) => active,
        _ => waiting,
      },
    }
  }
}

/// Spawns one polling task per watched document.
#[derive(Clone)]
pub struct StatusPoller {
  source: Arc<dyn DocumentSource>,
  cache: Arc<QueryCache>,
  interval: PollInterval,
  is_terminal: fn(DocumentStatus) -> bool,
  max_consecutive_failures: Option<u32>,
}

impl StatusPoller {
  pub fn new(source: Arc<dyn DocumentSource>, cache: Arc<QueryCache>) -> Self {
    Self {
      source,
      cache,
      interval: PollInterval::default(),
      is_terminal: DocumentStatus::is_terminal,
      max_consecutive_failures: None,
    }
  }

  pub fn with_interval(mut self, interval: PollInterval) -> Self {
    self.interval = interval;
    self
  }

  /// Replace the predicate deciding when polling stops.
  pub fn with_terminal(mut self, is_terminal: fn(DocumentStatus) -> bool) -> Self {
    self.is_terminal = is_terminal;
    self
  }

  /// Give up after this many failed fetches in a row. Unbounded by default.
  pub fn with_max_consecutive_failures(mut self, max: Option<u32>) -> Self {
    self.max_consecutive_failures = max;
    self
  }

  /// Start polling document `id`. The first fetch happens immediately.
  pub fn watch(&self, id: impl Into<String>) -> PollHandle {
    let id = id.into();
    let initial = self
      .cache
      .get_entity::<Document>(&id)
      .map(|doc| doc.status);
    let (tx, rx) = watch::channel(initial);

    let poller = self.clone();
    let task_id = id.clone();
    let task = tokio::spawn(async move { poller.run(&task_id, tx).await });

    PollHandle { id, rx, task }
  }

  async fn run(&self, id: &str, tx: watch::Sender<Option<DocumentStatus>>) -> Option<DocumentStatus> {
    let mut failures = 0u32;
    let mut last = *tx.borrow();

    loop {
      match self.source.fetch_document(id).await {
        Ok(doc) => {
          failures = 0;
          let status = doc.status;
          if let Err(e) = self.cache.replace_resource(doc.into()) {
            warn!(document = id, error = %e, "polled document rejected by cache");
          }
          if last != Some(status) {
            debug!(document = id, %status, "status changed");
          }
          last = Some(status);
          tx.send_replace(last);

          if (self.is_terminal)(status) {
            info!(document = id, %status, "processing finished");
            return last;
          }
        }
        Err(e) => {
          failures += 1;
          warn!(document = id, failures, error = %e, "status fetch failed, will retry");
          if self
            .max_consecutive_failures
            .is_some_and(|max| failures >= max)
          {
            warn!(document = id, "giving up after {} failed fetches", failures);
            return None;
          }
        }
      }

      tokio::time::sleep(self.interval.next(last)).await;
    }
  }
}

/// Handle to one polling task.
pub struct PollHandle {
  id: String,
  rx: watch::Receiver<Option<DocumentStatus>>,
  task: JoinHandle<Option<DocumentStatus>>,
}

impl PollHandle {
  pub fn id(&self) -> &str {
    &self.id
  }

  /// Latest known status. `None` until the first successful fetch unless
  /// the document was already cached.
  pub fn status(&self) -> Option<DocumentStatus> {
    *self.rx.borrow()
  }

  /// Receiver notified on every fetched status.
  pub fn subscribe(&self) -> watch::Receiver<Option<DocumentStatus>> {
    self.rx.clone()
  }

  /// Stop polling. Pending fetches are dropped.
  pub fn cancel(&self) {
    self.task.abort();
  }

  pub fn is_finished(&self) -> bool {
    self.task.is_finished()
  }

  /// Wait for polling to end. Returns the terminal status, or `None` if the
  /// poller gave up or was cancelled.
  pub async fn join(self) -> Option<DocumentStatus> {
    match self.task.await {
      Ok(status) => status,
      Err(e) if e.is_cancelled() => None,
      Err(e) => {
        warn!(document = %self.id, error = %e, "poll task panicked");
        None
      }
    }
  }
}
