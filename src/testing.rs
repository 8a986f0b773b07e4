//! Fixtures and fakes shared by unit tests.

use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::{Notify, Semaphore};

use crate::cache::CacheKey;
use crate::mutation::{MutationError, Notification, Notifier, RemoteOperation, Transport};
use crate::poller::DocumentSource;
use crate::portal::cache::PortalQuery;
use crate::portal::types::{
  Document, DocumentStatus, DocumentVersion, Employee, Permission, Role,
};

pub(crate) fn doc(id: &str) -> Document {
  Document {
    id: id.to_string(),
    title: format!("Document {}", id),
    owner_id: "u1".to_string(),
    folder: None,
    is_favorite: false,
    status: DocumentStatus::Completed,
    current_version: 1,
    versions: vec![DocumentVersion {
      number: 1,
      created_at: "2024-01-01T00:00:00Z".to_string(),
      author_id: None,
    }],
    updated_at: "2024-01-01T00:00:00Z".to_string(),
  }
}

pub(crate) fn doc_with_status(id: &str, status: DocumentStatus) -> Document {
  Document {
    status,
    ..doc(id)
  }
}

pub(crate) fn permission(id: &str, document_id: &str) -> Permission {
  Permission {
    id: id.to_string(),
    document_id: document_id.to_string(),
    principal_id: "u2".to_string(),
    role: Role::Viewer,
  }
}

pub(crate) fn employee(id: &str) -> Employee {
  Employee {
    id: id.to_string(),
    name: format!("Employee {}", id),
    email: format!("{}@example.com", id),
    department: None,
    title: None,
    updated_at: "2024-01-01T00:00:00Z".to_string(),
  }
}

pub(crate) fn documents_key() -> CacheKey {
  CacheKey::list(&PortalQuery::all_documents())
}

/// Transport answering from a script, in order. Once the script runs out
/// every request succeeds with no body.
pub(crate) struct FakeTransport {
  responses: Mutex<VecDeque<Result<Option<Value>, MutationError>>>,
  calls: Mutex<Vec<RemoteOperation>>,
  gate: Option<Semaphore>,
  entered: Notify,
}

impl FakeTransport {
  pub(crate) fn new(responses: Vec<Result<Option<Value>, MutationError>>) -> Self {
    Self {
      responses: Mutex::new(responses.into()),
      calls: Mutex::new(Vec::new()),
      gate: None,
      entered: Notify::new(),
    }
  }

  pub(crate) fn ok() -> Self {
    Self::new(Vec::new())
  }

  pub(crate) fn failing(error: MutationError) -> Self {
    Self::new(vec![Err(error)])
  }

  /// Hold every request until `release` is called.
  pub(crate) fn gated(mut self) -> Self {
    self.gate = Some(Semaphore::new(0));
    self
  }

  /// Let one held request through.
  pub(crate) fn release(&self) {
    if let Some(gate) = &self.gate {
      gate.add_permits(1);
    }
  }

  /// Resolves once a request has reached the transport.
  pub(crate) async fn entered(&self) {
    self.entered.notified().await;
  }

  pub(crate) fn calls(&self) -> Vec<RemoteOperation> {
    self.calls.lock().unwrap().clone()
  }
}

#[async_trait]
impl Transport for FakeTransport {
  async fn send(&self, operation: &RemoteOperation) -> Result<Option<Value>, MutationError> {
    self.calls.lock().unwrap().push(operation.clone());
    self.entered.notify_one();
    if let Some(gate) = &self.gate {
      gate.acquire().await.unwrap().forget();
    }
    self.responses.lock().unwrap().pop_front().unwrap_or(Ok(None))
  }
}

/// Keeps every notification for later inspection.
#[derive(Default)]
pub(crate) struct RecordingNotifier {
  seen: Mutex<Vec<Notification>>,
}

impl RecordingNotifier {
  pub(crate) fn take(&self) -> Vec<Notification> {
    std::mem::take(&mut *self.seen.lock().unwrap())
  }
}

impl Notifier for RecordingNotifier {
  fn notify(&self, notification: Notification) {
    self.seen.lock().unwrap().push(notification);
  }
}

/// Document source answering from a script.
pub(crate) struct FakeDocumentSource {
  responses: Mutex<VecDeque<Result<Document, String>>>,
  repeat: Option<Document>,
  calls: AtomicUsize,
}

impl FakeDocumentSource {
  pub(crate) fn new(responses: Vec<Result<Document, String>>) -> Self {
    Self {
      responses: Mutex::new(responses.into()),
      repeat: None,
      calls: AtomicUsize::new(0),
    }
  }

  /// Returns the same document forever.
  pub(crate) fn repeating(doc: Document) -> Self {
    Self {
      repeat: Some(doc),
      ..Self::new(Vec::new())
    }
  }

  pub(crate) fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

#[async_trait]
impl DocumentSource for FakeDocumentSource {
  async fn fetch_document(&self, id: &str) -> Result<Document> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    let next = self.responses.lock().unwrap().pop_front();
    match next {
      Some(Ok(doc)) => Ok(doc),
      Some(Err(e)) => Err(eyre!(e)),
      None => self
        .repeat
        .clone()
        .ok_or_else(|| eyre!("no scripted response for {}", id)),
    }
  }
}
