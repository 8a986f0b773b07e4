//! Description of one write about to be sent.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

use super::error::MutationError;
use super::retry::RetryPolicy;
use crate::cache::{CacheKey, Cacheable, Projection};
use crate::portal::types::{Resource, ResourceKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
  Post,
  Patch,
  Delete,
}

impl fmt::Display for Method {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      Method::Post => "POST",
      Method::Patch => "PATCH",
      Method::Delete => "DELETE",
    };
    f.write_str(s)
  }
}

/// The network half of a mutation: method, endpoint path and JSON body.
///
/// The path is kept as raw segments; the transport percent-encodes each one,
/// so an id never changes which endpoint is hit.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteOperation {
  pub method: Method,
  pub segments: Vec<String>,
  pub body: Option<Value>,
}

fn to_segments<I>(segments: I) -> Vec<String>
where
  I: IntoIterator,
  I::Item: Into<String>,
{
  segments.into_iter().map(Into::into).collect()
}

impl RemoteOperation {
  pub fn post<I>(segments: I, body: Option<Value>) -> Self
  where
    I: IntoIterator,
    I::Item: Into<String>,
  {
    Self {
      method: Method::Post,
      segments: to_segments(segments),
      body,
    }
  }

  pub fn patch<I>(segments: I, body: Value) -> Self
  where
    I: IntoIterator,
    I::Item: Into<String>,
  {
    Self {
      method: Method::Patch,
      segments: to_segments(segments),
      body: Some(body),
    }
  }

  pub fn delete<I>(segments: I) -> Self
  where
    I: IntoIterator,
    I::Item: Into<String>,
  {
    Self {
      method: Method::Delete,
      segments: to_segments(segments),
      body: None,
    }
  }

  /// Unencoded path, for logs and messages.
  pub fn path(&self) -> String {
    format!("/{}", self.segments.join("/"))
  }
}

impl fmt::Display for RemoteOperation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {}", self.method, self.path())
  }
}

/// Executes remote operations. The coordinator only cares whether the call
/// succeeded; a JSON response body is passed through to the caller.
#[async_trait]
pub trait Transport: Send + Sync {
  async fn send(&self, operation: &RemoteOperation) -> Result<Option<Value>, MutationError>;
}

/// A write about to be sent, plus how the cache should look meanwhile.
pub struct MutationIntent {
  pub(crate) label: String,
  pub(crate) kind: ResourceKind,
  pub(crate) id: String,
  pub(crate) operation: RemoteOperation,
  pub(crate) project: Arc<Projection>,
  pub(crate) inserts: Vec<(CacheKey, Resource)>,
  pub(crate) retry: RetryPolicy,
  pub(crate) success_message: String,
  pub(crate) error_message: String,
}

impl MutationIntent {
  /// Intent targeting resource `id` of `kind`. The default projection
  /// leaves cached values untouched.
  pub fn new(
    label: impl Into<String>,
    kind: ResourceKind,
    id: impl Into<String>,
    operation: RemoteOperation,
  ) -> Self {
    let label = label.into();
    Self {
      success_message: format!("{} succeeded", label),
      error_message: format!("{} failed", label),
      label,
      kind,
      id: id.into(),
      operation,
      project: Arc::new(|resource: &Resource| -> Result<Option<Resource>, String> {
        Ok(Some(resource.clone()))
      }),
      inserts: Vec::new(),
      retry: RetryPolicy::never(),
    }
  }

  /// Set the projection over the untyped resource.
  pub fn project<F>(mut self, project: F) -> Self
  where
    F: Fn(&Resource) -> Result<Option<Resource>, String> + Send + Sync + 'static,
  {
    self.project = Arc::new(project);
    self
  }

  /// Set the projection through the typed accessor of `T`.
  pub fn project_as<T, F>(self, project: F) -> Self
  where
    T: Cacheable,
    F: Fn(&T) -> Result<Option<T>, String> + Send + Sync + 'static,
  {
    self.project(move |resource| {
      let typed = T::from_resource(resource)
        .ok_or_else(|| format!("expected a {}, found a {}", T::entity_type(), resource.kind()))?;
      Ok(project(&typed)?.map(Cacheable::into_resource))
    })
  }

  /// The resource disappears from every cached copy.
  pub fn removes(self) -> Self {
    self.project(|_| Ok(None))
  }

  /// Prepend `resource` to the cached list under `key`, if that list is cached.
  pub fn insert_into(mut self, key: CacheKey, resource: impl Into<Resource>) -> Self {
    self.inserts.push((key, resource.into()));
    self
  }

  pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
    self.retry = retry;
    self
  }

  pub fn on_success(mut self, message: impl Into<String>) -> Self {
    self.success_message = message.into();
    self
  }

  pub fn on_error(mut self, message: impl Into<String>) -> Self {
    self.error_message = message.into();
    self
  }

  pub fn label(&self) -> &str {
    &self.label
  }

  /// Entity key of the targeted resource.
  pub fn key(&self) -> CacheKey {
    CacheKey::entity(self.kind, &self.id)
  }

  pub fn operation(&self) -> &RemoteOperation {
    &self.operation
  }
}

impl fmt::Debug for MutationIntent {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("MutationIntent")
      .field("label", &self.label)
      .field("key", &self.key())
      .field("operation", &self.operation)
      .field("inserts", &self.inserts.len())
      .field("retry", &self.retry)
      .finish_non_exhaustive()
  }
}
