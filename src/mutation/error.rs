//! Mutation error types.
//!
//! Every failure a mutation can meet falls in one of these buckets:
//! - `Network`: the request never reached the server or no response arrived
//! - `Rejected`: the server answered with a non-2xx status
//! - `Precondition`: the client refused to send the request
//! - `Cache`: the optimistic value failed validation at the cache boundary

use thiserror::Error;

use crate::cache::CacheError;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MutationError {
  /// Transport failure
  #[error("network error: {0}")]
  Network(String),

  /// Non-2xx response, validation or authorization failure
  #[error("request rejected ({status}): {message}")]
  Rejected {
    /// HTTP status code
    status: u16,
    /// Server supplied reason, or the status text
    message: String,
  },

  /// Client-side precondition failure
  #[error("{0}")]
  Precondition(String),

  #[error(transparent)]
  Cache(CacheError),
}

impl MutationError {
  /// Whether sending the same request again could succeed.
  pub fn is_retryable(&self) -> bool {
    match self {
      MutationError::Network(_) => true,
      MutationError::Rejected { status, .. } => *status >= 500 || *status == 429,
      MutationError::Precondition(_) | MutationError::Cache(_) => false,
    }
  }
}

impl From<CacheError> for MutationError {
  fn from(err: CacheError) -> Self {
    match err {
      CacheError::Projection { reason, .. } => MutationError::Precondition(reason),
      other => MutationError::Cache(other),
    }
  }
}
