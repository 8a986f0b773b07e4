use thiserror::Error;

use super::entry::CacheKey;

/// Errors raised at the cache boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
  /// A value failed schema validation or does not fit its key
  #[error("invalid value for {key}: {reason}")]
  Validation { key: CacheKey, reason: String },

  /// A projection refused the current value
  #[error("cannot update {key}: {reason}")]
  Projection { key: CacheKey, reason: String },
}
