//! Per-operation retry policy.

use serde::Deserialize;
use std::time::Duration;

use super::error::MutationError;

/// Delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Backoff {
  /// Same delay after every failed attempt
  Fixed { delay_ms: u64 },
  /// `base_ms * 2^(attempt - 1)`, capped at `max_ms`
  Exponential { base_ms: u64, max_ms: u64 },
}

impl Backoff {
  /// Delay to wait after attempt number `attempt` (1-based) failed.
  pub fn delay(&self, attempt: u32) -> Duration {
    let ms = match *self {
      Backoff::Fixed { delay_ms } => delay_ms,
      Backoff::Exponential { base_ms, max_ms } => {
        let factor = 1u64
          .checked_shl(attempt.saturating_sub(1))
          .unwrap_or(u64::MAX);
        base_ms.saturating_mul(factor).min(max_ms)
      }
    };
    Duration::from_millis(ms)
  }
}

impl Default for Backoff {
  fn default() -> Self {
    Backoff::Fixed { delay_ms: 500 }
  }
}

/// Whether and how often a mutation is re-sent after a failure.
///
/// Only idempotent operations are ever retried, and only for failures that
/// could plausibly go away (transport errors, 5xx, 429).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
  pub max_attempts: u32,
  pub backoff: Backoff,
  pub idempotent: bool,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self::never()
  }
}

impl RetryPolicy {
  /// A single attempt.
  pub fn never() -> Self {
    Self {
      max_attempts: 1,
      backoff: Backoff::default(),
      idempotent: false,
    }
  }

  pub fn idempotent(max_attempts: u32, backoff: Backoff) -> Self {
    Self {
      max_attempts,
      backoff,
      idempotent: true,
    }
  }

  /// Decide whether to try again after attempt `attempt` (1-based) failed.
  pub fn should_retry(&self, attempt: u32, error: &MutationError) -> bool {
    self.idempotent && attempt < self.max_attempts && error.is_retryable()
  }
}
