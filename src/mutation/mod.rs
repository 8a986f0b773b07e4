//! Optimistic writes against the portal with snapshot rollback.
//!
//! A `MutationIntent` describes the request and how the cache should look
//! while it is in flight; `MutationCoordinator::execute` carries it through
//! `Idle -> OptimisticApplied -> SettledSuccess | SettledFailure`.

mod coordinator;
mod error;
mod intent;
mod notify;
mod retry;

pub use coordinator::{MutationCoordinator, MutationOutcome, MutationPhase};
pub use error::MutationError;
pub use intent::{Method, MutationIntent, RemoteOperation, Transport};
pub use notify::{ChannelNotifier, Level, Notification, Notifier};
pub use retry::{Backoff, RetryPolicy};
