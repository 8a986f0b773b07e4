//! User-facing notifications emitted when a mutation settles.

use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
  Success,
  Error,
}

/// A toast-style message for the user
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
  pub level: Level,
  pub message: String,
  /// Human readable failure reason
  pub detail: Option<String>,
}

impl Notification {
  pub fn success(message: impl Into<String>) -> Self {
    Self {
      level: Level::Success,
      message: message.into(),
      detail: None,
    }
  }

  pub fn error(message: impl Into<String>, detail: impl Into<String>) -> Self {
    Self {
      level: Level::Error,
      message: message.into(),
      detail: Some(detail.into()),
    }
  }
}

/// Surface that shows notifications to the user.
pub trait Notifier: Send + Sync {
  fn notify(&self, notification: Notification);
}

/// Forwards notifications to an event loop.
pub struct ChannelNotifier {
  tx: mpsc::UnboundedSender<Notification>,
}

impl ChannelNotifier {
  pub fn new() -> (Self, mpsc::UnboundedReceiver<Notification>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Self { tx }, rx)
  }
}

impl Notifier for ChannelNotifier {
  fn notify(&self, notification: Notification) {
    // Ignore send errors - receiver may have been dropped
    let _ = self.tx.send(notification);
  }
}
