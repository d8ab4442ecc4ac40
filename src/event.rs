//! Notification events emitted by the data layer.
//!
//! The core never talks to a UI. Anything a user should be told about is sent
//! as a [`SyncEvent`] through an unbounded channel and drained by whoever hosts
//! the engine (a TUI loop, a CLI, a test).

use tokio::sync::mpsc;

use crate::error::SyncError;

/// Events for the host application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
  /// A request failed and the user should see an error toast
  Error { message: String },
  /// Authenticated but not allowed
  PermissionDenied { message: String },
  /// Session tokens were refreshed
  SessionRefreshed,
  /// Session is gone, the host should navigate to its login screen
  NavigateToLogin,
}

/// Cloneable sending half handed to every component that can notify.
#[derive(Debug, Clone)]
pub struct Notifier {
  tx: mpsc::UnboundedSender<SyncEvent>,
}

impl Notifier {
  pub fn emit(&self, event: SyncEvent) {
    // Host may have stopped listening
    let _ = self.tx.send(event);
  }

  /// Raise the one user-visible notification an error deserves, if any.
  pub fn surface(&self, error: &SyncError) {
    match error {
      SyncError::PermissionDenied(message) => self.emit(SyncEvent::PermissionDenied {
        message: message.clone(),
      }),
      e if e.is_surfaced() => self.emit(SyncEvent::Error {
        message: e.to_string(),
      }),
      _ => {}
    }
  }
}

/// Receiving half owned by the host
pub struct EventHandler {
  rx: mpsc::UnboundedReceiver<SyncEvent>,
}

impl EventHandler {
  /// Create a connected notifier/handler pair
  pub fn new() -> (Notifier, Self) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Notifier { tx }, Self { rx })
  }

  /// Receive the next event
  pub async fn next(&mut self) -> Option<SyncEvent> {
    self.rx.recv().await
  }

  /// Drain everything queued so far without waiting.
  pub fn drain(&mut self) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = self.rx.try_recv() {
      events.push(event);
    }
    events
  }
}
