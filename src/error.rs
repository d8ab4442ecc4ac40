//! Error taxonomy for the data-access layer.

use thiserror::Error;

/// Result type for data-access operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors surfaced by queries, mutations and the session guard.
///
/// `Clone` because a single in-flight read is shared by every caller that joined it.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SyncError {
  /// No response was received.
  #[error("network failure: {0}")]
  Network(String),

  /// Authenticated, but not allowed to perform the operation.
  #[error("permission denied: {0}")]
  PermissionDenied(String),

  /// Auth was invalid or expired and could not be refreshed.
  #[error("session expired")]
  SessionExpired,

  /// Non-success application status with a server message.
  #[error("application error {status}: {message}")]
  Application { status: u16, message: String },

  #[error("unknown entity: {0}")]
  EntityNotFound(String),

  #[error("invalid entity name: {0}")]
  InvalidEntityName(String),

  #[error("failed to decode response: {0}")]
  Decode(String),

  #[error("token store: {0}")]
  TokenStore(String),

  #[error("configuration: {0}")]
  Config(String),
}

impl SyncError {
  /// Whether this error should raise a user-facing error notification.
  pub fn is_surfaced(&self) -> bool {
    matches!(
      self,
      SyncError::Network(_) | SyncError::Application { .. } | SyncError::Decode(_)
    )
  }
}

impl From<serde_json::Error> for SyncError {
  fn from(e: serde_json::Error) -> Self {
    SyncError::Decode(e.to_string())
  }
}

impl From<rusqlite::Error> for SyncError {
  fn from(e: rusqlite::Error) -> Self {
    SyncError::TokenStore(e.to_string())
  }
}
