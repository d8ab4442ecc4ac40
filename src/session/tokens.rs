//! Session tokens and their persistence.

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::db::Database;
use crate::error::SyncResult;

/// Process-wide session credentials.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
  pub access_token: Option<String>,
  pub refresh_token: Option<String>,
  pub csrf_token: Option<String>,
}

impl SessionState {
  pub fn new(access_token: impl Into<String>, refresh_token: Option<String>) -> Self {
    Self {
      access_token: Some(access_token.into()),
      refresh_token,
      csrf_token: None,
    }
  }

  pub fn with_csrf(mut self, csrf_token: impl Into<String>) -> Self {
    self.csrf_token = Some(csrf_token.into());
    self
  }

  pub fn is_empty(&self) -> bool {
    self.access_token.is_none() && self.refresh_token.is_none()
  }
}

/// Where tokens survive restarts.
pub trait TokenStore: Send + Sync {
  fn load(&self) -> SyncResult<Option<SessionState>>;
  fn save(&self, session: &SessionState) -> SyncResult<()>;
  fn clear(&self) -> SyncResult<()>;
}

#[derive(Debug, Default)]
pub struct MemoryTokenStore {
  state: Mutex<Option<SessionState>>,
}

impl TokenStore for MemoryTokenStore {
  fn load(&self) -> SyncResult<Option<SessionState>> {
    Ok(self.state.lock().unwrap_or_else(PoisonError::into_inner).clone())
  }

  fn save(&self, session: &SessionState) -> SyncResult<()> {
    *self.state.lock().unwrap_or_else(PoisonError::into_inner) = Some(session.clone());
    Ok(())
  }

  fn clear(&self) -> SyncResult<()> {
    *self.state.lock().unwrap_or_else(PoisonError::into_inner) = None;
    Ok(())
  }
}

/// SQLite-backed token store.
pub struct SqliteTokenStore {
  db: Mutex<Database>,
}

impl SqliteTokenStore {
  pub fn open(path: &Path) -> SyncResult<Self> {
    Ok(Self {
      db: Mutex::new(Database::open(path)?),
    })
  }
}

impl TokenStore for SqliteTokenStore {
  fn load(&self) -> SyncResult<Option<SessionState>> {
    self.db.lock().unwrap_or_else(PoisonError::into_inner).load_session()
  }

  fn save(&self, session: &SessionState) -> SyncResult<()> {
    self
      .db
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .save_session(session)
  }

  fn clear(&self) -> SyncResult<()> {
    self.db.lock().unwrap_or_else(PoisonError::into_inner).clear_session()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_sqlite_store_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("session.db");
    let session = SessionState::new("acc", Some("ref".into())).with_csrf("csrf");

    {
      let store = SqliteTokenStore::open(&path).unwrap();
      store.save(&session).unwrap();
    }

    let store = SqliteTokenStore::open(&path).unwrap();
    assert_eq!(store.load().unwrap(), Some(session));
    store.clear().unwrap();
    assert_eq!(store.load().unwrap(), None);
  }

  #[test]
  fn test_memory_store() {
    let store = MemoryTokenStore::default();
    assert_eq!(store.load().unwrap(), None);
    store.save(&SessionState::new("a", None)).unwrap();
    assert_eq!(store.load().unwrap().unwrap().access_token.as_deref(), Some("a"));
  }
}
