use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};

use crate::error::{SyncError, SyncResult};
use crate::session::SessionState;

/// Schema for persisted session tokens. A single row keyed by id = 1.
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS session (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    access_token TEXT,
    refresh_token TEXT,
    csrf_token TEXT,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// Database connection wrapper for the token store
pub struct Database {
  conn: Connection,
}

impl Database {
  /// Open or create the database at `path`
  pub fn open(path: &Path) -> SyncResult<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        SyncError::TokenStore(format!("failed to create directory {}: {}", parent.display(), e))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      SyncError::TokenStore(format!("failed to open database at {}: {}", path.display(), e))
    })?;

    let db = Self { conn };
    db.run_migrations()?;

    Ok(db)
  }

  pub fn open_in_memory() -> SyncResult<Self> {
    let db = Self {
      conn: Connection::open_in_memory()?,
    };
    db.run_migrations()?;
    Ok(db)
  }

  /// Get the default database path
  pub fn default_path() -> Option<PathBuf> {
    let data_dir = dirs::data_dir().or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))?;
    Some(data_dir.join("crudsync").join("session.db"))
  }

  /// Run database migrations
  fn run_migrations(&self) -> SyncResult<()> {
    self.conn.execute_batch(SCHEMA)?;
    Ok(())
  }

  pub fn load_session(&self) -> SyncResult<Option<SessionState>> {
    let row = self
      .conn
      .query_row(
        "SELECT access_token, refresh_token, csrf_token FROM session WHERE id = 1",
        [],
        |row| {
          Ok(SessionState {
            access_token: row.get(0)?,
            refresh_token: row.get(1)?,
            csrf_token: row.get(2)?,
          })
        },
      )
      .optional()?;
    Ok(row)
  }

  pub fn save_session(&self, session: &SessionState) -> SyncResult<()> {
    self.conn.execute(
      "INSERT OR REPLACE INTO session (id, access_token, refresh_token, csrf_token, updated_at)
       VALUES (1, ?, ?, ?, datetime('now'))",
      params![
        session.access_token,
        session.refresh_token,
        session.csrf_token
      ],
    )?;
    Ok(())
  }

  pub fn clear_session(&self) -> SyncResult<()> {
    self.conn.execute("DELETE FROM session", [])?;
    Ok(())
  }
}
