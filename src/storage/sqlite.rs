//! SQLite-backed key/value storage.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use rusqlite::{params, Connection, OptionalExtension};

use super::LocalStorage;
use crate::error::{Error, Result};

/// Schema for the key/value table.
const KV_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

/// SQLite-based durable storage.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteStorage {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("SqliteStorage").finish_non_exhaustive()
  }
}

impl SqliteStorage {
  /// Open (or create) the database at the default location.
  pub fn open_default() -> Result<Self> {
    Self::open(&Self::default_path()?)
  }

  /// Open (or create) the database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| Error::Storage(format!("Failed to create data directory: {}", e)))?;
    }

    let conn = Connection::open(path).map_err(|e| {
      Error::Storage(format!(
        "Failed to open database at {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::with_connection(conn)
  }

  /// Database that lives only as long as this value.
  pub fn open_in_memory() -> Result<Self> {
    Self::with_connection(Connection::open_in_memory()?)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| Error::Storage("Could not determine data directory".to_string()))?;

    Ok(data_dir.join("shopsync").join("store.db"))
  }

  fn run_migrations(&self) -> Result<()> {
    self
      .lock()?
      .execute_batch(KV_SCHEMA)
      .map_err(|e| Error::Storage(format!("Failed to run migrations: {}", e)))
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| Error::Storage(format!("Lock poisoned: {}", e)))
  }
}

impl LocalStorage for SqliteStorage {
  fn get_item(&self, key: &str) -> Result<Option<String>> {
    let conn = self.lock()?;
    let value: Option<String> = conn
      .query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| Error::Storage(format!("Failed to read {}: {}", key, e)))?;
    Ok(value)
  }

  fn set_item(&self, key: &str, value: &str) -> Result<()> {
    self
      .lock()?
      .execute(
        "INSERT OR REPLACE INTO kv_store (key, value, updated_at)
         VALUES (?, ?, datetime('now'))",
        params![key, value],
      )
      .map_err(|e| Error::Storage(format!("Failed to write {}: {}", key, e)))?;
    Ok(())
  }

  fn remove_item(&self, key: &str) -> Result<()> {
    self
      .lock()?
      .execute("DELETE FROM kv_store WHERE key = ?", params![key])
      .map_err(|e| Error::Storage(format!("Failed to remove {}: {}", key, e)))?;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_set_get_remove() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    assert_eq!(storage.get_item("queue").unwrap(), None);

    storage.set_item("queue", "[1]").unwrap();
    storage.set_item("queue", "[1,2]").unwrap();
    assert_eq!(storage.get_item("queue").unwrap().as_deref(), Some("[1,2]"));

    storage.remove_item("queue").unwrap();
    assert_eq!(storage.get_item("queue").unwrap(), None);
  }

  #[test]
  fn test_survives_reopen() {
    let dir = std::env::temp_dir().join(format!("shopsync-test-{}", uuid::Uuid::new_v4()));
    let path = dir.join("store.db");
    {
      let storage = SqliteStorage::open(&path).unwrap();
      storage.set_item("k", "v").unwrap();
    }
    let storage = SqliteStorage::open(&path).unwrap();
    assert_eq!(storage.get_item("k").unwrap().as_deref(), Some("v"));
    std::fs::remove_dir_all(dir).ok();
  }
}
