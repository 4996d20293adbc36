//! SQLite-backed storage that survives process restarts.

use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::LocalStore;
use crate::error::{CoreError, Result};
use crate::site::SiteId;

/// SQLite storage implementation.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open (or create) the database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| CoreError::storage(format!("Failed to create data directory: {}", e)))?;
    }

    let conn = Connection::open(path).map_err(|e| {
      CoreError::storage(format!(
        "Failed to open database at {}: {}",
        path.display(),
        e
      ))
    })?;

    Self::from_connection(conn)
  }

  /// Open a private in-memory database.
  pub fn open_in_memory() -> Result<Self> {
    Self::from_connection(Connection::open_in_memory()?)
  }

  /// Default database location inside `data_dir`.
  pub fn default_path(data_dir: &Path) -> PathBuf {
    data_dir.join("coursenotes.db")
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;
    Ok(store)
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| CoreError::storage(format!("Lock poisoned: {}", e)))
  }

  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(SCHEMA)
      .map_err(|e| CoreError::storage(format!("Failed to run migrations: {}", e)))
  }
}

const SCHEMA: &str = r#"
-- One row per (site, namespace, key); REPLACE swaps a row atomically
CREATE TABLE IF NOT EXISTS kv_store (
    site_id TEXT NOT NULL,
    namespace TEXT NOT NULL,
    entry_key TEXT NOT NULL,
    data BLOB NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (site_id, namespace, entry_key)
);
"#;

impl LocalStore for SqliteStore {
  fn get(&self, site: &SiteId, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
    let conn = self.conn()?;
    let data = conn
      .query_row(
        "SELECT data FROM kv_store WHERE site_id = ? AND namespace = ? AND entry_key = ?",
        params![site.as_str(), namespace, key],
        |row| row.get(0),
      )
      .optional()?;
    Ok(data)
  }

  fn set(&self, site: &SiteId, namespace: &str, key: &str, value: &[u8]) -> Result<()> {
    let conn = self.conn()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO kv_store (site_id, namespace, entry_key, data, updated_at)
         VALUES (?, ?, ?, ?, datetime('now'))",
        params![site.as_str(), namespace, key, value],
      )
      .map_err(|e| CoreError::storage(format!("Failed to store {}/{}: {}", namespace, key, e)))?;
    Ok(())
  }

  fn delete(&self, site: &SiteId, namespace: &str, key: &str) -> Result<()> {
    let conn = self.conn()?;
    conn.execute(
      "DELETE FROM kv_store WHERE site_id = ? AND namespace = ? AND entry_key = ?",
      params![site.as_str(), namespace, key],
    )?;
    Ok(())
  }

  fn entries(&self, site: &SiteId, namespace: &str) -> Result<Vec<(String, Vec<u8>)>> {
    let conn = self.conn()?;
    let mut stmt = conn.prepare(
      "SELECT entry_key, data FROM kv_store
       WHERE site_id = ? AND namespace = ?
       ORDER BY entry_key",
    )?;

    let rows = stmt
      .query_map(params![site.as_str(), namespace], |row| {
        Ok((row.get(0)?, row.get(1)?))
      })?
      .collect::<rusqlite::Result<Vec<(String, Vec<u8>)>>>()?;

    Ok(rows)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn temp_db_path(name: &str) -> PathBuf {
    let nanos = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    std::env::temp_dir()
      .join(format!("coursenotes-test-{}-{}", std::process::id(), nanos))
      .join(format!("{}.db", name))
  }

  #[test]
  fn test_replace_and_list() {
    let store = SqliteStore::open_in_memory().unwrap();
    let site = SiteId::new("school");

    store.set(&site, "cache", "b", b"first").unwrap();
    store.set(&site, "cache", "a", b"other").unwrap();
    store.set(&site, "cache", "b", b"second").unwrap();

    let entries = store.entries(&site, "cache").unwrap();
    assert_eq!(
      entries,
      vec![
        ("a".to_string(), b"other".to_vec()),
        ("b".to_string(), b"second".to_vec()),
      ]
    );
  }

  #[test]
  fn test_missing_key_is_none() {
    let store = SqliteStore::open_in_memory().unwrap();
    let site = SiteId::new("school");
    assert_eq!(store.get(&site, "cache", "nope").unwrap(), None);
    store.delete(&site, "cache", "nope").unwrap();
  }

  #[test]
  fn test_survives_reopen() {
    let path = temp_db_path("reopen");
    let site = SiteId::new("school");

    {
      let store = SqliteStore::open(&path).unwrap();
      store.set(&site, "pending", "00000000000000000001", b"payload").unwrap();
    }

    let store = SqliteStore::open(&path).unwrap();
    assert_eq!(
      store.get(&site, "pending", "00000000000000000001").unwrap(),
      Some(b"payload".to_vec())
    );

    if let Some(dir) = path.parent() {
      let _ = std::fs::remove_dir_all(dir);
    }
  }
}
