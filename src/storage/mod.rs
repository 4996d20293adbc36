//! Local durable storage backing the result cache and the pending queue.
//!
//! Everything is partitioned by site and namespace, so two sites never see
//! each other's entries. Failures surface as [`CoreError::Storage`], never as
//! a cache miss.
//!
//! [`CoreError::Storage`]: crate::error::CoreError::Storage

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::Result;
use crate::site::SiteId;

/// Key/value storage scoped by (site, namespace, key).
pub trait LocalStore: Send + Sync {
  /// Load one value, `None` when the key is absent.
  fn get(&self, site: &SiteId, namespace: &str, key: &str) -> Result<Option<Vec<u8>>>;

  /// Insert or atomically replace one value.
  fn set(&self, site: &SiteId, namespace: &str, key: &str, value: &[u8]) -> Result<()>;

  /// Remove one value. Removing an absent key is not an error.
  fn delete(&self, site: &SiteId, namespace: &str, key: &str) -> Result<()>;

  /// All entries of a namespace, ordered by key.
  fn entries(&self, site: &SiteId, namespace: &str) -> Result<Vec<(String, Vec<u8>)>>;
}
