//! In-memory storage for tests and ephemeral runs.

use std::collections::BTreeMap;
use std::sync::Mutex;

use super::LocalStore;
use crate::error::{CoreError, Result};
use crate::site::SiteId;

type Partition = (SiteId, String);

/// Storage that lives only as long as the process.
#[derive(Default)]
pub struct MemoryStore {
  partitions: Mutex<BTreeMap<Partition, BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }

  fn with_partitions<T>(
    &self,
    f: impl FnOnce(&mut BTreeMap<Partition, BTreeMap<String, Vec<u8>>>) -> T,
  ) -> Result<T> {
    let mut partitions = self
      .partitions
      .lock()
      .map_err(|e| CoreError::storage(format!("Lock poisoned: {}", e)))?;
    Ok(f(&mut partitions))
  }
}

impl LocalStore for MemoryStore {
  fn get(&self, site: &SiteId, namespace: &str, key: &str) -> Result<Option<Vec<u8>>> {
    self.with_partitions(|partitions| {
      partitions
        .get(&(site.clone(), namespace.to_string()))
        .and_then(|entries| entries.get(key).cloned())
    })
  }

  fn set(&self, site: &SiteId, namespace: &str, key: &str, value: &[u8]) -> Result<()> {
    self.with_partitions(|partitions| {
      partitions
        .entry((site.clone(), namespace.to_string()))
        .or_default()
        .insert(key.to_string(), value.to_vec());
    })
  }

  fn delete(&self, site: &SiteId, namespace: &str, key: &str) -> Result<()> {
    self.with_partitions(|partitions| {
      if let Some(entries) = partitions.get_mut(&(site.clone(), namespace.to_string())) {
        entries.remove(key);
      }
    })
  }

  fn entries(&self, site: &SiteId, namespace: &str) -> Result<Vec<(String, Vec<u8>)>> {
    self.with_partitions(|partitions| {
      partitions
        .get(&(site.clone(), namespace.to_string()))
        .map(|entries| {
          entries
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
        })
        .unwrap_or_default()
    })
  }
}
