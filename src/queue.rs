//! Durable queue of writes that could not reach the server.
//!
//! Entries are only ever removed explicitly, after a confirmed replay or a
//! terminal server rejection. The queue itself never drops anything.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::error::{CoreError, Result};
use crate::site::SiteId;
use crate::storage::LocalStore;

const NAMESPACE: &str = "pending";
const META_NAMESPACE: &str = "pending_meta";
const NEXT_ID_KEY: &str = "next_id";

/// Identifier of a queued operation, unique per site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperationId(u64);

impl OperationId {
  pub fn new(id: u64) -> Self {
    Self(id)
  }

  pub fn value(self) -> u64 {
    self.0
  }

  /// Zero-padded so that lexical storage order matches numeric order.
  fn storage_key(self) -> String {
    format!("{:020}", self.0)
  }
}

impl fmt::Display for OperationId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "#{}", self.0)
  }
}

/// A write waiting to be replayed against the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOperation {
  pub id: OperationId,
  pub site_id: SiteId,
  /// Which replay handler owns the payload (e.g. "note")
  pub entity_kind: String,
  pub payload: Value,
  pub created_at: DateTime<Utc>,
  pub attempts: u32,
}

/// Per-site pending-operation queue.
pub struct PendingQueue {
  site_id: SiteId,
  store: Arc<dyn LocalStore>,
  /// Guards id allocation and read-modify-write of entries
  lock: Mutex<()>,
}

impl PendingQueue {
  pub fn new(site_id: SiteId, store: Arc<dyn LocalStore>) -> Self {
    Self {
      site_id,
      store,
      lock: Mutex::new(()),
    }
  }

  fn guard(&self) -> Result<std::sync::MutexGuard<'_, ()>> {
    self
      .lock
      .lock()
      .map_err(|e| CoreError::storage(format!("Lock poisoned: {}", e)))
  }

  /// Append an operation with zero attempts and return its id.
  ///
  /// The only possible failure is local storage being unavailable.
  pub fn enqueue(&self, entity_kind: &str, payload: Value) -> Result<OperationId> {
    let _guard = self.guard()?;

    let id = self.allocate_id()?;
    let operation = PendingOperation {
      id,
      site_id: self.site_id.clone(),
      entity_kind: entity_kind.to_string(),
      payload,
      created_at: Utc::now(),
      attempts: 0,
    };
    self.write(&operation)?;

    info!(site = %self.site_id, id = %id, kind = entity_kind, "operation queued");
    Ok(id)
  }

  /// Pending operations, oldest first, optionally restricted to one kind.
  pub fn list(&self, entity_kind: Option<&str>) -> Result<Vec<PendingOperation>> {
    let mut operations = self
      .store
      .entries(&self.site_id, NAMESPACE)?
      .into_iter()
      .map(|(key, data)| {
        serde_json::from_slice::<PendingOperation>(&data)
          .map_err(|e| CoreError::decode(format!("pending operation {}: {}", key, e)))
      })
      .collect::<Result<Vec<_>>>()?;

    if let Some(kind) = entity_kind {
      operations.retain(|op| op.entity_kind == kind);
    }
    operations.sort_by(|a, b| (a.created_at, a.id).cmp(&(b.created_at, b.id)));
    Ok(operations)
  }

  pub fn get(&self, id: OperationId) -> Result<Option<PendingOperation>> {
    match self.store.get(&self.site_id, NAMESPACE, &id.storage_key())? {
      Some(data) => Ok(Some(serde_json::from_slice(&data)?)),
      None => Ok(None),
    }
  }

  /// Delete one operation. Removing an unknown id is a no-op.
  pub fn remove(&self, id: OperationId) -> Result<()> {
    let _guard = self.guard()?;
    self.store.delete(&self.site_id, NAMESPACE, &id.storage_key())?;
    debug!(site = %self.site_id, id = %id, "operation removed");
    Ok(())
  }

  /// Bump the retry counter, returning the new count (`None` if unknown).
  pub fn increment_attempts(&self, id: OperationId) -> Result<Option<u32>> {
    let _guard = self.guard()?;
    let Some(mut operation) = self.get(id)? else {
      return Ok(None);
    };
    operation.attempts += 1;
    self.write(&operation)?;
    Ok(Some(operation.attempts))
  }

  pub fn is_empty(&self) -> Result<bool> {
    Ok(self.store.entries(&self.site_id, NAMESPACE)?.is_empty())
  }

  fn write(&self, operation: &PendingOperation) -> Result<()> {
    let data = serde_json::to_vec(operation)?;
    self
      .store
      .set(&self.site_id, NAMESPACE, &operation.id.storage_key(), &data)
  }

  /// Ids come from a persisted counter so they are never reused after removal.
  fn allocate_id(&self) -> Result<OperationId> {
    let next = match self.store.get(&self.site_id, META_NAMESPACE, NEXT_ID_KEY)? {
      Some(data) => serde_json::from_slice::<u64>(&data)?,
      None => 1,
    };
    let data = serde_json::to_vec(&(next + 1))?;
    self
      .store
      .set(&self.site_id, META_NAMESPACE, NEXT_ID_KEY, &data)?;
    Ok(OperationId(next))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::storage::{MemoryStore, SqliteStore};
  use serde_json::json;

  fn queue() -> PendingQueue {
    PendingQueue::new(SiteId::new("school"), Arc::new(MemoryStore::new()))
  }

  #[test]
  fn test_enqueue_starts_with_zero_attempts() {
    let queue = queue();
    let id = queue.enqueue("note", json!({"text": "hi"})).unwrap();

    let op = queue.get(id).unwrap().unwrap();
    assert_eq!(op.attempts, 0);
    assert_eq!(op.entity_kind, "note");
    assert_eq!(op.payload, json!({"text": "hi"}));
    assert_eq!(op.site_id, SiteId::new("school"));
  }

  #[test]
  fn test_list_preserves_insertion_order() {
    let queue = queue();
    let ids: Vec<_> = (0..12)
      .map(|i| queue.enqueue("note", json!({ "n": i })).unwrap())
      .collect();

    queue.remove(ids[3]).unwrap();
    queue.remove(ids[7]).unwrap();

    let listed: Vec<_> = queue.list(None).unwrap().iter().map(|op| op.id).collect();
    let expected: Vec<_> = ids
      .iter()
      .copied()
      .filter(|id| *id != ids[3] && *id != ids[7])
      .collect();
    assert_eq!(listed, expected);
  }

  #[test]
  fn test_list_filters_by_kind() {
    let queue = queue();
    queue.enqueue("note", json!(1)).unwrap();
    queue.enqueue("rating", json!(2)).unwrap();
    queue.enqueue("note", json!(3)).unwrap();

    let notes = queue.list(Some("note")).unwrap();
    assert_eq!(notes.len(), 2);
    assert!(notes.iter().all(|op| op.entity_kind == "note"));
  }

  #[test]
  fn test_remove_unknown_is_noop() {
    let queue = queue();
    queue.enqueue("note", json!(1)).unwrap();
    queue.remove(OperationId::new(999)).unwrap();
    assert_eq!(queue.list(None).unwrap().len(), 1);
  }

  #[test]
  fn test_ids_are_not_reused() {
    let queue = queue();
    let first = queue.enqueue("note", json!(1)).unwrap();
    queue.remove(first).unwrap();
    let second = queue.enqueue("note", json!(2)).unwrap();
    assert!(second > first);
  }

  #[test]
  fn test_increment_attempts() {
    let queue = queue();
    let id = queue.enqueue("note", json!(1)).unwrap();

    assert_eq!(queue.increment_attempts(id).unwrap(), Some(1));
    assert_eq!(queue.increment_attempts(id).unwrap(), Some(2));
    assert_eq!(queue.increment_attempts(OperationId::new(42)).unwrap(), None);

    let op = queue.get(id).unwrap().unwrap();
    assert_eq!(op.attempts, 2);
    assert_eq!(op.payload, json!(1));
  }

  #[test]
  fn test_queues_are_per_site() {
    let store: Arc<dyn LocalStore> = Arc::new(SqliteStore::open_in_memory().unwrap());
    let a = PendingQueue::new(SiteId::new("a"), Arc::clone(&store));
    let b = PendingQueue::new(SiteId::new("b"), Arc::clone(&store));

    a.enqueue("note", json!("a")).unwrap();
    assert!(b.is_empty().unwrap());
    assert!(!a.is_empty().unwrap());
  }
}
