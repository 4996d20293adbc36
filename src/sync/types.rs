use serde::Serialize;

use crate::queue::OperationId;
use crate::site::SiteId;

/// Phase of a site's sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncState {
  Idle = 0,
  Draining = 1,
  Reporting = 2,
}

impl From<u8> for SyncState {
  fn from(v: u8) -> Self {
    match v {
      1 => SyncState::Draining,
      2 => SyncState::Reporting,
      _ => SyncState::Idle,
    }
  }
}

/// An operation dropped from the queue, with the reason.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedOperation {
  pub operation_id: OperationId,
  pub reason: String,
}

/// Report of one drain. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncResult {
  pub succeeded: Vec<OperationId>,
  pub failed: Vec<FailedOperation>,
  /// Messages meant for the user
  pub warnings: Vec<String>,
  /// Set when a transport or storage failure stopped the drain early
  pub interrupted: Option<String>,
}

impl SyncResult {
  /// True when nothing was replayed or dropped.
  pub fn is_empty(&self) -> bool {
    self.succeeded.is_empty() && self.failed.is_empty()
  }
}

/// Broadcast once per completed run.
#[derive(Debug, Clone)]
pub struct SyncEvent {
  pub site_id: SiteId,
  /// Triggered by connectivity or the interval rather than a caller
  pub automatic: bool,
  pub result: SyncResult,
}

/// What to do with operations that keep failing for transport reasons.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryPolicy {
  /// Give up (remove and report) after this many failed attempts.
  /// `None` keeps retrying forever.
  pub max_attempts: Option<u32>,
}

impl RetryPolicy {
  pub fn exhausted(&self, attempts: u32) -> bool {
    self.max_attempts.is_some_and(|max| attempts >= max)
  }
}
