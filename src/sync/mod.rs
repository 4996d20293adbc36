//! Sync coordinator: replays queued writes against the server.
//!
//! One drain per site at a time; a second caller joins the running drain and
//! receives the same [`SyncResult`]. Outcomes are classified per operation:
//! - success: removed, affected cache keys invalidated
//! - server rejection: removed and reported, never retried
//! - transport failure: left queued, drain stops early

mod coordinator;
mod types;

pub use coordinator::{ReplayHandler, SyncCoordinator};
pub use types::{FailedOperation, RetryPolicy, SyncEvent, SyncResult, SyncState};
