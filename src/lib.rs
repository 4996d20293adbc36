//! Offline-capable data access for course notes.
//!
//! The core is split into per-site containers (result cache, pending queue)
//! owned by a [`site::SiteRegistry`], a [`sync::SyncCoordinator`] that
//! replays queued writes, and the [`notes::NotesRepository`] that combines
//! them for one entity kind.

pub mod cache;
pub mod connectivity;
pub mod error;
pub mod notes;
pub mod queue;
pub mod remote;
pub mod site;
pub mod storage;
pub mod sync;

pub use error::{CoreError, Result};
