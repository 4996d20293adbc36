//! Notes: the entity repository built on the cache, queue and sync layers.
//!
//! Reads go through the site's result cache and are merged with notes still
//! waiting in the pending queue. Writes try the server first and fall back to
//! the queue on transport failures.

pub mod api_types;
mod profiles;
mod query;
mod replay;
mod repository;
mod types;

pub use profiles::{ProfileResolver, RemoteProfiles};
pub use query::{NotesQuery, CREATE_NOTES, GET_COURSE_NOTES, GET_USER_PROFILES, VIEW_NOTES};
pub use replay::{NoteReplayHandler, NOTE_ENTITY_KIND};
pub use repository::{NotesReadOptions, NotesRepository, NOTES_FEATURE};
pub use types::{CourseNotes, NewNote, Note, PublishState, UserDisplay, WriteOutcome, FORMAT_HTML};
