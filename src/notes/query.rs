//! Cache keys for the notes web-service reads.

use serde_json::{json, Value};

use super::types::{PublishState, FORMAT_HTML};
use crate::cache::QueryKey;

pub const GET_COURSE_NOTES: &str = "core_notes_get_course_notes";
pub const CREATE_NOTES: &str = "core_notes_create_notes";
pub const VIEW_NOTES: &str = "core_notes_view_notes";
pub const GET_USER_PROFILES: &str = "core_user_get_course_user_profiles";

/// Reads issued by the notes repository.
#[derive(Clone, Debug)]
pub enum NotesQuery {
  /// All notes visible in a course
  CourseNotes { course_id: i64 },
  /// Create-notes call with an invalid user, used to detect the capability
  AddNoteProbe { course_id: i64 },
  /// Profile of a note author within a course
  UserProfile { user_id: i64, course_id: i64 },
}

impl QueryKey for NotesQuery {
  fn operation(&self) -> &'static str {
    match self {
      Self::CourseNotes { .. } => GET_COURSE_NOTES,
      Self::AddNoteProbe { .. } => CREATE_NOTES,
      Self::UserProfile { .. } => GET_USER_PROFILES,
    }
  }

  fn params(&self) -> Value {
    match self {
      Self::CourseNotes { course_id } => json!({ "courseid": course_id }),
      Self::AddNoteProbe { course_id } => json!({
        "notes": [{
          "userid": -1,
          "publishstate": PublishState::Personal.as_str(),
          "courseid": course_id,
          "text": "",
          "format": FORMAT_HTML,
        }]
      }),
      Self::UserProfile { user_id, course_id } => json!({
        "userlist": [{ "userid": user_id, "courseid": course_id }]
      }),
    }
  }

  fn description(&self) -> String {
    match self {
      Self::CourseNotes { course_id } => format!("notes for course {}", course_id),
      Self::AddNoteProbe { course_id } => format!("add-note probe for course {}", course_id),
      Self::UserProfile { user_id, course_id } => {
        format!("profile of user {} in course {}", user_id, course_id)
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_keys_are_distinct_per_course() {
    let a = NotesQuery::CourseNotes { course_id: 10 }.cache_key();
    let b = NotesQuery::CourseNotes { course_id: 11 }.cache_key();
    let probe = NotesQuery::AddNoteProbe { course_id: 10 }.cache_key();
    assert_ne!(a, b);
    assert_ne!(a.as_str(), probe.as_str());
    assert_eq!(a.description(), "notes for course 10");
  }

  #[test]
  fn test_key_is_stable() {
    assert_eq!(
      NotesQuery::CourseNotes { course_id: 10 }.cache_key(),
      NotesQuery::CourseNotes { course_id: 10 }.cache_key()
    );
  }
}
