//! Domain types for notes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use super::api_types::ApiCourseNotes;
use crate::error::Result;
use crate::queue::{OperationId, PendingOperation};

/// Note text format understood by the server (1 = HTML).
pub const FORMAT_HTML: i64 = 1;

/// Who can see a note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishState {
  Personal,
  Course,
  Site,
}

impl PublishState {
  pub const ALL: [PublishState; 3] = [PublishState::Site, PublishState::Course, PublishState::Personal];

  pub fn as_str(self) -> &'static str {
    match self {
      PublishState::Personal => "personal",
      PublishState::Course => "course",
      PublishState::Site => "site",
    }
  }
}

impl fmt::Display for PublishState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for PublishState {
  type Err = String;

  fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
    match s.trim().to_lowercase().as_str() {
      "personal" => Ok(PublishState::Personal),
      "course" => Ok(PublishState::Course),
      "site" => Ok(PublishState::Site),
      other => Err(format!(
        "unknown publish state '{}' (expected personal, course or site)",
        other
      )),
    }
  }
}

/// A note the user wants to create. Also the payload of queued note writes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewNote {
  pub user_id: i64,
  pub course_id: i64,
  pub publish_state: PublishState,
  pub text: String,
  pub format: i64,
}

impl NewNote {
  pub fn new(user_id: i64, course_id: i64, publish_state: PublishState, text: impl Into<String>) -> Self {
    Self {
      user_id,
      course_id,
      publish_state,
      text: text.into(),
      format: FORMAT_HTML,
    }
  }
}

/// Display data for a note's author.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserDisplay {
  pub full_name: String,
  pub avatar_url: Option<String>,
}

impl UserDisplay {
  /// Shown when the profile cannot be loaded.
  pub fn placeholder(user_id: i64) -> Self {
    Self {
      full_name: format!("User with ID {}", user_id),
      avatar_url: None,
    }
  }
}

/// A note as shown to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Note {
  /// Server id; `None` for notes that only exist in the queue
  pub id: Option<i64>,
  pub user_id: i64,
  pub course_id: i64,
  pub publish_state: PublishState,
  pub text: String,
  pub format: i64,
  pub created: Option<DateTime<Utc>>,
  pub last_modified: Option<DateTime<Utc>>,
  /// Not yet confirmed by the server
  pub offline: bool,
  /// Filled in by enrichment
  pub author: Option<UserDisplay>,
}

impl Note {
  /// Build the offline shadow of a queued note write.
  pub fn from_pending(operation: &PendingOperation) -> Result<Self> {
    let note: NewNote = serde_json::from_value(operation.payload.clone())?;
    Ok(Self {
      id: None,
      user_id: note.user_id,
      course_id: note.course_id,
      publish_state: note.publish_state,
      text: note.text,
      format: note.format,
      created: Some(operation.created_at),
      last_modified: Some(operation.created_at),
      offline: true,
      author: None,
    })
  }
}

/// Notes of one course, split by publish state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CourseNotes {
  pub site: Vec<Note>,
  pub course: Vec<Note>,
  pub personal: Vec<Note>,
  /// Warnings the server attached to the response
  pub warnings: Vec<String>,
}

impl CourseNotes {
  /// Decode a `core_notes_get_course_notes` response.
  pub fn from_response(value: Value) -> Result<Self> {
    let api: ApiCourseNotes = serde_json::from_value(value)?;
    Ok(api.into())
  }

  pub fn of_state(&self, state: PublishState) -> &[Note] {
    match state {
      PublishState::Site => &self.site,
      PublishState::Course => &self.course,
      PublishState::Personal => &self.personal,
    }
  }

  pub fn of_state_mut(&mut self, state: PublishState) -> &mut Vec<Note> {
    match state {
      PublishState::Site => &mut self.site,
      PublishState::Course => &mut self.course,
      PublishState::Personal => &mut self.personal,
    }
  }

  /// Put offline notes (oldest first) at the front of their lists, newest first.
  pub fn merge_offline(&mut self, offline: Vec<Note>) {
    for note in offline {
      self.of_state_mut(note.publish_state).insert(0, note);
    }
  }

  pub fn iter(&self) -> impl Iterator<Item = &Note> {
    self.site.iter().chain(&self.course).chain(&self.personal)
  }

  pub fn is_empty(&self) -> bool {
    self.site.is_empty() && self.course.is_empty() && self.personal.is_empty()
  }
}

/// How a write ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
  /// The server stored the note.
  Confirmed,
  /// Stored locally, will be sent by the next sync.
  Queued(OperationId),
}

impl WriteOutcome {
  pub fn is_confirmed(&self) -> bool {
    matches!(self, WriteOutcome::Confirmed)
  }
}
