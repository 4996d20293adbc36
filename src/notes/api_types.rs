//! Serde-deserializable types matching the notes web-service responses.
//!
//! These types are separate from domain types to allow clean deserialization
//! while keeping domain types focused on application needs.

use chrono::{DateTime, Utc};
use serde::Deserialize;

use super::types::{CourseNotes, Note, PublishState};

#[derive(Debug, Deserialize)]
pub struct ApiWarning {
  #[serde(default)]
  pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct ApiNote {
  pub id: i64,
  pub courseid: i64,
  pub userid: i64,
  #[serde(default)]
  pub content: String,
  #[serde(default = "default_format")]
  pub format: i64,
  pub created: Option<i64>,
  pub lastmodified: Option<i64>,
}

fn default_format() -> i64 {
  super::types::FORMAT_HTML
}

impl ApiNote {
  /// The server reports personal notes as "draft", so the state comes from
  /// the list the note was returned in.
  pub fn into_note(self, publish_state: PublishState) -> Note {
    Note {
      id: Some(self.id),
      user_id: self.userid,
      course_id: self.courseid,
      publish_state,
      text: self.content,
      format: self.format,
      created: self.created.and_then(timestamp),
      last_modified: self.lastmodified.and_then(timestamp),
      offline: false,
      author: None,
    }
  }
}

fn timestamp(secs: i64) -> Option<DateTime<Utc>> {
  DateTime::<Utc>::from_timestamp(secs, 0)
}

// ============================================================================
// core_notes_get_course_notes
// ============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct ApiCourseNotes {
  #[serde(default)]
  pub sitenotes: Vec<ApiNote>,
  #[serde(default)]
  pub coursenotes: Vec<ApiNote>,
  #[serde(default)]
  pub personalnotes: Vec<ApiNote>,
  #[serde(default)]
  pub warnings: Vec<ApiWarning>,
}

impl From<ApiCourseNotes> for CourseNotes {
  fn from(api: ApiCourseNotes) -> Self {
    let convert = |notes: Vec<ApiNote>, state| {
      notes
        .into_iter()
        .map(|note| note.into_note(state))
        .collect::<Vec<_>>()
    };

    CourseNotes {
      site: convert(api.sitenotes, PublishState::Site),
      course: convert(api.coursenotes, PublishState::Course),
      personal: convert(api.personalnotes, PublishState::Personal),
      warnings: api.warnings.into_iter().map(|w| w.message).collect(),
    }
  }
}

// ============================================================================
// core_user_get_course_user_profiles
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ApiUserProfile {
  pub fullname: String,
  pub profileimageurl: Option<String>,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_course_notes_conversion() {
    let notes = CourseNotes::from_response(json!({
      "sitenotes": [],
      "coursenotes": [
        {"id": 3, "courseid": 10, "userid": 5, "content": "<p>well done</p>", "format": 1,
         "created": 1500000000, "lastmodified": 1500000100, "usermodified": 2, "publishstate": "public"}
      ],
      "personalnotes": [
        {"id": 4, "courseid": 10, "userid": 6, "content": "mine", "publishstate": "draft"}
      ],
      "warnings": [{"item": "course", "warningcode": "1", "message": "partial"}]
    }))
    .unwrap();

    assert!(notes.site.is_empty());
    assert_eq!(notes.course[0].id, Some(3));
    assert_eq!(notes.course[0].publish_state, PublishState::Course);
    assert_eq!(notes.course[0].created.unwrap().timestamp(), 1500000000);
    assert_eq!(notes.personal[0].publish_state, PublishState::Personal);
    assert_eq!(notes.personal[0].format, 1);
    assert!(!notes.personal[0].offline);
    assert_eq!(notes.warnings, vec!["partial".to_string()]);
  }

  #[test]
  fn test_missing_lists_default_to_empty() {
    let notes = CourseNotes::from_response(json!({})).unwrap();
    assert!(notes.is_empty());
  }
}
