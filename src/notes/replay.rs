use futures::future::{BoxFuture, FutureExt};
use serde_json::{json, Value};
use std::sync::Arc;

use super::query::{NotesQuery, CREATE_NOTES};
use super::types::NewNote;
use crate::cache::{CacheKey, QueryKey};
use crate::error::{CoreError, Result};
use crate::queue::PendingOperation;
use crate::remote::CallOptions;
use crate::site::SiteContext;
use crate::sync::ReplayHandler;

/// Entity kind of queued note writes.
pub const NOTE_ENTITY_KIND: &str = "note";

/// Send one note to the server.
///
/// The call can succeed at the transport level and still carry a per-note
/// failure (`noteid == -1`); that is reported as a server rejection.
pub(crate) async fn create_note_online(site: &SiteContext, note: &NewNote) -> Result<()> {
  let params = json!({
    "notes": [{
      "userid": note.user_id,
      "publishstate": note.publish_state.as_str(),
      "courseid": note.course_id,
      "text": note.text,
      "format": note.format,
    }]
  });

  let response = site
    .remote()
    .call(CREATE_NOTES, params, CallOptions::write())
    .await?;

  if let Some(first) = response.get(0) {
    if first.get("noteid").and_then(Value::as_i64) == Some(-1) {
      let message = first
        .get("errormessage")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .unwrap_or("The note could not be added")
        .to_string();
      return Err(CoreError::server(message));
    }
  }
  Ok(())
}

/// Replays queued note writes for the sync coordinator.
pub struct NoteReplayHandler;

impl ReplayHandler for NoteReplayHandler {
  fn entity_kind(&self) -> &'static str {
    NOTE_ENTITY_KIND
  }

  fn replay(
    &self,
    site: Arc<SiteContext>,
    operation: PendingOperation,
  ) -> BoxFuture<'static, Result<Vec<CacheKey>>> {
    async move {
      let note: NewNote = serde_json::from_value(operation.payload)?;
      create_note_online(&site, &note).await?;
      Ok(vec![NotesQuery::CourseNotes {
        course_id: note.course_id,
      }
      .cache_key()])
    }
    .boxed()
  }
}
