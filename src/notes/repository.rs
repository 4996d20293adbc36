use futures::future::join_all;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};

use super::profiles::{ProfileResolver, RemoteProfiles};
use super::query::{NotesQuery, CREATE_NOTES, GET_COURSE_NOTES, VIEW_NOTES};
use super::replay::{create_note_online, NoteReplayHandler, NOTE_ENTITY_KIND};
use super::types::{CourseNotes, NewNote, Note, UserDisplay, WriteOutcome};
use crate::cache::{CacheResult, QueryKey, ReadOptions};
use crate::connectivity::Connectivity;
use crate::error::Result;
use crate::remote::CallOptions;
use crate::site::SiteContext;
use crate::sync::ReplayHandler;

/// Advanced feature that switches notes on for a site.
pub const NOTES_FEATURE: &str = "enablenotes";

/// Options for [`NotesRepository::read`].
#[derive(Debug, Clone, Copy, Default)]
pub struct NotesReadOptions {
  /// Skip the cache and the emergency fallback
  pub ignore_cache: bool,
  /// Leave out notes that are still queued
  pub only_online: bool,
}

/// Read and write access to notes, with offline support.
///
/// Holds no per-site state: everything lives in the [`SiteContext`] passed
/// to each call.
pub struct NotesRepository {
  connectivity: Connectivity,
  profiles: Arc<dyn ProfileResolver>,
}

impl NotesRepository {
  pub fn new(connectivity: Connectivity) -> Self {
    Self {
      connectivity,
      profiles: Arc::new(RemoteProfiles),
    }
  }

  pub fn with_profiles(mut self, profiles: Arc<dyn ProfileResolver>) -> Self {
    self.profiles = profiles;
    self
  }

  /// Handler to register with the sync coordinator.
  pub fn replay_handler() -> Arc<dyn ReplayHandler> {
    Arc::new(NoteReplayHandler)
  }

  /// Create a note, or queue it when the server cannot be reached.
  ///
  /// Server rejections are returned as errors and never queued.
  pub async fn write(&self, site: &Arc<SiteContext>, note: NewNote) -> Result<WriteOutcome> {
    // Offline writes never wait for a running drain
    if !self.connectivity.is_online() {
      debug!(site = %site.id(), course_id = note.course_id, "offline, storing note");
      return store_offline(site, &note);
    }

    let _guard = site.write_lock().lock().await;
    if !self.connectivity.is_online() {
      debug!(site = %site.id(), course_id = note.course_id, "went offline, storing note");
      return store_offline(site, &note);
    }

    match create_note_online(site, &note).await {
      Ok(()) => {
        if let Err(err) = self.invalidate(site, note.course_id) {
          warn!(site = %site.id(), course_id = note.course_id, error = %err, "invalidation failed");
        }
        Ok(WriteOutcome::Confirmed)
      }
      Err(err) if err.is_transport() => {
        warn!(site = %site.id(), error = %err, "could not send note, storing it");
        store_offline(site, &note)
      }
      Err(err) => Err(err),
    }
  }

  /// Notes of a course, with queued notes first unless `only_online`.
  pub async fn read(
    &self,
    site: &Arc<SiteContext>,
    course_id: i64,
    options: NotesReadOptions,
  ) -> Result<CacheResult<CourseNotes>> {
    debug!(site = %site.id(), course_id, "get notes");

    let query = NotesQuery::CourseNotes { course_id };
    let read_options = if options.ignore_cache {
      ReadOptions::refresh()
    } else {
      ReadOptions::default()
    };
    let remote = Arc::clone(site.remote());
    let params = query.params();

    let fetched = site
      .cache()
      .read(&query.cache_key(), read_options, move || async move {
        remote
          .call(GET_COURSE_NOTES, params, CallOptions::read())
          .await
      })
      .await;

    let mut result = match fetched {
      Ok(result) => result.try_map(CourseNotes::from_response)?,
      Err(err) if err.is_transport() && !options.only_online => {
        let offline = self.offline_notes(site, course_id)?;
        if offline.is_empty() {
          return Err(err);
        }
        warn!(site = %site.id(), course_id, error = %err, "showing offline notes only");
        let mut notes = CourseNotes::default();
        notes.merge_offline(offline);
        return Ok(CacheResult::offline(notes));
      }
      Err(err) => return Err(err),
    };

    if !options.only_online {
      result.data.merge_offline(self.offline_notes(site, course_id)?);
    }
    Ok(result)
  }

  /// Queued notes of a course, oldest first.
  pub fn offline_notes(&self, site: &SiteContext, course_id: i64) -> Result<Vec<Note>> {
    let operations = site.queue().list(Some(NOTE_ENTITY_KIND))?;
    let notes = operations
      .iter()
      .filter_map(|operation| match Note::from_pending(operation) {
        Ok(note) => Some(note),
        Err(err) => {
          warn!(site = %site.id(), id = %operation.id, error = %err, "unreadable queued note");
          None
        }
      })
      .filter(|note| note.course_id == course_id)
      .collect();
    Ok(notes)
  }

  pub fn has_pending_offline(notes: &[Note]) -> bool {
    notes.iter().any(|note| note.offline)
  }

  /// Fill in author names and avatars. Lookups that fail get a placeholder.
  pub async fn attach_display_metadata(&self, site: &Arc<SiteContext>, notes: Vec<Note>) -> Vec<Note> {
    let lookups = notes.into_iter().map(|mut note| {
      let lookup = self
        .profiles
        .resolve(Arc::clone(site), note.user_id, note.course_id);
      async move {
        let author = match lookup.await {
          Ok(author) => author,
          Err(err) => {
            warn!(user_id = note.user_id, error = %err, "using placeholder author");
            UserDisplay::placeholder(note.user_id)
          }
        };
        note.author = Some(author);
        note
      }
    });
    join_all(lookups).await
  }

  /// Mark the course's notes stale.
  pub fn invalidate(&self, site: &SiteContext, course_id: i64) -> Result<()> {
    site
      .cache()
      .invalidate(&NotesQuery::CourseNotes { course_id }.cache_key())
  }

  pub fn is_add_note_enabled(&self, site: &SiteContext) -> bool {
    site.can_use_feature(NOTES_FEATURE) && site.ws_available(CREATE_NOTES)
  }

  pub fn is_view_notes_enabled(&self, site: &SiteContext) -> bool {
    site.can_use_feature(NOTES_FEATURE) && site.ws_available(GET_COURSE_NOTES)
  }

  /// Probe whether the user may add notes in a course.
  ///
  /// Creates a note for user -1 through the cache: the server validates
  /// permissions before the user id, so any answer other than a rejection
  /// means adding is allowed.
  pub async fn is_add_note_enabled_for_course(&self, site: &Arc<SiteContext>, course_id: i64) -> bool {
    let probe = format!("add_note:{}", course_id);
    if let Some(enabled) = site.capabilities().get(&probe) {
      return enabled;
    }

    let query = NotesQuery::AddNoteProbe { course_id };
    let remote = Arc::clone(site.remote());
    let params = query.params();
    let outcome = site
      .cache()
      .read(&query.cache_key(), ReadOptions::default(), move || async move {
        remote.call(CREATE_NOTES, params, CallOptions::read()).await
      })
      .await;

    match outcome {
      Ok(_) => {
        site.capabilities().insert(probe, true);
        true
      }
      Err(err) if err.is_transport() => false,
      Err(err) => {
        debug!(site = %site.id(), course_id, error = %err, "adding notes not allowed");
        site.capabilities().insert(probe, false);
        false
      }
    }
  }

  /// Probe whether the user may read notes in a course.
  pub async fn is_view_notes_enabled_for_course(&self, site: &Arc<SiteContext>, course_id: i64) -> bool {
    let probe = format!("view_notes:{}", course_id);
    if let Some(enabled) = site.capabilities().get(&probe) {
      return enabled;
    }

    let options = NotesReadOptions {
      ignore_cache: false,
      only_online: true,
    };
    match self.read(site, course_id, options).await {
      Ok(_) => {
        site.capabilities().insert(probe, true);
        true
      }
      Err(err) if err.is_transport() => false,
      Err(_) => {
        site.capabilities().insert(probe, false);
        false
      }
    }
  }

  /// Tell the server the notes of a course were viewed. Failures are ignored.
  pub async fn log_view(&self, site: &SiteContext, course_id: i64) {
    let params = json!({ "courseid": course_id });
    if let Err(err) = site
      .remote()
      .call(VIEW_NOTES, params, CallOptions::write())
      .await
    {
      debug!(site = %site.id(), course_id, error = %err, "view not logged");
    }
  }
}

fn store_offline(site: &SiteContext, note: &NewNote) -> Result<WriteOutcome> {
  let payload = serde_json::to_value(note)?;
  let id = site.queue().enqueue(NOTE_ENTITY_KIND, payload)?;
  Ok(WriteOutcome::Queued(id))
}
