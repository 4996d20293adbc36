//! Author profile lookup used to decorate notes.

use futures::future::{BoxFuture, FutureExt};
use std::sync::Arc;

use super::api_types::ApiUserProfile;
use super::query::{NotesQuery, GET_USER_PROFILES};
use super::types::UserDisplay;
use crate::cache::{QueryKey, ReadOptions};
use crate::error::{CoreError, Result};
use crate::remote::CallOptions;
use crate::site::SiteContext;

/// Resolves display data for a user within a course.
pub trait ProfileResolver: Send + Sync {
  fn resolve(
    &self,
    site: Arc<SiteContext>,
    user_id: i64,
    course_id: i64,
  ) -> BoxFuture<'static, Result<UserDisplay>>;
}

/// Looks profiles up through the site's result cache.
pub struct RemoteProfiles;

impl ProfileResolver for RemoteProfiles {
  fn resolve(
    &self,
    site: Arc<SiteContext>,
    user_id: i64,
    course_id: i64,
  ) -> BoxFuture<'static, Result<UserDisplay>> {
    async move {
      let query = NotesQuery::UserProfile { user_id, course_id };
      let remote = Arc::clone(site.remote());
      let params = query.params();

      let result = site
        .cache()
        .read(&query.cache_key(), ReadOptions::default(), move || async move {
          remote
            .call(GET_USER_PROFILES, params, CallOptions::read())
            .await
        })
        .await
        .map_err(|e| CoreError::enrichment(format!("profile of user {}: {}", user_id, e)))?;

      let profiles: Vec<ApiUserProfile> = serde_json::from_value(result.data)
        .map_err(|e| CoreError::enrichment(format!("profile of user {}: {}", user_id, e)))?;
      let profile = profiles
        .into_iter()
        .next()
        .ok_or_else(|| CoreError::enrichment(format!("user {} not found", user_id)))?;

      Ok(UserDisplay {
        full_name: profile.fullname,
        avatar_url: profile.profileimageurl,
      })
    }
    .boxed()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::remote::fake::FakeRemote;
  use crate::site::{SiteId, SiteRegistry};
  use crate::storage::MemoryStore;
  use serde_json::json;

  fn site(remote: Arc<FakeRemote>) -> Arc<SiteContext> {
    SiteRegistry::new(Arc::new(MemoryStore::new())).register(SiteId::new("school"), remote)
  }

  #[tokio::test]
  async fn test_resolves_and_caches_profile() {
    let remote = Arc::new(FakeRemote::new());
    remote.respond(
      GET_USER_PROFILES,
      json!([{"id": 5, "fullname": "Ada Lovelace", "profileimageurl": "https://lms/u/5.png"}]),
    );
    let site = site(remote.clone());

    let first = RemoteProfiles.resolve(Arc::clone(&site), 5, 10).await.unwrap();
    let second = RemoteProfiles.resolve(Arc::clone(&site), 5, 10).await.unwrap();

    assert_eq!(first.full_name, "Ada Lovelace");
    assert_eq!(first.avatar_url.as_deref(), Some("https://lms/u/5.png"));
    assert_eq!(first, second);
    assert_eq!(remote.calls_to(GET_USER_PROFILES), 1);
    assert_eq!(
      remote.last_params(GET_USER_PROFILES),
      Some(json!({"userlist": [{"userid": 5, "courseid": 10}]}))
    );
  }

  #[tokio::test]
  async fn test_unknown_user_is_enrichment_error() {
    let remote = Arc::new(FakeRemote::new());
    remote.respond(GET_USER_PROFILES, json!([]));
    let site = site(remote);

    let err = RemoteProfiles.resolve(site, 99, 10).await.unwrap_err();
    assert!(matches!(err, CoreError::Enrichment { .. }));
  }
}
