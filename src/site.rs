//! Site scoping: identifiers, per-site containers and the registry that owns them.

use futures::future::{BoxFuture, Shared};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use tracing::{info, warn};

use crate::cache::{CacheKey, CacheResult, ReadOptions, ResultCache};
use crate::error::{CoreError, Result};
use crate::queue::PendingQueue;
use crate::remote::{CallOptions, RemoteCall};
use crate::storage::LocalStore;
use crate::sync::{SyncResult, SyncState};

/// Web-service function that describes the site and the current user.
pub const SITE_INFO_FUNCTION: &str = "core_webservice_get_site_info";

/// Opaque identifier of one backend account/session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SiteId(String);

impl SiteId {
  pub fn new(id: impl Into<String>) -> Self {
    Self(id.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for SiteId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// What the site told us about itself at login.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SiteInfo {
  pub site_name: String,
  pub user_id: i64,
  /// Web-service functions the token may call
  pub functions: BTreeSet<String>,
  /// Advanced features switched off by the site admin
  pub disabled_features: BTreeSet<String>,
}

impl SiteInfo {
  /// Parse a `core_webservice_get_site_info` response.
  pub fn from_response(value: &Value) -> Result<Self> {
    let site_name = value
      .get("sitename")
      .and_then(Value::as_str)
      .unwrap_or_default()
      .to_string();
    let user_id = value
      .get("userid")
      .and_then(Value::as_i64)
      .ok_or_else(|| CoreError::decode("site info without userid"))?;

    let functions = value
      .get("functions")
      .and_then(Value::as_array)
      .map(|functions| {
        functions
          .iter()
          .filter_map(|f| f.get("name").and_then(Value::as_str))
          .map(String::from)
          .collect()
      })
      .unwrap_or_default();

    // Features are reported as {name, value}; value 0 means disabled
    let disabled_features = value
      .get("advancedfeatures")
      .and_then(Value::as_array)
      .map(|features| {
        features
          .iter()
          .filter(|f| f.get("value").and_then(Value::as_i64) == Some(0))
          .filter_map(|f| f.get("name").and_then(Value::as_str))
          .map(String::from)
          .collect()
      })
      .unwrap_or_default();

    Ok(Self {
      site_name,
      user_id,
      functions,
      disabled_features,
    })
  }

  pub fn ws_available(&self, function: &str) -> bool {
    self.functions.contains(function)
  }

  pub fn can_use_feature(&self, feature: &str) -> bool {
    !self.disabled_features.contains(feature)
  }
}

/// Boolean answers of capability probes, keyed by probe name.
///
/// Only cleared on logout.
#[derive(Default)]
pub struct CapabilityCache {
  answers: Mutex<HashMap<String, bool>>,
}

impl CapabilityCache {
  pub fn get(&self, probe: &str) -> Option<bool> {
    self
      .answers
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .get(probe)
      .copied()
  }

  pub fn insert(&self, probe: impl Into<String>, enabled: bool) {
    self
      .answers
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(probe.into(), enabled);
  }

  pub fn clear(&self) {
    self
      .answers
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .clear();
  }
}

pub(crate) type SharedDrain = Shared<BoxFuture<'static, SyncResult>>;

/// Everything owned by one site: its remote endpoint, cache, queue and sync slot.
pub struct SiteContext {
  id: SiteId,
  info: RwLock<Option<SiteInfo>>,
  remote: Arc<dyn RemoteCall>,
  cache: ResultCache,
  queue: PendingQueue,
  capabilities: CapabilityCache,
  /// Serializes online writes with queue replay for this site. A drain holds
  /// it for its whole run, so an online write waits until the drain ends.
  write_lock: tokio::sync::Mutex<()>,
  /// The in-flight drain, if any
  drain: tokio::sync::Mutex<Option<SharedDrain>>,
  sync_state: AtomicU8,
}

impl SiteContext {
  pub fn new(
    id: SiteId,
    remote: Arc<dyn RemoteCall>,
    cache: ResultCache,
    queue: PendingQueue,
  ) -> Self {
    Self {
      id,
      info: RwLock::new(None),
      remote,
      cache,
      queue,
      capabilities: CapabilityCache::default(),
      write_lock: tokio::sync::Mutex::new(()),
      drain: tokio::sync::Mutex::new(None),
      sync_state: AtomicU8::new(SyncState::Idle as u8),
    }
  }

  pub fn id(&self) -> &SiteId {
    &self.id
  }

  pub fn remote(&self) -> &Arc<dyn RemoteCall> {
    &self.remote
  }

  pub fn cache(&self) -> &ResultCache {
    &self.cache
  }

  pub fn queue(&self) -> &PendingQueue {
    &self.queue
  }

  pub fn capabilities(&self) -> &CapabilityCache {
    &self.capabilities
  }

  /// Site information, if it has been loaded.
  pub fn info(&self) -> Option<SiteInfo> {
    self
      .info
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .clone()
  }

  pub fn set_info(&self, info: SiteInfo) {
    *self.info.write().unwrap_or_else(PoisonError::into_inner) = Some(info);
  }

  /// True when the site info is loaded and lists `function`.
  pub fn ws_available(&self, function: &str) -> bool {
    self.info().is_some_and(|info| info.ws_available(function))
  }

  /// True unless the site info marks `feature` disabled.
  pub fn can_use_feature(&self, feature: &str) -> bool {
    self.info().map_or(true, |info| info.can_use_feature(feature))
  }

  /// Load site info through the cache, falling back to the stored copy offline.
  pub async fn refresh_info(&self) -> Result<CacheResult<SiteInfo>> {
    let key = site_info_key();
    let remote = Arc::clone(&self.remote);
    let result = self
      .cache
      .read(&key, ReadOptions::default(), move || async move {
        remote
          .call(SITE_INFO_FUNCTION, json!({}), CallOptions::read())
          .await
      })
      .await?
      .try_map(|value| SiteInfo::from_response(&value))?;

    self.set_info(result.data.clone());
    Ok(result)
  }

  pub fn sync_state(&self) -> SyncState {
    SyncState::from(self.sync_state.load(Ordering::SeqCst))
  }

  pub(crate) fn set_sync_state(&self, state: SyncState) {
    self.sync_state.store(state as u8, Ordering::SeqCst);
  }

  /// Held by a queue drain for its full run and by online writes.
  /// Offline writes only enqueue and never take it.
  pub(crate) fn write_lock(&self) -> &tokio::sync::Mutex<()> {
    &self.write_lock
  }

  pub(crate) fn drain_slot(&self) -> &tokio::sync::Mutex<Option<SharedDrain>> {
    &self.drain
  }
}

fn site_info_key() -> CacheKey {
  CacheKey::derive(SITE_INFO_FUNCTION, &json!({})).with_description("site info")
}

/// Owns every registered site. Passed explicitly; there is no global lookup.
pub struct SiteRegistry {
  store: Arc<dyn LocalStore>,
  cache_max_age: Option<chrono::Duration>,
  sites: RwLock<HashMap<SiteId, Arc<SiteContext>>>,
}

impl SiteRegistry {
  pub fn new(store: Arc<dyn LocalStore>) -> Self {
    Self {
      store,
      cache_max_age: None,
      sites: RwLock::new(HashMap::new()),
    }
  }

  /// Apply `max_age` to the caches of sites registered afterwards.
  pub fn with_cache_max_age(mut self, max_age: chrono::Duration) -> Self {
    self.cache_max_age = Some(max_age);
    self
  }

  /// Register (or replace) a site and build its containers.
  pub fn register(&self, id: SiteId, remote: Arc<dyn RemoteCall>) -> Arc<SiteContext> {
    let mut cache = ResultCache::new(id.clone(), Arc::clone(&self.store));
    if let Some(max_age) = self.cache_max_age {
      cache = cache.with_max_age(max_age);
    }
    let queue = PendingQueue::new(id.clone(), Arc::clone(&self.store));
    let site = Arc::new(SiteContext::new(id.clone(), remote, cache, queue));

    info!(site = %id, "site registered");
    self
      .sites
      .write()
      .unwrap_or_else(PoisonError::into_inner)
      .insert(id, Arc::clone(&site));
    site
  }

  pub fn get(&self, id: &SiteId) -> Result<Arc<SiteContext>> {
    self
      .sites
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .get(id)
      .cloned()
      .ok_or_else(|| CoreError::UnknownSite(id.to_string()))
  }

  /// All registered sites, ordered by id.
  pub fn sites(&self) -> Vec<Arc<SiteContext>> {
    let mut sites: Vec<_> = self
      .sites
      .read()
      .unwrap_or_else(PoisonError::into_inner)
      .values()
      .cloned()
      .collect();
    sites.sort_by(|a, b| a.id().cmp(b.id()));
    sites
  }

  /// Account boundary: mark the whole cache stale and forget capability answers.
  ///
  /// Queued operations are kept so nothing the user wrote is lost.
  pub fn logout(&self, id: &SiteId) -> Result<()> {
    let site = self.get(id)?;
    site.cache().invalidate_all()?;
    site.capabilities().clear();

    let pending = site.queue().list(None)?.len();
    if pending > 0 {
      warn!(site = %id, pending, "logged out with operations still queued");
    }
    info!(site = %id, "logged out");
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::remote::fake::FakeRemote;
  use crate::storage::MemoryStore;
  use serde_json::json;

  fn site_info_response() -> Value {
    json!({
      "sitename": "School",
      "userid": 7,
      "functions": [
        {"name": "core_notes_create_notes", "version": "2017"},
        {"name": "core_notes_get_course_notes", "version": "2017"}
      ],
      "advancedfeatures": [
        {"name": "enablenotes", "value": 1},
        {"name": "enablebadges", "value": 0}
      ]
    })
  }

  #[test]
  fn test_site_info_parsing() {
    let info = SiteInfo::from_response(&site_info_response()).unwrap();
    assert_eq!(info.site_name, "School");
    assert_eq!(info.user_id, 7);
    assert!(info.ws_available("core_notes_create_notes"));
    assert!(!info.ws_available("core_user_get_users"));
    assert!(info.can_use_feature("enablenotes"));
    assert!(!info.can_use_feature("enablebadges"));
  }

  #[test]
  fn test_site_info_requires_user() {
    let err = SiteInfo::from_response(&json!({"sitename": "x"})).unwrap_err();
    assert!(matches!(err, CoreError::Decode { .. }));
  }

  #[test]
  fn test_unknown_site() {
    let registry = SiteRegistry::new(Arc::new(MemoryStore::new()));
    let err = registry.get(&SiteId::new("nope")).err().unwrap();
    assert_eq!(err, CoreError::UnknownSite("nope".to_string()));
  }

  #[tokio::test]
  async fn test_refresh_info_uses_emergency_cache_offline() {
    let registry = SiteRegistry::new(Arc::new(MemoryStore::new()));
    let remote = Arc::new(FakeRemote::new());
    remote.respond(SITE_INFO_FUNCTION, site_info_response());
    let site = registry.register(SiteId::new("school"), remote.clone());

    site.refresh_info().await.unwrap();
    site.cache().invalidate_all().unwrap();
    remote.set_online(false);

    let result = site.refresh_info().await.unwrap();
    assert!(result.source.is_degraded());
    assert_eq!(site.info().unwrap().user_id, 7);
  }

  #[tokio::test]
  async fn test_logout_invalidates_cache_and_capabilities() {
    let registry = SiteRegistry::new(Arc::new(MemoryStore::new()));
    let remote = Arc::new(FakeRemote::new());
    remote.respond(SITE_INFO_FUNCTION, site_info_response());
    let site = registry.register(SiteId::new("school"), remote);

    site.refresh_info().await.unwrap();
    site.capabilities().insert("add_note:10", true);
    site.queue().enqueue("note", json!({"text": "kept"})).unwrap();

    registry.logout(site.id()).unwrap();

    assert!(site.cache().entry(&site_info_key()).unwrap().unwrap().stale);
    assert_eq!(site.capabilities().get("add_note:10"), None);
    assert_eq!(site.queue().list(None).unwrap().len(), 1);
  }

  #[test]
  fn test_sites_are_listed_in_id_order() {
    let registry = SiteRegistry::new(Arc::new(MemoryStore::new()));
    registry.register(SiteId::new("b"), Arc::new(FakeRemote::new()));
    registry.register(SiteId::new("a"), Arc::new(FakeRemote::new()));

    let ids: Vec<_> = registry.sites().iter().map(|s| s.id().clone()).collect();
    assert_eq!(ids, vec![SiteId::new("a"), SiteId::new("b")]);
  }
}
