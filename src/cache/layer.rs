//! Cache layer that orchestrates caching logic with network fetching.

use chrono::{Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, MutexGuard, PoisonError};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::key::CacheKey;
use super::traits::{CacheEntry, CacheResult, ReadOptions};
use crate::error::{CoreError, Result};
use crate::site::SiteId;
use crate::storage::LocalStore;

const NAMESPACE: &str = "cache";

type SharedFetch = Shared<BoxFuture<'static, Result<CacheEntry>>>;

#[derive(Clone)]
struct InflightFetch {
  /// Invalidation clock when the fetch started
  started: u64,
  fetch: SharedFetch,
}

/// Logical clock of invalidations. A fetch remembers the clock when it
/// starts; if its key was invalidated since, its entry is stored stale.
#[derive(Default)]
struct Invalidations {
  clock: u64,
  all: u64,
  keys: HashMap<String, u64>,
}

impl Invalidations {
  fn tick(&mut self) -> u64 {
    self.clock += 1;
    self.clock
  }

  fn invalidated_since(&self, key: &str, since: u64) -> bool {
    self.all > since || self.keys.get(key).is_some_and(|at| *at > since)
  }
}

/// Per-site cache of remote read results.
///
/// At most one entry exists per key. Concurrent misses on the same key share
/// a single fetch, and an entry is replaced in one storage write so readers
/// never observe a partial update.
pub struct ResultCache {
  site_id: SiteId,
  store: Arc<dyn LocalStore>,
  /// Age after which a live entry is refetched
  max_age: Option<Duration>,
  inflight: Arc<Mutex<HashMap<String, InflightFetch>>>,
  /// Also held while a finished fetch stores its entry
  invalidations: Arc<std::sync::Mutex<Invalidations>>,
}

impl ResultCache {
  /// Create a cache for `site_id` on top of `store`.
  pub fn new(site_id: SiteId, store: Arc<dyn LocalStore>) -> Self {
    Self {
      site_id,
      store,
      max_age: None,
      inflight: Arc::new(Mutex::new(HashMap::new())),
      invalidations: Arc::new(std::sync::Mutex::new(Invalidations::default())),
    }
  }

  /// Treat entries older than `max_age` as needing a refetch.
  pub fn with_max_age(mut self, max_age: Duration) -> Self {
    self.max_age = Some(max_age);
    self
  }

  /// Look up the stored entry for `key`, live or stale.
  pub fn entry(&self, key: &CacheKey) -> Result<Option<CacheEntry>> {
    load_entry(self.store.as_ref(), &self.site_id, key.as_str())
  }

  fn marks(&self) -> MutexGuard<'_, Invalidations> {
    lock_marks(&self.invalidations)
  }

  fn is_live(&self, entry: &CacheEntry) -> bool {
    if entry.stale {
      return false;
    }
    match self.max_age {
      Some(max_age) => Utc::now() - entry.fetched_at <= max_age,
      None => true,
    }
  }

  /// Read `key`, calling `fetcher` only when no live entry can answer.
  ///
  /// 1. Live entry and cache allowed: return it, no fetch
  /// 2. Otherwise fetch (joining an in-flight fetch for the same key)
  /// 3. On a transport failure with emergency mode on, serve the stored entry
  pub async fn read<F, Fut>(
    &self,
    key: &CacheKey,
    options: ReadOptions,
    fetcher: F,
  ) -> Result<CacheResult<Value>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Value>> + Send + 'static,
  {
    let cached = self.entry(key)?;

    if let Some(entry) = &cached {
      if !options.ignore_cache && self.is_live(entry) {
        debug!(site = %self.site_id, key = %key, "cache hit");
        return Ok(CacheResult::from_cache(entry.value.clone(), entry.fetched_at));
      }
    }

    debug!(site = %self.site_id, key = %key, "cache miss, fetching");
    match self.fetch_shared(key, fetcher).await {
      Ok(entry) => Ok(CacheResult::from_network(entry.value)),
      Err(err) if err.is_transport() && options.allow_emergency_cache => match cached {
        Some(entry) => {
          warn!(site = %self.site_id, key = %key, error = %err, "serving emergency cache");
          Ok(CacheResult::emergency(entry.value, entry.fetched_at))
        }
        None => Err(err),
      },
      Err(err) => Err(err),
    }
  }

  async fn fetch_shared<F, Fut>(&self, key: &CacheKey, fetcher: F) -> Result<CacheEntry>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Value>> + Send + 'static,
  {
    let fetch = {
      let mut inflight = self.inflight.lock().await;
      let joinable = inflight
        .get(key.as_str())
        .filter(|existing| !self.marks().invalidated_since(key.as_str(), existing.started))
        .cloned();
      match joinable {
        Some(existing) => {
          debug!(site = %self.site_id, key = %key, "joining in-flight fetch");
          existing.fetch
        }
        None => {
          let hash = key.as_str().to_string();
          let store = Arc::clone(&self.store);
          let site_id = self.site_id.clone();
          let registry = Arc::clone(&self.inflight);
          let invalidations = Arc::clone(&self.invalidations);
          let started = self.marks().clock;
          let request = fetcher();

          let fetch = async move {
            let outcome = match request.await {
              Ok(value) => {
                let entry = CacheEntry::fresh(hash.clone(), site_id, value);
                settle_fetch(store.as_ref(), &invalidations, started, entry)
              }
              Err(err) => Err(err),
            };
            let mut inflight = registry.lock().await;
            if inflight.get(&hash).is_some_and(|f| f.started == started) {
              inflight.remove(&hash);
            }
            outcome
          }
          .boxed()
          .shared();

          inflight.insert(
            key.as_str().to_string(),
            InflightFetch {
              started,
              fetch: fetch.clone(),
            },
          );
          fetch
        }
      }
    };

    fetch.await
  }

  /// Mark the entry for `key` stale. Idempotent; the value is kept.
  ///
  /// A fetch for `key` still in flight will store its result stale too.
  pub fn invalidate(&self, key: &CacheKey) -> Result<()> {
    let mut marks = self.marks();
    let at = marks.tick();
    marks.keys.insert(key.as_str().to_string(), at);

    if let Some(mut entry) = self.entry(key)? {
      if !entry.stale {
        entry.stale = true;
        store_entry(self.store.as_ref(), &entry)?;
      }
      debug!(site = %self.site_id, key = %key, "invalidated");
    }
    Ok(())
  }

  /// Mark every entry of this site stale.
  pub fn invalidate_all(&self) -> Result<()> {
    let mut marks = self.marks();
    marks.all = marks.tick();

    let entries = self.store.entries(&self.site_id, NAMESPACE)?;
    let mut count = 0usize;

    for (key, data) in entries {
      match serde_json::from_slice::<CacheEntry>(&data) {
        Ok(mut entry) if !entry.stale => {
          entry.stale = true;
          store_entry(self.store.as_ref(), &entry)?;
          count += 1;
        }
        Ok(_) => {}
        Err(e) => {
          // Unreadable entries cannot serve as emergency values either
          warn!(site = %self.site_id, key = %key, error = %e, "dropping corrupt cache entry");
          self.store.delete(&self.site_id, NAMESPACE, &key)?;
        }
      }
    }

    debug!(site = %self.site_id, count, "invalidated all entries");
    Ok(())
  }
}

/// Store the result of a fetch that started at `started`.
///
/// If the key was invalidated since, the entry is stored stale, or not at all
/// when a later fetch already stored a live one.
fn settle_fetch(
  store: &dyn LocalStore,
  invalidations: &std::sync::Mutex<Invalidations>,
  started: u64,
  mut entry: CacheEntry,
) -> Result<CacheEntry> {
  let marks = lock_marks(invalidations);
  if marks.invalidated_since(&entry.key, started) {
    entry.stale = true;
    if matches!(load_entry(store, &entry.site_id, &entry.key), Ok(Some(current)) if !current.stale) {
      debug!(key = %entry.key, "newer entry stored while fetching, keeping it");
      return Ok(entry);
    }
    debug!(key = %entry.key, "invalidated while fetching, storing stale");
  }
  store_entry(store, &entry)?;
  Ok(entry)
}

fn lock_marks(invalidations: &std::sync::Mutex<Invalidations>) -> MutexGuard<'_, Invalidations> {
  invalidations.lock().unwrap_or_else(PoisonError::into_inner)
}

fn load_entry(store: &dyn LocalStore, site_id: &SiteId, key: &str) -> Result<Option<CacheEntry>> {
  match store.get(site_id, NAMESPACE, key)? {
    Some(data) => serde_json::from_slice(&data)
      .map(Some)
      .map_err(|e| CoreError::decode(format!("cache entry {}: {}", key, e))),
    None => Ok(None),
  }
}

fn store_entry(store: &dyn LocalStore, entry: &CacheEntry) -> Result<()> {
  let data = serde_json::to_vec(entry)?;
  store.set(&entry.site_id, NAMESPACE, &entry.key, &data)
}
