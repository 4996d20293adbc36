//! Core types for the caching system.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::site::SiteId;

/// One stored read result.
///
/// Invalidation only flips `stale`; the value is kept so an emergency read
/// can still serve it when the server is unreachable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
  pub key: String,
  pub site_id: SiteId,
  pub value: Value,
  pub fetched_at: DateTime<Utc>,
  pub stale: bool,
}

impl CacheEntry {
  /// A freshly fetched, live entry.
  pub fn fresh(key: impl Into<String>, site_id: SiteId, value: Value) -> Self {
    Self {
      key: key.into(),
      site_id,
      value,
      fetched_at: Utc::now(),
      stale: false,
    }
  }
}

/// Per-read switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadOptions {
  /// Skip live entries and always call the fetcher.
  pub ignore_cache: bool,
  /// Serve a stale value when the fetcher fails for a transport reason.
  pub allow_emergency_cache: bool,
}

impl Default for ReadOptions {
  fn default() -> Self {
    Self {
      ignore_cache: false,
      allow_emergency_cache: true,
    }
  }
}

impl ReadOptions {
  /// Force a network read with no stale fallback.
  pub fn refresh() -> Self {
    Self {
      ignore_cache: true,
      allow_emergency_cache: false,
    }
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from a live cache entry.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Stale data served because the fresh fetch failed.
  pub fn emergency(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Emergency,
      cached_at: Some(cached_at),
    }
  }

  /// Nothing cached and nothing fetched; only local records are available.
  pub fn offline(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: None,
    }
  }

  /// Convert the payload, keeping the source metadata.
  pub fn try_map<U>(self, f: impl FnOnce(T) -> Result<U>) -> Result<CacheResult<U>> {
    Ok(CacheResult {
      data: f(self.data)?,
      source: self.source,
      cached_at: self.cached_at,
    })
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Live cache entry, no network call made
  Cache,
  /// Network unavailable, serving a stale entry
  Emergency,
  /// Network unavailable and nothing cached
  Offline,
}

impl CacheSource {
  /// True when the data may be out of date with the server.
  pub fn is_degraded(self) -> bool {
    matches!(self, CacheSource::Emergency | CacheSource::Offline)
  }
}
