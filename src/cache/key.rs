//! Cache key derivation.

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::fmt;

/// Stable key for one remote read: operation name plus normalized parameters.
///
/// The hash is SHA-256 over `operation:params`, so it stays the same across
/// process restarts and has a fixed length regardless of the parameters.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
  hash: String,
  description: String,
}

impl CacheKey {
  /// Derive the key for `operation` called with `params`.
  pub fn derive(operation: &str, params: &Value) -> Self {
    let input = format!("{}:{}", operation, normalize(params));

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let hash = hex::encode(hasher.finalize());

    Self {
      hash,
      description: input,
    }
  }

  /// Replace the log-friendly description. Does not affect the hash.
  pub fn with_description(mut self, description: impl Into<String>) -> Self {
    self.description = description.into();
    self
  }

  /// Hex digest used as the storage key.
  pub fn as_str(&self) -> &str {
    &self.hash
  }

  pub fn description(&self) -> &str {
    &self.description
  }
}

impl fmt::Display for CacheKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.description)
  }
}

/// A typed remote read that knows its own cache key.
pub trait QueryKey {
  /// Remote operation (web-service function) name.
  fn operation(&self) -> &'static str;

  /// Parameters sent with the operation.
  fn params(&self) -> Value;

  /// Human-readable description for logs.
  fn description(&self) -> String;

  fn cache_key(&self) -> CacheKey {
    CacheKey::derive(self.operation(), &self.params()).with_description(self.description())
  }
}

/// Normalize parameters for consistent hashing.
/// Object keys are sorted and string values trimmed.
fn normalize(value: &Value) -> String {
  normalize_value(value).to_string()
}

fn normalize_value(value: &Value) -> Value {
  match value {
    Value::String(s) => Value::String(s.trim().to_string()),
    Value::Array(items) => Value::Array(items.iter().map(normalize_value).collect()),
    Value::Object(map) => {
      let mut keys: Vec<&String> = map.keys().collect();
      keys.sort();
      let mut sorted = Map::new();
      for key in keys {
        sorted.insert(key.clone(), normalize_value(&map[key]));
      }
      Value::Object(sorted)
    }
    other => other.clone(),
  }
}
