//! Error taxonomy shared by the cache, queue, sync and repository layers.
//!
//! The split that matters is between [`CoreError::Transport`] (the call never
//! completed, so it is worth retrying later) and [`CoreError::Server`] (the
//! server answered and rejected this specific operation, so retrying is
//! pointless). Storage failures are kept apart from both so that "no network"
//! is never confused with "cannot even record the attempt".

use thiserror::Error;

/// Result alias used across the library.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors produced by the offline data-access core.
///
/// The type is `Clone` so that one in-flight fetch or drain can hand the same
/// outcome to every caller that joined it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
  /// The remote call could not reach or complete against the server.
  #[error("transport error: {message}")]
  Transport { message: String },

  /// The server completed the call and rejected the operation.
  #[error("{message}")]
  Server {
    message: String,
    /// Machine-readable error code, when the server sent one.
    code: Option<String>,
  },

  /// Local durable storage is unavailable or failed.
  #[error("storage error: {message}")]
  Storage { message: String },

  /// Auxiliary display data (profiles, avatars) could not be loaded.
  #[error("could not load display data: {message}")]
  Enrichment { message: String },

  /// A cached or remote payload did not have the expected shape.
  #[error("malformed payload: {message}")]
  Decode { message: String },

  /// The site is not registered.
  #[error("unknown site: {0}")]
  UnknownSite(String),

  /// A collaborator could not be constructed from its settings.
  #[error("invalid configuration: {0}")]
  Config(String),
}

impl CoreError {
  pub fn transport(message: impl Into<String>) -> Self {
    Self::Transport {
      message: message.into(),
    }
  }

  pub fn server(message: impl Into<String>) -> Self {
    Self::Server {
      message: message.into(),
      code: None,
    }
  }

  pub fn storage(message: impl Into<String>) -> Self {
    Self::Storage {
      message: message.into(),
    }
  }

  pub fn decode(message: impl Into<String>) -> Self {
    Self::Decode {
      message: message.into(),
    }
  }

  pub fn enrichment(message: impl Into<String>) -> Self {
    Self::Enrichment {
      message: message.into(),
    }
  }

  /// True when the failure happened before the server could answer.
  pub fn is_transport(&self) -> bool {
    matches!(self, Self::Transport { .. })
  }

  /// True when the server answered and rejected the operation.
  pub fn is_server_rejection(&self) -> bool {
    matches!(self, Self::Server { .. })
  }
}

impl From<rusqlite::Error> for CoreError {
  fn from(err: rusqlite::Error) -> Self {
    Self::storage(err.to_string())
  }
}

impl From<serde_json::Error> for CoreError {
  fn from(err: serde_json::Error) -> Self {
    Self::decode(err.to_string())
  }
}
