//! Remote call collaborator.
//!
//! The core only needs to know whether a call failed before the server
//! answered ([`CoreError::Transport`]) or the server answered with a
//! rejection ([`CoreError::Server`]); the wire protocol stays behind
//! [`RemoteCall`].
//!
//! [`CoreError::Transport`]: crate::error::CoreError::Transport
//! [`CoreError::Server`]: crate::error::CoreError::Server

#[cfg(test)]
pub(crate) mod fake;
mod http;

pub use http::HttpRemote;

use futures::future::BoxFuture;
use serde_json::Value;
use std::time::Duration;

use crate::error::Result;

/// Whether a call only reads server state or changes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
  Read,
  Write,
}

/// Per-call settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallOptions {
  pub kind: CallKind,
  /// Overrides the transport's default timeout
  pub timeout: Option<Duration>,
}

impl CallOptions {
  pub fn read() -> Self {
    Self {
      kind: CallKind::Read,
      timeout: None,
    }
  }

  pub fn write() -> Self {
    Self {
      kind: CallKind::Write,
      timeout: None,
    }
  }

  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = Some(timeout);
    self
  }
}

/// Issues one named operation against the site's backend.
pub trait RemoteCall: Send + Sync {
  fn call<'a>(
    &'a self,
    function: &'a str,
    params: Value,
    options: CallOptions,
  ) -> BoxFuture<'a, Result<Value>>;
}
