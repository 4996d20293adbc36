//! Connectivity signal.
//!
//! Whoever knows about the network (the CLI flag, an OS hook, a probe) sets
//! the status; the sync coordinator subscribes and drains on "online".

use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkStatus {
  Online,
  Offline,
}

/// Shared, observable network status.
#[derive(Clone)]
pub struct Connectivity {
  tx: Arc<watch::Sender<NetworkStatus>>,
}

impl Connectivity {
  pub fn new(initial: NetworkStatus) -> Self {
    let (tx, _rx) = watch::channel(initial);
    Self { tx: Arc::new(tx) }
  }

  pub fn status(&self) -> NetworkStatus {
    *self.tx.borrow()
  }

  pub fn is_online(&self) -> bool {
    self.status() == NetworkStatus::Online
  }

  /// Publish a new status. Subscribers are only woken on actual transitions.
  pub fn set_status(&self, status: NetworkStatus) {
    let changed = self.tx.send_if_modified(|current| {
      if *current == status {
        false
      } else {
        *current = status;
        true
      }
    });
    if changed {
      info!(?status, "connectivity changed");
    }
  }

  pub fn subscribe(&self) -> watch::Receiver<NetworkStatus> {
    self.tx.subscribe()
  }
}

impl Default for Connectivity {
  fn default() -> Self {
    Self::new(NetworkStatus::Online)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_subscribers_see_transitions() {
    let connectivity = Connectivity::new(NetworkStatus::Offline);
    let mut rx = connectivity.subscribe();
    assert!(!connectivity.is_online());

    connectivity.set_status(NetworkStatus::Online);
    rx.changed().await.unwrap();
    assert_eq!(*rx.borrow_and_update(), NetworkStatus::Online);
    assert!(connectivity.is_online());
  }

  #[test]
  fn test_repeated_status_is_not_a_transition() {
    let connectivity = Connectivity::new(NetworkStatus::Online);
    let rx = connectivity.subscribe();
    connectivity.set_status(NetworkStatus::Online);
    assert!(!rx.has_changed().unwrap());
  }
}
