use futures::future::{join_all, BoxFuture, FutureExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::types::{FailedOperation, RetryPolicy, SyncEvent, SyncResult, SyncState};
use crate::cache::CacheKey;
use crate::connectivity::{Connectivity, NetworkStatus};
use crate::error::{CoreError, Result};
use crate::queue::{OperationId, PendingOperation};
use crate::site::{SiteContext, SiteId, SiteRegistry};

const EVENT_CAPACITY: usize = 32;

/// Replays queued operations of one entity kind.
pub trait ReplayHandler: Send + Sync {
  /// Entity kind this handler owns, matching `PendingOperation::entity_kind`.
  fn entity_kind(&self) -> &'static str;

  /// Send the operation to the server.
  ///
  /// On success returns the cache keys the write made stale.
  fn replay(
    &self,
    site: Arc<SiteContext>,
    operation: PendingOperation,
  ) -> BoxFuture<'static, Result<Vec<CacheKey>>>;
}

/// How one replay ended, from the queue's point of view.
enum Outcome {
  Confirmed(Vec<CacheKey>),
  Rejected(CoreError),
  Retry(CoreError),
}

fn classify(result: Result<Vec<CacheKey>>) -> Outcome {
  match result {
    Ok(keys) => Outcome::Confirmed(keys),
    // A payload that cannot be decoded will never succeed either
    Err(err @ (CoreError::Server { .. } | CoreError::Decode { .. })) => Outcome::Rejected(err),
    Err(err) => Outcome::Retry(err),
  }
}

/// Drains pending-operation queues and reports the outcome.
pub struct SyncCoordinator {
  handlers: HashMap<&'static str, Arc<dyn ReplayHandler>>,
  policy: RetryPolicy,
  events: broadcast::Sender<SyncEvent>,
}

impl SyncCoordinator {
  pub fn new(policy: RetryPolicy) -> Self {
    let (events, _rx) = broadcast::channel(EVENT_CAPACITY);
    Self {
      handlers: HashMap::new(),
      policy,
      events,
    }
  }

  /// Register the replay handler for its entity kind.
  pub fn with_handler(mut self, handler: Arc<dyn ReplayHandler>) -> Self {
    self.handlers.insert(handler.entity_kind(), handler);
    self
  }

  /// Receive a [`SyncEvent`] for every completed run.
  pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
    self.events.subscribe()
  }

  /// Drain `site`'s queue, or join the drain already running for it.
  ///
  /// Never fails: every problem is reported inside the [`SyncResult`].
  pub async fn sync(self: &Arc<Self>, site: &Arc<SiteContext>) -> SyncResult {
    self.run(site, false).await
  }

  /// Drain every registered site concurrently.
  pub async fn sync_all(self: &Arc<Self>, registry: &SiteRegistry) -> Vec<(SiteId, SyncResult)> {
    self.run_all(registry, false).await
  }

  async fn run_all(
    self: &Arc<Self>,
    registry: &SiteRegistry,
    automatic: bool,
  ) -> Vec<(SiteId, SyncResult)> {
    let sites = registry.sites();
    let runs = sites.iter().map(|site| async move {
      let result = self.run(site, automatic).await;
      (site.id().clone(), result)
    });
    join_all(runs).await
  }

  async fn run(self: &Arc<Self>, site: &Arc<SiteContext>, automatic: bool) -> SyncResult {
    let run = {
      let mut slot = site.drain_slot().lock().await;
      match slot.as_ref() {
        Some(running) => {
          debug!(site = %site.id(), "joining in-flight drain");
          running.clone()
        }
        None => {
          let coordinator = Arc::clone(self);
          let site = Arc::clone(site);
          let run = async move {
            let result = coordinator.drain(&site).await;
            site.drain_slot().lock().await.take();
            coordinator.report(&site, automatic, &result);
            result
          }
          .boxed()
          .shared();
          *slot = Some(run.clone());
          run
        }
      }
    };

    run.await
  }

  async fn drain(&self, site: &Arc<SiteContext>) -> SyncResult {
    site.set_sync_state(SyncState::Draining);
    let result = self.replay_queue(site).await;
    site.set_sync_state(SyncState::Reporting);
    result
  }

  fn report(&self, site: &SiteContext, automatic: bool, result: &SyncResult) {
    info!(
      site = %site.id(),
      succeeded = result.succeeded.len(),
      failed = result.failed.len(),
      interrupted = result.interrupted.is_some(),
      "sync finished"
    );
    // No subscribers is fine
    let _ = self.events.send(SyncEvent {
      site_id: site.id().clone(),
      automatic,
      result: result.clone(),
    });
    site.set_sync_state(SyncState::Idle);
  }

  async fn replay_queue(&self, site: &Arc<SiteContext>) -> SyncResult {
    let mut result = SyncResult::default();

    // Writers classify under the same lock, so no operation is judged twice
    let _guard = site.write_lock().lock().await;

    let operations = match site.queue().list(None) {
      Ok(operations) => operations,
      Err(err) => {
        warn!(site = %site.id(), error = %err, "cannot read pending operations");
        result.interrupted = Some(err.to_string());
        return result;
      }
    };

    if operations.is_empty() {
      debug!(site = %site.id(), "nothing to sync");
      return result;
    }
    info!(site = %site.id(), pending = operations.len(), "draining queue");

    for operation in operations {
      let Some(handler) = self.handlers.get(operation.entity_kind.as_str()) else {
        warn!(site = %site.id(), kind = %operation.entity_kind, "no replay handler");
        result.warnings.push(format!(
          "No sync handler for {} operation {}",
          operation.entity_kind, operation.id
        ));
        continue;
      };

      let id = operation.id;
      let outcome = classify(handler.replay(Arc::clone(site), operation).await);

      match outcome {
        Outcome::Confirmed(keys) => {
          if let Err(err) = site.queue().remove(id) {
            result.interrupted = Some(err.to_string());
            break;
          }
          for key in keys {
            if let Err(err) = site.cache().invalidate(&key) {
              warn!(site = %site.id(), key = %key, error = %err, "invalidation failed");
              result.warnings.push(err.to_string());
            }
          }
          debug!(site = %site.id(), id = %id, "operation confirmed");
          result.succeeded.push(id);
        }
        Outcome::Rejected(err) => {
          warn!(site = %site.id(), id = %id, error = %err, "operation rejected, dropping");
          if let Err(storage) = site.queue().remove(id) {
            result.interrupted = Some(storage.to_string());
            break;
          }
          result.warnings.push(err.to_string());
          result.failed.push(FailedOperation {
            operation_id: id,
            reason: err.to_string(),
          });
        }
        Outcome::Retry(err) => {
          warn!(site = %site.id(), id = %id, error = %err, "replay failed, stopping drain");
          if err.is_transport() {
            self.record_attempt(site, id, &err, &mut result);
          }
          result.interrupted = Some(err.to_string());
          break;
        }
      }
    }

    result
  }

  fn record_attempt(
    &self,
    site: &SiteContext,
    id: OperationId,
    err: &CoreError,
    result: &mut SyncResult,
  ) {
    let attempts = match site.queue().increment_attempts(id) {
      Ok(Some(attempts)) => attempts,
      Ok(None) => return,
      Err(storage) => {
        result.warnings.push(storage.to_string());
        return;
      }
    };

    if self.policy.exhausted(attempts) {
      let reason = format!("gave up after {} attempts: {}", attempts, err);
      warn!(site = %site.id(), id = %id, attempts, "retry limit reached, dropping");
      match site.queue().remove(id) {
        Ok(()) => {
          result.warnings.push(reason.clone());
          result.failed.push(FailedOperation {
            operation_id: id,
            reason,
          });
        }
        Err(storage) => result.warnings.push(storage.to_string()),
      }
    }
  }

  /// Drain every site whenever connectivity comes back, and on each
  /// `interval` tick while online.
  pub fn spawn_auto_sync(
    self: &Arc<Self>,
    registry: Arc<SiteRegistry>,
    connectivity: Connectivity,
    interval: Duration,
  ) -> JoinHandle<()> {
    let coordinator = Arc::clone(self);
    let mut status = connectivity.subscribe();

    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

      loop {
        tokio::select! {
          _ = ticker.tick() => {
            if !connectivity.is_online() {
              continue;
            }
          }
          changed = status.changed() => {
            if changed.is_err() {
              break;
            }
            if *status.borrow_and_update() != NetworkStatus::Online {
              continue;
            }
            info!("connectivity restored, syncing all sites");
          }
        }

        coordinator.run_all(&registry, true).await;
      }
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::remote::fake::FakeRemote;
  use crate::remote::CallOptions;
  use crate::storage::MemoryStore;
  use serde_json::json;

  const ECHO: &str = "test_echo";

  /// Replays `{ "value": .. }` payloads through the `test_echo` function.
  struct EchoHandler;

  impl ReplayHandler for EchoHandler {
    fn entity_kind(&self) -> &'static str {
      "echo"
    }

    fn replay(
      &self,
      site: Arc<SiteContext>,
      operation: PendingOperation,
    ) -> BoxFuture<'static, Result<Vec<CacheKey>>> {
      async move {
        site
          .remote()
          .call(ECHO, operation.payload, CallOptions::write())
          .await?;
        Ok(vec![CacheKey::derive("echo_list", &json!({}))])
      }
      .boxed()
    }
  }

  fn setup(policy: RetryPolicy) -> (Arc<SyncCoordinator>, Arc<SiteContext>, Arc<FakeRemote>) {
    let registry = SiteRegistry::new(Arc::new(MemoryStore::new()));
    let remote = Arc::new(FakeRemote::new());
    remote.respond(ECHO, json!({"ok": true}));
    let site = registry.register(SiteId::new("school"), remote.clone());
    let coordinator = Arc::new(SyncCoordinator::new(policy).with_handler(Arc::new(EchoHandler)));
    (coordinator, site, remote)
  }

  #[tokio::test]
  async fn test_empty_queue_yields_empty_result() {
    let (coordinator, site, _remote) = setup(RetryPolicy::default());
    let result = coordinator.sync(&site).await;
    assert_eq!(result, SyncResult::default());
    assert_eq!(site.sync_state(), SyncState::Idle);
  }

  #[tokio::test]
  async fn test_success_removes_and_invalidates() {
    let (coordinator, site, _remote) = setup(RetryPolicy::default());
    let list_key = CacheKey::derive("echo_list", &json!({}));
    site
      .cache()
      .read(&list_key, Default::default(), || async { Ok(json!([])) })
      .await
      .unwrap();

    let id = site.queue().enqueue("echo", json!({"value": 1})).unwrap();
    let result = coordinator.sync(&site).await;

    assert_eq!(result.succeeded, vec![id]);
    assert!(result.failed.is_empty());
    assert!(site.queue().is_empty().unwrap());
    assert!(site.cache().entry(&list_key).unwrap().unwrap().stale);
  }

  #[tokio::test]
  async fn test_rejection_drops_and_continues() {
    let (coordinator, site, remote) = setup(RetryPolicy::default());
    remote.push(ECHO, Err(CoreError::server("invalid userid")));

    let rejected = site.queue().enqueue("echo", json!({"value": 1})).unwrap();
    let accepted = site.queue().enqueue("echo", json!({"value": 2})).unwrap();

    let result = coordinator.sync(&site).await;

    assert_eq!(result.succeeded, vec![accepted]);
    assert_eq!(
      result.failed,
      vec![FailedOperation {
        operation_id: rejected,
        reason: "invalid userid".to_string(),
      }]
    );
    assert_eq!(result.warnings, vec!["invalid userid".to_string()]);
    assert!(site.queue().is_empty().unwrap());
  }

  #[tokio::test]
  async fn test_transport_failure_halts_drain() {
    let (coordinator, site, remote) = setup(RetryPolicy::default());
    let first = site.queue().enqueue("echo", json!({"value": 1})).unwrap();
    remote.push(ECHO, Ok(json!({"ok": true})));
    remote.push(ECHO, Err(CoreError::transport("connection reset")));
    let second = site.queue().enqueue("echo", json!({"value": 2})).unwrap();
    let third = site.queue().enqueue("echo", json!({"value": 3})).unwrap();

    let result = coordinator.sync(&site).await;

    assert_eq!(result.succeeded, vec![first]);
    assert!(result.failed.is_empty());
    assert!(result.interrupted.is_some());

    let remaining: Vec<_> = site.queue().list(None).unwrap();
    assert_eq!(remaining.iter().map(|op| op.id).collect::<Vec<_>>(), vec![second, third]);
    assert_eq!(remaining[0].attempts, 1);
    assert_eq!(remaining[1].attempts, 0);
  }

  #[tokio::test]
  async fn test_retry_cap_drops_with_report() {
    let (coordinator, site, remote) = setup(RetryPolicy {
      max_attempts: Some(2),
    });
    remote.set_online(false);
    let id = site.queue().enqueue("echo", json!({"value": 1})).unwrap();

    let first = coordinator.sync(&site).await;
    assert!(first.failed.is_empty());

    let second = coordinator.sync(&site).await;
    assert_eq!(second.failed.len(), 1);
    assert_eq!(second.failed[0].operation_id, id);
    assert!(second.failed[0].reason.starts_with("gave up after 2 attempts"));
    assert!(site.queue().is_empty().unwrap());
  }

  #[tokio::test]
  async fn test_unknown_kind_stays_queued() {
    let (coordinator, site, _remote) = setup(RetryPolicy::default());
    site.queue().enqueue("rating", json!({})).unwrap();

    let result = coordinator.sync(&site).await;

    assert!(result.is_empty());
    assert_eq!(result.warnings.len(), 1);
    assert_eq!(site.queue().list(None).unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_concurrent_syncs_share_one_drain() {
    let (coordinator, site, remote) = setup(RetryPolicy::default());
    remote.set_delay(std::time::Duration::from_millis(50));
    let id = site.queue().enqueue("echo", json!({"value": 1})).unwrap();

    let (a, b) = tokio::join!(coordinator.sync(&site), coordinator.sync(&site));

    assert_eq!(a, b);
    assert_eq!(a.succeeded, vec![id]);
    assert_eq!(remote.calls_to(ECHO), 1);
  }

  #[tokio::test]
  async fn test_subscribers_receive_events() {
    let (coordinator, site, _remote) = setup(RetryPolicy::default());
    let mut events = coordinator.subscribe();
    let id = site.queue().enqueue("echo", json!({"value": 1})).unwrap();

    coordinator.sync(&site).await;

    let event = events.recv().await.unwrap();
    assert_eq!(event.site_id, SiteId::new("school"));
    assert!(!event.automatic);
    assert_eq!(event.result.succeeded, vec![id]);
  }

  #[tokio::test]
  async fn test_auto_sync_on_connectivity_restored() {
    let registry = Arc::new(SiteRegistry::new(Arc::new(MemoryStore::new())));
    let remote = Arc::new(FakeRemote::new());
    remote.respond(ECHO, json!({"ok": true}));
    let site = registry.register(SiteId::new("school"), remote.clone());
    let coordinator = Arc::new(
      SyncCoordinator::new(RetryPolicy::default()).with_handler(Arc::new(EchoHandler)),
    );

    let connectivity = Connectivity::new(NetworkStatus::Offline);
    let mut events = coordinator.subscribe();
    let id = site.queue().enqueue("echo", json!({"value": 1})).unwrap();

    let task = coordinator.spawn_auto_sync(
      Arc::clone(&registry),
      connectivity.clone(),
      Duration::from_secs(3600),
    );
    connectivity.set_status(NetworkStatus::Online);

    let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
      .await
      .unwrap()
      .unwrap();
    assert!(event.automatic);
    assert_eq!(event.result.succeeded, vec![id]);

    task.abort();
  }
}
