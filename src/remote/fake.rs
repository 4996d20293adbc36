//! Scripted remote used by the unit tests.

use futures::future::{BoxFuture, FutureExt};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{CallOptions, RemoteCall};
use crate::error::{CoreError, Result};

/// Remote that answers from canned responses and can be switched offline.
pub struct FakeRemote {
  online: AtomicBool,
  delay: Mutex<Option<Duration>>,
  delays: Mutex<HashMap<String, Duration>>,
  defaults: Mutex<HashMap<String, Value>>,
  scripted: Mutex<HashMap<String, VecDeque<Result<Value>>>>,
  calls: Mutex<Vec<(String, Value)>>,
}

impl FakeRemote {
  pub fn new() -> Self {
    Self {
      online: AtomicBool::new(true),
      delay: Mutex::new(None),
      delays: Mutex::new(HashMap::new()),
      defaults: Mutex::new(HashMap::new()),
      scripted: Mutex::new(HashMap::new()),
      calls: Mutex::new(Vec::new()),
    }
  }

  pub fn set_online(&self, online: bool) {
    self.online.store(online, Ordering::SeqCst);
  }

  /// Delay every answer, to widen race windows.
  pub fn set_delay(&self, delay: Duration) {
    *self.delay.lock().unwrap() = Some(delay);
  }

  /// Delay only the answers to `function`.
  pub fn set_delay_for(&self, function: &str, delay: Duration) {
    self
      .delays
      .lock()
      .unwrap()
      .insert(function.to_string(), delay);
  }

  /// Answer `function` with `value` whenever nothing is scripted.
  pub fn respond(&self, function: &str, value: Value) {
    self
      .defaults
      .lock()
      .unwrap()
      .insert(function.to_string(), value);
  }

  /// Answer the next call to `function` with `outcome`.
  pub fn push(&self, function: &str, outcome: Result<Value>) {
    self
      .scripted
      .lock()
      .unwrap()
      .entry(function.to_string())
      .or_default()
      .push_back(outcome);
  }

  /// Calls that reached the server (made while online).
  pub fn calls_to(&self, function: &str) -> usize {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|(f, _)| f == function)
      .count()
  }

  pub fn last_params(&self, function: &str) -> Option<Value> {
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .rev()
      .find(|(f, _)| f == function)
      .map(|(_, params)| params.clone())
  }

  async fn answer(&self, function: &str, params: Value) -> Result<Value> {
    let delay = self
      .delays
      .lock()
      .unwrap()
      .get(function)
      .copied()
      .or(*self.delay.lock().unwrap());
    if let Some(delay) = delay {
      tokio::time::sleep(delay).await;
    }

    if !self.online.load(Ordering::SeqCst) {
      return Err(CoreError::transport("network unreachable"));
    }

    self
      .calls
      .lock()
      .unwrap()
      .push((function.to_string(), params));

    let scripted = self
      .scripted
      .lock()
      .unwrap()
      .get_mut(function)
      .and_then(VecDeque::pop_front);
    if let Some(outcome) = scripted {
      return outcome;
    }

    self
      .defaults
      .lock()
      .unwrap()
      .get(function)
      .cloned()
      .ok_or_else(|| CoreError::server(format!("{} is not available", function)))
  }
}

impl RemoteCall for FakeRemote {
  fn call<'a>(
    &'a self,
    function: &'a str,
    params: Value,
    _options: CallOptions,
  ) -> BoxFuture<'a, Result<Value>> {
    self.answer(function, params).boxed()
  }
}
