//! Single-flight coordination of origin fetches.

use dashmap::{mapref::entry::Entry, DashMap};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, Instrument};

type Gates = Arc<DashMap<String, watch::Receiver<bool>>>;

/// Ensures at most one population task runs per key at any time.
///
/// Callers that arrive while a task for their key is running wait for it to
/// finish instead of starting another one. The task result is not shared:
/// callers are expected to look at the store again once [`run_once`]
/// returns.
///
/// [`run_once`]: FetchCoordinator::run_once
#[derive(Debug, Clone, Default)]
pub struct FetchCoordinator {
  gates: Gates,
}

impl FetchCoordinator {
  pub fn new() -> Self {
    Self::default()
  }

  /// Run `action` for `key` unless a run is already in flight, then wait for
  /// whichever run is current to complete.
  ///
  /// The action is spawned onto the runtime, so it finishes even when every
  /// caller waiting on it goes away.
  pub async fn run_once<F, Fut>(&self, key: &str, action: F)
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = ()> + Send + 'static,
  {
    let (mut done, leader) = match self.gates.entry(key.to_string()) {
      Entry::Occupied(gate) => (gate.get().clone(), None),
      Entry::Vacant(slot) => {
        let (tx, rx) = watch::channel(false);
        slot.insert(rx.clone());
        (rx, Some(tx))
      }
    };

    match leader {
      Some(tx) => {
        let guard = GateGuard {
          gates: Arc::clone(&self.gates),
          key: key.to_string(),
          done: tx,
        };
        let task = action();
        tokio::spawn(
          async move {
            task.await;
            drop(guard);
          }
          .in_current_span(),
        );
      }
      None => debug!(key, "Waiting on in-flight fetch"),
    }

    // An error means the task died without signalling, which is also an end
    let _ = done.wait_for(|finished| *finished).await;
  }

  /// Number of keys with a fetch currently in flight.
  pub fn in_flight(&self) -> usize {
    self.gates.len()
  }
}

/// Retires a gate once its task ends, including by panic.
struct GateGuard {
  gates: Gates,
  key: String,
  done: watch::Sender<bool>,
}

impl Drop for GateGuard {
  fn drop(&mut self) {
    self.gates.remove(&self.key);
    self.done.send_replace(true);
  }
}
