// ── Request correlation ──
//
// Outstanding-request table shared by all three transports. Every entry
// is removed exactly once: on completion, on timeout (via the waiter's
// Drop), or by `fail_all` when the connection is torn down.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::Error;

type Slot<V> = oneshot::Sender<Result<V, Error>>;

/// Correlation id → completion signal.
pub struct PendingRequests<K, V> {
    slots: Arc<Mutex<HashMap<K, Slot<V>>>>,
}

impl<K, V> Clone for PendingRequests<K, V> {
    fn clone(&self) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
        }
    }
}

impl<K, V> Default for PendingRequests<K, V> {
    fn default() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<K, V> PendingRequests<K, V>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for `key`. Replaces (and drops) any previous waiter.
    pub fn register(&self, key: K) -> Waiter<K, V> {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(key.clone(), tx);
        Waiter {
            key,
            rx,
            slots: Arc::clone(&self.slots),
        }
    }

    /// Deliver a response. Returns `false` if nobody was waiting.
    pub fn resolve(&self, key: &K, value: V) -> bool {
        match self.lock().remove(key) {
            Some(tx) => tx.send(Ok(value)).is_ok(),
            None => false,
        }
    }

    /// Release every waiter with a `Disconnected` outcome.
    pub fn fail_all(&self) -> usize {
        let drained: Vec<Slot<V>> = self.lock().drain().map(|(_, tx)| tx).collect();
        let count = drained.len();
        for tx in drained {
            let _ = tx.send(Err(Error::Disconnected));
        }
        count
    }

    pub fn contains(&self, key: &K) -> bool {
        self.lock().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<K, Slot<V>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── Waiter ───────────────────────────────────────────────────────────

/// One outstanding command. Dropping it unregisters the correlation id.
pub struct Waiter<K: Eq + Hash, V> {
    key: K,
    rx: oneshot::Receiver<Result<V, Error>>,
    slots: Arc<Mutex<HashMap<K, Slot<V>>>>,
}

impl<K: Eq + Hash, V> Waiter<K, V> {
    /// Wait for the response, bounded by `timeout`.
    pub async fn wait(mut self, timeout: Duration) -> Result<V, Error> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(result)) => result,
            // Sender dropped without a value: the table was torn down.
            Ok(Err(_)) => Err(Error::Disconnected),
            Err(_) => Err(Error::Timeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }
}

impl<K: Eq + Hash, V> Drop for Waiter<K, V> {
    fn drop(&mut self) {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

// ── Tests ────────────────────────────────────────────────────────────
