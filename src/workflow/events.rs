//! Human-in-the-loop event waiting.
//!
//! Phases sometimes need an external signal (a compile finished, a human
//! answered a question) before they can continue. A waiter registers for an
//! event type and suspends; delivery resolves it with the payload, and a
//! timeout resolves it with `None`. Waiting never fails: timing out is an
//! expected outcome the caller decides how to handle.

use crate::{flog, flog_debug};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;

type WaiterMap = Arc<Mutex<HashMap<String, Vec<oneshot::Sender<Value>>>>>;

/// Registry of pending event waiters, keyed by event type.
///
/// Clones share state, so the engine and the host-facing delivery side can
/// each hold one.
#[derive(Clone, Default)]
pub struct EventWaiters {
    waiters: WaiterMap,
}

impl EventWaiters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for one delivery of `event_type`, up to `timeout`.
    ///
    /// Resolves `Some(payload)` on delivery, `None` on timeout or when the
    /// registry is cleared. Each call registers its own independent waiter;
    /// concurrent waiters on the same type are all resolved by one delivery.
    pub async fn wait_for(&self, event_type: &str, timeout: Duration) -> Option<Value> {
        let rx = {
            let mut waiters = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
            let (tx, rx) = oneshot::channel();
            waiters.entry(event_type.to_string()).or_default().push(tx);
            rx
        };
        flog_debug!("Events: waiting for '{}' (up to {:?})", event_type, timeout);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(payload)) => Some(payload),
            // Sender dropped: registry cleared or delivery raced a cleanup.
            Ok(Err(_)) => None,
            Err(_) => {
                flog!("Events: wait for '{}' timed out", event_type);
                self.remove_closed(event_type);
                None
            }
        }
    }

    /// Deliver an event to every current waiter of its type.
    ///
    /// Returns how many waiters were resolved. Delivery with no waiters is
    /// a no-op, not an error.
    pub fn deliver(&self, event_type: &str, payload: Value) -> usize {
        let senders = {
            let mut waiters = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
            waiters.remove(event_type).unwrap_or_default()
        };
        let mut resolved = 0;
        for tx in senders {
            if tx.send(payload.clone()).is_ok() {
                resolved += 1;
            }
        }
        if resolved > 0 {
            flog!("Events: delivered '{}' to {} waiter(s)", event_type, resolved);
        }
        resolved
    }

    /// Drop every pending waiter. Each one resolves with `None`.
    ///
    /// Called on workflow exit so nothing stays suspended forever.
    pub fn clear(&self) {
        let mut waiters = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
        let count: usize = waiters.values().map(|v| v.len()).sum();
        waiters.clear();
        if count > 0 {
            flog!("Events: cleared {} pending waiter(s)", count);
        }
    }

    /// Number of pending waiters for an event type.
    pub fn pending(&self, event_type: &str) -> usize {
        let mut waiters = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(senders) = waiters.get_mut(event_type) {
            senders.retain(|tx| !tx.is_closed());
            senders.len()
        } else {
            0
        }
    }

    /// Drop senders whose receiver already went away.
    fn remove_closed(&self, event_type: &str) {
        let mut waiters = self.waiters.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(senders) = waiters.get_mut(event_type) {
            senders.retain(|tx| !tx.is_closed());
            if senders.is_empty() {
                waiters.remove(event_type);
            }
        }
    }
}
