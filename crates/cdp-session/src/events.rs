//! Event subscription and dispatch.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, error};

pub type EventCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Ticket returned by `subscribe`; hand it back to `unsubscribe`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SubscriptionHandle {
    method: String,
    token: u64,
}

impl SubscriptionHandle {
    pub fn method(&self) -> &str {
        &self.method
    }
}

/// Name-keyed fan-out of unsolicited protocol events.
///
/// Any number of callbacks may be registered per event name. Dispatch works
/// on a snapshot of the subscriber set, so subscribing or unsubscribing
/// concurrently never skips or double-invokes a callback mid-flight, and a
/// panicking callback cannot keep the others from running.
#[derive(Default)]
pub struct EventDispatcher {
    next_token: AtomicU64,
    subscribers: DashMap<String, Vec<(u64, EventCallback)>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, method: impl Into<String>, callback: F) -> SubscriptionHandle
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let method = method.into();
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .entry(method.clone())
            .or_default()
            .push((token, Arc::new(callback)));
        SubscriptionHandle { method, token }
    }

    /// Remove one subscription. Returns false when the handle was already
    /// unsubscribed.
    pub fn unsubscribe(&self, handle: &SubscriptionHandle) -> bool {
        match self.subscribers.get_mut(&handle.method) {
            Some(mut entry) => {
                let before = entry.len();
                entry.retain(|(token, _)| *token != handle.token);
                before != entry.len()
            }
            None => false,
        }
    }

    /// Invoke every callback currently registered for `method`.
    pub fn dispatch(&self, method: &str, params: &Value) {
        let snapshot: Vec<EventCallback> = match self.subscribers.get(method) {
            Some(entry) => entry.iter().map(|(_, cb)| Arc::clone(cb)).collect(),
            None => {
                debug!(target: "cdp-session", method = %method, "event with no subscribers");
                return;
            }
        };

        for callback in snapshot {
            if catch_unwind(AssertUnwindSafe(|| callback(params))).is_err() {
                error!(target: "cdp-session", method = %method, "event callback panicked");
            }
        }
    }

    pub fn subscriber_count(&self, method: &str) -> usize {
        self.subscribers
            .get(method)
            .map(|entry| entry.len())
            .unwrap_or(0)
    }
}
