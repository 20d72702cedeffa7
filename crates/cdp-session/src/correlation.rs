//! Pending-call correlation: the map from outstanding command id to the
//! handle awaiting that id's reply.

use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, error};

use cdp_wire::{CallId, ProtocolError};

use crate::error::SessionError;

/// Why a pending call resolved without a success payload.
#[derive(Debug)]
pub enum FailureCause {
    /// The remote answered with an error object.
    Protocol(ProtocolError),
    /// The session tore down while the call was outstanding.
    SessionClosed,
}

pub type CallOutcome = Result<Value, FailureCause>;

struct PendingCall {
    tx: oneshot::Sender<CallOutcome>,
    created_at: Instant,
}

/// Concurrent table of outstanding calls.
///
/// Registration is insert-if-absent and completion is remove-on-lookup, both
/// atomic, so a given id resolves at most once no matter how replies race
/// with each other or with teardown.
#[derive(Default)]
pub struct CorrelationTable {
    calls: DashMap<CallId, PendingCall>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self {
            calls: DashMap::new(),
        }
    }

    /// Register a new pending call and hand back the receiver its reply will
    /// arrive on. A collision on `id` is refused loudly instead of
    /// overwriting the call that already owns it.
    pub fn register(&self, id: CallId) -> Result<oneshot::Receiver<CallOutcome>, SessionError> {
        let (tx, rx) = oneshot::channel();
        match self.calls.entry(id) {
            Entry::Occupied(_) => {
                error!(target: "cdp-session", %id, "duplicate command id registration refused");
                Err(SessionError::DuplicateId(id))
            }
            Entry::Vacant(slot) => {
                slot.insert(PendingCall {
                    tx,
                    created_at: Instant::now(),
                });
                Ok(rx)
            }
        }
    }

    /// Resolve the call registered under `id`. Returns false when no such
    /// call exists (late, duplicate, or unknown reply).
    pub fn complete(&self, id: CallId, outcome: CallOutcome) -> bool {
        match self.calls.remove(&id) {
            Some((_, call)) => {
                let _ = call.tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Drop the registration for `id` without resolving it, reporting how
    /// long it had been outstanding. Used when the send itself fails and the
    /// caller gets a synchronous error instead.
    pub fn discard(&self, id: CallId) -> Option<Duration> {
        self.calls
            .remove(&id)
            .map(|(_, call)| call.created_at.elapsed())
    }

    /// Fail every outstanding call with a session-closed outcome so no
    /// caller is left waiting across teardown. Returns the number drained.
    pub fn drain(&self) -> usize {
        let ids: Vec<CallId> = self.calls.iter().map(|entry| *entry.key()).collect();
        let mut drained = 0;
        for id in ids {
            if let Some((_, call)) = self.calls.remove(&id) {
                debug!(
                    target: "cdp-session",
                    %id,
                    outstanding_ms = call.created_at.elapsed().as_millis() as u64,
                    "failing call on session teardown"
                );
                let _ = call.tx.send(Err(FailureCause::SessionClosed));
                drained += 1;
            }
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn completes_registered_call_once() {
        let table = CorrelationTable::new();
        let rx = table.register(CallId(1)).unwrap();

        assert!(table.complete(CallId(1), Ok(json!({"value": 42}))));
        assert_eq!(rx.await.unwrap().unwrap()["value"], 42);

        // The slot is gone; a second reply for the same id finds nothing.
        assert!(!table.complete(CallId(1), Ok(json!({}))));
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn refuses_duplicate_registration() {
        let table = CorrelationTable::new();
        let _rx = table.register(CallId(9)).unwrap();

        match table.register(CallId(9)) {
            Err(SessionError::DuplicateId(id)) => assert_eq!(id, CallId(9)),
            other => panic!("expected DuplicateId, got {other:?}"),
        }
        // The original registration must survive the refused attempt.
        assert_eq!(table.len(), 1);
        assert!(table.complete(CallId(9), Ok(json!(null))));
    }

    #[tokio::test]
    async fn unknown_reply_leaves_other_calls_alone() {
        let table = CorrelationTable::new();
        let rx = table.register(CallId(3)).unwrap();

        assert!(!table.complete(CallId(999), Ok(json!({}))));
        assert_eq!(table.len(), 1);

        assert!(table.complete(CallId(3), Ok(json!({"ok": true}))));
        assert_eq!(rx.await.unwrap().unwrap()["ok"], true);
    }

    #[tokio::test]
    async fn drain_fails_every_outstanding_call() {
        let table = CorrelationTable::new();
        let rx1 = table.register(CallId(1)).unwrap();
        let rx2 = table.register(CallId(2)).unwrap();

        assert_eq!(table.drain(), 2);
        assert!(table.is_empty());

        for rx in [rx1, rx2] {
            match rx.await.unwrap() {
                Err(FailureCause::SessionClosed) => {}
                other => panic!("expected SessionClosed, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn discard_drops_without_resolving() {
        let table = CorrelationTable::new();
        let rx = table.register(CallId(5)).unwrap();

        assert!(table.discard(CallId(5)).is_some());
        assert!(table.discard(CallId(5)).is_none());
        // The receiver observes a dropped sender, not an outcome.
        assert!(rx.await.is_err());
    }
}
