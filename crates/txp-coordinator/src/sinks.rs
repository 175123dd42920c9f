//! In-process result notifiers for synchronous callers.
//!
//! One single-shot sender per waiting admission, keyed by handle. The
//! scheduler takes the sender when a verdict lands and fires it exactly once;
//! if the caller has already timed out the send is dropped on the floor.
//! Nothing here persists — the durable record is the request row.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::oneshot;
use uuid::Uuid;

use txp_schemas::ResultMessage;

#[derive(Clone, Default)]
pub struct SinkTable {
    inner: Arc<Mutex<HashMap<Uuid, oneshot::Sender<ResultMessage>>>>,
}

impl SinkTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a sink for `handle`; returns the receiving end.
    pub fn register(&self, handle: Uuid) -> oneshot::Receiver<ResultMessage> {
        let (tx, rx) = oneshot::channel();
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(handle, tx);
        rx
    }

    /// Take the sink for `handle`, if one is still waiting.
    pub fn take(&self, handle: Uuid) -> Option<oneshot::Sender<ResultMessage>> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&handle)
    }

    /// Drop the sink for `handle` (caller gave up waiting).
    pub fn discard(&self, handle: Uuid) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&handle);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sink_delivers_once_and_only_once() {
        let table = SinkTable::new();
        let handle = Uuid::new_v4();
        let rx = table.register(handle);

        let tx = table.take(handle).expect("sink present");
        assert!(table.take(handle).is_none(), "sink is single-shot");

        tx.send(ResultMessage {
            txid: Some("ab".repeat(32)),
            aggregator_status: "seen-on-network".to_string(),
            error: None,
        })
        .unwrap();

        let msg = rx.await.unwrap();
        assert!(msg.is_success());
    }

    #[test]
    fn send_to_departed_caller_is_dropped() {
        let table = SinkTable::new();
        let handle = Uuid::new_v4();
        let rx = table.register(handle);
        drop(rx); // caller timed out

        let tx = table.take(handle).expect("sink present");
        // The send errors (no receiver) and that is fine.
        assert!(tx
            .send(ResultMessage {
                txid: None,
                aggregator_status: "rejected".to_string(),
                error: Some("refused".to_string()),
            })
            .is_err());
    }
}
