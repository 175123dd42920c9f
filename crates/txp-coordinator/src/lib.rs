//! Request Lifecycle Coordinator.
//!
//! The authoritative record of every admitted submission lives in the
//! `requests` table; this crate owns admission (insert → enqueue → optional
//! bounded wait), handle lookups, and the outcome path the scheduler calls
//! after each broadcast. Synchronous callers are unblocked through the
//! in-process [`SinkTable`]; the persisted record carries no notifier.

use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::PgPool;
use uuid::Uuid;

pub mod queue;
pub mod sinks;

pub use queue::{EnqueueError, TrainQueue, TrainReceiver};
pub use sinks::SinkTable;
pub use txp_schemas::{ResultMessage, WorkItem};
pub use txp_store::{RequestOutcome, RequestRow, RequestStatus};

/// How one admission resolved.
#[derive(Debug)]
pub enum Admitted {
    /// Synchronous wait completed inside the bound.
    Resolved {
        handle: Uuid,
        result: ResultMessage,
    },
    /// Synchronous wait hit `sync_timeout`; the record lives on for polling.
    TimedOut { handle: Uuid },
    /// Asynchronous admission (requested, or degraded under queue pressure).
    Queued { handle: Uuid, degraded: bool },
}

#[derive(Clone)]
pub struct Coordinator {
    db: PgPool,
    queue: TrainQueue,
    sinks: SinkTable,
    sync_timeout: Duration,
    sync_wait_threshold: usize,
}

impl Coordinator {
    pub fn new(
        db: PgPool,
        queue: TrainQueue,
        sync_timeout: Duration,
        sync_wait_threshold: usize,
    ) -> Self {
        Self {
            db,
            queue,
            sinks: SinkTable::new(),
            sync_timeout,
            sync_wait_threshold,
        }
    }

    pub fn queue(&self) -> &TrainQueue {
        &self.queue
    }

    /// Admit one assembled transaction.
    ///
    /// On an enqueue refusal the pending record is deleted and the typed
    /// [`EnqueueError`] is surfaced; the caller still owns the output hold
    /// and must release it before reporting the error.
    pub async fn admit(
        &self,
        raw_tx: Vec<u8>,
        outpoint_used: String,
        wait: bool,
    ) -> Result<Admitted> {
        let handle = Uuid::new_v4();

        // Degrade to async when the queue is already deeper than one train:
        // the caller would wait out its bound for nothing.
        let depth = self.queue.depth();
        let degraded = wait && depth >= self.sync_wait_threshold;
        let use_sink = wait && !degraded;

        txp_store::insert_request(&self.db, handle, &raw_tx, &outpoint_used)
            .await
            .context("admission insert failed")?;

        // Register the sink before enqueueing so a fast train cannot resolve
        // the item before anyone is listening.
        let sink_rx = use_sink.then(|| self.sinks.register(handle));

        let item = WorkItem {
            handle,
            raw_tx,
            outpoint_used,
        };

        if let Err(refusal) = self.queue.try_enqueue(item) {
            self.sinks.discard(handle);
            let _ = txp_store::delete_request(&self.db, handle).await;
            tracing::warn!(handle = %handle, refusal = %refusal, "admission refused at enqueue");
            return Err(refusal.into());
        }

        tracing::debug!(handle = %handle, depth = depth + 1, wait, degraded, "request admitted");

        let Some(sink_rx) = sink_rx else {
            return Ok(Admitted::Queued { handle, degraded });
        };

        match tokio::time::timeout(self.sync_timeout, sink_rx).await {
            Ok(Ok(result)) => Ok(Admitted::Resolved { handle, result }),
            // Sender dropped without a verdict; treat as an expired wait.
            Ok(Err(_)) => Ok(Admitted::TimedOut { handle }),
            Err(_) => {
                self.sinks.discard(handle);
                tracing::debug!(handle = %handle, "synchronous wait expired; caller degraded to polling");
                Ok(Admitted::TimedOut { handle })
            }
        }
    }

    /// Poll the current record for a handle.
    pub async fn lookup(&self, handle: Uuid) -> Result<Option<RequestRow>> {
        txp_store::fetch_request(&self.db, handle).await
    }

    /// `pending → processing` for a departed batch.
    pub async fn mark_processing(&self, handles: &[Uuid]) -> Result<u64> {
        txp_store::mark_processing(&self.db, handles).await
    }

    /// Apply one broadcast outcome: a single guarded record write, then a
    /// best-effort, non-blocking notification of any waiting caller.
    ///
    /// Illegal writes (terminal rows revisited with a different status) are
    /// refused by the store and logged here; replaying the same terminal
    /// outcome is silently accepted.
    pub async fn complete(&self, handle: Uuid, outcome: RequestOutcome) -> Result<()> {
        let updated = txp_store::apply_outcome(&self.db, handle, &outcome)
            .await
            .context("outcome write failed")?;

        if !updated {
            tracing::warn!(
                handle = %handle,
                status = outcome.status.as_str(),
                "outcome refused by transition guard; record already terminal"
            );
        }

        if let Some(sink) = self.sinks.take(handle) {
            let message = ResultMessage {
                txid: outcome.txid,
                aggregator_status: outcome.aggregator_status.unwrap_or_default(),
                error: outcome.error,
            };
            // The caller may have timed out and gone; a failed send is fine.
            let _ = sink.send(message);
        }

        Ok(())
    }

    /// Depth + capacity counters for /health.
    pub fn queue_counters(&self) -> (usize, usize) {
        (self.queue.depth(), self.queue.capacity())
    }
}
