//! Train Scheduler — fixed-cadence, bounded-batch dispatch.
//!
//! A single loop task accumulates work items off the queue and departs on
//! either trigger: the interval tick (with a non-empty batch) or the batch
//! reaching `max_batch` (early departure). Departure detaches the batch into
//! a spawned dispatch task, so broadcasting never blocks accumulation of the
//! next train.
//!
//! Dispatch marks the batch `processing`, calls the aggregator under
//! `broadcast_timeout`, and routes each verdict — in returned order — to the
//! request record, the output pool, and any waiting synchronous caller. A
//! failed aggregator call fails the whole batch and releases every hold; no
//! transaction was accepted, so there is no double-spend risk.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use txp_aggregator::Aggregator;
use txp_coordinator::{Coordinator, TrainReceiver};
use txp_pool::PoolManager;
use txp_schemas::{AggregatorVerdict, WorkItem};
use txp_store::{RequestOutcome, RequestStatus};

pub mod verdicts;

use verdicts::{classify, OutputAction};

#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub interval: Duration,
    pub max_batch: usize,
    pub broadcast_timeout: Duration,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(3),
            max_batch: 1000,
            broadcast_timeout: Duration::from_secs(30),
        }
    }
}

pub struct TrainScheduler {
    cfg: TrainConfig,
    recv: TrainReceiver,
    ctx: Arc<DispatchCtx>,
}

struct DispatchCtx {
    cfg: TrainConfig,
    pool: PoolManager,
    coordinator: Coordinator,
    aggregator: Arc<dyn Aggregator>,
}

impl TrainScheduler {
    pub fn new(
        cfg: TrainConfig,
        recv: TrainReceiver,
        pool: PoolManager,
        coordinator: Coordinator,
        aggregator: Arc<dyn Aggregator>,
    ) -> Self {
        let ctx = Arc::new(DispatchCtx {
            cfg: cfg.clone(),
            pool,
            coordinator,
            aggregator,
        });
        Self { cfg, recv, ctx }
    }

    /// Run until shutdown. Returns after the drain protocol completes.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(self.cfg.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // interval() fires immediately; consume the initial tick so the
        // first departure honors the cadence.
        ticker.tick().await;

        let mut batch: Vec<WorkItem> = Vec::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !batch.is_empty() {
                        self.depart(&mut batch);
                    }
                }
                item = self.recv.rx.recv() => match item {
                    Some(item) => {
                        batch.push(item);
                        if batch.len() >= self.cfg.max_batch {
                            self.depart(&mut batch);
                            ticker.reset();
                        }
                    }
                    None => {
                        // All enqueue handles dropped; treat as shutdown.
                        break;
                    }
                },
                _ = self.recv.shutdown.changed() => {
                    if *self.recv.shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.drain(batch).await;
    }

    /// Detach the accumulated batch and dispatch it without holding up the
    /// accumulation loop.
    fn depart(&self, batch: &mut Vec<WorkItem>) {
        let departing = std::mem::take(batch);
        tracing::info!(size = departing.len(), "train departing");
        let ctx = Arc::clone(&self.ctx);
        tokio::spawn(async move {
            dispatch(ctx, departing).await;
        });
    }

    /// Shutdown protocol: dispatch the current batch, drain up to one more
    /// batch from the queue, then log and abandon the rest in `pending` —
    /// the janitor recovers their holds.
    async fn drain(mut self, current: Vec<WorkItem>) {
        tracing::info!(in_hand = current.len(), "scheduler draining");

        if !current.is_empty() {
            dispatch(Arc::clone(&self.ctx), current).await;
        }

        let mut last_batch = Vec::new();
        while last_batch.len() < self.cfg.max_batch {
            match self.recv.rx.try_recv() {
                Ok(item) => last_batch.push(item),
                Err(_) => break,
            }
        }
        if !last_batch.is_empty() {
            dispatch(Arc::clone(&self.ctx), last_batch).await;
        }

        let mut abandoned = 0usize;
        while self.recv.rx.try_recv().is_ok() {
            abandoned += 1;
        }
        if abandoned > 0 {
            tracing::warn!(abandoned, "items left pending at shutdown; janitor will recover holds");
        }
    }
}

async fn dispatch(ctx: Arc<DispatchCtx>, batch: Vec<WorkItem>) {
    let handles: Vec<Uuid> = batch.iter().map(|item| item.handle).collect();
    if let Err(err) = ctx.coordinator.mark_processing(&handles).await {
        tracing::error!(error = %err, "failed to mark batch processing");
        // Fall through: the guarded outcome writes still apply cleanly.
    }

    let raw_txs: Vec<Vec<u8>> = batch.iter().map(|item| item.raw_tx.clone()).collect();

    let outcome = tokio::time::timeout(
        ctx.cfg.broadcast_timeout,
        ctx.aggregator.broadcast(&raw_txs),
    )
    .await;

    match outcome {
        Err(_) => {
            fail_batch(&ctx, &batch, "aggregator broadcast timed out").await;
        }
        Ok(Err(err)) => {
            fail_batch(&ctx, &batch, &format!("aggregator broadcast failed: {err}")).await;
        }
        Ok(Ok(verdicts)) => {
            apply_verdicts(&ctx, &batch, verdicts).await;
        }
    }
}

/// The aggregator accepted nothing: every request fails with the error and
/// every held output returns to the pool.
async fn fail_batch(ctx: &DispatchCtx, batch: &[WorkItem], error: &str) {
    tracing::warn!(size = batch.len(), error, "failing whole batch");

    for item in batch {
        let outcome = RequestOutcome {
            status: RequestStatus::Failed,
            txid: None,
            aggregator_status: None,
            error: Some(error.to_string()),
        };
        if let Err(err) = ctx.coordinator.complete(item.handle, outcome).await {
            tracing::error!(handle = %item.handle, error = %err, "outcome write failed");
        }
        if let Err(err) = ctx.pool.release(&item.outpoint_used).await {
            tracing::error!(outpoint = %item.outpoint_used, error = %err, "release failed");
        }
    }
}

/// Apply per-item verdicts in the order the aggregator returned them. The
/// aggregator aligns verdicts with submission order; items beyond the verdict
/// list fail closed with their holds released.
async fn apply_verdicts(ctx: &DispatchCtx, batch: &[WorkItem], verdicts: Vec<AggregatorVerdict>) {
    if verdicts.len() != batch.len() {
        tracing::warn!(
            submitted = batch.len(),
            returned = verdicts.len(),
            "aggregator verdict count does not match batch"
        );
    }

    let mut verdicts = verdicts.into_iter();

    for item in batch {
        match verdicts.next() {
            Some(verdict) => apply_one(ctx, item, verdict).await,
            None => {
                let outcome = RequestOutcome {
                    status: RequestStatus::Failed,
                    txid: None,
                    aggregator_status: None,
                    error: Some("no verdict returned for transaction".to_string()),
                };
                if let Err(err) = ctx.coordinator.complete(item.handle, outcome).await {
                    tracing::error!(handle = %item.handle, error = %err, "outcome write failed");
                }
                if let Err(err) = ctx.pool.release(&item.outpoint_used).await {
                    tracing::error!(outpoint = %item.outpoint_used, error = %err, "release failed");
                }
            }
        }
    }
}

async fn apply_one(ctx: &DispatchCtx, item: &WorkItem, verdict: AggregatorVerdict) {
    let disposition = classify(&verdict.status);

    let error = match (&disposition.error, &verdict.extra_info) {
        (Some(reason), Some(extra)) => Some(format!("{reason}: {extra}")),
        (Some(reason), None) => Some(reason.clone()),
        (None, _) => None,
    };

    let txid = (!verdict.txid.is_empty()).then(|| verdict.txid.clone());

    // Output first, then record: a crash between the two leaves a
    // `processing` request with a resolved output, which is recoverable; the
    // reverse would strand the hold until the janitor's stale-age horizon.
    match disposition.output_action {
        OutputAction::Commit => {
            let spent_in = txid.as_deref().unwrap_or("");
            if let Err(err) = ctx.pool.commit(&item.outpoint_used, spent_in).await {
                tracing::error!(outpoint = %item.outpoint_used, error = %err, "commit failed");
            }
        }
        OutputAction::Release => {
            if let Err(err) = ctx.pool.release(&item.outpoint_used).await {
                tracing::error!(outpoint = %item.outpoint_used, error = %err, "release failed");
            }
        }
    }

    let outcome = RequestOutcome {
        status: disposition.request_status,
        txid,
        aggregator_status: Some(verdict.status),
        error,
    };

    if let Err(err) = ctx.coordinator.complete(item.handle, outcome).await {
        tracing::error!(handle = %item.handle, error = %err, "outcome write failed");
    }
}
