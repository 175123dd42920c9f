//! Deterministic in-memory aggregator for scenario tests.
//!
//! Design decisions (kept intentionally simple/deterministic):
//! - Verdict txids are derived from the submitted bytes (`txid_hex`), so
//!   tests can predict them without talking to a network.
//! - No randomness. Per-position status overrides; unscripted positions
//!   answer `seen-on-network`.
//! - Optional whole-call failure and an optional artificial delay, for the
//!   aggregator-failure and sync-timeout scenarios.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use txp_aggregator::Aggregator;
use txp_assembler::txid_hex;
use txp_schemas::AggregatorVerdict;

#[derive(Default)]
pub struct FakeAggregator {
    /// Status override per batch position; missing positions succeed.
    statuses: Mutex<Vec<String>>,
    /// When set, the next calls fail wholesale with this message.
    fail_with: Mutex<Option<String>>,
    /// Artificial latency before answering.
    delay: Mutex<Option<Duration>>,
    calls: AtomicUsize,
    batch_sizes: Mutex<Vec<usize>>,
}

impl FakeAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the status answered for batch position `index`.
    pub fn set_status_at(&self, index: usize, status: impl Into<String>) {
        let mut statuses = self.statuses.lock().unwrap_or_else(|e| e.into_inner());
        if statuses.len() <= index {
            statuses.resize(index + 1, String::new());
        }
        statuses[index] = status.into();
    }

    /// Make every subsequent call fail wholesale.
    pub fn fail_with(&self, message: impl Into<String>) {
        *self.fail_with.lock().unwrap_or_else(|e| e.into_inner()) = Some(message.into());
    }

    /// Clear a previously-set wholesale failure.
    pub fn recover(&self) {
        *self.fail_with.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// Delay every answer, to hold synchronous callers past their bound.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap_or_else(|e| e.into_inner()) = Some(delay);
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn batch_sizes(&self) -> Vec<usize> {
        self.batch_sizes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl Aggregator for FakeAggregator {
    async fn broadcast(&self, raw_txs: &[Vec<u8>]) -> Result<Vec<AggregatorVerdict>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.batch_sizes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(raw_txs.len());

        let delay = *self.delay.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let fail = self
            .fail_with
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        if let Some(message) = fail {
            return Err(anyhow!("{message}"));
        }

        let statuses = self
            .statuses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        Ok(raw_txs
            .iter()
            .enumerate()
            .map(|(i, raw)| {
                let status = statuses
                    .get(i)
                    .filter(|s| !s.is_empty())
                    .cloned()
                    .unwrap_or_else(|| "seen-on-network".to_string());
                AggregatorVerdict {
                    txid: txid_hex(raw),
                    status,
                    extra_info: None,
                }
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unscripted_batch_succeeds_with_derived_txids() {
        let agg = FakeAggregator::new();
        let verdicts = agg.broadcast(&[vec![1], vec![2]]).await.unwrap();
        assert_eq!(verdicts.len(), 2);
        assert_eq!(verdicts[0].status, "seen-on-network");
        assert_eq!(verdicts[0].txid, txid_hex(&[1]));
        assert_eq!(agg.call_count(), 1);
        assert_eq!(agg.batch_sizes(), vec![2]);
    }

    #[tokio::test]
    async fn scripted_position_overrides_status() {
        let agg = FakeAggregator::new();
        agg.set_status_at(1, "double-spend");
        let verdicts = agg.broadcast(&[vec![1], vec![2], vec![3]]).await.unwrap();
        assert_eq!(verdicts[0].status, "seen-on-network");
        assert_eq!(verdicts[1].status, "double-spend");
        assert_eq!(verdicts[2].status, "seen-on-network");
    }

    #[tokio::test]
    async fn wholesale_failure_and_recovery() {
        let agg = FakeAggregator::new();
        agg.fail_with("upstream 503");
        assert!(agg.broadcast(&[vec![1]]).await.is_err());
        agg.recover();
        assert!(agg.broadcast(&[vec![1]]).await.is_ok());
    }
}
