//! UTXO Pool Manager — the only component permitted to transition an output.
//!
//! The storage layer (`txp-store::outputs`) provides the atomic conditional
//! updates; this crate owns the transition DAG and turns refused updates into
//! typed errors:
//!
//! ```text
//! available ──acquire──► held ──commit──► spent   (terminal)
//!     ▲                    │
//!     └──────release───────┘
//! ```
//!
//! `acquire` is a single `FOR UPDATE SKIP LOCKED` update, so two concurrent
//! callers can never both take the same output. Losing that property would
//! permit double-spending a single on-chain output.

use anyhow::Result;
use sqlx::PgPool;

pub mod janitor;

pub use txp_store::{NewOutput, OutputCategory, OutputRow, OutputStatus};

// ---------------------------------------------------------------------------
// PoolError
// ---------------------------------------------------------------------------

/// Typed refusals from pool operations. Carried inside `anyhow::Error`;
/// callers that need to branch on them downcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The available subset of the requested category is empty. Transient:
    /// callers retry with backoff, never in a tight loop.
    Unavailable,
    /// The requested transition is not an edge of the DAG.
    IllegalTransition {
        outpoint: String,
        from: &'static str,
        attempted: &'static str,
    },
    /// The outpoint does not exist in the population.
    UnknownOutpoint(String),
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::Unavailable => write!(f, "no available output in the requested category"),
            PoolError::IllegalTransition {
                outpoint,
                from,
                attempted,
            } => write!(
                f,
                "illegal output transition: {} is {} (attempted {})",
                outpoint, from, attempted
            ),
            PoolError::UnknownOutpoint(outpoint) => {
                write!(f, "unknown outpoint: {}", outpoint)
            }
        }
    }
}

impl std::error::Error for PoolError {}

// ---------------------------------------------------------------------------
// PoolManager
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PoolManager {
    db: PgPool,
}

impl PoolManager {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    /// Take an exclusive hold on one output of the requested category.
    ///
    /// FIFO over the available subset (oldest `created_at` first) so no
    /// output is indefinitely passed over. Fails with [`PoolError::Unavailable`]
    /// when the subset is empty.
    pub async fn acquire(&self, category: OutputCategory) -> Result<OutputRow> {
        match txp_store::acquire_available(&self.db, category).await? {
            Some(output) => {
                tracing::debug!(outpoint = %output.outpoint, category = category.as_str(), "output held");
                Ok(output)
            }
            None => Err(PoolError::Unavailable.into()),
        }
    }

    /// Best-effort batch hold: returns up to `n` outputs (possibly empty).
    pub async fn acquire_batch(&self, category: OutputCategory, n: usize) -> Result<Vec<OutputRow>> {
        let outputs = txp_store::acquire_available_batch(&self.db, category, n as i64).await?;
        if outputs.len() < n {
            tracing::debug!(
                requested = n,
                acquired = outputs.len(),
                category = category.as_str(),
                "partial batch acquisition"
            );
        }
        Ok(outputs)
    }

    /// `held → available`. Releasing an already-available output is a no-op;
    /// releasing a spent output is an [`PoolError::IllegalTransition`].
    pub async fn release(&self, outpoint: &str) -> Result<()> {
        if txp_store::release_hold(&self.db, outpoint).await? {
            tracing::debug!(outpoint, "hold released");
            return Ok(());
        }

        match self.current_status(outpoint).await? {
            OutputStatus::Available => Ok(()),
            OutputStatus::Spent => Err(PoolError::IllegalTransition {
                outpoint: outpoint.to_string(),
                from: "spent",
                attempted: "release",
            }
            .into()),
            // The guarded update raced with another releaser; the row is in
            // the state we wanted.
            OutputStatus::Held => Ok(()),
        }
    }

    /// `held → spent`, recording the consuming transaction.
    ///
    /// Committing an already-spent output with the same `spent_in_txid` is a
    /// no-op; with a different txid it is an [`PoolError::IllegalTransition`].
    pub async fn commit(&self, outpoint: &str, spent_in_txid: &str) -> Result<()> {
        if txp_store::commit_spend(&self.db, outpoint, spent_in_txid).await? {
            tracing::debug!(outpoint, txid = spent_in_txid, "output spent");
            return Ok(());
        }

        let current = txp_store::fetch_output(&self.db, outpoint)
            .await?
            .ok_or_else(|| PoolError::UnknownOutpoint(outpoint.to_string()))?;

        match current.status {
            OutputStatus::Spent if current.spent_in_txid.as_deref() == Some(spent_in_txid) => {
                Ok(())
            }
            status => Err(PoolError::IllegalTransition {
                outpoint: outpoint.to_string(),
                from: status.as_str(),
                attempted: "commit",
            }
            .into()),
        }
    }

    /// Insert a new output as `available`. Idempotent on outpoint, so
    /// recovery scans can replay registrations.
    pub async fn register(&self, output: &NewOutput) -> Result<bool> {
        let inserted = txp_store::insert_output_deduped(&self.db, output).await?;
        if inserted {
            tracing::info!(outpoint = %output.outpoint(), category = output.category.as_str(), "output registered");
        }
        Ok(inserted)
    }

    /// `(category, status) → count` for /health and the CLI.
    pub async fn stats(&self) -> Result<Vec<(String, String, i64)>> {
        txp_store::count_by_category_status(&self.db).await
    }

    pub(crate) fn db_handle(&self) -> &PgPool {
        &self.db
    }

    async fn current_status(&self, outpoint: &str) -> Result<OutputStatus> {
        let row = txp_store::fetch_output(&self.db, outpoint)
            .await?
            .ok_or_else(|| PoolError::UnknownOutpoint(outpoint.to_string()))?;
        Ok(row.status)
    }
}
