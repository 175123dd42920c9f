//! Stale-hold sweeper.
//!
//! A hold that outlives `stale_hold_age` belongs to a request that crashed
//! mid-admission, was abandoned at shutdown, or hit a logic error. The
//! janitor returns those outputs to `available`; it never touches `spent`
//! rows and never mutates request records.

use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::PoolManager;

/// One sweep pass. Returns the number of recovered outputs.
pub async fn sweep_stale(manager: &PoolManager, stale_hold_age: Duration) -> Result<u64> {
    let cutoff = Utc::now()
        - chrono::Duration::from_std(stale_hold_age).unwrap_or(chrono::Duration::seconds(600));
    let recovered = txp_store::release_stale_holds(manager.db_handle(), cutoff).await?;
    if recovered > 0 {
        tracing::warn!(recovered, "janitor recovered stale holds");
    }
    Ok(recovered)
}

/// Spawn the periodic sweeper. Exits when `shutdown` flips to true.
pub fn spawn_janitor(
    manager: PoolManager,
    interval: Duration,
    stale_hold_age: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick fires immediately; skip it so a boot-time sweep does
        // not race the first admissions.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = sweep_stale(&manager, stale_hold_age).await {
                        tracing::error!(error = %err, "janitor sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        tracing::info!("janitor stopping");
                        break;
                    }
                }
            }
        }
    })
}
