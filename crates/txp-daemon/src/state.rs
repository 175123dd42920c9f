//! Shared runtime state and wiring for txp-daemon.

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use txp_aggregator::Aggregator;
use txp_assembler::SigningKey;
use txp_auth::Authenticator;
use txp_config::Settings;
use txp_coordinator::{Coordinator, TrainQueue};
use txp_pool::PoolManager;
use txp_scheduler::{TrainConfig, TrainScheduler};

/// Static build metadata included in health responses.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BuildInfo {
    pub service: &'static str,
    pub version: &'static str,
}

/// Cloneable (Arc) handle shared across all Axum handlers.
pub struct AppState {
    pub build: BuildInfo,
    pub settings: Settings,
    pub db: PgPool,
    pub pool: PoolManager,
    pub coordinator: Coordinator,
    pub auth: Authenticator,
    pub signing_key: SigningKey,
}

/// Wire the full service graph around one aggregator implementation.
///
/// Returns the shared state and the (not yet running) scheduler so the caller
/// decides where the loop task lives — `main.rs` spawns it, scenario tests
/// drive it on their own runtime.
pub fn wire(
    settings: Settings,
    db: PgPool,
    aggregator: Arc<dyn Aggregator>,
) -> Result<(Arc<AppState>, TrainScheduler)> {
    let signing_key = SigningKey::from_hex(&settings.publishing_key_hex)?;

    let (queue, receiver) = TrainQueue::new(settings.queue_buffer);

    let pool = PoolManager::new(db.clone());
    let coordinator = Coordinator::new(
        db.clone(),
        queue,
        settings.sync_timeout,
        settings.sync_wait_threshold,
    );
    let auth = Authenticator::new(db.clone(), settings.auth_skew);

    let scheduler = TrainScheduler::new(
        TrainConfig {
            interval: settings.train_interval,
            max_batch: settings.max_batch,
            broadcast_timeout: settings.broadcast_timeout,
        },
        receiver,
        pool.clone(),
        coordinator.clone(),
        aggregator,
    );

    let state = Arc::new(AppState {
        build: BuildInfo {
            service: "txp-daemon",
            version: env!("CARGO_PKG_VERSION"),
        },
        settings,
        db,
        pool,
        coordinator,
        auth,
        signing_key,
    });

    Ok((state, scheduler))
}
