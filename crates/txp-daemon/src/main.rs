//! txp-daemon entry point.
//!
//! This file is intentionally thin: it sets up tracing, wires the service
//! graph around the live HTTP aggregator, and runs the server with the
//! cooperative shutdown protocol (stop enqueues → drain the scheduler under
//! a bounded deadline → stop the janitor).

use std::sync::Arc;

use anyhow::Context;
use axum::http::Method;
use tokio::sync::watch;
use tower_http::{
    cors::CorsLayer,
    trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer},
};
use tracing::{info, Level};

use txp_aggregator::HttpAggregator;
use txp_daemon::{routes, state};
use txp_pool::janitor::spawn_janitor;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env.local if present (dev convenience). Silent if the file does
    // not exist — production injects env vars directly.
    let _ = dotenvy::from_filename(".env.local");

    init_tracing();

    let settings = txp_config::Settings::from_env()?;
    let db = txp_store::connect_from_env().await?;

    let aggregator = Arc::new(HttpAggregator::new(
        settings.aggregator_url.clone(),
        settings.aggregator_token.clone(),
    )?);

    let (shared, scheduler) = state::wire(settings.clone(), db, aggregator)?;
    let scheduler_task = tokio::spawn(scheduler.run());

    let (janitor_shutdown_tx, janitor_shutdown_rx) = watch::channel(false);
    let janitor_task = spawn_janitor(
        shared.pool.clone(),
        settings.janitor_interval,
        settings.stale_hold_age,
        janitor_shutdown_rx,
    );

    let app = routes::build_router(Arc::clone(&shared))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_layer());

    info!("txp-daemon listening on http://{}", settings.bind_addr);

    axum::serve(
        tokio::net::TcpListener::bind(settings.bind_addr).await?,
        app,
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    })
    .await
    .context("server crashed")?;

    // Drain: refuse new enqueues, let the scheduler dispatch what it holds
    // plus one more batch, then leave — abandoned holds go to the janitor of
    // the next process.
    shared.coordinator.queue().shutdown();
    if tokio::time::timeout(settings.shutdown_deadline, scheduler_task)
        .await
        .is_err()
    {
        tracing::warn!(
            deadline_secs = settings.shutdown_deadline.as_secs(),
            "scheduler did not drain inside the deadline; exiting anyway"
        );
    }

    let _ = janitor_shutdown_tx.send(true);
    janitor_task.abort();

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();
}

/// CORS: per-client origin policy is enforced at admission; the HTTP layer
/// stays permissive about origins but strict about methods.
fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(tower_http::cors::Any)
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(tower_http::cors::Any)
}
