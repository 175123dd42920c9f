//! Environment-driven settings for the publishing service.
//!
//! Every knob has a default so a dev instance boots with nothing but
//! `TXP_DATABASE_URL` and `TXP_PUBLISHING_KEY` set. Production injects the
//! full set. `dotenvy::from_filename(".env.local")` is loaded by the binary
//! mains before `Settings::from_env()` is called.

use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};

pub const ENV_DAEMON_ADDR: &str = "TXP_DAEMON_ADDR";
pub const ENV_AGGREGATOR_URL: &str = "TXP_AGGREGATOR_URL";
pub const ENV_AGGREGATOR_TOKEN: &str = "TXP_AGGREGATOR_TOKEN";
pub const ENV_PUBLISHING_KEY: &str = "TXP_PUBLISHING_KEY";
pub const ENV_ADMIN_SECRET: &str = "TXP_ADMIN_SECRET";
pub const ENV_TRAIN_INTERVAL_MS: &str = "TXP_TRAIN_INTERVAL_MS";
pub const ENV_MAX_BATCH: &str = "TXP_MAX_BATCH";
pub const ENV_QUEUE_BUFFER: &str = "TXP_QUEUE_BUFFER";
pub const ENV_BROADCAST_TIMEOUT_MS: &str = "TXP_BROADCAST_TIMEOUT_MS";
pub const ENV_SYNC_TIMEOUT_MS: &str = "TXP_SYNC_TIMEOUT_MS";
pub const ENV_JANITOR_INTERVAL_SECS: &str = "TXP_JANITOR_INTERVAL_SECS";
pub const ENV_STALE_HOLD_SECS: &str = "TXP_STALE_HOLD_SECS";
pub const ENV_MAX_PAYLOAD_BYTES: &str = "TXP_MAX_PAYLOAD_BYTES";
pub const ENV_AUTH_SKEW_SECS: &str = "TXP_AUTH_SKEW_SECS";
pub const ENV_SHUTDOWN_DEADLINE_SECS: &str = "TXP_SHUTDOWN_DEADLINE_SECS";

#[derive(Debug, Clone)]
pub struct Settings {
    pub bind_addr: SocketAddr,
    pub aggregator_url: String,
    pub aggregator_token: Option<String>,
    /// 32-byte secret key, hex. Parsed by the assembler at wiring time.
    pub publishing_key_hex: String,
    pub admin_secret: Option<String>,

    /// Train cadence.
    pub train_interval: Duration,
    /// Bound on one departure.
    pub max_batch: usize,
    /// In-memory queue capacity (default 10 × max_batch).
    pub queue_buffer: usize,
    /// Bound on one aggregator call.
    pub broadcast_timeout: Duration,
    /// Bound on a synchronous caller's inline wait.
    pub sync_timeout: Duration,
    /// Queue depth at which sync admissions degrade to async.
    pub sync_wait_threshold: usize,

    pub janitor_interval: Duration,
    pub stale_hold_age: Duration,

    pub max_payload_bytes: usize,
    /// Accepted |now − X-Timestamp| skew for signed requests.
    pub auth_skew: Duration,
    /// Cooperative drain bound at shutdown.
    pub shutdown_deadline: Duration,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let bind_addr = match std::env::var(ENV_DAEMON_ADDR) {
            Ok(v) => v
                .parse()
                .with_context(|| format!("{ENV_DAEMON_ADDR} is not a socket address: {v}"))?,
            Err(_) => SocketAddr::from(([127, 0, 0, 1], 8870)),
        };

        let aggregator_url = std::env::var(ENV_AGGREGATOR_URL)
            .unwrap_or_else(|_| "http://127.0.0.1:9090/broadcast".to_string());
        let aggregator_token = std::env::var(ENV_AGGREGATOR_TOKEN).ok();
        let publishing_key_hex = std::env::var(ENV_PUBLISHING_KEY)
            .with_context(|| format!("missing env var {ENV_PUBLISHING_KEY}"))?;
        let admin_secret = std::env::var(ENV_ADMIN_SECRET).ok();

        let max_batch = env_usize(ENV_MAX_BATCH, 1000)?;
        let queue_buffer = env_usize(ENV_QUEUE_BUFFER, max_batch.saturating_mul(10))?;

        Ok(Self {
            bind_addr,
            aggregator_url,
            aggregator_token,
            publishing_key_hex,
            admin_secret,
            train_interval: Duration::from_millis(env_u64(ENV_TRAIN_INTERVAL_MS, 3_000)?),
            max_batch,
            queue_buffer,
            broadcast_timeout: Duration::from_millis(env_u64(ENV_BROADCAST_TIMEOUT_MS, 30_000)?),
            sync_timeout: Duration::from_millis(env_u64(ENV_SYNC_TIMEOUT_MS, 5_000)?),
            // The full batch bound is the natural degradation threshold: a
            // deeper queue means the item will not ride the next train.
            sync_wait_threshold: max_batch,
            janitor_interval: Duration::from_secs(env_u64(ENV_JANITOR_INTERVAL_SECS, 300)?),
            stale_hold_age: Duration::from_secs(env_u64(ENV_STALE_HOLD_SECS, 600)?),
            max_payload_bytes: env_usize(ENV_MAX_PAYLOAD_BYTES, 512 * 1024)?,
            auth_skew: Duration::from_secs(env_u64(ENV_AUTH_SKEW_SECS, 300)?),
            shutdown_deadline: Duration::from_secs(env_u64(ENV_SHUTDOWN_DEADLINE_SECS, 30)?),
        })
    }
}

fn env_u64(key: &str, default: u64) -> Result<u64> {
    match std::env::var(key) {
        Ok(v) => v
            .parse()
            .with_context(|| format!("{key} is not an unsigned integer: {v}")),
        Err(_) => Ok(default),
    }
}

fn env_usize(key: &str, default: usize) -> Result<usize> {
    match std::env::var(key) {
        Ok(v) => v
            .parse()
            .with_context(|| format!("{key} is not an unsigned integer: {v}")),
        Err(_) => Ok(default),
    }
}
