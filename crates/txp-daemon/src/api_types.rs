//! Request and response types for all txp-daemon HTTP endpoints.
//!
//! These types are `Serialize + Deserialize` so they can be JSON-encoded
//! by Axum and decoded by tests. No business logic lives here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// POST /publish
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishBody {
    /// Hex-encoded opaque payload.
    pub data: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PublishParams {
    /// `?wait=true` blocks for the on-network verdict up to the sync bound.
    #[serde(default)]
    pub wait: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublishResponse {
    pub handle: Uuid,
    /// "success" | "processing" | "pending"
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub txid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregator_status: Option<String>,
}

// ---------------------------------------------------------------------------
// GET /status/{handle}
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub handle: Uuid,
    pub status: String,
    pub txid: Option<String>,
    pub aggregator_status: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolCounter {
    pub category: String,
    pub status: String,
    pub count: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: String,
    pub version: String,
    pub pool: Vec<PoolCounter>,
    pub queue_depth: usize,
    pub queue_capacity: usize,
}

// ---------------------------------------------------------------------------
// POST /admin/clients
// ---------------------------------------------------------------------------

fn default_tier() -> String {
    "standard".to_string()
}

fn default_daily_limit() -> i64 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateClientRequest {
    pub name: String,
    #[serde(default = "default_tier")]
    pub tier: String,
    #[serde(default = "default_daily_limit")]
    pub daily_limit: i64,
    #[serde(default)]
    pub require_signature: bool,
    #[serde(default)]
    pub pubkey_hex: Option<String>,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateClientResponse {
    pub client_id: Uuid,
    /// Shown exactly once; only its hash is stored.
    pub api_key: String,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}
