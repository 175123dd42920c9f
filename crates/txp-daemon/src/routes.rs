//! Axum router and all HTTP handlers for txp-daemon.
//!
//! `build_router` is the single entry point; `main.rs` calls it and attaches
//! middleware layers. All handlers are `pub(crate)` so the scenario tests in
//! `tests/` can compose the router directly.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header::ORIGIN, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use tracing::info;
use uuid::Uuid;

use txp_assembler::{assemble, PrevOutput};
use txp_auth::{hash_api_key, Credentials};
use txp_coordinator::Admitted;
use txp_pool::OutputCategory;
use txp_store::NewClient;

use crate::{
    api_types::{
        CreateClientRequest, CreateClientResponse, HealthResponse, PoolCounter, PublishBody,
        PublishParams, PublishResponse, StatusResponse,
    },
    error::{bad_request, forbidden, not_found, refusal_response, upstream_failed},
    state::AppState,
};

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Build the complete application router wired to the given shared state.
///
/// Middleware layers (CORS, tracing) are **not** applied here; `main.rs`
/// attaches them after this call so tests can use the bare router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/publish", post(publish))
        .route("/status/:handle", get(status_handler))
        .route("/health", get(health))
        .route("/admin/clients", post(admin_create_client))
        .with_state(state)
}

// ---------------------------------------------------------------------------
// POST /publish
// ---------------------------------------------------------------------------

/// Admit one payload for broadcast.
///
/// `?wait=true` blocks for the verdict up to the sync bound; the response is
/// 201 on an inline success, 202 when the request is queued (async admission,
/// degraded sync admission, or an expired sync wait), and a taxonomy code on
/// refusal. The output hold is always resolved before an error returns.
pub(crate) async fn publish(
    State(st): State<Arc<AppState>>,
    Query(params): Query<PublishParams>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let Ok(parsed) = serde_json::from_slice::<PublishBody>(&body) else {
        return bad_request("body must be JSON: {\"data\": \"<hex payload>\"}");
    };

    let credentials = credentials_from_headers(&headers);
    let client = match st.auth.authenticate(&credentials, &parsed.data).await {
        Ok(client) => client,
        Err(err) => return refusal_response(err),
    };

    let Ok(payload) = hex::decode(parsed.data.trim()) else {
        return bad_request("data is not valid hex");
    };

    let output = match st.pool.acquire(OutputCategory::Publishing).await {
        Ok(output) => output,
        Err(err) => return refusal_response(err),
    };

    let prev = PrevOutput {
        txid: output.txid.clone(),
        vout: output.vout as u32,
        value_satoshis: output.value_satoshis as u64,
        locking_script: output.locking_script.clone(),
    };

    let assembled = match assemble(&prev, &payload, &st.signing_key, st.settings.max_payload_bytes)
    {
        Ok(assembled) => assembled,
        Err(err) => {
            release_hold_on_error(&st, &output.outpoint).await;
            return refusal_response(err);
        }
    };

    let wait = params.wait.unwrap_or(false);
    let admitted = match st
        .coordinator
        .admit(assembled.raw_tx, output.outpoint.clone(), wait)
        .await
    {
        Ok(admitted) => admitted,
        Err(err) => {
            release_hold_on_error(&st, &output.outpoint).await;
            return refusal_response(err);
        }
    };

    info!(client = %client.name, txid = %assembled.txid, wait, "payload admitted");

    match admitted {
        Admitted::Resolved { handle, result } => {
            if result.is_success() {
                (
                    StatusCode::CREATED,
                    Json(PublishResponse {
                        handle,
                        status: "success".to_string(),
                        txid: result.txid,
                        aggregator_status: Some(result.aggregator_status),
                    }),
                )
                    .into_response()
            } else {
                upstream_failed(
                    result
                        .error
                        .unwrap_or_else(|| "aggregator refused the transaction".to_string()),
                )
            }
        }
        Admitted::TimedOut { handle } => (
            StatusCode::ACCEPTED,
            Json(PublishResponse {
                handle,
                status: "processing".to_string(),
                txid: None,
                aggregator_status: None,
            }),
        )
            .into_response(),
        Admitted::Queued { handle, .. } => (
            StatusCode::ACCEPTED,
            Json(PublishResponse {
                handle,
                status: "pending".to_string(),
                txid: None,
                aggregator_status: None,
            }),
        )
            .into_response(),
    }
}

/// A failed admission must never leave its output held.
async fn release_hold_on_error(st: &AppState, outpoint: &str) {
    if let Err(err) = st.pool.release(outpoint).await {
        tracing::error!(outpoint, error = %err, "failed to release hold after admission error");
    }
}

fn credentials_from_headers(headers: &HeaderMap) -> Credentials {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    };

    Credentials {
        api_key: header("x-api-key"),
        signature_hex: header("x-signature"),
        timestamp_ms: header("x-timestamp"),
        nonce: header("x-nonce"),
        origin: headers
            .get(ORIGIN)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
    }
}

// ---------------------------------------------------------------------------
// GET /status/{handle}
// ---------------------------------------------------------------------------

pub(crate) async fn status_handler(
    State(st): State<Arc<AppState>>,
    Path(handle): Path<Uuid>,
) -> Response {
    match st.coordinator.lookup(handle).await {
        Ok(Some(row)) => (
            StatusCode::OK,
            Json(StatusResponse {
                handle: row.handle,
                status: row.status.as_str().to_string(),
                txid: row.txid,
                aggregator_status: row.aggregator_status,
                error: row.error,
                created_at: row.created_at,
                updated_at: row.updated_at,
            }),
        )
            .into_response(),
        Ok(None) => not_found("unknown handle"),
        Err(err) => refusal_response(err),
    }
}

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

pub(crate) async fn health(State(st): State<Arc<AppState>>) -> Response {
    let (queue_depth, queue_capacity) = st.coordinator.queue_counters();

    let (ok, pool) = match st.pool.stats().await {
        Ok(rows) => (
            true,
            rows.into_iter()
                .map(|(category, status, count)| PoolCounter {
                    category,
                    status,
                    count,
                })
                .collect(),
        ),
        Err(err) => {
            tracing::error!(error = %err, "health probe could not read pool counters");
            (false, Vec::new())
        }
    };

    (
        StatusCode::OK,
        Json(HealthResponse {
            ok,
            service: st.build.service.to_string(),
            version: st.build.version.to_string(),
            pool,
            queue_depth,
            queue_capacity,
        }),
    )
        .into_response()
}

// ---------------------------------------------------------------------------
// POST /admin/clients
// ---------------------------------------------------------------------------

/// Provision a client. Gated by the shared admin secret; the generated API
/// key is returned exactly once and only its hash is stored.
pub(crate) async fn admin_create_client(
    State(st): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateClientRequest>,
) -> Response {
    let Some(expected) = st.settings.admin_secret.as_deref() else {
        return forbidden("admin interface disabled");
    };
    let presented = headers
        .get("x-admin-secret")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if presented != expected {
        return forbidden("bad admin secret");
    }

    let api_key = format!(
        "txp_{}{}",
        Uuid::new_v4().simple(),
        Uuid::new_v4().simple()
    );

    let client = NewClient {
        client_id: Uuid::new_v4(),
        name: body.name.clone(),
        api_key_hash: hash_api_key(&api_key),
        pubkey_hex: body.pubkey_hex,
        tier: body.tier,
        require_signature: body.require_signature,
        allowed_origins: body.allowed_origins,
        daily_limit: body.daily_limit,
    };

    match txp_store::insert_client(&st.db, &client).await {
        Ok(()) => {
            info!(client = %client.name, tier = %client.tier, "client provisioned");
            (
                StatusCode::CREATED,
                Json(CreateClientResponse {
                    client_id: client.client_id,
                    api_key,
                }),
            )
                .into_response()
        }
        Err(err) => bad_request(format!("could not create client: {err}")),
    }
}
