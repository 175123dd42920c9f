//! In-process scenario tests for the txp-daemon HTTP surface.
//!
//! These tests spin up the Axum router **without** binding a TCP socket:
//! each builds the full service graph around a `FakeAggregator` and drives
//! the router via `tower::ServiceExt::oneshot`. They need a Postgres behind
//! `TXP_DATABASE_URL` and skip when it is absent.
//!
//! Tests that publish contend on the publishing category; `publish_lock()`
//! serializes them within this binary.

use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use secp256k1::{Message, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tower::ServiceExt; // oneshot
use uuid::Uuid;

use txp_config::Settings;
use txp_daemon::{routes, state};
use txp_pool::{NewOutput, OutputCategory, PoolManager};
use txp_testkit::FakeAggregator;

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

fn publish_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

fn test_settings() -> Settings {
    Settings {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        aggregator_url: "http://127.0.0.1:1/unused".to_string(),
        aggregator_token: None,
        publishing_key_hex: "11".repeat(32),
        admin_secret: Some("test-admin-secret".to_string()),
        train_interval: Duration::from_millis(100),
        max_batch: 1000,
        queue_buffer: 10_000,
        broadcast_timeout: Duration::from_secs(5),
        sync_timeout: Duration::from_secs(5),
        sync_wait_threshold: 1000,
        janitor_interval: Duration::from_secs(300),
        stale_hold_age: Duration::from_secs(600),
        max_payload_bytes: 512 * 1024,
        auth_skew: Duration::from_secs(300),
        shutdown_deadline: Duration::from_secs(30),
    }
}

struct Rig {
    router: axum::Router,
    db: sqlx::PgPool,
    pool: PoolManager,
    aggregator: Arc<FakeAggregator>,
    scheduler_task: tokio::task::JoinHandle<()>,
}

async fn rig_with(settings: Settings) -> anyhow::Result<Option<Rig>> {
    if std::env::var(txp_store::ENV_DB_URL).is_err() {
        eprintln!("SKIP: TXP_DATABASE_URL not set");
        return Ok(None);
    }
    let db = txp_store::testkit_db_pool().await?;
    let aggregator = Arc::new(FakeAggregator::new());

    let (shared, scheduler) = state::wire(
        settings,
        db.clone(),
        Arc::clone(&aggregator) as Arc<dyn txp_aggregator::Aggregator>,
    )?;
    let scheduler_task = tokio::spawn(scheduler.run());

    Ok(Some(Rig {
        router: routes::build_router(Arc::clone(&shared)),
        db,
        pool: shared.pool.clone(),
        aggregator,
        scheduler_task,
    }))
}

async fn rig() -> anyhow::Result<Option<Rig>> {
    rig_with(test_settings()).await
}

/// Drive the router with a single request and return (status, body JSON).
async fn call(
    router: &axum::Router,
    req: Request<Body>,
) -> (StatusCode, serde_json::Value) {
    let resp = router.clone().oneshot(req).await.expect("oneshot failed");
    let status = resp.status();
    let body = resp
        .into_body()
        .collect()
        .await
        .expect("body collect failed")
        .to_bytes();
    let json = if body.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or(serde_json::Value::Null)
    };
    (status, json)
}

fn publish_request(api_key: &str, data_hex: &str, wait: bool) -> Request<Body> {
    let uri = if wait { "/publish?wait=true" } else { "/publish" };
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-api-key", api_key)
        .body(Body::from(format!("{{\"data\":\"{data_hex}\"}}")))
        .unwrap()
}

/// Insert a client directly and return its API key.
async fn seed_client(
    db: &sqlx::PgPool,
    require_signature: bool,
    pubkey_hex: Option<String>,
) -> anyhow::Result<String> {
    let api_key = format!("test_{}", Uuid::new_v4().simple());
    let client = txp_store::NewClient {
        client_id: Uuid::new_v4(),
        name: format!("client-{}", Uuid::new_v4().simple()),
        api_key_hash: txp_auth::hash_api_key(&api_key),
        pubkey_hex,
        tier: "standard".to_string(),
        require_signature,
        allowed_origins: Vec::new(),
        daily_limit: 10_000,
    };
    txp_store::insert_client(db, &client).await?;
    Ok(api_key)
}

async fn seed_output(pool: &PoolManager) -> anyhow::Result<String> {
    let output = NewOutput {
        txid: format!("{}{}", Uuid::new_v4().simple(), Uuid::new_v4().simple()),
        vout: 0,
        value_satoshis: 550,
        locking_script: vec![0x51],
        category: OutputCategory::Publishing,
    };
    pool.register(&output).await?;
    Ok(output.outpoint())
}

// ---------------------------------------------------------------------------
// GET /health
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_reports_pool_and_queue_counters() -> anyhow::Result<()> {
    let Some(rig) = rig().await? else { return Ok(()) };

    let req = Request::builder()
        .method("GET")
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let (status, json) = call(&rig.router, req).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["ok"], true);
    assert_eq!(json["service"], "txp-daemon");
    assert!(json["pool"].is_array());
    assert_eq!(json["queue_depth"], 0);
    assert_eq!(json["queue_capacity"], 10_000);

    rig.scheduler_task.abort();
    Ok(())
}

// ---------------------------------------------------------------------------
// POST /publish — refusals
// ---------------------------------------------------------------------------

#[tokio::test]
async fn publish_without_credentials_is_401() -> anyhow::Result<()> {
    let Some(rig) = rig().await? else { return Ok(()) };

    let req = Request::builder()
        .method("POST")
        .uri("/publish")
        .header("content-type", "application/json")
        .body(Body::from(r#"{"data":"00"}"#))
        .unwrap();
    let (status, json) = call(&rig.router, req).await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(json["error"].as_str().unwrap().contains("unauthenticated"));

    rig.scheduler_task.abort();
    Ok(())
}

#[tokio::test]
async fn publish_with_unknown_key_is_401() -> anyhow::Result<()> {
    let Some(rig) = rig().await? else { return Ok(()) };

    let (status, _) = call(&rig.router, publish_request("not-a-key", "00", false)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    rig.scheduler_task.abort();
    Ok(())
}

#[tokio::test]
async fn publish_with_malformed_body_or_hex_is_400() -> anyhow::Result<()> {
    let Some(rig) = rig().await? else { return Ok(()) };
    let api_key = seed_client(&rig.db, false, None).await?;

    let req = Request::builder()
        .method("POST")
        .uri("/publish")
        .header("content-type", "application/json")
        .header("x-api-key", &api_key)
        .body(Body::from("not json"))
        .unwrap();
    let (status, _) = call(&rig.router, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, json) = call(&rig.router, publish_request(&api_key, "zz-not-hex", false)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("hex"));

    rig.scheduler_task.abort();
    Ok(())
}

#[tokio::test]
async fn publish_oversized_payload_is_413() -> anyhow::Result<()> {
    let mut settings = test_settings();
    settings.max_payload_bytes = 16;
    let Some(rig) = rig_with(settings).await? else { return Ok(()) };
    let _guard = publish_lock().lock().await;

    let api_key = seed_client(&rig.db, false, None).await?;

    // Drain leftovers so the handler acquires exactly the seeded output.
    let parked = rig
        .pool
        .acquire_batch(OutputCategory::Publishing, 1_000_000)
        .await?;
    let outpoint = seed_output(&rig.pool).await?;

    let data_hex = "ab".repeat(17); // 17 bytes > 16 byte ceiling
    let (status, json) = call(&rig.router, publish_request(&api_key, &data_hex, false)).await;
    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert!(json["error"].as_str().unwrap().contains("ceiling"));

    // The hold was released on the refusal path.
    let row = txp_store::fetch_output(&rig.db, &outpoint).await?.unwrap();
    assert_eq!(row.status, txp_pool::OutputStatus::Available);

    for output in parked {
        rig.pool.release(&output.outpoint).await?;
    }

    rig.scheduler_task.abort();
    Ok(())
}

#[tokio::test]
async fn publish_with_empty_pool_is_503() -> anyhow::Result<()> {
    let Some(rig) = rig().await? else { return Ok(()) };
    let _guard = publish_lock().lock().await;

    let api_key = seed_client(&rig.db, false, None).await?;

    // Hold everything available so the category is exhausted.
    let parked = rig
        .pool
        .acquire_batch(OutputCategory::Publishing, 1_000_000)
        .await?;

    let (status, json) = call(&rig.router, publish_request(&api_key, "00", false)).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(json["error"].as_str().unwrap().contains("available"));

    for output in parked {
        rig.pool.release(&output.outpoint).await?;
    }

    rig.scheduler_task.abort();
    Ok(())
}

// ---------------------------------------------------------------------------
// POST /publish — admission paths
// ---------------------------------------------------------------------------

#[tokio::test]
async fn publish_async_returns_202_and_resolves_via_status() -> anyhow::Result<()> {
    let Some(rig) = rig().await? else { return Ok(()) };
    let _guard = publish_lock().lock().await;

    let api_key = seed_client(&rig.db, false, None).await?;
    seed_output(&rig.pool).await?;

    let (status, json) = call(&rig.router, publish_request(&api_key, "48656c6c6f", false)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["status"], "pending");
    let handle = json["handle"].as_str().unwrap().to_string();

    // Poll until the train delivers.
    let mut last = serde_json::Value::Null;
    for _ in 0..100 {
        let req = Request::builder()
            .method("GET")
            .uri(format!("/status/{handle}"))
            .body(Body::empty())
            .unwrap();
        let (status, json) = call(&rig.router, req).await;
        assert_eq!(status, StatusCode::OK);
        last = json;
        if last["status"] == "success" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    assert_eq!(last["status"], "success");
    assert_eq!(last["aggregator_status"], "seen-on-network");
    assert!(last["txid"].as_str().unwrap().len() == 64);

    rig.scheduler_task.abort();
    Ok(())
}

#[tokio::test]
async fn publish_sync_happy_path_returns_201_with_txid() -> anyhow::Result<()> {
    let Some(rig) = rig().await? else { return Ok(()) };
    let _guard = publish_lock().lock().await;

    let api_key = seed_client(&rig.db, false, None).await?;
    seed_output(&rig.pool).await?;

    let (status, json) = call(&rig.router, publish_request(&api_key, "48656c6c6f", true)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(json["status"], "success");
    assert_eq!(json["aggregator_status"], "seen-on-network");
    assert_eq!(json["txid"].as_str().unwrap().len(), 64);

    rig.scheduler_task.abort();
    Ok(())
}

#[tokio::test]
async fn publish_sync_upstream_failure_is_502() -> anyhow::Result<()> {
    let Some(rig) = rig().await? else { return Ok(()) };
    let _guard = publish_lock().lock().await;

    rig.aggregator.fail_with("aggregator exploded");

    let api_key = seed_client(&rig.db, false, None).await?;
    seed_output(&rig.pool).await?;

    let (status, json) = call(&rig.router, publish_request(&api_key, "00", true)).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(json["error"].as_str().unwrap().contains("aggregator"));

    rig.scheduler_task.abort();
    Ok(())
}

#[tokio::test]
async fn publish_sync_timeout_degrades_to_202_processing() -> anyhow::Result<()> {
    let mut settings = test_settings();
    settings.sync_timeout = Duration::from_millis(200);
    let Some(rig) = rig_with(settings).await? else { return Ok(()) };
    let _guard = publish_lock().lock().await;

    // The verdict lands well after the caller's bound.
    rig.aggregator.set_delay(Duration::from_millis(600));

    let api_key = seed_client(&rig.db, false, None).await?;
    seed_output(&rig.pool).await?;

    let (status, json) = call(&rig.router, publish_request(&api_key, "00", true)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["status"], "processing");
    let handle: Uuid = json["handle"].as_str().unwrap().parse()?;

    // The record later reflects the verdict.
    let mut resolved = false;
    for _ in 0..100 {
        if let Some(row) = txp_store::fetch_request(&rig.db, handle).await? {
            if row.status.is_terminal() {
                assert_eq!(row.status, txp_store::RequestStatus::Success);
                resolved = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(resolved, "record resolves after the inline wait expired");

    rig.scheduler_task.abort();
    Ok(())
}

// ---------------------------------------------------------------------------
// Detached signatures
// ---------------------------------------------------------------------------

fn sign_payload(secret: &SecretKey, timestamp: &str, nonce: &str, data_hex: &str) -> String {
    let payload = format!("{timestamp}{nonce}{data_hex}");
    let digest = Sha256::digest(payload.as_bytes());
    let mut msg = [0u8; 32];
    msg.copy_from_slice(&digest);
    let sig = Secp256k1::new().sign_ecdsa(&Message::from_digest(msg), secret);
    hex::encode(sig.serialize_der())
}

#[tokio::test]
async fn signature_required_client_is_enforced() -> anyhow::Result<()> {
    let Some(rig) = rig().await? else { return Ok(()) };
    let _guard = publish_lock().lock().await;

    let secret = SecretKey::from_slice(&[9u8; 32])?;
    let pubkey_hex = hex::encode(
        secp256k1::PublicKey::from_secret_key(&Secp256k1::new(), &secret).serialize(),
    );
    let api_key = seed_client(&rig.db, true, Some(pubkey_hex)).await?;
    seed_output(&rig.pool).await?;

    // Missing signature headers → 401.
    let (status, _) = call(&rig.router, publish_request(&api_key, "00", false)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Correctly signed → admitted.
    let data_hex = "48656c6c6f";
    let timestamp = chrono::Utc::now().timestamp_millis().to_string();
    let nonce = Uuid::new_v4().to_string();
    let signature = sign_payload(&secret, &timestamp, &nonce, data_hex);

    let req = Request::builder()
        .method("POST")
        .uri("/publish")
        .header("content-type", "application/json")
        .header("x-api-key", &api_key)
        .header("x-signature", &signature)
        .header("x-timestamp", &timestamp)
        .header("x-nonce", &nonce)
        .body(Body::from(format!("{{\"data\":\"{data_hex}\"}}")))
        .unwrap();
    let (status, json) = call(&rig.router, req).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    // Replaying the same nonce is refused and mutates nothing.
    let handle = json["handle"].as_str().unwrap();
    let req = Request::builder()
        .method("POST")
        .uri("/publish")
        .header("content-type", "application/json")
        .header("x-api-key", &api_key)
        .header("x-signature", &signature)
        .header("x-timestamp", &timestamp)
        .header("x-nonce", &nonce)
        .body(Body::from(format!("{{\"data\":\"{data_hex}\"}}")))
        .unwrap();
    let (status, json) = call(&rig.router, req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(json["error"].as_str().unwrap().contains("unauthenticated"));
    assert!(handle.parse::<Uuid>().is_ok());

    rig.scheduler_task.abort();
    Ok(())
}

// ---------------------------------------------------------------------------
// GET /status/{handle}
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_handle_is_404_and_malformed_is_400() -> anyhow::Result<()> {
    let Some(rig) = rig().await? else { return Ok(()) };

    let req = Request::builder()
        .method("GET")
        .uri(format!("/status/{}", Uuid::new_v4()))
        .body(Body::empty())
        .unwrap();
    let (status, json) = call(&rig.router, req).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json["error"].as_str().unwrap().contains("unknown handle"));

    let req = Request::builder()
        .method("GET")
        .uri("/status/not-a-handle")
        .body(Body::empty())
        .unwrap();
    let (status, _) = call(&rig.router, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    rig.scheduler_task.abort();
    Ok(())
}

// ---------------------------------------------------------------------------
// POST /admin/clients
// ---------------------------------------------------------------------------

#[tokio::test]
async fn admin_provisioning_requires_the_shared_secret() -> anyhow::Result<()> {
    let Some(rig) = rig().await? else { return Ok(()) };

    let body = format!(
        r#"{{"name":"admin-made-{}","daily_limit":50}}"#,
        Uuid::new_v4().simple()
    );

    // No secret → 403.
    let req = Request::builder()
        .method("POST")
        .uri("/admin/clients")
        .header("content-type", "application/json")
        .body(Body::from(body.clone()))
        .unwrap();
    let (status, _) = call(&rig.router, req).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Correct secret → 201 with a usable key.
    let req = Request::builder()
        .method("POST")
        .uri("/admin/clients")
        .header("content-type", "application/json")
        .header("x-admin-secret", "test-admin-secret")
        .body(Body::from(body))
        .unwrap();
    let (status, json) = call(&rig.router, req).await;
    assert_eq!(status, StatusCode::CREATED);
    let api_key = json["api_key"].as_str().unwrap().to_string();
    assert!(api_key.starts_with("txp_"));

    // The fresh key authenticates (it may then hit other refusals, but
    // never 401).
    let (status, _) = call(&rig.router, publish_request(&api_key, "00", false)).await;
    assert_ne!(status, StatusCode::UNAUTHORIZED);

    rig.scheduler_task.abort();
    Ok(())
}
