//! The admission gate.
//!
//! `authenticate` evaluates the checks in a fixed order and refuses with the
//! first failure: credential → enablement/origin → detached signature (when
//! the client demands one) → replay window → daily quota. The predicate reads
//! the client record and consumes quota; it performs no other writes.
//!
//! Replay state (seen nonces) is in-process, matching the stance that the
//! notifier and replay window are local to the admitting process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone, Utc};
use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1};
use sha2::{Digest, Sha256};
use sqlx::PgPool;

pub use txp_store::ClientRow;

// ---------------------------------------------------------------------------
// AuthError
// ---------------------------------------------------------------------------

/// Typed admission refusals, checked in declaration order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Credential unknown, signature invalid, nonce replayed, or timestamp
    /// outside the skew window. The reason stays server-side; callers get
    /// one opaque refusal.
    Unauthenticated(&'static str),
    /// Client disabled or origin not allowed.
    Forbidden(&'static str),
    /// Daily counter exhausted.
    QuotaExceeded,
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::Unauthenticated(reason) => write!(f, "unauthenticated: {}", reason),
            AuthError::Forbidden(reason) => write!(f, "forbidden: {}", reason),
            AuthError::QuotaExceeded => write!(f, "daily quota exceeded"),
        }
    }
}

impl std::error::Error for AuthError {}

// ---------------------------------------------------------------------------
// Request credentials
// ---------------------------------------------------------------------------

/// Credential material extracted from the request headers by the HTTP layer.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub api_key: Option<String>,
    pub signature_hex: Option<String>,
    pub timestamp_ms: Option<String>,
    pub nonce: Option<String>,
    pub origin: Option<String>,
}

/// sha256 hex of the opaque API key; this is the stored lookup key.
pub fn hash_api_key(api_key: &str) -> String {
    hex::encode(Sha256::digest(api_key.as_bytes()))
}

// ---------------------------------------------------------------------------
// NonceCache
// ---------------------------------------------------------------------------

/// In-process replay window. A nonce is accepted at most once per window;
/// entries older than the window are pruned opportunistically.
#[derive(Clone, Default)]
pub struct NonceCache {
    inner: Arc<Mutex<HashMap<String, DateTime<Utc>>>>,
}

impl NonceCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `nonce` at `now`. Returns false when the nonce was already
    /// observed inside the window (a replay).
    pub fn observe(&self, nonce: &str, now: DateTime<Utc>, window: chrono::Duration) -> bool {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(seen_at) = map.get(nonce) {
            if now.signed_duration_since(*seen_at) <= window {
                return false;
            }
        }

        if map.len() >= 4096 {
            map.retain(|_, seen_at| now.signed_duration_since(*seen_at) <= window);
        }

        map.insert(nonce.to_string(), now);
        true
    }
}

// ---------------------------------------------------------------------------
// Authenticator
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Authenticator {
    db: PgPool,
    skew: chrono::Duration,
    nonces: NonceCache,
}

impl Authenticator {
    pub fn new(db: PgPool, skew: Duration) -> Self {
        Self {
            db,
            skew: chrono::Duration::from_std(skew).unwrap_or(chrono::Duration::seconds(300)),
            nonces: NonceCache::new(),
        }
    }

    /// Admit or refuse one request. `body_payload` is the `data` field
    /// exactly as it appeared on the wire (the hex string), which is what
    /// detached signatures cover.
    pub async fn authenticate(
        &self,
        credentials: &Credentials,
        body_payload: &str,
    ) -> Result<ClientRow> {
        let api_key = credentials
            .api_key
            .as_deref()
            .ok_or(AuthError::Unauthenticated("missing API key"))?;

        let client = txp_store::fetch_client_by_key_hash(&self.db, &hash_api_key(api_key))
            .await
            .context("client lookup failed")?
            .ok_or(AuthError::Unauthenticated("unknown API key"))?;

        if client.disabled {
            return Err(AuthError::Forbidden("client disabled").into());
        }

        if let Some(origin) = credentials.origin.as_deref() {
            if !client.allowed_origins.is_empty()
                && !client.allowed_origins.iter().any(|o| o == origin)
            {
                return Err(AuthError::Forbidden("origin not allowed").into());
            }
        }

        if client.require_signature {
            self.verify_detached_signature(&client, credentials, body_payload)?;
        }

        let today = Utc::now().date_naive();
        let consumed = txp_store::consume_daily_quota(&self.db, client.client_id, today)
            .await
            .context("quota update failed")?;

        match consumed {
            Some((used, limit)) => {
                tracing::debug!(client = %client.name, used, limit, "admission quota consumed");
                Ok(client)
            }
            None => Err(AuthError::QuotaExceeded.into()),
        }
    }

    fn verify_detached_signature(
        &self,
        client: &ClientRow,
        credentials: &Credentials,
        body_payload: &str,
    ) -> Result<()> {
        let signature = credentials
            .signature_hex
            .as_deref()
            .ok_or(AuthError::Unauthenticated("missing signature"))?;
        let timestamp = credentials
            .timestamp_ms
            .as_deref()
            .ok_or(AuthError::Unauthenticated("missing timestamp"))?;
        let nonce = credentials
            .nonce
            .as_deref()
            .ok_or(AuthError::Unauthenticated("missing nonce"))?;

        let ts_ms: i64 = timestamp
            .parse()
            .map_err(|_| AuthError::Unauthenticated("timestamp is not an integer"))?;
        let ts = Utc
            .timestamp_millis_opt(ts_ms)
            .single()
            .ok_or(AuthError::Unauthenticated("timestamp out of range"))?;

        let now = Utc::now();
        let age = now.signed_duration_since(ts);
        if age > self.skew || age < -self.skew {
            return Err(AuthError::Unauthenticated("timestamp outside skew window").into());
        }

        if !self.nonces.observe(nonce, now, self.skew) {
            return Err(AuthError::Unauthenticated("nonce replayed").into());
        }

        let signing_payload = format!("{timestamp}{nonce}{body_payload}");

        let current = client
            .pubkey_hex
            .as_deref()
            .ok_or(AuthError::Unauthenticated("client has no public key"))?;

        if verify_detached(current, signing_payload.as_bytes(), signature) {
            return Ok(());
        }

        // Grace window: the prior key stays valid for a configured number of
        // hours after rotation.
        if let (Some(prior), Some(rotated_at)) =
            (client.prior_pubkey_hex.as_deref(), client.key_rotated_at)
        {
            if grace_window_active(rotated_at, client.rotation_grace_hours, now)
                && verify_detached(prior, signing_payload.as_bytes(), signature)
            {
                tracing::info!(client = %client.name, "signature accepted under prior key (grace window)");
                return Ok(());
            }
        }

        Err(AuthError::Unauthenticated("signature verification failed").into())
    }
}

/// Is `now` still inside the post-rotation window during which the prior
/// public key remains accepted?
pub fn grace_window_active(
    rotated_at: DateTime<Utc>,
    grace_hours: i32,
    now: DateTime<Utc>,
) -> bool {
    if grace_hours <= 0 {
        return false;
    }
    now.signed_duration_since(rotated_at) <= chrono::Duration::hours(grace_hours as i64)
}

/// Verify a detached ECDSA signature (DER, hex) over sha256(payload).
pub fn verify_detached(pubkey_hex: &str, payload: &[u8], signature_hex: &str) -> bool {
    let Ok(pubkey_bytes) = hex::decode(pubkey_hex) else {
        return false;
    };
    let Ok(pubkey) = PublicKey::from_slice(&pubkey_bytes) else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(signature_hex) else {
        return false;
    };
    let Ok(signature) = Signature::from_der(&sig_bytes) else {
        return false;
    };

    let digest = Sha256::digest(payload);
    let mut msg = [0u8; 32];
    msg.copy_from_slice(&digest);

    Secp256k1::verification_only()
        .verify_ecdsa(&Message::from_digest(msg), &signature, &pubkey)
        .is_ok()
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
