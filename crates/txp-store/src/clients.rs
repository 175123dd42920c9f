//! Client records: credentials, signing keys, origins, quotas.

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ClientRow {
    pub client_id: Uuid,
    pub name: String,
    pub api_key_hash: String,
    pub pubkey_hex: Option<String>,
    pub prior_pubkey_hex: Option<String>,
    pub key_rotated_at: Option<DateTime<Utc>>,
    pub rotation_grace_hours: i32,
    pub tier: String,
    pub require_signature: bool,
    pub allowed_origins: Vec<String>,
    pub daily_limit: i64,
    pub used_today: i64,
    pub counter_reset_date: NaiveDate,
    pub disabled: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewClient {
    pub client_id: Uuid,
    pub name: String,
    pub api_key_hash: String,
    pub pubkey_hex: Option<String>,
    pub tier: String,
    pub require_signature: bool,
    pub allowed_origins: Vec<String>,
    pub daily_limit: i64,
}

const CLIENT_COLUMNS: &str = "client_id, name, api_key_hash, pubkey_hex, prior_pubkey_hex, \
                              key_rotated_at, rotation_grace_hours, tier, require_signature, \
                              allowed_origins, daily_limit, used_today, counter_reset_date, \
                              disabled, created_at";

fn client_from_row(row: &PgRow) -> Result<ClientRow> {
    Ok(ClientRow {
        client_id: row.try_get("client_id")?,
        name: row.try_get("name")?,
        api_key_hash: row.try_get("api_key_hash")?,
        pubkey_hex: row.try_get("pubkey_hex")?,
        prior_pubkey_hex: row.try_get("prior_pubkey_hex")?,
        key_rotated_at: row.try_get("key_rotated_at")?,
        rotation_grace_hours: row.try_get("rotation_grace_hours")?,
        tier: row.try_get("tier")?,
        require_signature: row.try_get("require_signature")?,
        allowed_origins: row.try_get("allowed_origins")?,
        daily_limit: row.try_get("daily_limit")?,
        used_today: row.try_get("used_today")?,
        counter_reset_date: row.try_get("counter_reset_date")?,
        disabled: row.try_get("disabled")?,
        created_at: row.try_get("created_at")?,
    })
}

pub async fn insert_client(pool: &PgPool, client: &NewClient) -> Result<()> {
    sqlx::query(
        r#"
        insert into clients (
            client_id, name, api_key_hash, pubkey_hex, tier,
            require_signature, allowed_origins, daily_limit
        ) values ($1, $2, $3, $4, $5, $6, $7, $8)
        "#,
    )
    .bind(client.client_id)
    .bind(&client.name)
    .bind(&client.api_key_hash)
    .bind(&client.pubkey_hex)
    .bind(&client.tier)
    .bind(client.require_signature)
    .bind(&client.allowed_origins)
    .bind(client.daily_limit)
    .execute(pool)
    .await
    .context("insert_client failed")?;

    Ok(())
}

/// The credential hash is the admission lookup key (unique index).
pub async fn fetch_client_by_key_hash(
    pool: &PgPool,
    api_key_hash: &str,
) -> Result<Option<ClientRow>> {
    let row = sqlx::query(&format!(
        "select {CLIENT_COLUMNS} from clients where api_key_hash = $1"
    ))
    .bind(api_key_hash)
    .fetch_optional(pool)
    .await
    .context("fetch_client_by_key_hash failed")?;

    row.as_ref().map(client_from_row).transpose()
}

/// Rotate the signing key: the current key becomes the prior key and stays
/// valid for the client's grace window, stamped from the rotation moment.
pub async fn rotate_client_key(pool: &PgPool, name: &str, new_pubkey_hex: &str) -> Result<bool> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        update clients
           set prior_pubkey_hex = pubkey_hex,
               pubkey_hex       = $2,
               key_rotated_at   = now()
         where name = $1
        returning client_id
        "#,
    )
    .bind(name)
    .bind(new_pubkey_hex)
    .fetch_optional(pool)
    .await
    .context("rotate_client_key failed")?;

    Ok(row.is_some())
}

pub async fn set_daily_limit(pool: &PgPool, name: &str, daily_limit: i64) -> Result<bool> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        update clients
           set daily_limit = $2
         where name = $1
        returning client_id
        "#,
    )
    .bind(name)
    .bind(daily_limit)
    .fetch_optional(pool)
    .await
    .context("set_daily_limit failed")?;

    Ok(row.is_some())
}

/// Take one unit of today's quota in a single conditional update.
///
/// The counter resets lazily when `today` differs from the stored reset date,
/// and increments only while strictly under `daily_limit` — so a refused
/// admission never burns quota and the counter cannot grow past the limit.
/// Returns `Some((used_today, daily_limit))` on success, `None` when the
/// quota is exhausted.
pub async fn consume_daily_quota(
    pool: &PgPool,
    client_id: Uuid,
    today: NaiveDate,
) -> Result<Option<(i64, i64)>> {
    let row: Option<(i64, i64)> = sqlx::query_as(
        r#"
        update clients
           set used_today = case when counter_reset_date = $2 then used_today + 1 else 1 end,
               counter_reset_date = $2
         where client_id = $1
           and (case when counter_reset_date = $2 then used_today else 0 end) < daily_limit
        returning used_today, daily_limit
        "#,
    )
    .bind(client_id)
    .bind(today)
    .fetch_optional(pool)
    .await
    .context("consume_daily_quota failed")?;

    Ok(row)
}
