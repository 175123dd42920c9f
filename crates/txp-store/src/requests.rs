//! Request rows: one per admitted submission.
//!
//! Legal transitions: `pending → processing → {success, mined, failed}`.
//! Terminal rows are immutable except for the `success → mined` refinement;
//! re-applying the same terminal status is a silent no-op.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Processing,
    Success,
    Mined,
    Failed,
}

impl RequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Processing => "processing",
            RequestStatus::Success => "success",
            RequestStatus::Mined => "mined",
            RequestStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(RequestStatus::Pending),
            "processing" => Ok(RequestStatus::Processing),
            "success" => Ok(RequestStatus::Success),
            "mined" => Ok(RequestStatus::Mined),
            "failed" => Ok(RequestStatus::Failed),
            other => Err(anyhow!("invalid request status: {}", other)),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Success | RequestStatus::Mined | RequestStatus::Failed
        )
    }
}

#[derive(Debug, Clone)]
pub struct RequestRow {
    pub handle: Uuid,
    pub raw_tx: Vec<u8>,
    pub outpoint_used: String,
    pub status: RequestStatus,
    pub txid: Option<String>,
    pub aggregator_status: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Terminal (or refining) outcome applied by the scheduler.
#[derive(Debug, Clone)]
pub struct RequestOutcome {
    pub status: RequestStatus,
    pub txid: Option<String>,
    pub aggregator_status: Option<String>,
    pub error: Option<String>,
}

const REQUEST_COLUMNS: &str =
    "handle, raw_tx, outpoint_used, status, txid, aggregator_status, error, created_at, updated_at";

fn request_from_row(row: &PgRow) -> Result<RequestRow> {
    Ok(RequestRow {
        handle: row.try_get("handle")?,
        raw_tx: row.try_get("raw_tx")?,
        outpoint_used: row.try_get("outpoint_used")?,
        status: RequestStatus::parse(&row.try_get::<String, _>("status")?)?,
        txid: row.try_get("txid")?,
        aggregator_status: row.try_get("aggregator_status")?,
        error: row.try_get("error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub async fn insert_request(
    pool: &PgPool,
    handle: Uuid,
    raw_tx: &[u8],
    outpoint_used: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        insert into requests (handle, raw_tx, outpoint_used, status)
        values ($1, $2, $3, 'pending')
        "#,
    )
    .bind(handle)
    .bind(raw_tx)
    .bind(outpoint_used)
    .execute(pool)
    .await
    .context("insert_request failed")?;

    Ok(())
}

/// Remove an admission whose enqueue was refused. Only `pending` rows may be
/// deleted; anything else has already been picked up by a train.
pub async fn delete_request(pool: &PgPool, handle: Uuid) -> Result<bool> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        delete from requests
        where handle = $1
          and status = 'pending'
        returning handle
        "#,
    )
    .bind(handle)
    .fetch_optional(pool)
    .await
    .context("delete_request failed")?;

    Ok(row.is_some())
}

pub async fn fetch_request(pool: &PgPool, handle: Uuid) -> Result<Option<RequestRow>> {
    let row = sqlx::query(&format!(
        "select {REQUEST_COLUMNS} from requests where handle = $1"
    ))
    .bind(handle)
    .fetch_optional(pool)
    .await
    .context("fetch_request failed")?;

    row.as_ref().map(request_from_row).transpose()
}

/// `pending → processing` for a departed batch. Rows already past `pending`
/// are left alone. Returns the number of rows transitioned.
pub async fn mark_processing(pool: &PgPool, handles: &[Uuid]) -> Result<u64> {
    let res = sqlx::query(
        r#"
        update requests
           set status     = 'processing',
               updated_at = now()
         where handle = any($1)
           and status = 'pending'
        "#,
    )
    .bind(handles)
    .execute(pool)
    .await
    .context("mark_processing failed")?;

    Ok(res.rows_affected())
}

/// Apply a terminal outcome in one guarded write.
///
/// The WHERE clause encodes the transition DAG:
/// - non-terminal rows accept any outcome;
/// - `success` may refine to `mined`;
/// - re-applying the current terminal status is accepted (idempotent replay);
/// - every other write is silently refused (returns false).
pub async fn apply_outcome(pool: &PgPool, handle: Uuid, outcome: &RequestOutcome) -> Result<bool> {
    let row: Option<(Uuid,)> = sqlx::query_as(
        r#"
        update requests
           set status            = $2,
               txid              = coalesce($3, txid),
               aggregator_status = coalesce($4, aggregator_status),
               error             = coalesce($5, error),
               updated_at        = now()
         where handle = $1
           and (
                status in ('pending', 'processing')
                or (status = 'success' and $2 = 'mined')
                or status = $2
           )
        returning handle
        "#,
    )
    .bind(handle)
    .bind(outcome.status.as_str())
    .bind(&outcome.txid)
    .bind(&outcome.aggregator_status)
    .bind(&outcome.error)
    .fetch_optional(pool)
    .await
    .context("apply_outcome failed")?;

    Ok(row.is_some())
}
