//! Output rows and their guarded transitions.
//!
//! Every status change goes through a single conditional UPDATE so that two
//! concurrent callers can never both win the same row. The legal transitions
//! are `available→held→{available, spent}`; `spent` is terminal. Callers that
//! need the DAG enforced with typed refusals should go through
//! `txp_pool::PoolManager` rather than calling these directly.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputCategory {
    Funding,
    Publishing,
    Change,
}

impl OutputCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputCategory::Funding => "funding",
            OutputCategory::Publishing => "publishing",
            OutputCategory::Change => "change",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "funding" => Ok(OutputCategory::Funding),
            "publishing" => Ok(OutputCategory::Publishing),
            "change" => Ok(OutputCategory::Change),
            other => Err(anyhow!("invalid output category: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStatus {
    Available,
    Held,
    Spent,
}

impl OutputStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputStatus::Available => "available",
            OutputStatus::Held => "held",
            OutputStatus::Spent => "spent",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "available" => Ok(OutputStatus::Available),
            "held" => Ok(OutputStatus::Held),
            "spent" => Ok(OutputStatus::Spent),
            other => Err(anyhow!("invalid output status: {}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OutputRow {
    pub outpoint: String,
    pub txid: String,
    pub vout: i32,
    pub value_satoshis: i64,
    pub locking_script: Vec<u8>,
    pub category: OutputCategory,
    pub status: OutputStatus,
    pub held_at: Option<DateTime<Utc>>,
    pub spent_at: Option<DateTime<Utc>>,
    pub spent_in_txid: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewOutput {
    pub txid: String,
    pub vout: i32,
    pub value_satoshis: i64,
    pub locking_script: Vec<u8>,
    pub category: OutputCategory,
}

impl NewOutput {
    pub fn outpoint(&self) -> String {
        format!("{}:{}", self.txid, self.vout)
    }
}

const OUTPUT_COLUMNS: &str = "outpoint, txid, vout, value_satoshis, locking_script, category, \
                              status, held_at, spent_at, spent_in_txid, created_at, updated_at";

fn output_from_row(row: &PgRow) -> Result<OutputRow> {
    Ok(OutputRow {
        outpoint: row.try_get("outpoint")?,
        txid: row.try_get("txid")?,
        vout: row.try_get("vout")?,
        value_satoshis: row.try_get("value_satoshis")?,
        locking_script: row.try_get("locking_script")?,
        category: OutputCategory::parse(&row.try_get::<String, _>("category")?)?,
        status: OutputStatus::parse(&row.try_get::<String, _>("status")?)?,
        held_at: row.try_get("held_at")?,
        spent_at: row.try_get("spent_at")?,
        spent_in_txid: row.try_get("spent_in_txid")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

/// Atomically take an exclusive hold on the oldest available output of one
/// category. Returns `None` when the available subset is empty.
///
/// `FOR UPDATE SKIP LOCKED` makes concurrent acquirers skip rows another
/// transaction is claiming, so no two callers ever hold the same outpoint.
pub async fn acquire_available(
    pool: &PgPool,
    category: OutputCategory,
) -> Result<Option<OutputRow>> {
    let row = sqlx::query(&format!(
        r#"
        with to_hold as (
            select outpoint
            from outputs
            where status = 'available'
              and category = $1
            order by created_at asc, outpoint asc
            limit 1
            for update skip locked
        )
        update outputs
           set status     = 'held',
               held_at    = now(),
               updated_at = now()
         where outpoint in (select outpoint from to_hold)
        returning {OUTPUT_COLUMNS}
        "#
    ))
    .bind(category.as_str())
    .fetch_optional(pool)
    .await
    .context("acquire_available failed")?;

    row.as_ref().map(output_from_row).transpose()
}

/// Best-effort batch acquisition: holds up to `n` outputs, oldest first.
/// Returns fewer (possibly zero) when the available subset is smaller.
pub async fn acquire_available_batch(
    pool: &PgPool,
    category: OutputCategory,
    n: i64,
) -> Result<Vec<OutputRow>> {
    let rows = sqlx::query(&format!(
        r#"
        with to_hold as (
            select outpoint
            from outputs
            where status = 'available'
              and category = $1
            order by created_at asc, outpoint asc
            limit $2
            for update skip locked
        )
        update outputs
           set status     = 'held',
               held_at    = now(),
               updated_at = now()
         where outpoint in (select outpoint from to_hold)
        returning {OUTPUT_COLUMNS}
        "#
    ))
    .bind(category.as_str())
    .bind(n)
    .fetch_all(pool)
    .await
    .context("acquire_available_batch failed")?;

    let mut out = Vec::with_capacity(rows.len());
    for row in &rows {
        out.push(output_from_row(row)?);
    }
    // The CTE does not guarantee update order; hand the FIFO promise back.
    out.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.outpoint.cmp(&b.outpoint))
    });
    Ok(out)
}

/// `held → available`. Returns true if a row transitioned.
pub async fn release_hold(pool: &PgPool, outpoint: &str) -> Result<bool> {
    let row: Option<(String,)> = sqlx::query_as(
        r#"
        update outputs
           set status     = 'available',
               held_at    = null,
               updated_at = now()
         where outpoint = $1
           and status = 'held'
        returning outpoint
        "#,
    )
    .bind(outpoint)
    .fetch_optional(pool)
    .await
    .context("release_hold failed")?;

    Ok(row.is_some())
}

/// `held → spent`, stamping `spent_at` and the consuming transaction id.
/// Returns true if a row transitioned.
pub async fn commit_spend(pool: &PgPool, outpoint: &str, spent_in_txid: &str) -> Result<bool> {
    let row: Option<(String,)> = sqlx::query_as(
        r#"
        update outputs
           set status        = 'spent',
               spent_at      = now(),
               spent_in_txid = $2,
               updated_at    = now()
         where outpoint = $1
           and status = 'held'
        returning outpoint
        "#,
    )
    .bind(outpoint)
    .bind(spent_in_txid)
    .fetch_optional(pool)
    .await
    .context("commit_spend failed")?;

    Ok(row.is_some())
}

/// Insert a new output in `available` state.
///
/// Idempotent on `outpoint`: re-registering an existing output returns
/// Ok(false) and does not touch the row, so recovery scans can replay.
pub async fn insert_output_deduped(pool: &PgPool, output: &NewOutput) -> Result<bool> {
    let row: Option<(String,)> = sqlx::query_as(
        r#"
        insert into outputs (outpoint, txid, vout, value_satoshis, locking_script, category)
        values ($1, $2, $3, $4, $5, $6)
        on conflict (outpoint) do nothing
        returning outpoint
        "#,
    )
    .bind(output.outpoint())
    .bind(&output.txid)
    .bind(output.vout)
    .bind(output.value_satoshis)
    .bind(&output.locking_script)
    .bind(output.category.as_str())
    .fetch_optional(pool)
    .await
    .context("insert_output_deduped failed")?;

    Ok(row.is_some())
}

pub async fn fetch_output(pool: &PgPool, outpoint: &str) -> Result<Option<OutputRow>> {
    let row = sqlx::query(&format!(
        "select {OUTPUT_COLUMNS} from outputs where outpoint = $1"
    ))
    .bind(outpoint)
    .fetch_optional(pool)
    .await
    .context("fetch_output failed")?;

    row.as_ref().map(output_from_row).transpose()
}

/// Aggregate (category, status) counts for operational observability.
pub async fn count_by_category_status(pool: &PgPool) -> Result<Vec<(String, String, i64)>> {
    let rows: Vec<(String, String, i64)> = sqlx::query_as(
        r#"
        select category, status, count(*)::bigint
        from outputs
        group by category, status
        order by category, status
        "#,
    )
    .fetch_all(pool)
    .await
    .context("count_by_category_status failed")?;

    Ok(rows)
}

/// Janitor sweep: un-hold outputs whose hold predates `cutoff`.
/// Never touches `spent` rows. Returns the number of recovered outputs.
pub async fn release_stale_holds(pool: &PgPool, cutoff: DateTime<Utc>) -> Result<u64> {
    let res = sqlx::query(
        r#"
        update outputs
           set status     = 'available',
               held_at    = null,
               updated_at = now()
         where status = 'held'
           and held_at < $1
        "#,
    )
    .bind(cutoff)
    .execute(pool)
    .await
    .context("release_stale_holds failed")?;

    Ok(res.rows_affected())
}
