//! Idempotency keys: dedupe by `(ledger_id, key)` with a cached result.
//!
//! The first writer wins; replays with the same key and reference get the
//! cached result back, replays with a different reference are collisions.
//! Expired rows are invisible to checks and removed by a maintenance
//! worker.

use jiff::Timestamp;
use jiff_sqlx::{Timestamp as SqlxTs, ToSqlx};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, Transaction};

use crate::error::LedgerError;
use crate::store::{LedgerCtx, LedgerId};

#[derive(Debug, Clone, FromRow)]
struct IdempotencyRow {
    reference: String,
    result_data: Option<Json<serde_json::Value>>,
    #[sqlx(try_from = "SqlxTs")]
    expires_at: Timestamp,
}

/// Look up a key inside the mutation transaction. Returns the cached
/// result when the same `(key, reference)` pair was already processed.
pub async fn check_tx(
    tx: &mut Transaction<'_, Postgres>,
    ledger_id: &LedgerId,
    key: &str,
    reference: &str,
    now: Timestamp,
) -> Result<Option<serde_json::Value>, LedgerError> {
    let row = sqlx::query_as::<_, IdempotencyRow>(
        "SELECT reference, result_data, expires_at
        FROM idempotency_keys
        WHERE ledger_id = $1 AND key = $2",
    )
    .bind(ledger_id)
    .bind(key)
    .fetch_optional(&mut **tx)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };
    if row.expires_at <= now {
        return Ok(None);
    }
    if row.reference != reference {
        return Err(LedgerError::Conflict(format!(
            "idempotency key reused with a different reference \
             (stored {}, got {reference})",
            row.reference
        )));
    }
    Ok(Some(
        row.result_data.map(|d| d.0).unwrap_or(serde_json::Value::Null),
    ))
}

/// Record the operation result. First write wins; a concurrent writer's
/// row is left untouched.
pub async fn save_tx(
    ctx: &LedgerCtx,
    tx: &mut Transaction<'_, Postgres>,
    key: &str,
    reference: &str,
    result_data: &serde_json::Value,
    now: Timestamp,
) -> Result<(), LedgerError> {
    let expires_at = now
        .checked_add(jiff::Span::new().milliseconds(
            ctx.advanced.idempotency_ttl_ms,
        ))
        .map_err(|e| LedgerError::InvalidArgument(e.to_string()))?;
    sqlx::query(
        "INSERT INTO idempotency_keys (
            ledger_id, key, reference, result_data, expires_at, created_at
        ) VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (ledger_id, key) DO NOTHING",
    )
    .bind(ctx.ledger_id)
    .bind(key)
    .bind(reference)
    .bind(Json(result_data))
    .bind(expires_at.to_sqlx())
    .bind(now.to_sqlx())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Delete expired keys. Worker-driven.
pub async fn prune(
    pool: &PgPool,
    now: Timestamp,
) -> Result<u64, LedgerError> {
    let result =
        sqlx::query("DELETE FROM idempotency_keys WHERE expires_at < $1")
            .bind(now.to_sqlx())
            .execute(pool)
            .await?;
    Ok(result.rows_affected())
}
