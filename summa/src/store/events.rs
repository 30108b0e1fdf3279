//! Append-only event store with per-aggregate hash chains.
//!
//! Each aggregate (an account or a transfer) owns one chain: every event
//! carries the hash of its predecessor, and the unique
//! `(ledger_id, aggregate_type, aggregate_id, aggregate_version)`
//! constraint serializes concurrent appenders — the loser of a race hits
//! the constraint and the surrounding transaction retries.

use sqlx::types::Json;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::store::{AggregateType, LedgerCtx, LedgerEvent};

pub struct AppendEvent {
    pub aggregate_type: AggregateType,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub event_data: serde_json::Value,
    pub correlation_id: Option<Uuid>,
}

/// Append an event inside the caller's transaction, linking it to the
/// chain head for its aggregate.
pub async fn append_tx(
    ctx: &LedgerCtx,
    tx: &mut Transaction<'_, Postgres>,
    event: AppendEvent,
) -> Result<LedgerEvent, LedgerError> {
    // Lock the chain head so two appenders cannot both read the same
    // predecessor. First-ever events race on the unique constraint instead.
    let prev = sqlx::query_as::<_, LedgerEvent>(
        "SELECT * FROM ledger_events
        WHERE ledger_id = $1 AND aggregate_type = $2 AND aggregate_id = $3
        ORDER BY aggregate_version DESC
        LIMIT 1
        FOR UPDATE",
    )
    .bind(ctx.ledger_id)
    .bind(event.aggregate_type)
    .bind(event.aggregate_id)
    .fetch_optional(&mut **tx)
    .await?;

    let next_version = prev.as_ref().map(|p| p.aggregate_version + 1).unwrap_or(1);
    let prev_hash = prev.as_ref().map(|p| p.hash.as_str());
    let hash = ctx.hasher.event_hash(prev_hash, &event.event_data)?;

    let row = sqlx::query_as::<_, LedgerEvent>(
        "INSERT INTO ledger_events (
            ledger_id, aggregate_type, aggregate_id, aggregate_version,
            event_type, event_data, correlation_id, hash, prev_hash
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING *",
    )
    .bind(ctx.ledger_id)
    .bind(event.aggregate_type)
    .bind(event.aggregate_id)
    .bind(next_version)
    .bind(&event.event_type)
    .bind(Json(&event.event_data))
    .bind(event.correlation_id)
    .bind(&hash)
    .bind(prev_hash)
    .fetch_one(&mut **tx)
    .await?;

    Ok(row)
}

/// The ordered event stream for one aggregate.
pub async fn get_for_aggregate(
    ctx: &LedgerCtx,
    aggregate_type: AggregateType,
    aggregate_id: Uuid,
) -> Result<Vec<LedgerEvent>, LedgerError> {
    Ok(sqlx::query_as::<_, LedgerEvent>(
        "SELECT * FROM ledger_events
        WHERE ledger_id = $1 AND aggregate_type = $2 AND aggregate_id = $3
        ORDER BY aggregate_version",
    )
    .bind(ctx.ledger_id)
    .bind(aggregate_type)
    .bind(aggregate_id)
    .fetch_all(&ctx.pool)
    .await?)
}

/// All events across aggregates that share a correlation id.
pub async fn get_by_correlation(
    ctx: &LedgerCtx,
    correlation_id: Uuid,
) -> Result<Vec<LedgerEvent>, LedgerError> {
    Ok(sqlx::query_as::<_, LedgerEvent>(
        "SELECT * FROM ledger_events
        WHERE ledger_id = $1 AND correlation_id = $2
        ORDER BY sequence_number",
    )
    .bind(ctx.ledger_id)
    .bind(correlation_id)
    .fetch_all(&ctx.pool)
    .await?)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainVerification {
    pub valid: bool,
    pub events_checked: u64,
    pub broken_at_version: Option<i64>,
}

const VERIFY_BATCH: i64 = 500;

/// Walk an aggregate's chain in version order and recompute every link.
/// Stops at the first mismatch.
pub async fn verify_chain(
    ctx: &LedgerCtx,
    aggregate_type: AggregateType,
    aggregate_id: Uuid,
) -> Result<ChainVerification, LedgerError> {
    let mut computed_prev: Option<String> = None;
    let mut expected_version: i64 = 1;
    let mut checked: u64 = 0;

    loop {
        let batch = sqlx::query_as::<_, LedgerEvent>(
            "SELECT * FROM ledger_events
            WHERE ledger_id = $1
              AND aggregate_type = $2
              AND aggregate_id = $3
              AND aggregate_version >= $4
            ORDER BY aggregate_version
            LIMIT $5",
        )
        .bind(ctx.ledger_id)
        .bind(aggregate_type)
        .bind(aggregate_id)
        .bind(expected_version)
        .bind(VERIFY_BATCH)
        .fetch_all(&ctx.pool)
        .await?;

        if batch.is_empty() {
            break;
        }
        for event in &batch {
            let broken = ChainVerification {
                valid: false,
                events_checked: checked,
                broken_at_version: Some(event.aggregate_version),
            };
            if event.aggregate_version != expected_version {
                return Ok(broken);
            }
            if event.prev_hash.as_deref() != computed_prev.as_deref() {
                return Ok(broken);
            }
            let recomputed = ctx
                .hasher
                .event_hash(computed_prev.as_deref(), &event.event_data.0)?;
            if !crate::hash::digests_equal(&recomputed, &event.hash) {
                return Ok(broken);
            }
            computed_prev = Some(event.hash.clone());
            expected_version += 1;
            checked += 1;
        }
    }

    Ok(ChainVerification {
        valid: true,
        events_checked: checked,
        broken_at_version: None,
    })
}
