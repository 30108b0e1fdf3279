//! Transactional outbox.
//!
//! Writers insert rows inside the same transaction as the mutation they
//! announce; a worker drains pending rows in batches and publishes them
//! through the configured [`Publisher`]. Delivery is at-least-once; the
//! `processed_events` table lets retries and redeliveries be detected on
//! the consumer side.

use async_trait::async_trait;
use jiff_sqlx::ToSqlx;
use sqlx::types::Json;
use sqlx::{Postgres, Transaction};

use crate::error::LedgerError;
use crate::store::{LedgerCtx, OutboxMessageId, OutboxRow};

/// Delivery target for drained outbox rows. The default implementation
/// logs the payload; real deployments plug in a broker client.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        payload: &serde_json::Value,
    ) -> anyhow::Result<()>;
}

pub struct TracingPublisher;

#[async_trait]
impl Publisher for TracingPublisher {
    async fn publish(
        &self,
        topic: &str,
        payload: &serde_json::Value,
    ) -> anyhow::Result<()> {
        tracing::info!(topic, %payload, "outbox publish");
        Ok(())
    }
}

/// Insert a notification row in the caller's transaction.
pub async fn enqueue_tx(
    tx: &mut Transaction<'_, Postgres>,
    topic: &str,
    payload: &serde_json::Value,
) -> Result<OutboxMessageId, LedgerError> {
    Ok(sqlx::query_scalar(
        "INSERT INTO outbox (topic, payload) VALUES ($1, $2) RETURNING id",
    )
    .bind(topic)
    .bind(Json(payload))
    .fetch_one(&mut **tx)
    .await?)
}

/// Claim and publish one batch of pending rows. Returns how many rows
/// were claimed; a full batch suggests more work is waiting.
#[tracing::instrument(skip(ctx))]
pub async fn drain_once(ctx: &LedgerCtx) -> Result<usize, LedgerError> {
    let mut tx = ctx.pool.begin().await?;
    let batch = sqlx::query_as::<_, OutboxRow>(
        "SELECT * FROM outbox
        WHERE status = 'pending'
        ORDER BY created_at
        LIMIT $1
        FOR UPDATE SKIP LOCKED",
    )
    .bind(ctx.advanced.batch_max_size as i64)
    .fetch_all(&mut *tx)
    .await?;

    let claimed = batch.len();
    for row in batch {
        publish_row(ctx, &mut tx, &row).await?;
    }
    tx.commit().await?;
    Ok(claimed)
}

async fn publish_row(
    ctx: &LedgerCtx,
    tx: &mut Transaction<'_, Postgres>,
    row: &OutboxRow,
) -> Result<(), LedgerError> {
    // A previous attempt may have published but crashed before updating
    // the row; the processed-event record makes the redelivery a no-op.
    let already: bool = sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM processed_events WHERE id = $1)",
    )
    .bind(row.id)
    .fetch_one(&mut **tx)
    .await?;

    let outcome = if already {
        Ok(())
    } else {
        ctx.publisher.publish(&row.topic, &row.payload.0).await
    };

    let now = ctx.time_source.now();
    match outcome {
        Ok(()) => {
            sqlx::query(
                "UPDATE outbox
                SET status = 'published', processed_at = $1
                WHERE id = $2",
            )
            .bind(now.to_sqlx())
            .bind(row.id)
            .execute(&mut **tx)
            .await?;
            sqlx::query(
                "INSERT INTO processed_events (id, topic, payload, processed_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (id) DO NOTHING",
            )
            .bind(row.id)
            .bind(&row.topic)
            .bind(&row.payload)
            .bind(now.to_sqlx())
            .execute(&mut **tx)
            .await?;
        }
        Err(e) => {
            let retries = row.retry_count + 1;
            tracing::warn!(
                topic = row.topic,
                id = %row.id,
                retries,
                "outbox publish failed: {e:#}"
            );
            if retries >= row.max_retries {
                sqlx::query(
                    "UPDATE outbox
                    SET status = 'failed', retry_count = $1, last_error = $2
                    WHERE id = $3",
                )
                .bind(retries)
                .bind(e.to_string())
                .bind(row.id)
                .execute(&mut **tx)
                .await?;
                sqlx::query(
                    "INSERT INTO outbox_dead_letters (
                        id, topic, payload, retry_count, last_error,
                        failed_at, created_at
                    ) VALUES ($1, $2, $3, $4, $5, $6, $7)",
                )
                .bind(row.id)
                .bind(&row.topic)
                .bind(&row.payload)
                .bind(retries)
                .bind(e.to_string())
                .bind(now.to_sqlx())
                .bind(row.created_at.to_sqlx())
                .execute(&mut **tx)
                .await?;
            } else {
                sqlx::query(
                    "UPDATE outbox
                    SET retry_count = $1, last_error = $2
                    WHERE id = $3",
                )
                .bind(retries)
                .bind(e.to_string())
                .bind(row.id)
                .execute(&mut **tx)
                .await?;
            }
        }
    }
    Ok(())
}

/// Drop published rows older than the retention window.
pub async fn cleanup(
    ctx: &LedgerCtx,
    retention: jiff::Span,
) -> Result<u64, LedgerError> {
    let cutoff = ctx
        .time_source
        .now()
        .checked_sub(retention)
        .map_err(|e| LedgerError::InvalidArgument(e.to_string()))?;
    let result = sqlx::query(
        "DELETE FROM outbox
        WHERE status = 'published' AND processed_at < $1",
    )
    .bind(cutoff.to_sqlx())
    .execute(&ctx.pool)
    .await?;
    Ok(result.rows_affected())
}
