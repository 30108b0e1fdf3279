//! Hot-account aggregation.
//!
//! Entries against hot system accounts are insert-only on the write path;
//! this worker folds them into the account row in batches, tracked by a
//! per-account watermark. The whole batch applies in one REPEATABLE READ
//! transaction — any failure rolls everything back and the next cycle
//! retries the same range.

use std::collections::BTreeMap;

use jiff_sqlx::ToSqlx;
use sqlx::FromRow;

use crate::error::LedgerError;
use crate::store::{Account, AccountId, EntryType, LedgerCtx};

#[derive(Debug, Clone, FromRow)]
struct HotEntry {
    account_id: AccountId,
    entry_type: EntryType,
    amount: i64,
    sequence_number: i64,
}

#[derive(Debug, Default)]
struct Fold {
    net: i64,
    credit: i64,
    debit: i64,
    max_sequence: i64,
    count: i64,
}

/// Fold one batch of unaggregated hot entries into their account rows.
/// Returns the number of entries folded.
#[tracing::instrument(skip(ctx))]
pub async fn aggregate_once(ctx: &LedgerCtx) -> Result<u64, LedgerError> {
    let mut tx = ctx.pool.begin().await?;
    sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ")
        .execute(&mut *tx)
        .await?;

    let batch = sqlx::query_as::<_, HotEntry>(
        "SELECT e.account_id, e.entry_type, e.amount, e.sequence_number
        FROM entries e
        JOIN accounts a ON e.account_id = a.id
        LEFT JOIN hot_account_watermarks w ON w.account_id = a.id
        WHERE e.ledger_id = $1
          AND e.is_hot_account
          AND a.is_system
          AND e.sequence_number
              > COALESCE(w.last_entry_sequence_number, 0)
        ORDER BY e.sequence_number
        LIMIT $2",
    )
    .bind(ctx.ledger_id)
    .bind(ctx.advanced.hot_account_threshold)
    .fetch_all(&mut *tx)
    .await?;
    if batch.is_empty() {
        return Ok(0);
    }

    // BTreeMap keeps the per-account fold order stable.
    let mut folds: BTreeMap<AccountId, Fold> = BTreeMap::new();
    for entry in &batch {
        let fold = folds.entry(entry.account_id).or_default();
        match entry.entry_type {
            EntryType::Credit => {
                fold.net += entry.amount;
                fold.credit += entry.amount;
            }
            EntryType::Debit => {
                fold.net -= entry.amount;
                fold.debit += entry.amount;
            }
        }
        fold.max_sequence = fold.max_sequence.max(entry.sequence_number);
        fold.count += 1;
    }

    for (account_id, fold) in &folds {
        let account = sqlx::query_as::<_, Account>(
            "SELECT * FROM accounts WHERE id = $1 FOR UPDATE",
        )
        .bind(account_id)
        .fetch_one(&mut *tx)
        .await?;
        account.verify_checksum(&ctx.hasher)?;

        let mut tuple = account.balance_tuple();
        tuple.balance += fold.net;
        tuple.credit_balance += fold.credit;
        tuple.debit_balance += fold.debit;
        let new_version = account.version + 1;
        let checksum = ctx.hasher.balance_checksum(&tuple, new_version);
        let updated = sqlx::query(
            "UPDATE accounts SET
                balance = $1,
                credit_balance = $2,
                debit_balance = $3,
                version = $4,
                checksum = $5,
                updated_at = $6
            WHERE id = $7 AND version = $8",
        )
        .bind(tuple.balance)
        .bind(tuple.credit_balance)
        .bind(tuple.debit_balance)
        .bind(new_version)
        .bind(&checksum)
        .bind(ctx.time_source.now().to_sqlx())
        .bind(account.id)
        .bind(account.version)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if updated == 0 {
            // The whole batch rolls back; next cycle retries.
            return Err(LedgerError::VersionConflict);
        }

        sqlx::query(
            "INSERT INTO hot_account_watermarks (
                account_id, last_entry_sequence_number, entries_aggregated,
                updated_at
            ) VALUES ($1, $2, $3, $4)
            ON CONFLICT (account_id) DO UPDATE SET
                last_entry_sequence_number = GREATEST(
                    hot_account_watermarks.last_entry_sequence_number,
                    EXCLUDED.last_entry_sequence_number
                ),
                entries_aggregated =
                    hot_account_watermarks.entries_aggregated
                    + EXCLUDED.entries_aggregated,
                updated_at = EXCLUDED.updated_at",
        )
        .bind(account_id)
        .bind(fold.max_sequence)
        .bind(fold.count)
        .bind(ctx.time_source.now().to_sqlx())
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    let folded = batch.len() as u64;
    tracing::debug!(folded, accounts = folds.len(), "hot entries folded");
    Ok(folded)
}

/// Committed balance plus the unaggregated tail, for callers that need
/// up-to-the-second numbers on a hot account.
pub async fn realtime_balance(
    ctx: &LedgerCtx,
    system_identifier: &str,
) -> Result<i64, LedgerError> {
    let account = sqlx::query_as::<_, Account>(
        "SELECT * FROM accounts
        WHERE ledger_id = $1 AND system_identifier = $2 AND is_system",
    )
    .bind(ctx.ledger_id)
    .bind(system_identifier)
    .fetch_optional(&ctx.pool)
    .await?
    .ok_or(LedgerError::NotFound("system account"))?;

    let tail: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(
            CASE WHEN e.entry_type = 'CREDIT' THEN e.amount
                 ELSE -e.amount END
        ), 0)::bigint
        FROM entries e
        LEFT JOIN hot_account_watermarks w ON w.account_id = e.account_id
        WHERE e.account_id = $1
          AND e.is_hot_account
          AND e.sequence_number
              > COALESCE(w.last_entry_sequence_number, 0)",
    )
    .bind(account.id)
    .fetch_one(&ctx.pool)
    .await?;

    Ok(account.balance + tail)
}
