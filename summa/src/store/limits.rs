//! Per-account transaction limits.
//!
//! A limit row caps the size of a single mutation and the total debited
//! or credited per UTC day. Enforcement happens inside the mutation
//! transaction, after the account row is locked, so concurrent mutations
//! cannot slip past a daily cap together.

use jiff::Timestamp;
use jiff_sqlx::{Timestamp as SqlxTs, ToSqlx};
use serde::Serialize;
use sqlx::{FromRow, Postgres, Transaction};

use crate::error::LedgerError;
use crate::store::{Account, AccountId, AccountRef, EntryType, LedgerCtx};

#[derive(Debug, Clone, FromRow)]
pub struct AccountLimits {
    pub account_id: AccountId,
    pub max_transaction_amount: Option<i64>,
    pub daily_debit_limit: Option<i64>,
    pub daily_credit_limit: Option<i64>,
    #[sqlx(try_from = "SqlxTs")]
    pub updated_at: Timestamp,
}

#[derive(Debug, Clone, Default)]
pub struct SetLimitsParams {
    pub max_transaction_amount: Option<i64>,
    pub daily_debit_limit: Option<i64>,
    pub daily_credit_limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LimitUsage {
    pub account_id: AccountId,
    pub debited_today: i64,
    pub credited_today: i64,
    pub daily_debit_remaining: Option<i64>,
    pub daily_credit_remaining: Option<i64>,
}

pub async fn set(
    ctx: &LedgerCtx,
    account: &AccountRef,
    params: &SetLimitsParams,
) -> Result<AccountLimits, LedgerError> {
    for limit in [
        params.max_transaction_amount,
        params.daily_debit_limit,
        params.daily_credit_limit,
    ]
    .into_iter()
    .flatten()
    {
        if limit <= 0 {
            return Err(LedgerError::InvalidArgument(
                "limits must be positive".into(),
            ));
        }
    }
    let row = super::accounts::find(ctx, account).await?;
    Ok(sqlx::query_as::<_, AccountLimits>(
        "INSERT INTO account_limits (
            account_id, max_transaction_amount, daily_debit_limit,
            daily_credit_limit, updated_at
        ) VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (account_id) DO UPDATE SET
            max_transaction_amount = EXCLUDED.max_transaction_amount,
            daily_debit_limit = EXCLUDED.daily_debit_limit,
            daily_credit_limit = EXCLUDED.daily_credit_limit,
            updated_at = EXCLUDED.updated_at
        RETURNING *",
    )
    .bind(row.id)
    .bind(params.max_transaction_amount)
    .bind(params.daily_debit_limit)
    .bind(params.daily_credit_limit)
    .bind(ctx.time_source.now().to_sqlx())
    .fetch_one(&ctx.pool)
    .await?)
}

pub async fn get(
    ctx: &LedgerCtx,
    account: &AccountRef,
) -> Result<Option<AccountLimits>, LedgerError> {
    let row = super::accounts::find(ctx, account).await?;
    Ok(sqlx::query_as::<_, AccountLimits>(
        "SELECT * FROM account_limits WHERE account_id = $1",
    )
    .bind(row.id)
    .fetch_optional(&ctx.pool)
    .await?)
}

pub async fn remove(
    ctx: &LedgerCtx,
    account: &AccountRef,
) -> Result<bool, LedgerError> {
    let row = super::accounts::find(ctx, account).await?;
    let result =
        sqlx::query("DELETE FROM account_limits WHERE account_id = $1")
            .bind(row.id)
            .execute(&ctx.pool)
            .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn get_usage(
    ctx: &LedgerCtx,
    account: &AccountRef,
) -> Result<LimitUsage, LedgerError> {
    let row = super::accounts::find(ctx, account).await?;
    let limits = sqlx::query_as::<_, AccountLimits>(
        "SELECT * FROM account_limits WHERE account_id = $1",
    )
    .bind(row.id)
    .fetch_optional(&ctx.pool)
    .await?;
    let now = ctx.time_source.now();
    let (start, end) = utc_day_bounds(now)?;
    let (credited, debited): (i64, i64) = sqlx::query_as(
        "SELECT
            COALESCE(SUM(amount)
                FILTER (WHERE entry_type = 'CREDIT'), 0)::bigint,
            COALESCE(SUM(amount)
                FILTER (WHERE entry_type = 'DEBIT'), 0)::bigint
        FROM entries
        WHERE account_id = $1 AND created_at >= $2 AND created_at < $3",
    )
    .bind(row.id)
    .bind(start.to_sqlx())
    .bind(end.to_sqlx())
    .fetch_one(&ctx.pool)
    .await?;
    let limits = limits.as_ref();
    Ok(LimitUsage {
        account_id: row.id,
        debited_today: debited,
        credited_today: credited,
        daily_debit_remaining: limits
            .and_then(|l| l.daily_debit_limit)
            .map(|l| (l - debited).max(0)),
        daily_credit_remaining: limits
            .and_then(|l| l.daily_credit_limit)
            .map(|l| (l - credited).max(0)),
    })
}

/// Enforce limits for one leg, inside the mutation transaction with the
/// account row already locked.
pub async fn enforce_tx(
    ctx: &LedgerCtx,
    tx: &mut Transaction<'_, Postgres>,
    account: &Account,
    entry_type: EntryType,
    amount: i64,
) -> Result<(), LedgerError> {
    let limits = sqlx::query_as::<_, AccountLimits>(
        "SELECT * FROM account_limits WHERE account_id = $1",
    )
    .bind(account.id)
    .fetch_optional(&mut **tx)
    .await?;
    let Some(limits) = limits else {
        return Ok(());
    };

    if let Some(cap) = limits.max_transaction_amount {
        if amount > cap {
            return Err(LedgerError::LimitExceeded(format!(
                "amount {amount} exceeds per-transaction limit {cap} on \
                 account {}",
                account.id
            )));
        }
    }

    let daily = match entry_type {
        EntryType::Debit => limits.daily_debit_limit,
        EntryType::Credit => limits.daily_credit_limit,
    };
    let Some(daily) = daily else {
        return Ok(());
    };

    let (start, end) = utc_day_bounds(ctx.time_source.now())?;
    let used: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(amount), 0)::bigint FROM entries
        WHERE account_id = $1 AND entry_type = $2
          AND created_at >= $3 AND created_at < $4",
    )
    .bind(account.id)
    .bind(entry_type)
    .bind(start.to_sqlx())
    .bind(end.to_sqlx())
    .fetch_one(&mut **tx)
    .await?;
    if used + amount > daily {
        return Err(LedgerError::LimitExceeded(format!(
            "daily {entry_type} limit {daily} exceeded on account {} \
             (used {used}, requested {amount})",
            account.id
        )));
    }
    Ok(())
}

fn utc_day_bounds(
    now: Timestamp,
) -> Result<(Timestamp, Timestamp), LedgerError> {
    let zoned = now.to_zoned(jiff::tz::TimeZone::UTC);
    let start = zoned
        .start_of_day()
        .map_err(|e| LedgerError::InvalidArgument(e.to_string()))?
        .timestamp();
    let end = start
        .checked_add(jiff::Span::new().hours(24))
        .map_err(|e| LedgerError::InvalidArgument(e.to_string()))?;
    Ok((start, end))
}
