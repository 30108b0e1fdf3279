//! The entry+balance engine: the one place that mutates balance fields.
//!
//! Every mutation funnels through [`post_entry_tx`] (realized balances) or
//! [`adjust_pending_tx`] (hold reservations). Both verify the stored
//! balance checksum before touching the row, and update through a
//! `WHERE id = $1 AND version = $2` predicate so a lost lock is detected
//! as a retryable conflict rather than silently overwriting.

use jiff_sqlx::ToSqlx;
use sqlx::{Postgres, Transaction};

use crate::config::LockMode;
use crate::error::LedgerError;
use crate::hash::BalanceTuple;
use crate::store::{
    Account, AccountId, AccountStatus, Entry, EntryType, LedgerCtx,
    TransferId,
};

/// FX annotation for the converted leg of a cross-currency transfer.
#[derive(Debug, Clone)]
pub struct FxLeg {
    pub original_amount: i64,
    pub original_currency: String,
    /// Scaled by 1e6.
    pub exchange_rate: i64,
}

#[derive(Debug, Clone)]
pub struct EntryParams {
    pub transfer_id: TransferId,
    pub entry_type: EntryType,
    pub amount: i64,
    pub currency: String,
    pub fx: Option<FxLeg>,
    /// Caller opt-in; only effective when the account also allows it.
    pub allow_overdraft: bool,
}

/// Load and row-lock an account according to the configured lock mode.
/// Under `Optimistic` no lock is taken and the version predicate carries
/// the serialization burden.
pub async fn lock_account_tx(
    ctx: &LedgerCtx,
    tx: &mut Transaction<'_, Postgres>,
    account_id: &AccountId,
) -> Result<Account, LedgerError> {
    let sql = match ctx.advanced.lock_mode {
        LockMode::Wait => {
            "SELECT * FROM accounts WHERE id = $1 AND ledger_id = $2
            FOR UPDATE"
        }
        LockMode::Nowait => {
            "SELECT * FROM accounts WHERE id = $1 AND ledger_id = $2
            FOR UPDATE NOWAIT"
        }
        LockMode::Optimistic => {
            "SELECT * FROM accounts WHERE id = $1 AND ledger_id = $2"
        }
    };
    let account = sqlx::query_as::<_, Account>(sql)
        .bind(account_id)
        .bind(ctx.ledger_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or(LedgerError::NotFound("account"))?;
    if ctx.advanced.verify_entry_hash_on_read {
        account.verify_checksum(&ctx.hasher)?;
    }
    Ok(account)
}

fn check_active(account: &Account) -> Result<(), LedgerError> {
    match account.status {
        AccountStatus::Active => Ok(()),
        AccountStatus::Frozen => Err(LedgerError::AccountFrozen(account.id)),
        AccountStatus::Closed => Err(LedgerError::AccountClosed(account.id)),
    }
}

/// Apply one debit or credit leg against a locked account snapshot and
/// record the entry row.
///
/// Hot system accounts take the insert-only path: the entry is recorded
/// with `is_hot_account = true` and the account row is left for the
/// aggregator to fold later.
pub async fn post_entry_tx(
    ctx: &LedgerCtx,
    tx: &mut Transaction<'_, Postgres>,
    account: &Account,
    params: &EntryParams,
) -> Result<Entry, LedgerError> {
    debug_assert!(params.amount > 0);
    check_active(account)?;

    if account.is_hot && account.is_system {
        return insert_entry(ctx, tx, account, params, true, account.balance)
            .await;
    }

    let new_balance = match params.entry_type {
        EntryType::Credit => account
            .balance
            .checked_add(params.amount)
            .ok_or_else(|| overflow(account.id))?,
        EntryType::Debit => {
            let new_balance = account
                .balance
                .checked_sub(params.amount)
                .ok_or_else(|| overflow(account.id))?;
            if let Some(floor) =
                account.balance_floor(params.allow_overdraft)
            {
                if new_balance < floor {
                    return Err(LedgerError::InsufficientFunds {
                        account_id: account.id,
                        available: account.balance - floor,
                        requested: params.amount,
                    });
                }
            }
            new_balance
        }
    };

    let mut tuple = account.balance_tuple();
    tuple.balance = new_balance;
    match params.entry_type {
        EntryType::Credit => tuple.credit_balance += params.amount,
        EntryType::Debit => tuple.debit_balance += params.amount,
    }
    update_balances(ctx, tx, account, &tuple).await?;

    insert_entry(ctx, tx, account, params, false, new_balance).await
}

/// Move pending (hold) balances on a locked account snapshot. Positive
/// deltas reserve, negative deltas release; realized balances are
/// untouched. No entry row is written — entries appear when a hold
/// commits.
pub async fn adjust_pending_tx(
    ctx: &LedgerCtx,
    tx: &mut Transaction<'_, Postgres>,
    account: &Account,
    pending_debit_delta: i64,
    pending_credit_delta: i64,
) -> Result<(), LedgerError> {
    check_active(account)?;

    let mut tuple = account.balance_tuple();
    tuple.pending_debit += pending_debit_delta;
    tuple.pending_credit += pending_credit_delta;
    if tuple.pending_debit < 0 || tuple.pending_credit < 0 {
        return Err(LedgerError::Conflict(format!(
            "pending balance underflow on account {}",
            account.id
        )));
    }
    // A new reservation must fit inside the funds not already reserved.
    if pending_debit_delta > 0 {
        if let Some(floor) = account.balance_floor(false) {
            if account.balance - tuple.pending_debit < floor {
                return Err(LedgerError::InsufficientFunds {
                    account_id: account.id,
                    available: (account.balance
                        - account.pending_debit
                        - floor)
                        .max(0),
                    requested: pending_debit_delta,
                });
            }
        }
    }

    update_balances(ctx, tx, account, &tuple).await
}

/// Optimistic-concurrency balance write: bumps the version, recomputes the
/// checksum, and treats an unmatched version as a retryable conflict.
async fn update_balances(
    ctx: &LedgerCtx,
    tx: &mut Transaction<'_, Postgres>,
    account: &Account,
    tuple: &BalanceTuple,
) -> Result<(), LedgerError> {
    let new_version = account.version + 1;
    let checksum = ctx.hasher.balance_checksum(tuple, new_version);
    let updated = sqlx::query(
        "UPDATE accounts SET
            balance = $1,
            credit_balance = $2,
            debit_balance = $3,
            pending_debit = $4,
            pending_credit = $5,
            version = $6,
            checksum = $7,
            updated_at = $8
        WHERE id = $9 AND version = $10",
    )
    .bind(tuple.balance)
    .bind(tuple.credit_balance)
    .bind(tuple.debit_balance)
    .bind(tuple.pending_debit)
    .bind(tuple.pending_credit)
    .bind(new_version)
    .bind(&checksum)
    .bind(ctx.time_source.now().to_sqlx())
    .bind(account.id)
    .bind(account.version)
    .execute(&mut **tx)
    .await?
    .rows_affected();
    if updated == 0 {
        return Err(LedgerError::VersionConflict);
    }
    Ok(())
}

async fn insert_entry(
    ctx: &LedgerCtx,
    tx: &mut Transaction<'_, Postgres>,
    account: &Account,
    params: &EntryParams,
    is_hot: bool,
    balance_after: i64,
) -> Result<Entry, LedgerError> {
    // Hot entries record the committed balance on both sides; the true
    // running balance only exists once the aggregator folds them.
    let balance_before = account.balance;
    let balance_after = if is_hot { account.balance } else { balance_after };
    Ok(sqlx::query_as::<_, Entry>(
        "INSERT INTO entries (
            ledger_id, transfer_id, account_id, entry_type, amount,
            currency, balance_before, balance_after, account_lock_version,
            is_hot_account, original_amount, original_currency,
            exchange_rate, created_at
        ) VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14
        )
        RETURNING *",
    )
    .bind(ctx.ledger_id)
    .bind(params.transfer_id)
    .bind(account.id)
    .bind(params.entry_type)
    .bind(params.amount)
    .bind(&params.currency)
    .bind(balance_before)
    .bind(balance_after)
    .bind(account.version)
    .bind(is_hot)
    .bind(params.fx.as_ref().map(|fx| fx.original_amount))
    .bind(params.fx.as_ref().map(|fx| fx.original_currency.as_str()))
    .bind(params.fx.as_ref().map(|fx| fx.exchange_rate))
    .bind(ctx.time_source.now().to_sqlx())
    .fetch_one(&mut **tx)
    .await?)
}

fn overflow(account_id: AccountId) -> LedgerError {
    LedgerError::InvalidArgument(format!(
        "balance arithmetic overflow on account {account_id}"
    ))
}
