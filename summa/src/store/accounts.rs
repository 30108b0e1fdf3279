//! Account lifecycle and balance reads.
//!
//! Creation is idempotent on the natural key: a fast-path lookup returns
//! an existing row, and the slow path serializes same-key creators behind
//! an advisory lock before inserting. Lifecycle transitions follow
//! created -> {frozen <-> active} -> closed; closure requires a zero
//! balance or a same-currency sweep target.

use jiff::Timestamp;
use jiff_sqlx::ToSqlx;
use serde_json::json;
use sqlx::types::Json;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::plugin::OperationContext;
use crate::store::{
    Account, AccountId, AccountRef, AccountStatus, AccountType,
    AggregateType, BalanceSummary, EntryType, HolderType, LedgerCtx,
    TransferStatus, TransferType, advisory_lock_tx, entries, events,
    natural_key_lock, outbox, transactions,
};

#[derive(Debug, Clone)]
pub struct CreateAccountParams {
    pub holder_id: String,
    pub holder_type: HolderType,
    /// Defaults to the engine's configured currency.
    pub currency: Option<String>,
    pub allow_overdraft: bool,
    pub overdraft_limit: i64,
    pub account_type: Option<AccountType>,
    pub account_code: Option<String>,
    pub parent_account_id: Option<AccountId>,
    pub metadata: serde_json::Value,
}

impl CreateAccountParams {
    pub fn new(holder_id: impl Into<String>, holder_type: HolderType) -> Self {
        Self {
            holder_id: holder_id.into(),
            holder_type,
            currency: None,
            allow_overdraft: false,
            overdraft_limit: 0,
            account_type: None,
            account_code: None,
            parent_account_id: None,
            metadata: json!({}),
        }
    }
}

pub fn validate_currency(currency: &str) -> Result<(), LedgerError> {
    if (3..=4).contains(&currency.len())
        && currency.bytes().all(|b| b.is_ascii_uppercase())
    {
        Ok(())
    } else {
        Err(LedgerError::InvalidArgument(format!(
            "currency must be 3-4 uppercase letters, got {currency:?}"
        )))
    }
}

/// Create an ordinary account, or return the existing one for the same
/// natural key.
pub async fn create(
    ctx: &LedgerCtx,
    params: &CreateAccountParams,
) -> Result<Account, LedgerError> {
    if params.holder_id.is_empty() || params.holder_id.len() > 255 {
        return Err(LedgerError::InvalidArgument(
            "holder_id must be 1-255 characters".into(),
        ));
    }
    if params.holder_type == HolderType::System {
        return Err(LedgerError::InvalidArgument(
            "system accounts are configured, not created by holder".into(),
        ));
    }
    if params.overdraft_limit < 0 {
        return Err(LedgerError::InvalidArgument(
            "overdraft_limit must be non-negative".into(),
        ));
    }
    let currency =
        params.currency.clone().unwrap_or_else(|| ctx.currency.clone());
    validate_currency(&currency)?;

    // Fast path: the natural key already exists.
    if let Some(existing) =
        find_by_holder(ctx, &params.holder_id, Some(params.holder_type))
            .await?
    {
        return Ok(existing);
    }

    let mut tx = ctx.begin().await?;
    let op = OperationContext {
        operation: "accounts.create".into(),
        ledger_id: ctx.ledger_id,
        payload: json!({
            "holder_id": params.holder_id,
            "holder_type": params.holder_type,
            "currency": currency,
        }),
    };
    ctx.hooks.run_before(&op).await?;

    advisory_lock_tx(
        &mut tx,
        &natural_key_lock(&ctx.ledger_id, &params.holder_id, params.holder_type),
    )
    .await?;

    // Re-check under the lock; a racing creator may have won.
    if let Some(existing) = sqlx::query_as::<_, Account>(
        "SELECT * FROM accounts
        WHERE ledger_id = $1 AND holder_id = $2 AND holder_type = $3
          AND NOT is_system",
    )
    .bind(ctx.ledger_id)
    .bind(&params.holder_id)
    .bind(params.holder_type)
    .fetch_optional(&mut *tx)
    .await?
    {
        tx.commit().await?;
        return Ok(existing);
    }

    if let Some(parent_id) = &params.parent_account_id {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(
                SELECT 1 FROM accounts WHERE id = $1 AND ledger_id = $2
            )",
        )
        .bind(parent_id)
        .bind(ctx.ledger_id)
        .fetch_one(&mut *tx)
        .await?;
        if !exists {
            return Err(LedgerError::NotFound("parent account"));
        }
    }

    let checksum = ctx
        .hasher
        .balance_checksum(&crate::hash::BalanceTuple {
            balance: 0,
            credit_balance: 0,
            debit_balance: 0,
            pending_debit: 0,
            pending_credit: 0,
        }, 0);
    let normal_balance =
        params.account_type.map(AccountType::normal_balance);
    let account = sqlx::query_as::<_, Account>(
        "INSERT INTO accounts (
            ledger_id, holder_id, holder_type, is_system, currency,
            allow_overdraft, overdraft_limit, checksum, account_type,
            account_code, parent_account_id, normal_balance, metadata
        ) VALUES (
            $1, $2, $3, FALSE, $4, $5, $6, $7, $8, $9, $10, $11, $12
        )
        RETURNING *",
    )
    .bind(ctx.ledger_id)
    .bind(&params.holder_id)
    .bind(params.holder_type)
    .bind(&currency)
    .bind(params.allow_overdraft)
    .bind(params.overdraft_limit)
    .bind(&checksum)
    .bind(params.account_type)
    .bind(params.account_code.as_deref())
    .bind(params.parent_account_id)
    .bind(normal_balance)
    .bind(Json(&params.metadata))
    .fetch_one(&mut *tx)
    .await?;

    log_status_tx(&mut tx, &account.id, None, AccountStatus::Active, None)
        .await?;
    events::append_tx(ctx, &mut tx, events::AppendEvent {
        aggregate_type: AggregateType::Account,
        aggregate_id: account.id.0,
        event_type: "account-created".into(),
        event_data: json!({
            "account_id": account.id,
            "holder_id": account.holder_id,
            "holder_type": account.holder_type,
            "currency": account.currency,
        }),
        correlation_id: None,
    })
    .await?;
    outbox::enqueue_tx(
        &mut tx,
        "ledger-account-created",
        &json!({
            "ledger_id": ctx.ledger_id,
            "account_id": account.id,
            "holder_id": account.holder_id,
            "currency": account.currency,
        }),
    )
    .await?;

    tx.commit().await?;
    ctx.hooks.run_after(&op).await;
    Ok(account)
}

/// Fetch by natural key; `holder_type` narrows an ambiguous holder id.
pub async fn find_by_holder(
    ctx: &LedgerCtx,
    holder_id: &str,
    holder_type: Option<HolderType>,
) -> Result<Option<Account>, LedgerError> {
    let matches = sqlx::query_as::<_, Account>(
        "SELECT * FROM accounts
        WHERE ledger_id = $1 AND holder_id = $2 AND NOT is_system
          AND ($3::holder_type IS NULL OR holder_type = $3)",
    )
    .bind(ctx.ledger_id)
    .bind(holder_id)
    .bind(holder_type)
    .fetch_all(&ctx.pool)
    .await?;
    match matches.len() {
        0 => Ok(None),
        1 => Ok(Some(matches.into_iter().next().expect("one row"))),
        _ => Err(LedgerError::InvalidArgument(format!(
            "holder {holder_id} matches multiple accounts; pass holder_type"
        ))),
    }
}

pub async fn get(
    ctx: &LedgerCtx,
    holder_id: &str,
    holder_type: Option<HolderType>,
) -> Result<Account, LedgerError> {
    find_by_holder(ctx, holder_id, holder_type)
        .await?
        .ok_or(LedgerError::NotFound("account"))
}

pub async fn get_by_id(
    ctx: &LedgerCtx,
    id: &AccountId,
) -> Result<Account, LedgerError> {
    sqlx::query_as::<_, Account>(
        "SELECT * FROM accounts WHERE id = $1 AND ledger_id = $2",
    )
    .bind(id)
    .bind(ctx.ledger_id)
    .fetch_optional(&ctx.pool)
    .await?
    .ok_or(LedgerError::NotFound("account"))
}

/// Resolve an account reference without creating anything.
pub async fn find(
    ctx: &LedgerCtx,
    account: &AccountRef,
) -> Result<Account, LedgerError> {
    match account {
        AccountRef::Holder {
            holder_id,
            holder_type,
        } => get(ctx, holder_id, *holder_type).await,
        AccountRef::System(name) => {
            find_system(ctx, ctx.system_identifier(name))
                .await?
                .ok_or(LedgerError::NotFound("system account"))
        }
    }
}

pub async fn find_system(
    ctx: &LedgerCtx,
    identifier: &str,
) -> Result<Option<Account>, LedgerError> {
    Ok(sqlx::query_as::<_, Account>(
        "SELECT * FROM accounts
        WHERE ledger_id = $1 AND system_identifier = $2 AND is_system",
    )
    .bind(ctx.ledger_id)
    .bind(identifier)
    .fetch_optional(&ctx.pool)
    .await?)
}

/// Fetch or lazily create a system account, serialized by an advisory
/// lock on the identifier.
pub async fn get_or_create_system_tx(
    ctx: &LedgerCtx,
    tx: &mut Transaction<'_, Postgres>,
    identifier: &str,
    hot: bool,
) -> Result<Account, LedgerError> {
    if !identifier.starts_with('@') {
        return Err(LedgerError::InvalidArgument(format!(
            "system identifiers start with '@', got {identifier:?}"
        )));
    }
    advisory_lock_tx(
        &mut *tx,
        &format!("system-account:{}:{identifier}", ctx.ledger_id),
    )
    .await?;
    if let Some(existing) = sqlx::query_as::<_, Account>(
        "SELECT * FROM accounts
        WHERE ledger_id = $1 AND system_identifier = $2 AND is_system",
    )
    .bind(ctx.ledger_id)
    .bind(identifier)
    .fetch_optional(&mut **tx)
    .await?
    {
        return Ok(existing);
    }
    let checksum = ctx
        .hasher
        .balance_checksum(&crate::hash::BalanceTuple {
            balance: 0,
            credit_balance: 0,
            debit_balance: 0,
            pending_debit: 0,
            pending_credit: 0,
        }, 0);
    Ok(sqlx::query_as::<_, Account>(
        "INSERT INTO accounts (
            ledger_id, holder_id, holder_type, is_system,
            system_identifier, is_hot, currency, checksum
        ) VALUES ($1, $2, 'system', TRUE, $3, $4, $5, $6)
        RETURNING *",
    )
    .bind(ctx.ledger_id)
    .bind(identifier)
    .bind(identifier)
    .bind(hot)
    .bind(&ctx.currency)
    .bind(&checksum)
    .fetch_one(&mut **tx)
    .await?)
}

/// Balance snapshot. Verifies the stored checksum; a mismatch is a fatal
/// tamper error. With `as_of` the balance is reconstructed from entries
/// (pending amounts are not historically tracked and read as zero).
pub async fn get_balance(
    ctx: &LedgerCtx,
    account: &AccountRef,
    as_of: Option<Timestamp>,
) -> Result<BalanceSummary, LedgerError> {
    let row = find(ctx, account).await?;
    if ctx.advanced.verify_entry_hash_on_read {
        row.verify_checksum(&ctx.hasher)?;
    }
    match as_of {
        None => Ok(BalanceSummary {
            balance: row.balance,
            credit_balance: row.credit_balance,
            debit_balance: row.debit_balance,
            pending_credit: row.pending_credit,
            pending_debit: row.pending_debit,
            available_balance: row.available_balance(),
            currency: row.currency,
        }),
        Some(as_of) => {
            let (credited, debited): (i64, i64) = sqlx::query_as(
                "SELECT
                    COALESCE(SUM(amount)
                        FILTER (WHERE entry_type = 'CREDIT'), 0)::bigint,
                    COALESCE(SUM(amount)
                        FILTER (WHERE entry_type = 'DEBIT'), 0)::bigint
                FROM entries
                WHERE account_id = $1 AND created_at <= $2",
            )
            .bind(row.id)
            .bind(as_of.to_sqlx())
            .fetch_one(&ctx.pool)
            .await?;
            let balance = credited - debited;
            Ok(BalanceSummary {
                balance,
                credit_balance: credited,
                debit_balance: debited,
                pending_credit: 0,
                pending_debit: 0,
                available_balance: balance.max(0),
                currency: row.currency,
            })
        }
    }
}

async fn lock_for_update(
    ctx: &LedgerCtx,
    tx: &mut Transaction<'_, Postgres>,
    id: &AccountId,
) -> Result<Account, LedgerError> {
    let account = sqlx::query_as::<_, Account>(
        "SELECT * FROM accounts WHERE id = $1 AND ledger_id = $2 FOR UPDATE",
    )
    .bind(id)
    .bind(ctx.ledger_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or(LedgerError::NotFound("account"))?;
    if ctx.advanced.verify_entry_hash_on_read {
        account.verify_checksum(&ctx.hasher)?;
    }
    Ok(account)
}

pub async fn freeze(
    ctx: &LedgerCtx,
    account: &AccountRef,
    reason: Option<&str>,
) -> Result<Account, LedgerError> {
    transactions::run_with_retries(ctx, || {
        transition(ctx, account, Transition::Freeze, reason)
    })
    .await
}

pub async fn unfreeze(
    ctx: &LedgerCtx,
    account: &AccountRef,
) -> Result<Account, LedgerError> {
    transactions::run_with_retries(ctx, || {
        transition(ctx, account, Transition::Unfreeze, None)
    })
    .await
}

#[derive(Clone, Copy)]
enum Transition {
    Freeze,
    Unfreeze,
}

async fn transition(
    ctx: &LedgerCtx,
    account: &AccountRef,
    kind: Transition,
    reason: Option<&str>,
) -> Result<Account, LedgerError> {
    let target = find(ctx, account).await?;
    let mut tx = ctx.begin().await?;
    let (operation, event_type, topic) = match kind {
        Transition::Freeze => {
            ("accounts.freeze", "account-frozen", "ledger-account-frozen")
        }
        Transition::Unfreeze => (
            "accounts.unfreeze",
            "account-unfrozen",
            "ledger-account-unfrozen",
        ),
    };
    let op = OperationContext {
        operation: operation.into(),
        ledger_id: ctx.ledger_id,
        payload: json!({ "account_id": target.id, "reason": reason }),
    };
    ctx.hooks.run_before(&op).await?;

    let row = lock_for_update(ctx, &mut tx, &target.id).await?;
    let (required, next) = match kind {
        Transition::Freeze => (AccountStatus::Active, AccountStatus::Frozen),
        Transition::Unfreeze => (AccountStatus::Frozen, AccountStatus::Active),
    };
    if row.status != required {
        return Err(LedgerError::InvalidArgument(format!(
            "cannot move account {} from {} to {next}",
            row.id, row.status
        )));
    }

    let now = ctx.time_source.now();
    let new_version = row.version + 1;
    let checksum = ctx.hasher.balance_checksum(&row.balance_tuple(), new_version);
    let frozen_at = match kind {
        Transition::Freeze => Some(now),
        Transition::Unfreeze => None,
    };
    let updated = sqlx::query_as::<_, Account>(
        "UPDATE accounts SET
            status = $1,
            frozen_at = $2,
            freeze_reason = $3,
            version = $4,
            checksum = $5,
            updated_at = $6
        WHERE id = $7 AND version = $8
        RETURNING *",
    )
    .bind(next)
    .bind(frozen_at.map(|t| t.to_sqlx()))
    .bind(match kind {
        Transition::Freeze => reason,
        Transition::Unfreeze => None,
    })
    .bind(new_version)
    .bind(&checksum)
    .bind(now.to_sqlx())
    .bind(row.id)
    .bind(row.version)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(LedgerError::VersionConflict)?;

    log_status_tx(&mut tx, &row.id, Some(row.status), next, reason).await?;
    events::append_tx(ctx, &mut tx, events::AppendEvent {
        aggregate_type: AggregateType::Account,
        aggregate_id: row.id.0,
        event_type: event_type.into(),
        event_data: json!({
            "account_id": row.id,
            "from": row.status,
            "to": next,
            "reason": reason,
        }),
        correlation_id: None,
    })
    .await?;
    outbox::enqueue_tx(
        &mut tx,
        topic,
        &json!({
            "ledger_id": ctx.ledger_id,
            "account_id": row.id,
            "status": next,
        }),
    )
    .await?;

    tx.commit().await?;
    ctx.hooks.run_after(&op).await;
    Ok(updated)
}

/// Close an account. A non-zero balance requires a same-currency sweep
/// target, which receives (or covers) the remainder atomically before the
/// account is marked closed. Inflight holds block closure.
pub async fn close(
    ctx: &LedgerCtx,
    account: &AccountRef,
    transfer_to: Option<&AccountRef>,
    reason: Option<&str>,
) -> Result<Account, LedgerError> {
    transactions::run_with_retries(ctx, || {
        close_once(ctx, account, transfer_to, reason)
    })
    .await
}

async fn close_once(
    ctx: &LedgerCtx,
    account: &AccountRef,
    transfer_to: Option<&AccountRef>,
    reason: Option<&str>,
) -> Result<Account, LedgerError> {
    let source = find(ctx, account).await?;
    let sweep_target = match transfer_to {
        Some(target) => Some(find(ctx, target).await?),
        None => None,
    };

    let mut tx = ctx.begin().await?;
    let op = OperationContext {
        operation: "accounts.close".into(),
        ledger_id: ctx.ledger_id,
        payload: json!({ "account_id": source.id, "reason": reason }),
    };
    ctx.hooks.run_before(&op).await?;

    // Lock in ascending id order, the same discipline as transfers.
    let mut ids = vec![source.id];
    if let Some(target) = &sweep_target {
        if target.id == source.id {
            return Err(LedgerError::InvalidArgument(
                "sweep target must differ from the closing account".into(),
            ));
        }
        ids.push(target.id);
    }
    ids.sort();
    let mut locked = std::collections::HashMap::new();
    for id in &ids {
        locked.insert(*id, lock_for_update(ctx, &mut tx, id).await?);
    }
    let row = locked.remove(&source.id).expect("locked above");
    if row.status == AccountStatus::Closed {
        return Err(LedgerError::AccountClosed(row.id));
    }

    let inflight: bool = sqlx::query_scalar(
        "SELECT EXISTS(
            SELECT 1 FROM transfers
            WHERE ledger_id = $1 AND is_hold AND status = 'inflight'
              AND (source_account_id = $2 OR destination_account_id = $2)
        )",
    )
    .bind(ctx.ledger_id)
    .bind(row.id)
    .fetch_one(&mut *tx)
    .await?;
    if inflight {
        return Err(LedgerError::Conflict(format!(
            "account {} has inflight holds",
            row.id
        )));
    }

    let mut row = row;
    if row.balance != 0 {
        // The sweep posts real entries, which only active accounts accept.
        if row.status != AccountStatus::Active {
            return Err(LedgerError::InvalidArgument(format!(
                "unfreeze account {} before closing with a sweep",
                row.id
            )));
        }
        let target = match sweep_target.as_ref() {
            Some(target) => locked.remove(&target.id).expect("locked above"),
            None => {
                return Err(LedgerError::InvalidArgument(
                    "account balance is non-zero; pass a sweep target".into(),
                ));
            }
        };
        if target.status != AccountStatus::Active {
            return Err(LedgerError::InvalidArgument(
                "sweep target must be active".into(),
            ));
        }
        if target.currency != row.currency {
            return Err(LedgerError::InvalidArgument(
                "sweep target must share the account currency".into(),
            ));
        }
        let sweep_amount = row.balance.abs();
        let now = ctx.time_source.now();
        let transfer = transactions::insert_transfer_tx(
            ctx,
            &mut tx,
            transactions::NewTransfer {
                transfer_type: TransferType::Transfer,
                reference: format!("close-sweep:{}", row.id),
                status: TransferStatus::Posted,
                amount: sweep_amount,
                currency: row.currency.clone(),
                source_account_id: Some(row.id),
                destination_account_id: Some(target.id),
                is_hold: false,
                hold_expires_at: None,
                committed_amount: None,
                parent_id: None,
                is_reversal: false,
                adjustment_type: None,
                correlation_id: Uuid::new_v4(),
                metadata: json!({ "close_sweep": true }),
                posted_at: Some(now),
                effective_date: Some(now),
            },
        )
        .await?;
        // A negative (overdrawn) balance is covered by the target instead.
        let (debited, credited) = if row.balance > 0 {
            (&row, &target)
        } else {
            (&target, &row)
        };
        entries::post_entry_tx(ctx, &mut tx, debited, &entries::EntryParams {
            transfer_id: transfer.id,
            entry_type: EntryType::Debit,
            amount: sweep_amount,
            currency: row.currency.clone(),
            fx: None,
            allow_overdraft: false,
        })
        .await?;
        entries::post_entry_tx(ctx, &mut tx, credited, &entries::EntryParams {
            transfer_id: transfer.id,
            entry_type: EntryType::Credit,
            amount: sweep_amount,
            currency: row.currency.clone(),
            fx: None,
            allow_overdraft: false,
        })
        .await?;
        events::append_tx(ctx, &mut tx, events::AppendEvent {
            aggregate_type: AggregateType::Transaction,
            aggregate_id: transfer.id.0,
            event_type: "transaction-posted".into(),
            event_data: json!({
                "transaction_id": transfer.id,
                "type": transfer.transfer_type,
                "amount": sweep_amount,
                "currency": transfer.currency,
                "reference": transfer.reference,
            }),
            correlation_id: Some(transfer.correlation_id),
        })
        .await?;
        // The sweep bumped the version; re-read before the close update.
        row = sqlx::query_as::<_, Account>(
            "SELECT * FROM accounts WHERE id = $1",
        )
        .bind(row.id)
        .fetch_one(&mut *tx)
        .await?;
    }

    let now = ctx.time_source.now();
    let new_version = row.version + 1;
    let checksum =
        ctx.hasher.balance_checksum(&row.balance_tuple(), new_version);
    let closed = sqlx::query_as::<_, Account>(
        "UPDATE accounts SET
            status = 'closed',
            closed_at = $1,
            close_reason = $2,
            version = $3,
            checksum = $4,
            updated_at = $1
        WHERE id = $5 AND version = $6
        RETURNING *",
    )
    .bind(now.to_sqlx())
    .bind(reason)
    .bind(new_version)
    .bind(&checksum)
    .bind(row.id)
    .bind(row.version)
    .fetch_optional(&mut *tx)
    .await?
    .ok_or(LedgerError::VersionConflict)?;

    log_status_tx(
        &mut tx,
        &row.id,
        Some(row.status),
        AccountStatus::Closed,
        reason,
    )
    .await?;
    events::append_tx(ctx, &mut tx, events::AppendEvent {
        aggregate_type: AggregateType::Account,
        aggregate_id: row.id.0,
        event_type: "account-closed".into(),
        event_data: json!({
            "account_id": row.id,
            "from": row.status,
            "to": AccountStatus::Closed,
            "swept_to": sweep_target.as_ref().map(|t| t.id),
            "reason": reason,
        }),
        correlation_id: None,
    })
    .await?;
    outbox::enqueue_tx(
        &mut tx,
        "ledger-account-closed",
        &json!({
            "ledger_id": ctx.ledger_id,
            "account_id": row.id,
        }),
    )
    .await?;

    tx.commit().await?;
    ctx.hooks.run_after(&op).await;
    Ok(closed)
}

/// Mark a system account hot (aggregator-folded) or cold.
pub async fn set_hot(
    ctx: &LedgerCtx,
    account: &AccountRef,
    hot: bool,
) -> Result<Account, LedgerError> {
    let row = find(ctx, account).await?;
    if !row.is_system {
        return Err(LedgerError::InvalidArgument(
            "only system accounts can be hot".into(),
        ));
    }
    Ok(sqlx::query_as::<_, Account>(
        "UPDATE accounts SET is_hot = $1, updated_at = $2
        WHERE id = $3
        RETURNING *",
    )
    .bind(hot)
    .bind(ctx.time_source.now().to_sqlx())
    .bind(row.id)
    .fetch_one(&ctx.pool)
    .await?)
}

pub async fn list(
    ctx: &LedgerCtx,
    limit: i64,
    offset: i64,
) -> Result<Vec<Account>, LedgerError> {
    Ok(sqlx::query_as::<_, Account>(
        "SELECT * FROM accounts
        WHERE ledger_id = $1
        ORDER BY created_at
        LIMIT $2 OFFSET $3",
    )
    .bind(ctx.ledger_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(&ctx.pool)
    .await?)
}

async fn log_status_tx(
    tx: &mut Transaction<'_, Postgres>,
    account_id: &AccountId,
    from_status: Option<AccountStatus>,
    to_status: AccountStatus,
    reason: Option<&str>,
) -> Result<(), LedgerError> {
    sqlx::query(
        "INSERT INTO account_status_log (
            account_id, from_status, to_status, reason
        ) VALUES ($1, $2, $3, $4)",
    )
    .bind(account_id)
    .bind(from_status)
    .bind(to_status)
    .bind(reason)
    .execute(&mut **tx)
    .await?;
    Ok(())
}
