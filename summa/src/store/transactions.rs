//! The transaction manager: the eight ledger mutations.
//!
//! Every operation follows one template: validate, open a transaction
//! with the configured timeouts, check idempotency, resolve accounts
//! (advisory lock on natural keys, then `FOR UPDATE` in ascending id
//! order), apply entries through the engine, append events, enqueue
//! outbox rows, save the idempotency result, commit. Retryable failures
//! (version conflicts, lost event-version races, serialization errors)
//! re-run the whole template with bounded exponential backoff.

use std::collections::HashMap;
use std::future::Future;

use jiff_sqlx::ToSqlx;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::types::Json;
use sqlx::{Postgres, Transaction};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::plugin::OperationContext;
use crate::store::{
    Account, AccountId, AccountRef, AdjustmentType, AggregateType, Entry,
    EntryType, HolderType, LedgerCtx, Transfer, TransferId, TransferStatus,
    TransferType, accounts, advisory_lock_tx, entries, events, idempotency,
    limits, natural_key_lock, outbox,
};

/// Exchange rates are fixed-point integers scaled by 1e6.
pub const EXCHANGE_RATE_SCALE: i64 = 1_000_000;

/// What every mutation returns (and what idempotent replays reproduce).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionResult {
    pub transaction_id: TransferId,
    pub transfer_type: TransferType,
    pub status: TransferStatus,
    pub reference: String,
    pub amount: i64,
    pub currency: String,
    pub correlation_id: Uuid,
}

impl From<&Transfer> for TransactionResult {
    fn from(transfer: &Transfer) -> Self {
        Self {
            transaction_id: transfer.id,
            transfer_type: transfer.transfer_type,
            status: transfer.status,
            reference: transfer.reference.clone(),
            amount: transfer.amount,
            currency: transfer.currency.clone(),
            correlation_id: transfer.correlation_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CreditParams {
    pub holder_id: String,
    pub holder_type: Option<HolderType>,
    pub amount: i64,
    pub reference: String,
    /// Logical name or `@` identifier; defaults to the world account.
    pub source_system_account: Option<String>,
    pub idempotency_key: Option<String>,
    pub metadata: serde_json::Value,
}

impl CreditParams {
    pub fn new(
        holder_id: impl Into<String>,
        amount: i64,
        reference: impl Into<String>,
    ) -> Self {
        Self {
            holder_id: holder_id.into(),
            holder_type: None,
            amount,
            reference: reference.into(),
            source_system_account: None,
            idempotency_key: None,
            metadata: json!({}),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DebitParams {
    pub holder_id: String,
    pub holder_type: Option<HolderType>,
    pub amount: i64,
    pub reference: String,
    pub destination_system_account: Option<String>,
    /// Effective only when the account also allows overdraft.
    pub allow_overdraft: bool,
    pub idempotency_key: Option<String>,
    pub metadata: serde_json::Value,
}

impl DebitParams {
    pub fn new(
        holder_id: impl Into<String>,
        amount: i64,
        reference: impl Into<String>,
    ) -> Self {
        Self {
            holder_id: holder_id.into(),
            holder_type: None,
            amount,
            reference: reference.into(),
            destination_system_account: None,
            allow_overdraft: false,
            idempotency_key: None,
            metadata: json!({}),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransferParams {
    pub source_holder_id: String,
    pub source_holder_type: Option<HolderType>,
    pub destination_holder_id: String,
    pub destination_holder_type: Option<HolderType>,
    pub amount: i64,
    pub reference: String,
    /// Required for cross-currency transfers; scaled by
    /// [`EXCHANGE_RATE_SCALE`].
    pub exchange_rate: Option<i64>,
    pub idempotency_key: Option<String>,
    pub metadata: serde_json::Value,
}

impl TransferParams {
    pub fn new(
        source_holder_id: impl Into<String>,
        destination_holder_id: impl Into<String>,
        amount: i64,
        reference: impl Into<String>,
    ) -> Self {
        Self {
            source_holder_id: source_holder_id.into(),
            source_holder_type: None,
            destination_holder_id: destination_holder_id.into(),
            destination_holder_type: None,
            amount,
            reference: reference.into(),
            exchange_rate: None,
            idempotency_key: None,
            metadata: json!({}),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MultiTransferDestination {
    pub holder_id: String,
    pub holder_type: Option<HolderType>,
    pub amount: i64,
}

#[derive(Debug, Clone)]
pub struct MultiTransferParams {
    pub source_holder_id: String,
    pub source_holder_type: Option<HolderType>,
    pub amount: i64,
    pub destinations: Vec<MultiTransferDestination>,
    pub reference: String,
    pub idempotency_key: Option<String>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct RefundParams {
    pub transaction_id: TransferId,
    /// Defaults to the unrefunded remainder.
    pub amount: Option<i64>,
    pub reason: Option<String>,
}

/// One leg of a correction, adjustment or journal entry.
#[derive(Debug, Clone)]
pub struct JournalLeg {
    pub account: AccountRef,
    pub entry_type: EntryType,
    pub amount: i64,
}

#[derive(Debug, Clone)]
pub struct CorrectionParams {
    pub transaction_id: TransferId,
    pub entries: Vec<JournalLeg>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AdjustParams {
    pub entries: Vec<JournalLeg>,
    pub adjustment_type: AdjustmentType,
    pub reference: String,
    pub idempotency_key: Option<String>,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct JournalParams {
    pub entries: Vec<JournalLeg>,
    pub reference: String,
    pub idempotency_key: Option<String>,
    pub metadata: serde_json::Value,
}

/// Re-run a mutation closure while it fails retryably. Version conflicts
/// and lost unique-constraint races consume the optimistic budget, lock
/// timeouts the (default zero) lock budget; backoff doubles from the base
/// delay up to the configured cap.
pub(crate) async fn run_with_retries<T, Fut>(
    ctx: &LedgerCtx,
    mut f: impl FnMut() -> Fut,
) -> Result<T, LedgerError>
where
    Fut: Future<Output = Result<T, LedgerError>>,
{
    let mut optimistic_left = ctx.advanced.optimistic_retry_count;
    let mut lock_left = ctx.advanced.lock_retry_count;
    let mut attempt: u32 = 0;
    loop {
        match f().await {
            Err(e) if e.is_retryable() => {
                let budget = match e {
                    LedgerError::Timeout => &mut lock_left,
                    _ => &mut optimistic_left,
                };
                if *budget == 0 {
                    return Err(e);
                }
                *budget -= 1;
                attempt += 1;
                let delay = ctx
                    .advanced
                    .lock_retry_base_delay_ms
                    .saturating_mul(1u64 << (attempt - 1).min(16))
                    .min(ctx.advanced.lock_retry_max_delay_ms);
                tokio::time::sleep(std::time::Duration::from_millis(delay))
                    .await;
            }
            other => return other,
        }
    }
}

fn validate_amount(ctx: &LedgerCtx, amount: i64) -> Result<(), LedgerError> {
    if amount <= 0 {
        return Err(LedgerError::InvalidArgument(
            "amount must be a positive integer".into(),
        ));
    }
    if amount > ctx.advanced.max_transaction_amount {
        return Err(LedgerError::LimitExceeded(format!(
            "amount {amount} exceeds max_transaction_amount {}",
            ctx.advanced.max_transaction_amount
        )));
    }
    Ok(())
}

fn validate_reference(reference: &str) -> Result<(), LedgerError> {
    if reference.is_empty() || reference.len() > 255 {
        return Err(LedgerError::InvalidArgument(
            "reference must be 1-255 characters".into(),
        ));
    }
    Ok(())
}

/// Resolve an ordinary account inside the transaction, serializing
/// same-natural-key resolvers behind an advisory lock before any row lock
/// is taken.
pub(crate) async fn resolve_holder_tx(
    ctx: &LedgerCtx,
    tx: &mut Transaction<'_, Postgres>,
    holder_id: &str,
    holder_type: Option<HolderType>,
) -> Result<Account, LedgerError> {
    let matches = sqlx::query_as::<_, Account>(
        "SELECT * FROM accounts
        WHERE ledger_id = $1 AND holder_id = $2 AND NOT is_system
          AND ($3::holder_type IS NULL OR holder_type = $3)",
    )
    .bind(ctx.ledger_id)
    .bind(holder_id)
    .bind(holder_type)
    .fetch_all(&mut **tx)
    .await?;
    let account = match matches.len() {
        0 => return Err(LedgerError::NotFound("account")),
        1 => matches.into_iter().next().expect("one row"),
        _ => {
            return Err(LedgerError::InvalidArgument(format!(
                "holder {holder_id} matches multiple accounts; \
                 pass holder_type"
            )));
        }
    };
    advisory_lock_tx(
        tx,
        &natural_key_lock(&ctx.ledger_id, holder_id, account.holder_type),
    )
    .await?;
    Ok(account)
}

pub(crate) async fn resolve_account_tx(
    ctx: &LedgerCtx,
    tx: &mut Transaction<'_, Postgres>,
    account: &AccountRef,
) -> Result<Account, LedgerError> {
    match account {
        AccountRef::Holder {
            holder_id,
            holder_type,
        } => resolve_holder_tx(ctx, tx, holder_id, *holder_type).await,
        AccountRef::System(name) => {
            accounts::get_or_create_system_tx(
                ctx,
                tx,
                ctx.system_identifier(name),
                false,
            )
            .await
        }
    }
}

/// Row-lock the given accounts in ascending id order and return fresh
/// snapshots. Ascending order is the deadlock-avoidance rule shared by
/// every multi-account operation.
pub(crate) async fn lock_all(
    ctx: &LedgerCtx,
    tx: &mut Transaction<'_, Postgres>,
    ids: &[AccountId],
) -> Result<HashMap<AccountId, Account>, LedgerError> {
    let mut sorted: Vec<AccountId> = ids.to_vec();
    sorted.sort();
    sorted.dedup();
    let mut locked = HashMap::with_capacity(sorted.len());
    for id in sorted {
        locked.insert(id, entries::lock_account_tx(ctx, tx, &id).await?);
    }
    Ok(locked)
}

pub(crate) struct NewTransfer {
    pub transfer_type: TransferType,
    pub reference: String,
    pub status: TransferStatus,
    pub amount: i64,
    pub currency: String,
    pub source_account_id: Option<AccountId>,
    pub destination_account_id: Option<AccountId>,
    pub is_hold: bool,
    pub hold_expires_at: Option<jiff::Timestamp>,
    pub committed_amount: Option<i64>,
    pub parent_id: Option<TransferId>,
    pub is_reversal: bool,
    pub adjustment_type: Option<AdjustmentType>,
    pub correlation_id: Uuid,
    pub metadata: serde_json::Value,
    pub posted_at: Option<jiff::Timestamp>,
    pub effective_date: Option<jiff::Timestamp>,
}

pub(crate) async fn insert_transfer_tx(
    ctx: &LedgerCtx,
    tx: &mut Transaction<'_, Postgres>,
    transfer: NewTransfer,
) -> Result<Transfer, LedgerError> {
    sqlx::query_as::<_, Transfer>(
        "INSERT INTO transfers (
            ledger_id, transfer_type, reference, status, amount, currency,
            source_account_id, destination_account_id, is_hold,
            hold_expires_at, committed_amount, parent_id, is_reversal,
            adjustment_type, correlation_id, metadata, created_at,
            posted_at, effective_date
        ) VALUES (
            $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
            $15, $16, $17, $18, $19
        )
        RETURNING *",
    )
    .bind(ctx.ledger_id)
    .bind(transfer.transfer_type)
    .bind(&transfer.reference)
    .bind(transfer.status)
    .bind(transfer.amount)
    .bind(&transfer.currency)
    .bind(transfer.source_account_id)
    .bind(transfer.destination_account_id)
    .bind(transfer.is_hold)
    .bind(transfer.hold_expires_at.map(|t| t.to_sqlx()))
    .bind(transfer.committed_amount)
    .bind(transfer.parent_id)
    .bind(transfer.is_reversal)
    .bind(transfer.adjustment_type)
    .bind(transfer.correlation_id)
    .bind(Json(&transfer.metadata))
    .bind(ctx.time_source.now().to_sqlx())
    .bind(transfer.posted_at.map(|t| t.to_sqlx()))
    .bind(transfer.effective_date.map(|t| t.to_sqlx()))
    .fetch_one(&mut **tx)
    .await
    .map_err(Into::into)
}

fn transfer_event_data(transfer: &Transfer) -> serde_json::Value {
    json!({
        "transaction_id": transfer.id,
        "type": transfer.transfer_type,
        "status": transfer.status,
        "amount": transfer.amount,
        "currency": transfer.currency,
        "reference": transfer.reference,
        "source_account_id": transfer.source_account_id,
        "destination_account_id": transfer.destination_account_id,
        "is_reversal": transfer.is_reversal,
        "parent_id": transfer.parent_id,
    })
}

pub(crate) async fn append_posted_event(
    ctx: &LedgerCtx,
    tx: &mut Transaction<'_, Postgres>,
    transfer: &Transfer,
) -> Result<(), LedgerError> {
    events::append_tx(ctx, tx, events::AppendEvent {
        aggregate_type: AggregateType::Transaction,
        aggregate_id: transfer.id.0,
        event_type: "transaction-posted".into(),
        event_data: transfer_event_data(transfer),
        correlation_id: Some(transfer.correlation_id),
    })
    .await?;
    Ok(())
}

async fn check_idempotency(
    tx: &mut Transaction<'_, Postgres>,
    ctx: &LedgerCtx,
    key: Option<&str>,
    reference: &str,
) -> Result<Option<TransactionResult>, LedgerError> {
    let Some(key) = key else { return Ok(None) };
    let cached = idempotency::check_tx(
        tx,
        &ctx.ledger_id,
        key,
        reference,
        ctx.time_source.now(),
    )
    .await?;
    match cached {
        Some(value) => Ok(Some(
            serde_json::from_value(value)
                .map_err(|e| LedgerError::Internal(e.into()))?,
        )),
        None => Ok(None),
    }
}

async fn save_idempotency(
    tx: &mut Transaction<'_, Postgres>,
    ctx: &LedgerCtx,
    key: Option<&str>,
    reference: &str,
    result: &TransactionResult,
) -> Result<(), LedgerError> {
    let Some(key) = key else { return Ok(()) };
    let value = serde_json::to_value(result)
        .map_err(|e| LedgerError::Internal(e.into()))?;
    idempotency::save_tx(
        ctx,
        tx,
        key,
        reference,
        &value,
        ctx.time_source.now(),
    )
    .await
}

/// Credit a holder from a system account (the world by default).
pub async fn credit(
    ctx: &LedgerCtx,
    params: &CreditParams,
) -> Result<TransactionResult, LedgerError> {
    validate_amount(ctx, params.amount)?;
    validate_reference(&params.reference)?;
    run_with_retries(ctx, || credit_once(ctx, params)).await
}

async fn credit_once(
    ctx: &LedgerCtx,
    params: &CreditParams,
) -> Result<TransactionResult, LedgerError> {
    let mut tx = ctx.begin().await?;
    let op = OperationContext {
        operation: "transactions.credit".into(),
        ledger_id: ctx.ledger_id,
        payload: json!({
            "holder_id": params.holder_id,
            "amount": params.amount,
            "reference": params.reference,
        }),
    };
    ctx.hooks.run_before(&op).await?;

    if let Some(result) = check_idempotency(
        &mut tx,
        ctx,
        params.idempotency_key.as_deref(),
        &params.reference,
    )
    .await?
    {
        return Ok(result);
    }

    let system_name = params
        .source_system_account
        .as_deref()
        .unwrap_or(crate::config::WORLD_ACCOUNT);
    let system =
        resolve_account_tx(ctx, &mut tx, &AccountRef::system(system_name))
            .await?;
    let user = resolve_holder_tx(
        ctx,
        &mut tx,
        &params.holder_id,
        params.holder_type,
    )
    .await?;
    let locked = lock_all(ctx, &mut tx, &[system.id, user.id]).await?;
    let (system, user) = (&locked[&system.id], &locked[&user.id]);

    limits::enforce_tx(ctx, &mut tx, user, EntryType::Credit, params.amount)
        .await?;

    let now = ctx.time_source.now();
    let transfer = insert_transfer_tx(ctx, &mut tx, NewTransfer {
        transfer_type: TransferType::Credit,
        reference: params.reference.clone(),
        status: TransferStatus::Posted,
        amount: params.amount,
        currency: user.currency.clone(),
        source_account_id: Some(system.id),
        destination_account_id: Some(user.id),
        is_hold: false,
        hold_expires_at: None,
        committed_amount: None,
        parent_id: None,
        is_reversal: false,
        adjustment_type: None,
        correlation_id: Uuid::new_v4(),
        metadata: params.metadata.clone(),
        posted_at: Some(now),
        effective_date: Some(now),
    })
    .await?;

    entries::post_entry_tx(ctx, &mut tx, system, &entries::EntryParams {
        transfer_id: transfer.id,
        entry_type: EntryType::Debit,
        amount: params.amount,
        currency: user.currency.clone(),
        fx: None,
        allow_overdraft: false,
    })
    .await?;
    entries::post_entry_tx(ctx, &mut tx, user, &entries::EntryParams {
        transfer_id: transfer.id,
        entry_type: EntryType::Credit,
        amount: params.amount,
        currency: user.currency.clone(),
        fx: None,
        allow_overdraft: false,
    })
    .await?;

    append_posted_event(ctx, &mut tx, &transfer).await?;
    outbox::enqueue_tx(
        &mut tx,
        "ledger-transaction-posted",
        &transfer_event_data(&transfer),
    )
    .await?;

    let result = TransactionResult::from(&transfer);
    save_idempotency(
        &mut tx,
        ctx,
        params.idempotency_key.as_deref(),
        &params.reference,
        &result,
    )
    .await?;
    tx.commit().await?;
    ctx.hooks.run_after(&op).await;
    Ok(result)
}

/// Debit a holder into a system account (the world by default).
pub async fn debit(
    ctx: &LedgerCtx,
    params: &DebitParams,
) -> Result<TransactionResult, LedgerError> {
    validate_amount(ctx, params.amount)?;
    validate_reference(&params.reference)?;
    run_with_retries(ctx, || debit_once(ctx, params)).await
}

async fn debit_once(
    ctx: &LedgerCtx,
    params: &DebitParams,
) -> Result<TransactionResult, LedgerError> {
    let mut tx = ctx.begin().await?;
    let op = OperationContext {
        operation: "transactions.debit".into(),
        ledger_id: ctx.ledger_id,
        payload: json!({
            "holder_id": params.holder_id,
            "amount": params.amount,
            "reference": params.reference,
        }),
    };
    ctx.hooks.run_before(&op).await?;

    if let Some(result) = check_idempotency(
        &mut tx,
        ctx,
        params.idempotency_key.as_deref(),
        &params.reference,
    )
    .await?
    {
        return Ok(result);
    }

    let system_name = params
        .destination_system_account
        .as_deref()
        .unwrap_or(crate::config::WORLD_ACCOUNT);
    let system =
        resolve_account_tx(ctx, &mut tx, &AccountRef::system(system_name))
            .await?;
    let user = resolve_holder_tx(
        ctx,
        &mut tx,
        &params.holder_id,
        params.holder_type,
    )
    .await?;
    let locked = lock_all(ctx, &mut tx, &[system.id, user.id]).await?;
    let (system, user) = (&locked[&system.id], &locked[&user.id]);

    limits::enforce_tx(ctx, &mut tx, user, EntryType::Debit, params.amount)
        .await?;

    let now = ctx.time_source.now();
    let transfer = insert_transfer_tx(ctx, &mut tx, NewTransfer {
        transfer_type: TransferType::Debit,
        reference: params.reference.clone(),
        status: TransferStatus::Posted,
        amount: params.amount,
        currency: user.currency.clone(),
        source_account_id: Some(user.id),
        destination_account_id: Some(system.id),
        is_hold: false,
        hold_expires_at: None,
        committed_amount: None,
        parent_id: None,
        is_reversal: false,
        adjustment_type: None,
        correlation_id: Uuid::new_v4(),
        metadata: params.metadata.clone(),
        posted_at: Some(now),
        effective_date: Some(now),
    })
    .await?;

    entries::post_entry_tx(ctx, &mut tx, user, &entries::EntryParams {
        transfer_id: transfer.id,
        entry_type: EntryType::Debit,
        amount: params.amount,
        currency: user.currency.clone(),
        fx: None,
        allow_overdraft: params.allow_overdraft,
    })
    .await?;
    entries::post_entry_tx(ctx, &mut tx, system, &entries::EntryParams {
        transfer_id: transfer.id,
        entry_type: EntryType::Credit,
        amount: params.amount,
        currency: user.currency.clone(),
        fx: None,
        allow_overdraft: false,
    })
    .await?;

    append_posted_event(ctx, &mut tx, &transfer).await?;
    outbox::enqueue_tx(
        &mut tx,
        "ledger-transaction-posted",
        &transfer_event_data(&transfer),
    )
    .await?;

    let result = TransactionResult::from(&transfer);
    save_idempotency(
        &mut tx,
        ctx,
        params.idempotency_key.as_deref(),
        &params.reference,
        &result,
    )
    .await?;
    tx.commit().await?;
    ctx.hooks.run_after(&op).await;
    Ok(result)
}

/// Round-half-up fixed-point conversion for the destination leg of a
/// cross-currency transfer.
pub fn convert_amount(amount: i64, rate: i64) -> Result<i64, LedgerError> {
    if rate <= 0 {
        return Err(LedgerError::InvalidArgument(
            "exchange_rate must be positive".into(),
        ));
    }
    let scaled = (amount as i128) * (rate as i128);
    let converted = (scaled + (EXCHANGE_RATE_SCALE as i128) / 2)
        / (EXCHANGE_RATE_SCALE as i128);
    i64::try_from(converted).map_err(|_| {
        LedgerError::InvalidArgument(
            "converted amount overflows 64 bits".into(),
        )
    })
}

/// Move funds between two holder accounts. Cross-currency transfers
/// require an exchange rate and record the original amount on the
/// destination leg.
pub async fn transfer(
    ctx: &LedgerCtx,
    params: &TransferParams,
) -> Result<TransactionResult, LedgerError> {
    validate_amount(ctx, params.amount)?;
    validate_reference(&params.reference)?;
    run_with_retries(ctx, || transfer_once(ctx, params)).await
}

async fn transfer_once(
    ctx: &LedgerCtx,
    params: &TransferParams,
) -> Result<TransactionResult, LedgerError> {
    let mut tx = ctx.begin().await?;
    let op = OperationContext {
        operation: "transactions.transfer".into(),
        ledger_id: ctx.ledger_id,
        payload: json!({
            "source": params.source_holder_id,
            "destination": params.destination_holder_id,
            "amount": params.amount,
            "reference": params.reference,
        }),
    };
    ctx.hooks.run_before(&op).await?;

    if let Some(result) = check_idempotency(
        &mut tx,
        ctx,
        params.idempotency_key.as_deref(),
        &params.reference,
    )
    .await?
    {
        return Ok(result);
    }

    let source = resolve_holder_tx(
        ctx,
        &mut tx,
        &params.source_holder_id,
        params.source_holder_type,
    )
    .await?;
    let destination = resolve_holder_tx(
        ctx,
        &mut tx,
        &params.destination_holder_id,
        params.destination_holder_type,
    )
    .await?;
    if source.id == destination.id {
        return Err(LedgerError::InvalidArgument(
            "cannot transfer an account to itself".into(),
        ));
    }
    let locked = lock_all(ctx, &mut tx, &[source.id, destination.id]).await?;
    let (source, destination) =
        (&locked[&source.id], &locked[&destination.id]);

    let (destination_amount, fx) = if source.currency == destination.currency
    {
        if params.exchange_rate.is_some() {
            return Err(LedgerError::InvalidArgument(
                "exchange_rate is only valid for cross-currency transfers"
                    .into(),
            ));
        }
        (params.amount, None)
    } else {
        let rate = params.exchange_rate.ok_or_else(|| {
            LedgerError::InvalidArgument(format!(
                "transfer {} -> {} requires an exchange_rate",
                source.currency, destination.currency
            ))
        })?;
        let converted = convert_amount(params.amount, rate)?;
        if converted <= 0 {
            return Err(LedgerError::InvalidArgument(
                "converted amount rounds to zero".into(),
            ));
        }
        (converted, Some(entries::FxLeg {
            original_amount: params.amount,
            original_currency: source.currency.clone(),
            exchange_rate: rate,
        }))
    };

    limits::enforce_tx(ctx, &mut tx, source, EntryType::Debit, params.amount)
        .await?;
    limits::enforce_tx(
        ctx,
        &mut tx,
        destination,
        EntryType::Credit,
        destination_amount,
    )
    .await?;

    let now = ctx.time_source.now();
    let transfer = insert_transfer_tx(ctx, &mut tx, NewTransfer {
        transfer_type: TransferType::Transfer,
        reference: params.reference.clone(),
        status: TransferStatus::Posted,
        amount: params.amount,
        currency: source.currency.clone(),
        source_account_id: Some(source.id),
        destination_account_id: Some(destination.id),
        is_hold: false,
        hold_expires_at: None,
        committed_amount: None,
        parent_id: None,
        is_reversal: false,
        adjustment_type: None,
        correlation_id: Uuid::new_v4(),
        metadata: params.metadata.clone(),
        posted_at: Some(now),
        effective_date: Some(now),
    })
    .await?;

    entries::post_entry_tx(ctx, &mut tx, source, &entries::EntryParams {
        transfer_id: transfer.id,
        entry_type: EntryType::Debit,
        amount: params.amount,
        currency: source.currency.clone(),
        fx: None,
        allow_overdraft: false,
    })
    .await?;
    entries::post_entry_tx(ctx, &mut tx, destination, &entries::EntryParams {
        transfer_id: transfer.id,
        entry_type: EntryType::Credit,
        amount: destination_amount,
        currency: destination.currency.clone(),
        fx,
        allow_overdraft: false,
    })
    .await?;

    append_posted_event(ctx, &mut tx, &transfer).await?;
    outbox::enqueue_tx(
        &mut tx,
        "ledger-transaction-posted",
        &transfer_event_data(&transfer),
    )
    .await?;

    let result = TransactionResult::from(&transfer);
    save_idempotency(
        &mut tx,
        ctx,
        params.idempotency_key.as_deref(),
        &params.reference,
        &result,
    )
    .await?;
    tx.commit().await?;
    ctx.hooks.run_after(&op).await;
    Ok(result)
}

/// One debit on the source split into credits across several
/// destinations.
pub async fn multi_transfer(
    ctx: &LedgerCtx,
    params: &MultiTransferParams,
) -> Result<TransactionResult, LedgerError> {
    validate_amount(ctx, params.amount)?;
    validate_reference(&params.reference)?;
    if params.destinations.is_empty() {
        return Err(LedgerError::InvalidArgument(
            "multi_transfer requires at least one destination".into(),
        ));
    }
    let mut total: i64 = 0;
    for destination in &params.destinations {
        if destination.amount <= 0 {
            return Err(LedgerError::InvalidArgument(
                "destination amounts must be positive".into(),
            ));
        }
        total = total.checked_add(destination.amount).ok_or_else(|| {
            LedgerError::InvalidArgument(
                "destination amounts overflow".into(),
            )
        })?;
    }
    if total != params.amount {
        return Err(LedgerError::InvalidArgument(format!(
            "destination amounts sum to {total}, expected {}",
            params.amount
        )));
    }
    run_with_retries(ctx, || multi_transfer_once(ctx, params)).await
}

async fn multi_transfer_once(
    ctx: &LedgerCtx,
    params: &MultiTransferParams,
) -> Result<TransactionResult, LedgerError> {
    let mut tx = ctx.begin().await?;
    let op = OperationContext {
        operation: "transactions.multi_transfer".into(),
        ledger_id: ctx.ledger_id,
        payload: json!({
            "source": params.source_holder_id,
            "amount": params.amount,
            "destinations": params.destinations.len(),
            "reference": params.reference,
        }),
    };
    ctx.hooks.run_before(&op).await?;

    if let Some(result) = check_idempotency(
        &mut tx,
        ctx,
        params.idempotency_key.as_deref(),
        &params.reference,
    )
    .await?
    {
        return Ok(result);
    }

    let source = resolve_holder_tx(
        ctx,
        &mut tx,
        &params.source_holder_id,
        params.source_holder_type,
    )
    .await?;
    let mut destination_ids = Vec::with_capacity(params.destinations.len());
    let mut all_ids = vec![source.id];
    for destination in &params.destinations {
        let account = resolve_holder_tx(
            ctx,
            &mut tx,
            &destination.holder_id,
            destination.holder_type,
        )
        .await?;
        if account.id == source.id {
            return Err(LedgerError::InvalidArgument(
                "source cannot also be a destination".into(),
            ));
        }
        if destination_ids.contains(&account.id) {
            return Err(LedgerError::InvalidArgument(
                "destinations must be distinct".into(),
            ));
        }
        if account.currency != source.currency {
            return Err(LedgerError::InvalidArgument(
                "multi_transfer requires a single currency".into(),
            ));
        }
        destination_ids.push(account.id);
        all_ids.push(account.id);
    }
    let locked = lock_all(ctx, &mut tx, &all_ids).await?;
    let source = &locked[&source.id];

    limits::enforce_tx(ctx, &mut tx, source, EntryType::Debit, params.amount)
        .await?;
    for (destination_id, destination) in
        destination_ids.iter().zip(&params.destinations)
    {
        limits::enforce_tx(
            ctx,
            &mut tx,
            &locked[destination_id],
            EntryType::Credit,
            destination.amount,
        )
        .await?;
    }

    let now = ctx.time_source.now();
    let destinations_meta: Vec<serde_json::Value> = destination_ids
        .iter()
        .zip(&params.destinations)
        .map(|(id, destination)| {
            json!({ "account_id": id, "amount": destination.amount })
        })
        .collect();
    let mut metadata = params.metadata.clone();
    if let serde_json::Value::Object(map) = &mut metadata {
        map.insert("destinations".into(), json!(destinations_meta));
    }
    let transfer = insert_transfer_tx(ctx, &mut tx, NewTransfer {
        transfer_type: TransferType::MultiTransfer,
        reference: params.reference.clone(),
        status: TransferStatus::Posted,
        amount: params.amount,
        currency: source.currency.clone(),
        source_account_id: Some(source.id),
        destination_account_id: None,
        is_hold: false,
        hold_expires_at: None,
        committed_amount: None,
        parent_id: None,
        is_reversal: false,
        adjustment_type: None,
        correlation_id: Uuid::new_v4(),
        metadata,
        posted_at: Some(now),
        effective_date: Some(now),
    })
    .await?;

    entries::post_entry_tx(ctx, &mut tx, source, &entries::EntryParams {
        transfer_id: transfer.id,
        entry_type: EntryType::Debit,
        amount: params.amount,
        currency: source.currency.clone(),
        fx: None,
        allow_overdraft: false,
    })
    .await?;
    for (destination_id, destination) in
        destination_ids.iter().zip(&params.destinations)
    {
        entries::post_entry_tx(
            ctx,
            &mut tx,
            &locked[destination_id],
            &entries::EntryParams {
                transfer_id: transfer.id,
                entry_type: EntryType::Credit,
                amount: destination.amount,
                currency: source.currency.clone(),
                fx: None,
                allow_overdraft: false,
            },
        )
        .await?;
    }

    append_posted_event(ctx, &mut tx, &transfer).await?;
    outbox::enqueue_tx(
        &mut tx,
        "ledger-transaction-posted",
        &transfer_event_data(&transfer),
    )
    .await?;

    let result = TransactionResult::from(&transfer);
    save_idempotency(
        &mut tx,
        ctx,
        params.idempotency_key.as_deref(),
        &params.reference,
        &result,
    )
    .await?;
    tx.commit().await?;
    ctx.hooks.run_after(&op).await;
    Ok(result)
}

/// Reverse a posted transfer, fully or partially. Partial refunds are
/// limited to two-leg transfers with equal leg amounts; everything else
/// must be refunded in full.
pub async fn refund(
    ctx: &LedgerCtx,
    params: &RefundParams,
) -> Result<TransactionResult, LedgerError> {
    if let Some(amount) = params.amount {
        validate_amount(ctx, amount)?;
    }
    run_with_retries(ctx, || refund_once(ctx, params)).await
}

async fn refund_once(
    ctx: &LedgerCtx,
    params: &RefundParams,
) -> Result<TransactionResult, LedgerError> {
    let mut tx = ctx.begin().await?;
    let op = OperationContext {
        operation: "transactions.refund".into(),
        ledger_id: ctx.ledger_id,
        payload: json!({
            "transaction_id": params.transaction_id,
            "amount": params.amount,
        }),
    };
    ctx.hooks.run_before(&op).await?;

    let original = lock_transfer_tx(ctx, &mut tx, &params.transaction_id)
        .await?;
    if original.is_reversal {
        return Err(LedgerError::InvalidArgument(
            "cannot refund a reversal".into(),
        ));
    }
    if original.is_hold {
        return Err(LedgerError::InvalidArgument(
            "holds are voided, not refunded".into(),
        ));
    }
    if original.status != TransferStatus::Posted {
        return Err(LedgerError::InvalidArgument(format!(
            "only posted transfers can be refunded, status is {}",
            original.status
        )));
    }
    let remaining = original.amount - original.refunded_amount;
    let amount = params.amount.unwrap_or(remaining);
    if amount <= 0 || amount > remaining {
        return Err(LedgerError::InvalidArgument(format!(
            "refund amount {amount} exceeds the unrefunded remainder \
             {remaining}"
        )));
    }

    let original_entries = entries_for_transfer_tx(&mut tx, &original.id)
        .await?;
    let full = amount == remaining && original.refunded_amount == 0;
    if !full {
        let two_equal_legs = original_entries.len() == 2
            && original_entries
                .iter()
                .all(|e| e.amount == original.amount);
        if !two_equal_legs {
            return Err(LedgerError::InvalidArgument(
                "partial refunds require a simple two-leg transfer".into(),
            ));
        }
    }

    let ids: Vec<AccountId> =
        original_entries.iter().map(|e| e.account_id).collect();
    let locked = lock_all(ctx, &mut tx, &ids).await?;

    let now = ctx.time_source.now();
    let reference = format!(
        "refund:{}:{}",
        original.reference,
        original.refunded_amount + amount
    );
    let reversal = insert_transfer_tx(ctx, &mut tx, NewTransfer {
        transfer_type: TransferType::Refund,
        reference,
        status: TransferStatus::Posted,
        amount,
        currency: original.currency.clone(),
        source_account_id: original.destination_account_id,
        destination_account_id: original.source_account_id,
        is_hold: false,
        hold_expires_at: None,
        committed_amount: None,
        parent_id: Some(original.id),
        is_reversal: true,
        adjustment_type: None,
        correlation_id: original.correlation_id,
        metadata: json!({ "reason": params.reason }),
        posted_at: Some(now),
        effective_date: Some(now),
    })
    .await?;

    for entry in &original_entries {
        let leg_amount = if full { entry.amount } else { amount };
        entries::post_entry_tx(
            ctx,
            &mut tx,
            &locked[&entry.account_id],
            &entries::EntryParams {
                transfer_id: reversal.id,
                entry_type: entry.entry_type.opposite(),
                amount: leg_amount,
                currency: entry.currency.clone(),
                fx: None,
                allow_overdraft: false,
            },
        )
        .await?;
    }

    let refunded_total = original.refunded_amount + amount;
    let new_status = if refunded_total == original.amount {
        TransferStatus::Reversed
    } else {
        original.status
    };
    sqlx::query(
        "UPDATE transfers SET refunded_amount = $1, status = $2
        WHERE id = $3",
    )
    .bind(refunded_total)
    .bind(new_status)
    .bind(original.id)
    .execute(&mut *tx)
    .await?;

    append_posted_event(ctx, &mut tx, &reversal).await?;
    events::append_tx(ctx, &mut tx, events::AppendEvent {
        aggregate_type: AggregateType::Transaction,
        aggregate_id: original.id.0,
        event_type: "transaction-refunded".into(),
        event_data: json!({
            "transaction_id": original.id,
            "refund_id": reversal.id,
            "amount": amount,
            "refunded_total": refunded_total,
            "status": new_status,
            "reason": params.reason,
        }),
        correlation_id: Some(original.correlation_id),
    })
    .await?;
    outbox::enqueue_tx(
        &mut tx,
        "ledger-transaction-refunded",
        &json!({
            "transaction_id": original.id,
            "refund_id": reversal.id,
            "amount": amount,
        }),
    )
    .await?;

    tx.commit().await?;
    ctx.hooks.run_after(&op).await;
    Ok(TransactionResult::from(&reversal))
}

/// Reverse a posted transfer in full and post a replacement set of
/// balanced legs, grouped under the original's correlation id.
pub async fn correct(
    ctx: &LedgerCtx,
    params: &CorrectionParams,
) -> Result<TransactionResult, LedgerError> {
    validate_legs(ctx, &params.entries)?;
    run_with_retries(ctx, || correct_once(ctx, params)).await
}

async fn correct_once(
    ctx: &LedgerCtx,
    params: &CorrectionParams,
) -> Result<TransactionResult, LedgerError> {
    let mut tx = ctx.begin().await?;
    let op = OperationContext {
        operation: "transactions.correct".into(),
        ledger_id: ctx.ledger_id,
        payload: json!({
            "transaction_id": params.transaction_id,
            "legs": params.entries.len(),
        }),
    };
    ctx.hooks.run_before(&op).await?;

    let original = lock_transfer_tx(ctx, &mut tx, &params.transaction_id)
        .await?;
    if original.is_reversal || original.is_hold {
        return Err(LedgerError::InvalidArgument(
            "only ordinary posted transfers can be corrected".into(),
        ));
    }
    if original.status != TransferStatus::Posted {
        return Err(LedgerError::InvalidArgument(format!(
            "only posted transfers can be corrected, status is {}",
            original.status
        )));
    }
    if original.refunded_amount != 0 {
        return Err(LedgerError::Conflict(
            "cannot correct a partially refunded transfer".into(),
        ));
    }

    let original_entries = entries_for_transfer_tx(&mut tx, &original.id)
        .await?;
    let mut correction_accounts = Vec::with_capacity(params.entries.len());
    for leg in &params.entries {
        let account =
            resolve_account_tx(ctx, &mut tx, &leg.account).await?;
        correction_accounts.push(account);
    }
    let mut all_ids: Vec<AccountId> =
        original_entries.iter().map(|e| e.account_id).collect();
    all_ids.extend(correction_accounts.iter().map(|a| a.id));
    let locked = lock_all(ctx, &mut tx, &all_ids).await?;

    let now = ctx.time_source.now();
    let reversal = insert_transfer_tx(ctx, &mut tx, NewTransfer {
        transfer_type: TransferType::Correction,
        reference: format!("correction-reversal:{}", original.reference),
        status: TransferStatus::Posted,
        amount: original.amount,
        currency: original.currency.clone(),
        source_account_id: original.destination_account_id,
        destination_account_id: original.source_account_id,
        is_hold: false,
        hold_expires_at: None,
        committed_amount: None,
        parent_id: Some(original.id),
        is_reversal: true,
        adjustment_type: None,
        correlation_id: original.correlation_id,
        metadata: json!({ "reason": params.reason }),
        posted_at: Some(now),
        effective_date: Some(now),
    })
    .await?;
    for entry in &original_entries {
        entries::post_entry_tx(
            ctx,
            &mut tx,
            &locked[&entry.account_id],
            &entries::EntryParams {
                transfer_id: reversal.id,
                entry_type: entry.entry_type.opposite(),
                amount: entry.amount,
                currency: entry.currency.clone(),
                fx: None,
                allow_overdraft: false,
            },
        )
        .await?;
    }
    sqlx::query(
        "UPDATE transfers SET refunded_amount = amount, status = 'reversed'
        WHERE id = $1",
    )
    .bind(original.id)
    .execute(&mut *tx)
    .await?;

    // Reversal legs may have touched the same accounts; refresh snapshots
    // before posting the corrected legs.
    let ids: Vec<AccountId> =
        correction_accounts.iter().map(|a| a.id).collect();
    let relocked = lock_all(ctx, &mut tx, &ids).await?;

    let corrected_amount: i64 = params
        .entries
        .iter()
        .filter(|leg| leg.entry_type == EntryType::Debit)
        .map(|leg| leg.amount)
        .sum();
    let correction = insert_transfer_tx(ctx, &mut tx, NewTransfer {
        transfer_type: TransferType::Correction,
        reference: format!("correction:{}", original.reference),
        status: TransferStatus::Posted,
        amount: corrected_amount,
        currency: original.currency.clone(),
        source_account_id: None,
        destination_account_id: None,
        is_hold: false,
        hold_expires_at: None,
        committed_amount: None,
        parent_id: Some(original.id),
        is_reversal: false,
        adjustment_type: None,
        correlation_id: original.correlation_id,
        metadata: json!({ "reason": params.reason }),
        posted_at: Some(now),
        effective_date: Some(now),
    })
    .await?;
    for (leg, account) in params.entries.iter().zip(&correction_accounts) {
        entries::post_entry_tx(
            ctx,
            &mut tx,
            &relocked[&account.id],
            &entries::EntryParams {
                transfer_id: correction.id,
                entry_type: leg.entry_type,
                amount: leg.amount,
                currency: relocked[&account.id].currency.clone(),
                fx: None,
                allow_overdraft: false,
            },
        )
        .await?;
    }

    events::append_tx(ctx, &mut tx, events::AppendEvent {
        aggregate_type: AggregateType::Transaction,
        aggregate_id: original.id.0,
        event_type: "transaction-reversed".into(),
        event_data: json!({
            "transaction_id": original.id,
            "correction_id": correction.id,
            "reason": params.reason,
        }),
        correlation_id: Some(original.correlation_id),
    })
    .await?;
    append_posted_event(ctx, &mut tx, &reversal).await?;
    append_posted_event(ctx, &mut tx, &correction).await?;
    outbox::enqueue_tx(
        &mut tx,
        "ledger-transaction-corrected",
        &json!({
            "transaction_id": original.id,
            "correction_id": correction.id,
        }),
    )
    .await?;

    tx.commit().await?;
    ctx.hooks.run_after(&op).await;
    Ok(TransactionResult::from(&correction))
}

/// Balanced N-leg entry tagged with an adjustment type.
pub async fn adjust(
    ctx: &LedgerCtx,
    params: &AdjustParams,
) -> Result<TransactionResult, LedgerError> {
    validate_reference(&params.reference)?;
    validate_legs(ctx, &params.entries)?;
    run_with_retries(ctx, || {
        journal_once(
            ctx,
            &params.entries,
            TransferType::Adjustment,
            Some(params.adjustment_type),
            &params.reference,
            params.idempotency_key.as_deref(),
            &params.metadata,
            "transactions.adjust",
        )
    })
    .await
}

/// Plain balanced N-leg journal entry.
pub async fn journal(
    ctx: &LedgerCtx,
    params: &JournalParams,
) -> Result<TransactionResult, LedgerError> {
    validate_reference(&params.reference)?;
    validate_legs(ctx, &params.entries)?;
    run_with_retries(ctx, || {
        journal_once(
            ctx,
            &params.entries,
            TransferType::Journal,
            None,
            &params.reference,
            params.idempotency_key.as_deref(),
            &params.metadata,
            "transactions.journal",
        )
    })
    .await
}

fn validate_legs(
    ctx: &LedgerCtx,
    legs: &[JournalLeg],
) -> Result<(), LedgerError> {
    if legs.len() < 2 {
        return Err(LedgerError::InvalidArgument(
            "a journal entry needs at least two legs".into(),
        ));
    }
    let mut debits: i64 = 0;
    let mut credits: i64 = 0;
    for leg in legs {
        validate_amount(ctx, leg.amount)?;
        match leg.entry_type {
            EntryType::Debit => {
                debits = debits.checked_add(leg.amount).ok_or_else(|| {
                    LedgerError::InvalidArgument("legs overflow".into())
                })?;
            }
            EntryType::Credit => {
                credits =
                    credits.checked_add(leg.amount).ok_or_else(|| {
                        LedgerError::InvalidArgument("legs overflow".into())
                    })?;
            }
        }
    }
    if debits != credits {
        return Err(LedgerError::InvalidArgument(format!(
            "legs are unbalanced: debits {debits}, credits {credits}"
        )));
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn journal_once(
    ctx: &LedgerCtx,
    legs: &[JournalLeg],
    transfer_type: TransferType,
    adjustment_type: Option<AdjustmentType>,
    reference: &str,
    idempotency_key: Option<&str>,
    metadata: &serde_json::Value,
    operation: &str,
) -> Result<TransactionResult, LedgerError> {
    let mut tx = ctx.begin().await?;
    let op = OperationContext {
        operation: operation.into(),
        ledger_id: ctx.ledger_id,
        payload: json!({ "reference": reference, "legs": legs.len() }),
    };
    ctx.hooks.run_before(&op).await?;

    if let Some(result) =
        check_idempotency(&mut tx, ctx, idempotency_key, reference).await?
    {
        return Ok(result);
    }

    let mut accounts = Vec::with_capacity(legs.len());
    for leg in legs {
        let account =
            resolve_account_tx(ctx, &mut tx, &leg.account).await?;
        if accounts.iter().any(|a: &Account| a.id == account.id) {
            return Err(LedgerError::InvalidArgument(
                "each account may appear in at most one leg".into(),
            ));
        }
        accounts.push(account);
    }
    let currency = accounts
        .iter()
        .find(|a| !a.is_system)
        .map(|a| a.currency.clone())
        .unwrap_or_else(|| ctx.currency.clone());
    for account in accounts.iter().filter(|a| !a.is_system) {
        if account.currency != currency {
            return Err(LedgerError::InvalidArgument(
                "journal legs must share one currency".into(),
            ));
        }
    }

    let ids: Vec<AccountId> = accounts.iter().map(|a| a.id).collect();
    let locked = lock_all(ctx, &mut tx, &ids).await?;
    for (leg, account) in legs.iter().zip(&accounts) {
        limits::enforce_tx(
            ctx,
            &mut tx,
            &locked[&account.id],
            leg.entry_type,
            leg.amount,
        )
        .await?;
    }

    let amount: i64 = legs
        .iter()
        .filter(|leg| leg.entry_type == EntryType::Debit)
        .map(|leg| leg.amount)
        .sum();
    let now = ctx.time_source.now();
    let transfer = insert_transfer_tx(ctx, &mut tx, NewTransfer {
        transfer_type,
        reference: reference.to_string(),
        status: TransferStatus::Posted,
        amount,
        currency,
        source_account_id: None,
        destination_account_id: None,
        is_hold: false,
        hold_expires_at: None,
        committed_amount: None,
        parent_id: None,
        is_reversal: false,
        adjustment_type,
        correlation_id: Uuid::new_v4(),
        metadata: metadata.clone(),
        posted_at: Some(now),
        effective_date: Some(now),
    })
    .await?;

    for (leg, account) in legs.iter().zip(&accounts) {
        entries::post_entry_tx(
            ctx,
            &mut tx,
            &locked[&account.id],
            &entries::EntryParams {
                transfer_id: transfer.id,
                entry_type: leg.entry_type,
                amount: leg.amount,
                currency: transfer.currency.clone(),
                fx: None,
                allow_overdraft: false,
            },
        )
        .await?;
    }

    append_posted_event(ctx, &mut tx, &transfer).await?;
    outbox::enqueue_tx(
        &mut tx,
        "ledger-transaction-posted",
        &transfer_event_data(&transfer),
    )
    .await?;

    let result = TransactionResult::from(&transfer);
    save_idempotency(&mut tx, ctx, idempotency_key, reference, &result)
        .await?;
    tx.commit().await?;
    ctx.hooks.run_after(&op).await;
    Ok(result)
}

pub(crate) async fn lock_transfer_tx(
    ctx: &LedgerCtx,
    tx: &mut Transaction<'_, Postgres>,
    id: &TransferId,
) -> Result<Transfer, LedgerError> {
    sqlx::query_as::<_, Transfer>(
        "SELECT * FROM transfers
        WHERE id = $1 AND ledger_id = $2
        FOR UPDATE",
    )
    .bind(id)
    .bind(ctx.ledger_id)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or(LedgerError::NotFound("transfer"))
}

pub(crate) async fn entries_for_transfer_tx(
    tx: &mut Transaction<'_, Postgres>,
    transfer_id: &TransferId,
) -> Result<Vec<Entry>, LedgerError> {
    Ok(sqlx::query_as::<_, Entry>(
        "SELECT * FROM entries WHERE transfer_id = $1
        ORDER BY sequence_number",
    )
    .bind(transfer_id)
    .fetch_all(&mut **tx)
    .await?)
}

pub async fn get(
    ctx: &LedgerCtx,
    id: &TransferId,
) -> Result<Transfer, LedgerError> {
    sqlx::query_as::<_, Transfer>(
        "SELECT * FROM transfers WHERE id = $1 AND ledger_id = $2",
    )
    .bind(id)
    .bind(ctx.ledger_id)
    .fetch_optional(&ctx.pool)
    .await?
    .ok_or(LedgerError::NotFound("transfer"))
}

pub async fn get_by_reference(
    ctx: &LedgerCtx,
    reference: &str,
) -> Result<Transfer, LedgerError> {
    sqlx::query_as::<_, Transfer>(
        "SELECT * FROM transfers
        WHERE ledger_id = $1 AND reference = $2",
    )
    .bind(ctx.ledger_id)
    .bind(reference)
    .fetch_optional(&ctx.pool)
    .await?
    .ok_or(LedgerError::NotFound("transfer"))
}

pub async fn list(
    ctx: &LedgerCtx,
    limit: i64,
    offset: i64,
) -> Result<Vec<Transfer>, LedgerError> {
    Ok(sqlx::query_as::<_, Transfer>(
        "SELECT * FROM transfers
        WHERE ledger_id = $1
        ORDER BY created_at DESC
        LIMIT $2 OFFSET $3",
    )
    .bind(ctx.ledger_id)
    .bind(limit)
    .bind(offset)
    .fetch_all(&ctx.pool)
    .await?)
}

/// List the double-entry legs of one transfer.
pub async fn entries_for(
    ctx: &LedgerCtx,
    transfer_id: &TransferId,
) -> Result<Vec<Entry>, LedgerError> {
    Ok(sqlx::query_as::<_, Entry>(
        "SELECT * FROM entries
        WHERE ledger_id = $1 AND transfer_id = $2
        ORDER BY sequence_number",
    )
    .bind(ctx.ledger_id)
    .bind(transfer_id)
    .fetch_all(&ctx.pool)
    .await?)
}
