//! Two-phase holds.
//!
//! Creating a hold reserves funds in the `pending_*` balance fields; no
//! double-entry legs exist yet. Committing converts the reservation into
//! real entries for the committed amount (any unused remainder is simply
//! released), voiding or expiring releases the reservation untouched.

use jiff_sqlx::ToSqlx;
use serde_json::json;
use uuid::Uuid;

use crate::error::LedgerError;
use crate::plugin::OperationContext;
use crate::store::{
    Account, AccountId, AccountRef, AggregateType, EntryType, LedgerCtx,
    Transfer, TransferId, TransferStatus, TransferType, accounts, entries,
    events, idempotency, outbox, transactions,
};

const DEFAULT_EXPIRY_MINUTES: i64 = 60;

#[derive(Debug, Clone)]
pub struct HoldDestination {
    pub account: AccountRef,
    pub amount: i64,
}

#[derive(Debug, Clone)]
pub struct CreateHoldParams {
    pub holder_id: String,
    pub holder_type: Option<crate::store::HolderType>,
    pub amount: i64,
    pub reference: String,
    pub expires_in_minutes: Option<i64>,
    /// Optional payees. Empty means the commit settles against the world
    /// account; amounts must sum to the hold amount otherwise.
    pub destinations: Vec<HoldDestination>,
    pub idempotency_key: Option<String>,
    pub metadata: serde_json::Value,
}

impl CreateHoldParams {
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
            expires_in_minutes: None,
            destinations: Vec::new(),
            idempotency_key: None,
            metadata: json!({}),
        }
    }
}

/// Reserve funds on the source account until commit, void or expiry.
pub async fn create(
    ctx: &LedgerCtx,
    params: &CreateHoldParams,
) -> Result<Transfer, LedgerError> {
    if params.amount <= 0 {
        return Err(LedgerError::InvalidArgument(
            "amount must be a positive integer".into(),
        ));
    }
    if params.amount > ctx.advanced.max_transaction_amount {
        return Err(LedgerError::LimitExceeded(format!(
            "amount {} exceeds max_transaction_amount {}",
            params.amount, ctx.advanced.max_transaction_amount
        )));
    }
    if params.reference.is_empty() {
        return Err(LedgerError::InvalidArgument(
            "reference must not be empty".into(),
        ));
    }
    if !params.destinations.is_empty() {
        let total: i64 = params.destinations.iter().map(|d| d.amount).sum();
        if total != params.amount
            || params.destinations.iter().any(|d| d.amount <= 0)
        {
            return Err(LedgerError::InvalidArgument(
                "destination amounts must be positive and sum to the hold \
                 amount"
                    .into(),
            ));
        }
    }
    let expiry = params
        .expires_in_minutes
        .unwrap_or(DEFAULT_EXPIRY_MINUTES);
    if expiry <= 0 {
        return Err(LedgerError::InvalidArgument(
            "expires_in_minutes must be positive".into(),
        ));
    }
    transactions::run_with_retries(ctx, || create_once(ctx, params, expiry))
        .await
}

async fn create_once(
    ctx: &LedgerCtx,
    params: &CreateHoldParams,
    expiry_minutes: i64,
) -> Result<Transfer, LedgerError> {
    let mut tx = ctx.begin().await?;
    let op = OperationContext {
        operation: "holds.create".into(),
        ledger_id: ctx.ledger_id,
        payload: json!({
            "holder_id": params.holder_id,
            "amount": params.amount,
            "reference": params.reference,
        }),
    };
    ctx.hooks.run_before(&op).await?;
    let now = ctx.time_source.now();

    if let Some(key) = params.idempotency_key.as_deref() {
        if let Some(cached) = idempotency::check_tx(
            &mut tx,
            &ctx.ledger_id,
            key,
            &params.reference,
            now,
        )
        .await?
        {
            let id: TransferId = serde_json::from_value(cached)
                .map_err(|e| LedgerError::Internal(e.into()))?;
            let existing =
                transactions::lock_transfer_tx(ctx, &mut tx, &id).await?;
            return Ok(existing);
        }
    }

    let source = transactions::resolve_holder_tx(
        ctx,
        &mut tx,
        &params.holder_id,
        params.holder_type,
    )
    .await?;
    let mut destination_accounts: Vec<(Account, i64)> =
        Vec::with_capacity(params.destinations.len());
    let mut ids = vec![source.id];
    for destination in &params.destinations {
        let account = transactions::resolve_account_tx(
            ctx,
            &mut tx,
            &destination.account,
        )
        .await?;
        if account.id == source.id
            || destination_accounts.iter().any(|(a, _)| a.id == account.id)
        {
            return Err(LedgerError::InvalidArgument(
                "hold destinations must be distinct from the source and \
                 each other"
                    .into(),
            ));
        }
        ids.push(account.id);
        destination_accounts.push((account, destination.amount));
    }
    let locked = transactions::lock_all(ctx, &mut tx, &ids).await?;
    let source = &locked[&source.id];

    entries::adjust_pending_tx(ctx, &mut tx, source, params.amount, 0)
        .await?;
    for (account, amount) in &destination_accounts {
        entries::adjust_pending_tx(
            ctx,
            &mut tx,
            &locked[&account.id],
            0,
            *amount,
        )
        .await?;
    }

    let expires_at = now
        .checked_add(jiff::Span::new().minutes(expiry_minutes))
        .map_err(|e| LedgerError::InvalidArgument(e.to_string()))?;
    let mut metadata = params.metadata.clone();
    if let serde_json::Value::Object(map) = &mut metadata {
        if !destination_accounts.is_empty() {
            let dests: Vec<serde_json::Value> = destination_accounts
                .iter()
                .map(|(account, amount)| {
                    json!({ "account_id": account.id, "amount": amount })
                })
                .collect();
            map.insert("destinations".into(), json!(dests));
        }
    }
    let single_destination = match destination_accounts.as_slice() {
        [(account, _)] => Some(account.id),
        _ => None,
    };
    let hold = transactions::insert_transfer_tx(
        ctx,
        &mut tx,
        transactions::NewTransfer {
            transfer_type: TransferType::Hold,
            reference: params.reference.clone(),
            status: TransferStatus::Inflight,
            amount: params.amount,
            currency: source.currency.clone(),
            source_account_id: Some(source.id),
            destination_account_id: single_destination,
            is_hold: true,
            hold_expires_at: Some(expires_at),
            committed_amount: None,
            parent_id: None,
            is_reversal: false,
            adjustment_type: None,
            correlation_id: Uuid::new_v4(),
            metadata,
            posted_at: None,
            effective_date: None,
        },
    )
    .await?;

    events::append_tx(ctx, &mut tx, events::AppendEvent {
        aggregate_type: AggregateType::Transaction,
        aggregate_id: hold.id.0,
        event_type: "hold-created".into(),
        event_data: json!({
            "hold_id": hold.id,
            "source_account_id": source.id,
            "amount": params.amount,
            "expires_at": expires_at.to_string(),
        }),
        correlation_id: Some(hold.correlation_id),
    })
    .await?;
    outbox::enqueue_tx(
        &mut tx,
        "ledger-hold-created",
        &json!({
            "ledger_id": ctx.ledger_id,
            "hold_id": hold.id,
            "amount": params.amount,
        }),
    )
    .await?;

    if let Some(key) = params.idempotency_key.as_deref() {
        idempotency::save_tx(
            ctx,
            &mut tx,
            key,
            &params.reference,
            &serde_json::to_value(hold.id)
                .map_err(|e| LedgerError::Internal(e.into()))?,
            now,
        )
        .await?;
    }
    tx.commit().await?;
    ctx.hooks.run_after(&op).await;
    Ok(hold)
}

fn hold_destinations(
    hold: &Transfer,
) -> Result<Vec<(AccountId, i64)>, LedgerError> {
    let Some(dests) = hold.metadata.0.get("destinations") else {
        return Ok(Vec::new());
    };
    serde_json::from_value::<Vec<serde_json::Value>>(dests.clone())
        .map_err(|e| LedgerError::Internal(e.into()))?
        .into_iter()
        .map(|d| {
            let account_id: AccountId =
                serde_json::from_value(d["account_id"].clone())
                    .map_err(|e| LedgerError::Internal(e.into()))?;
            let amount = d["amount"].as_i64().ok_or_else(|| {
                LedgerError::InvalidArgument(
                    "malformed hold destination metadata".into(),
                )
            })?;
            Ok((account_id, amount))
        })
        .collect()
}

/// Post the held funds. A partial `amount` (single-destination holds
/// only) commits that much and releases the rest.
pub async fn commit(
    ctx: &LedgerCtx,
    hold_id: &TransferId,
    amount: Option<i64>,
) -> Result<Transfer, LedgerError> {
    transactions::run_with_retries(ctx, || {
        commit_once(ctx, hold_id, amount)
    })
    .await
}

async fn commit_once(
    ctx: &LedgerCtx,
    hold_id: &TransferId,
    amount: Option<i64>,
) -> Result<Transfer, LedgerError> {
    let mut tx = ctx.begin().await?;
    let op = OperationContext {
        operation: "holds.commit".into(),
        ledger_id: ctx.ledger_id,
        payload: json!({ "hold_id": hold_id, "amount": amount }),
    };
    ctx.hooks.run_before(&op).await?;
    let now = ctx.time_source.now();

    let hold = transactions::lock_transfer_tx(ctx, &mut tx, hold_id).await?;
    if !hold.is_hold {
        return Err(LedgerError::InvalidArgument(
            "transfer is not a hold".into(),
        ));
    }
    if hold.status != TransferStatus::Inflight {
        return Err(LedgerError::InvalidArgument(format!(
            "hold {} is {}, not inflight",
            hold.id, hold.status
        )));
    }
    if hold.hold_expires_at.is_some_and(|expires| now >= expires) {
        return Err(LedgerError::HoldExpired(hold.id));
    }
    let commit_amount = amount.unwrap_or(hold.amount);
    if commit_amount <= 0 || commit_amount > hold.amount {
        return Err(LedgerError::InvalidArgument(format!(
            "commit amount {commit_amount} must be within the hold amount \
             {}",
            hold.amount
        )));
    }

    let destinations = hold_destinations(&hold)?;
    if commit_amount != hold.amount && destinations.len() > 1 {
        return Err(LedgerError::InvalidArgument(
            "partial commits are limited to single-destination holds".into(),
        ));
    }
    let source_id = hold
        .source_account_id
        .ok_or(LedgerError::NotFound("hold source account"))?;

    let mut ids = vec![source_id];
    ids.extend(destinations.iter().map(|(id, _)| *id));
    let world;
    let credit_plan: Vec<(AccountId, i64)> = if destinations.is_empty() {
        world = accounts::get_or_create_system_tx(
            ctx,
            &mut tx,
            ctx.world_identifier(),
            false,
        )
        .await?;
        ids.push(world.id);
        vec![(world.id, commit_amount)]
    } else if destinations.len() == 1 {
        vec![(destinations[0].0, commit_amount)]
    } else {
        destinations.clone()
    };
    let locked = transactions::lock_all(ctx, &mut tx, &ids).await?;

    // Release the reservation in full, then post the committed amount.
    entries::adjust_pending_tx(
        ctx,
        &mut tx,
        &locked[&source_id],
        -hold.amount,
        0,
    )
    .await?;
    for (destination_id, reserved) in &destinations {
        entries::adjust_pending_tx(
            ctx,
            &mut tx,
            &locked[destination_id],
            0,
            -reserved,
        )
        .await?;
    }

    // Pending updates bumped versions; refresh before the real entries.
    let relocked = transactions::lock_all(ctx, &mut tx, &ids).await?;
    entries::post_entry_tx(
        ctx,
        &mut tx,
        &relocked[&source_id],
        &entries::EntryParams {
            transfer_id: hold.id,
            entry_type: EntryType::Debit,
            amount: commit_amount,
            currency: hold.currency.clone(),
            fx: None,
            allow_overdraft: false,
        },
    )
    .await?;
    for (destination_id, credit_amount) in &credit_plan {
        entries::post_entry_tx(
            ctx,
            &mut tx,
            &relocked[destination_id],
            &entries::EntryParams {
                transfer_id: hold.id,
                entry_type: EntryType::Credit,
                amount: *credit_amount,
                currency: hold.currency.clone(),
                fx: None,
                allow_overdraft: false,
            },
        )
        .await?;
    }

    let committed = sqlx::query_as::<_, Transfer>(
        "UPDATE transfers SET
            status = 'posted',
            committed_amount = $1,
            posted_at = $2,
            effective_date = COALESCE(effective_date, $2)
        WHERE id = $3
        RETURNING *",
    )
    .bind(commit_amount)
    .bind(now.to_sqlx())
    .bind(hold.id)
    .fetch_one(&mut *tx)
    .await?;

    events::append_tx(ctx, &mut tx, events::AppendEvent {
        aggregate_type: AggregateType::Transaction,
        aggregate_id: hold.id.0,
        event_type: "hold-committed".into(),
        event_data: json!({
            "hold_id": hold.id,
            "committed_amount": commit_amount,
            "released_amount": hold.amount - commit_amount,
        }),
        correlation_id: Some(hold.correlation_id),
    })
    .await?;
    outbox::enqueue_tx(
        &mut tx,
        "ledger-hold-committed",
        &json!({
            "ledger_id": ctx.ledger_id,
            "hold_id": hold.id,
            "committed_amount": commit_amount,
        }),
    )
    .await?;

    tx.commit().await?;
    ctx.hooks.run_after(&op).await;
    Ok(committed)
}

/// Release a hold without posting anything.
pub async fn void(
    ctx: &LedgerCtx,
    hold_id: &TransferId,
) -> Result<Transfer, LedgerError> {
    transactions::run_with_retries(ctx, || {
        release_once(ctx, hold_id, TransferStatus::Voided)
    })
    .await
}

async fn release_once(
    ctx: &LedgerCtx,
    hold_id: &TransferId,
    final_status: TransferStatus,
) -> Result<Transfer, LedgerError> {
    let mut tx = ctx.begin().await?;
    let op = OperationContext {
        operation: "holds.void".into(),
        ledger_id: ctx.ledger_id,
        payload: json!({ "hold_id": hold_id }),
    };
    ctx.hooks.run_before(&op).await?;

    let hold = transactions::lock_transfer_tx(ctx, &mut tx, hold_id).await?;
    if !hold.is_hold {
        return Err(LedgerError::InvalidArgument(
            "transfer is not a hold".into(),
        ));
    }
    if hold.status != TransferStatus::Inflight {
        return Err(LedgerError::InvalidArgument(format!(
            "hold {} is {}, not inflight",
            hold.id, hold.status
        )));
    }
    let source_id = hold
        .source_account_id
        .ok_or(LedgerError::NotFound("hold source account"))?;
    let destinations = hold_destinations(&hold)?;

    let mut ids = vec![source_id];
    ids.extend(destinations.iter().map(|(id, _)| *id));
    let locked = transactions::lock_all(ctx, &mut tx, &ids).await?;

    entries::adjust_pending_tx(
        ctx,
        &mut tx,
        &locked[&source_id],
        -hold.amount,
        0,
    )
    .await?;
    for (destination_id, reserved) in &destinations {
        entries::adjust_pending_tx(
            ctx,
            &mut tx,
            &locked[destination_id],
            0,
            -reserved,
        )
        .await?;
    }

    let released = sqlx::query_as::<_, Transfer>(
        "UPDATE transfers SET status = $1 WHERE id = $2 RETURNING *",
    )
    .bind(final_status)
    .bind(hold.id)
    .fetch_one(&mut *tx)
    .await?;

    let event_type = match final_status {
        TransferStatus::Expired => "hold-expired",
        _ => "hold-voided",
    };
    events::append_tx(ctx, &mut tx, events::AppendEvent {
        aggregate_type: AggregateType::Transaction,
        aggregate_id: hold.id.0,
        event_type: event_type.into(),
        event_data: json!({ "hold_id": hold.id, "status": final_status }),
        correlation_id: Some(hold.correlation_id),
    })
    .await?;
    outbox::enqueue_tx(
        &mut tx,
        "ledger-hold-released",
        &json!({
            "ledger_id": ctx.ledger_id,
            "hold_id": hold.id,
            "status": final_status,
        }),
    )
    .await?;

    tx.commit().await?;
    ctx.hooks.run_after(&op).await;
    Ok(released)
}

/// Void every inflight hold past its expiry. Worker-driven; each hold is
/// released in its own transaction so one failure does not wedge the
/// rest.
#[tracing::instrument(skip(ctx))]
pub async fn expire_all(ctx: &LedgerCtx) -> Result<u64, LedgerError> {
    let now = ctx.time_source.now();
    let expired: Vec<TransferId> = sqlx::query_scalar(
        "SELECT id FROM transfers
        WHERE ledger_id = $1 AND is_hold AND status = 'inflight'
          AND hold_expires_at < $2
        ORDER BY hold_expires_at",
    )
    .bind(ctx.ledger_id)
    .bind(now.to_sqlx())
    .fetch_all(&ctx.pool)
    .await?;

    let mut released = 0;
    for hold_id in expired {
        match release_once(ctx, &hold_id, TransferStatus::Expired).await {
            Ok(_) => released += 1,
            // A concurrent commit or void got there first.
            Err(LedgerError::InvalidArgument(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(released)
}

pub async fn get(
    ctx: &LedgerCtx,
    hold_id: &TransferId,
) -> Result<Transfer, LedgerError> {
    let hold = transactions::get(ctx, hold_id).await?;
    if !hold.is_hold {
        return Err(LedgerError::NotFound("hold"));
    }
    Ok(hold)
}

pub async fn list_active(
    ctx: &LedgerCtx,
) -> Result<Vec<Transfer>, LedgerError> {
    Ok(sqlx::query_as::<_, Transfer>(
        "SELECT * FROM transfers
        WHERE ledger_id = $1 AND is_hold AND status = 'inflight'
        ORDER BY created_at",
    )
    .bind(ctx.ledger_id)
    .fetch_all(&ctx.pool)
    .await?)
}

pub async fn list_all(
    ctx: &LedgerCtx,
) -> Result<Vec<Transfer>, LedgerError> {
    Ok(sqlx::query_as::<_, Transfer>(
        "SELECT * FROM transfers
        WHERE ledger_id = $1 AND is_hold
        ORDER BY created_at",
    )
    .bind(ctx.ledger_id)
    .fetch_all(&ctx.pool)
    .await?)
}
