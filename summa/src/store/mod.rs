//! Database store for the ledger engine.
//!
//! ## Design Decisions
//!
//! ### Typed ids
//! - **Id newtypes with sqlx::Type**: every table id gets a uuid newtype
//!   deriving `sqlx::Type` + `#[sqlx(transparent)]`, so ids bind directly
//!   in queries and cannot be mixed up across tables.
//!
//! ### Tenancy
//! - **ledger_id on every tenant-scoped table**: accounts, transfers,
//!   entries, events, blocks and idempotency keys all carry `ledger_id`,
//!   and every query binds it. Nothing resolves across tenants.
//!
//! ### Time source dependency
//! - **Mocked time for testing**: functions that need current time accept
//!   the engine's `TimeSource` (via the context) instead of reading the
//!   clock, so hold expiry, idempotency TTLs and worker leases can be
//!   driven deterministically in tests.
//!
//! ### Transaction discipline
//! - **`*_tx` functions**: anything that must join an open transaction
//!   takes `&mut sqlx::Transaction<'_, Postgres>`. Mutations always run
//!   inside [`LedgerCtx::begin`], which applies the configured statement
//!   and lock timeouts with `SET LOCAL`.
//! - **Positional binds only**: no value is ever interpolated into SQL.
//!   The two `format!` call sites inject config integers into `SET LOCAL`,
//!   which cannot take bind parameters.

use std::collections::HashMap;
use std::sync::Arc;

use derive_more::Display;
use jiff::Timestamp;
use jiff_sqlx::Timestamp as SqlxTs;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, Transaction, Type};
use uuid::Uuid;

use crate::config::AdvancedConfig;
use crate::error::LedgerError;
use crate::hash::{BalanceTuple, Hasher};
use crate::plugin::HookIndex;
use crate::time::TimeSource;

pub mod accounts;
pub mod checkpoint;
pub mod entries;
pub mod events;
pub mod holds;
pub mod hot_accounts;
pub mod idempotency;
pub mod limits;
pub mod outbox;
pub mod transactions;

/// Id type wrappers help ensure we don't mix up ids for different tables.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Display, Serialize, Deserialize,
    Type,
)]
#[sqlx(transparent)]
pub struct LedgerId(pub Uuid);

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Display,
    Serialize, Deserialize, Type,
)]
#[sqlx(transparent)]
pub struct AccountId(pub Uuid);

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Display, Serialize, Deserialize,
    Type,
)]
#[sqlx(transparent)]
pub struct TransferId(pub Uuid);

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Display, Serialize, Deserialize, Type,
)]
#[sqlx(transparent)]
pub struct EntryId(pub Uuid);

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Display, Serialize, Deserialize, Type,
)]
#[sqlx(transparent)]
pub struct EventId(pub Uuid);

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Display, Serialize, Deserialize, Type,
)]
#[sqlx(transparent)]
pub struct BlockId(pub Uuid);

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Display, Serialize, Deserialize, Type,
)]
#[sqlx(transparent)]
pub struct OutboxMessageId(pub Uuid);

/// Newtype bridging nullable timestamptz columns into jiff.
#[derive(Debug, Clone, Copy, Type)]
#[sqlx(transparent)]
pub struct OptionalTimestamp(pub Option<SqlxTs>);

impl From<OptionalTimestamp> for Option<Timestamp> {
    fn from(ts: OptionalTimestamp) -> Self {
        ts.0.map(Timestamp::from)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize, Type,
)]
#[sqlx(type_name = "holder_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum HolderType {
    Individual,
    Organization,
    System,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize, Type,
)]
#[sqlx(type_name = "account_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Frozen,
    Closed,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize, Type,
)]
#[sqlx(type_name = "account_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    Asset,
    Liability,
    Equity,
    Revenue,
    Expense,
}

impl AccountType {
    /// Chart-of-accounts convention: assets and expenses grow on the debit
    /// side, everything else on the credit side.
    pub fn normal_balance(self) -> NormalBalance {
        match self {
            Self::Asset | Self::Expense => NormalBalance::Debit,
            _ => NormalBalance::Credit,
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize, Type,
)]
#[sqlx(type_name = "normal_balance", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum NormalBalance {
    Debit,
    Credit,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize, Type,
)]
#[sqlx(type_name = "transfer_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransferType {
    Credit,
    Debit,
    Transfer,
    MultiTransfer,
    Refund,
    Correction,
    Adjustment,
    Journal,
    Hold,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize, Type,
)]
#[sqlx(type_name = "transfer_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Inflight,
    Posted,
    Reversed,
    Voided,
    Expired,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize, Type,
)]
#[sqlx(type_name = "adjustment_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AdjustmentType {
    Accrual,
    Depreciation,
    Correction,
    Reclassification,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize, Type,
)]
#[sqlx(type_name = "entry_type", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum EntryType {
    Debit,
    Credit,
}

impl EntryType {
    pub fn opposite(self) -> Self {
        match self {
            Self::Debit => Self::Credit,
            Self::Credit => Self::Debit,
        }
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize, Type,
)]
#[sqlx(type_name = "aggregate_type", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AggregateType {
    Account,
    Transaction,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Display, Serialize, Deserialize, Type,
)]
#[sqlx(type_name = "outbox_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Published,
    Failed,
}

#[derive(Debug, Clone, FromRow)]
pub struct Ledger {
    pub id: LedgerId,
    pub name: String,
    #[sqlx(try_from = "SqlxTs")]
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, FromRow)]
pub struct Account {
    pub id: AccountId,
    pub ledger_id: LedgerId,
    pub holder_id: String,
    pub holder_type: HolderType,
    pub is_system: bool,
    pub system_identifier: Option<String>,
    pub is_hot: bool,
    pub currency: String,
    pub status: AccountStatus,
    pub balance: i64,
    pub credit_balance: i64,
    pub debit_balance: i64,
    pub pending_credit: i64,
    pub pending_debit: i64,
    pub allow_overdraft: bool,
    pub overdraft_limit: i64,
    pub version: i64,
    pub checksum: String,
    pub account_type: Option<AccountType>,
    pub account_code: Option<String>,
    pub parent_account_id: Option<AccountId>,
    pub normal_balance: Option<NormalBalance>,
    #[sqlx(try_from = "OptionalTimestamp")]
    pub frozen_at: Option<Timestamp>,
    pub freeze_reason: Option<String>,
    #[sqlx(try_from = "OptionalTimestamp")]
    pub closed_at: Option<Timestamp>,
    pub close_reason: Option<String>,
    pub metadata: Json<serde_json::Value>,
    #[sqlx(try_from = "SqlxTs")]
    pub created_at: Timestamp,
    #[sqlx(try_from = "SqlxTs")]
    pub updated_at: Timestamp,
}

impl Account {
    pub fn balance_tuple(&self) -> BalanceTuple {
        BalanceTuple {
            balance: self.balance,
            credit_balance: self.credit_balance,
            debit_balance: self.debit_balance,
            pending_debit: self.pending_debit,
            pending_credit: self.pending_credit,
        }
    }

    /// Funds not reserved by inflight holds.
    pub fn available_balance(&self) -> i64 {
        (self.balance - self.pending_debit).max(0)
    }

    /// The lowest balance this account may reach, or `None` when exempt
    /// (system accounts). `caller_allows_overdraft` is the per-operation
    /// opt-in; both the caller and the account must allow it.
    pub fn balance_floor(&self, caller_allows_overdraft: bool) -> Option<i64> {
        if self.is_system {
            return None;
        }
        if self.allow_overdraft && caller_allows_overdraft {
            Some(-self.overdraft_limit)
        } else {
            Some(0)
        }
    }

    /// Recompute the balance checksum and compare against the stored one.
    /// A mismatch means the row was modified outside the entry engine.
    pub fn verify_checksum(&self, hasher: &Hasher) -> Result<(), LedgerError> {
        let expected =
            hasher.balance_checksum(&self.balance_tuple(), self.version);
        if !crate::hash::digests_equal(&expected, &self.checksum) {
            return Err(LedgerError::ChainIntegrityViolation(format!(
                "balance checksum mismatch on account {}",
                self.id
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Transfer {
    pub id: TransferId,
    pub ledger_id: LedgerId,
    pub transfer_type: TransferType,
    pub reference: String,
    pub status: TransferStatus,
    pub amount: i64,
    pub currency: String,
    pub source_account_id: Option<AccountId>,
    pub destination_account_id: Option<AccountId>,
    pub is_hold: bool,
    #[sqlx(try_from = "OptionalTimestamp")]
    pub hold_expires_at: Option<Timestamp>,
    pub committed_amount: Option<i64>,
    pub parent_id: Option<TransferId>,
    pub is_reversal: bool,
    pub refunded_amount: i64,
    pub adjustment_type: Option<AdjustmentType>,
    pub correlation_id: Uuid,
    pub metadata: Json<serde_json::Value>,
    #[sqlx(try_from = "SqlxTs")]
    pub created_at: Timestamp,
    #[sqlx(try_from = "OptionalTimestamp")]
    pub posted_at: Option<Timestamp>,
    #[sqlx(try_from = "OptionalTimestamp")]
    pub effective_date: Option<Timestamp>,
}

#[derive(Debug, Clone, FromRow)]
pub struct Entry {
    pub id: EntryId,
    pub ledger_id: LedgerId,
    pub transfer_id: TransferId,
    pub account_id: AccountId,
    pub entry_type: EntryType,
    pub amount: i64,
    pub currency: String,
    pub balance_before: i64,
    pub balance_after: i64,
    pub account_lock_version: i64,
    pub is_hot_account: bool,
    pub original_amount: Option<i64>,
    pub original_currency: Option<String>,
    pub exchange_rate: Option<i64>,
    pub sequence_number: i64,
    #[sqlx(try_from = "SqlxTs")]
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, FromRow)]
pub struct LedgerEvent {
    pub id: EventId,
    pub ledger_id: LedgerId,
    pub sequence_number: i64,
    pub aggregate_type: AggregateType,
    pub aggregate_id: Uuid,
    pub aggregate_version: i64,
    pub event_type: String,
    pub event_data: Json<serde_json::Value>,
    pub correlation_id: Option<Uuid>,
    pub hash: String,
    pub prev_hash: Option<String>,
    #[sqlx(try_from = "SqlxTs")]
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, FromRow)]
pub struct Block {
    pub id: BlockId,
    pub ledger_id: LedgerId,
    pub block_sequence: i64,
    pub from_event_sequence: i64,
    pub to_event_sequence: i64,
    pub event_count: i64,
    pub events_hash: String,
    pub merkle_root: String,
    pub tree_depth: i32,
    pub block_hash: String,
    pub prev_block_id: Option<BlockId>,
    pub prev_block_hash: Option<String>,
    #[sqlx(try_from = "SqlxTs")]
    pub created_at: Timestamp,
}

#[derive(Debug, Clone, FromRow)]
pub struct OutboxRow {
    pub id: OutboxMessageId,
    pub topic: String,
    pub payload: Json<serde_json::Value>,
    pub status: OutboxStatus,
    pub retry_count: i32,
    pub max_retries: i32,
    pub last_error: Option<String>,
    #[sqlx(try_from = "SqlxTs")]
    pub created_at: Timestamp,
    #[sqlx(try_from = "OptionalTimestamp")]
    pub processed_at: Option<Timestamp>,
}

#[derive(Debug, Clone, FromRow)]
pub struct WorkerLease {
    pub worker_id: String,
    pub lease_holder: Uuid,
    #[sqlx(try_from = "SqlxTs")]
    pub lease_until: Timestamp,
    #[sqlx(try_from = "SqlxTs")]
    pub acquired_at: Timestamp,
}

#[derive(Debug, Clone, FromRow)]
pub struct HotAccountWatermark {
    pub account_id: AccountId,
    pub last_entry_sequence_number: i64,
    pub entries_aggregated: i64,
    #[sqlx(try_from = "SqlxTs")]
    pub updated_at: Timestamp,
}

/// How an operation addresses an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccountRef {
    /// Natural key within the ledger. When `holder_type` is absent the
    /// holder id must resolve to exactly one account.
    Holder {
        holder_id: String,
        holder_type: Option<HolderType>,
    },
    /// A system account, by configured logical name or literal `@`
    /// identifier.
    System(String),
}

impl AccountRef {
    pub fn holder(holder_id: impl Into<String>) -> Self {
        Self::Holder {
            holder_id: holder_id.into(),
            holder_type: None,
        }
    }

    pub fn system(identifier: impl Into<String>) -> Self {
        Self::System(identifier.into())
    }
}

/// Balance snapshot returned by `accounts().get_balance`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BalanceSummary {
    pub balance: i64,
    pub credit_balance: i64,
    pub debit_balance: i64,
    pub pending_credit: i64,
    pub pending_debit: i64,
    pub available_balance: i64,
    pub currency: String,
}

/// Capability descriptor for the SQL dialect in use. PostgreSQL is the
/// reference target; the constants centralize the spellings the engine
/// relies on.
#[derive(Debug, Clone, Copy)]
pub struct Dialect {
    pub name: &'static str,
    pub supports_advisory_locks: bool,
    pub supports_for_update: bool,
    pub supports_returning: bool,
    pub for_update: &'static str,
    pub for_update_skip_locked: &'static str,
    pub on_conflict_do_update: &'static str,
    pub returning: &'static str,
    pub now: &'static str,
    pub generate_uuid: &'static str,
    pub count_int: &'static str,
}

pub const POSTGRES: Dialect = Dialect {
    name: "postgresql",
    supports_advisory_locks: true,
    supports_for_update: true,
    supports_returning: true,
    for_update: "FOR UPDATE",
    for_update_skip_locked: "FOR UPDATE SKIP LOCKED",
    on_conflict_do_update: "ON CONFLICT DO UPDATE",
    returning: "RETURNING",
    now: "NOW()",
    generate_uuid: "gen_random_uuid()",
    count_int: "COUNT(*)::int",
};

/// Everything the store functions need: pool, tenant, clock, hashing
/// context, configuration, hook index and the outbox publisher.
pub struct LedgerCtx {
    pub pool: PgPool,
    pub ledger_id: LedgerId,
    pub currency: String,
    pub functional_currency: Option<String>,
    pub system_accounts: HashMap<String, String>,
    pub hasher: Hasher,
    pub time_source: TimeSource,
    pub advanced: AdvancedConfig,
    pub hooks: HookIndex,
    pub publisher: Arc<dyn outbox::Publisher>,
}

impl LedgerCtx {
    /// Begin a mutation transaction with the configured statement and lock
    /// timeouts. `SET LOCAL` scopes both to this transaction.
    pub async fn begin(
        &self,
    ) -> Result<Transaction<'static, Postgres>, LedgerError> {
        let mut tx = self.pool.begin().await?;
        // SET cannot take bind parameters; the values are config integers.
        sqlx::query(&format!(
            "SET LOCAL statement_timeout = {}",
            self.advanced.transaction_timeout_ms
        ))
        .execute(&mut *tx)
        .await?;
        sqlx::query(&format!(
            "SET LOCAL lock_timeout = {}",
            self.advanced.lock_timeout_ms
        ))
        .execute(&mut *tx)
        .await?;
        Ok(tx)
    }

    /// The configured world counterparty identifier.
    pub fn world_identifier(&self) -> &str {
        self.system_accounts
            .get(crate::config::WORLD_ACCOUNT)
            .map(String::as_str)
            .unwrap_or("@World")
    }

    /// Resolve a logical system account name to its identifier; literal
    /// `@`-prefixed identifiers pass through.
    pub fn system_identifier<'a>(&'a self, name: &'a str) -> &'a str {
        if name.starts_with('@') {
            name
        } else {
            self.system_accounts
                .get(name)
                .map(String::as_str)
                .unwrap_or(name)
        }
    }
}

/// Take a transaction-scoped advisory lock on an arbitrary string key.
/// Serializes natural-key resolution across concurrent callers before any
/// row locks are taken.
pub async fn advisory_lock_tx(
    tx: &mut Transaction<'_, Postgres>,
    key: &str,
) -> Result<(), LedgerError> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtextextended($1, 0))")
        .bind(key)
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Deterministic advisory-lock key for an account natural key.
pub fn natural_key_lock(
    ledger_id: &LedgerId,
    holder_id: &str,
    holder_type: HolderType,
) -> String {
    format!("account:{ledger_id}:{holder_id}:{holder_type}")
}

/// Fetch a ledger by id, or create-by-name on first use.
pub async fn ensure_ledger(
    pool: &PgPool,
    ledger: &crate::config::LedgerRef,
) -> Result<Ledger, LedgerError> {
    match ledger {
        crate::config::LedgerRef::ById(id) => {
            sqlx::query_as::<_, Ledger>(
                "SELECT * FROM ledgers WHERE id = $1",
            )
            .bind(id)
            .fetch_optional(pool)
            .await?
            .ok_or(LedgerError::NotFound("ledger"))
        }
        crate::config::LedgerRef::ByName(name) => {
            sqlx::query(
                "INSERT INTO ledgers (name) VALUES ($1)
                ON CONFLICT (name) DO NOTHING",
            )
            .bind(name)
            .execute(pool)
            .await?;
            Ok(sqlx::query_as::<_, Ledger>(
                "SELECT * FROM ledgers WHERE name = $1",
            )
            .bind(name)
            .fetch_one(pool)
            .await?)
        }
    }
}
