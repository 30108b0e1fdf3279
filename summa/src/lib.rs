//! Summa: a multi-tenant, event-sourced, double-entry ledger engine on
//! PostgreSQL.
//!
//! The façade is [`Summa`]: build it from a pool (or connection string)
//! and a [`Config`], then reach the operation groups through the accessor
//! methods — `accounts()`, `transactions()`, `holds()`, `events()`,
//! `limits()` — and run the background maintenance loop with
//! [`Summa::start_workers`].
//!
//! Every committed mutation guarantees: debits equal credits, no account
//! crosses its floor, exactly-once recording under retries and
//! concurrency, an immutable hash-linked event record, and at-least-once
//! downstream notification through the transactional outbox.

pub mod config;
pub mod error;
pub mod hash;
pub mod plugin;
pub mod scheduler;
pub mod store;
pub mod telemetry;
pub mod time;

use std::str::FromStr;
use std::sync::Arc;

use secrecy::ExposeSecret;
use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use uuid::Uuid;

pub use config::{AdvancedConfig, Config, LedgerRef, LockMode};
pub use error::{ErrorCode, LedgerError};

use crate::store::{
    Account, AccountRef, AggregateType, BalanceSummary, Block, Entry,
    LedgerCtx, LedgerEvent, Transfer, TransferId,
    accounts as accounts_store, checkpoint, events as events_store, holds,
    hot_accounts, limits as limits_store, outbox, transactions,
};
use crate::time::TimeSource;

pub struct Summa {
    ctx: Arc<LedgerCtx>,
    ledger: store::Ledger,
    plugins: Vec<Arc<dyn plugin::Plugin>>,
}

impl Summa {
    /// Connect a fresh pool (with the configured schema on the search
    /// path) and build the engine.
    pub async fn connect(
        database_url: &str,
        config: Config,
        time_source: TimeSource,
    ) -> Result<Self, LedgerError> {
        let options = PgConnectOptions::from_str(database_url)?
            .options([("search_path", config.schema.as_str())]);
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect_with(options)
            .await?;
        Self::build(pool, config, time_source).await
    }

    /// Build the engine on an existing pool: resolve the ledger row,
    /// order and initialize plugins, index their hooks.
    pub async fn build(
        pool: PgPool,
        config: Config,
        time_source: TimeSource,
    ) -> Result<Self, LedgerError> {
        let ledger = store::ensure_ledger(&pool, &config.ledger).await?;

        let secret = config
            .advanced
            .hmac_secret
            .as_ref()
            .map(|s| s.expose_secret().as_bytes().to_vec());
        if secret.is_none() {
            tracing::warn!(
                "no hmac_secret configured; event chains and balance \
                 checksums fall back to plain SHA-256"
            );
        }
        let hasher = hash::Hasher::new(secret.as_deref());

        let plugins = plugin::topological_order(&config.plugins)?;
        let init_ctx = plugin::PluginInitContext {
            pool: pool.clone(),
            ledger_id: ledger.id,
        };
        for p in &plugins {
            p.init(&init_ctx).await.map_err(LedgerError::Internal)?;
            tracing::debug!(plugin = p.id(), "plugin initialized");
        }
        let hooks = plugin::HookIndex::build(&plugins);
        let publisher = config
            .publisher
            .unwrap_or_else(|| Arc::new(outbox::TracingPublisher));

        let ctx = Arc::new(LedgerCtx {
            pool,
            ledger_id: ledger.id,
            currency: config.currency,
            functional_currency: config.functional_currency,
            system_accounts: config.system_accounts,
            hasher,
            time_source,
            advanced: config.advanced,
            hooks,
            publisher,
        });
        Ok(Self {
            ctx,
            ledger,
            plugins,
        })
    }

    pub fn ledger(&self) -> &store::Ledger {
        &self.ledger
    }

    pub fn dialect(&self) -> store::Dialect {
        store::POSTGRES
    }

    pub fn accounts(&self) -> Accounts<'_> {
        Accounts { ctx: &self.ctx }
    }

    pub fn transactions(&self) -> Transactions<'_> {
        Transactions { ctx: &self.ctx }
    }

    pub fn holds(&self) -> Holds<'_> {
        Holds { ctx: &self.ctx }
    }

    pub fn events(&self) -> Events<'_> {
        Events { ctx: &self.ctx }
    }

    pub fn limits(&self) -> Limits<'_> {
        Limits { ctx: &self.ctx }
    }

    /// Manual triggers for the actions the background workers run on a
    /// timer. Useful for operational tooling and deterministic tests.
    pub fn maintenance(&self) -> Maintenance<'_> {
        Maintenance { ctx: &self.ctx }
    }

    /// Spawn the built-in maintenance workers plus any the plugins
    /// contribute. The returned handle stops them gracefully.
    pub fn start_workers(
        &self,
    ) -> Result<scheduler::WorkerRunner, LedgerError> {
        let mut workers = scheduler::built_in_workers();
        for p in &self.plugins {
            workers.extend(p.workers());
        }
        scheduler::WorkerRunner::start(Arc::clone(&self.ctx), workers)
    }
}

pub struct Accounts<'a> {
    ctx: &'a LedgerCtx,
}

impl Accounts<'_> {
    pub async fn create(
        &self,
        params: &accounts_store::CreateAccountParams,
    ) -> Result<Account, LedgerError> {
        accounts_store::create(self.ctx, params).await
    }

    pub async fn get(
        &self,
        holder_id: &str,
        holder_type: Option<store::HolderType>,
    ) -> Result<Account, LedgerError> {
        accounts_store::get(self.ctx, holder_id, holder_type).await
    }

    pub async fn get_by_id(
        &self,
        id: &store::AccountId,
    ) -> Result<Account, LedgerError> {
        accounts_store::get_by_id(self.ctx, id).await
    }

    pub async fn get_balance(
        &self,
        account: &AccountRef,
    ) -> Result<BalanceSummary, LedgerError> {
        accounts_store::get_balance(self.ctx, account, None).await
    }

    pub async fn get_balance_as_of(
        &self,
        account: &AccountRef,
        as_of: jiff::Timestamp,
    ) -> Result<BalanceSummary, LedgerError> {
        accounts_store::get_balance(self.ctx, account, Some(as_of)).await
    }

    /// Committed balance plus the unaggregated tail of a hot system
    /// account.
    pub async fn realtime_balance(
        &self,
        system_identifier: &str,
    ) -> Result<i64, LedgerError> {
        hot_accounts::realtime_balance(self.ctx, system_identifier).await
    }

    pub async fn freeze(
        &self,
        account: &AccountRef,
        reason: Option<&str>,
    ) -> Result<Account, LedgerError> {
        accounts_store::freeze(self.ctx, account, reason).await
    }

    pub async fn unfreeze(
        &self,
        account: &AccountRef,
    ) -> Result<Account, LedgerError> {
        accounts_store::unfreeze(self.ctx, account).await
    }

    pub async fn close(
        &self,
        account: &AccountRef,
        transfer_to: Option<&AccountRef>,
        reason: Option<&str>,
    ) -> Result<Account, LedgerError> {
        accounts_store::close(self.ctx, account, transfer_to, reason).await
    }

    pub async fn set_hot(
        &self,
        account: &AccountRef,
        hot: bool,
    ) -> Result<Account, LedgerError> {
        accounts_store::set_hot(self.ctx, account, hot).await
    }

    pub async fn list(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Account>, LedgerError> {
        accounts_store::list(self.ctx, limit, offset).await
    }
}

pub struct Transactions<'a> {
    ctx: &'a LedgerCtx,
}

impl Transactions<'_> {
    pub async fn credit(
        &self,
        params: &transactions::CreditParams,
    ) -> Result<transactions::TransactionResult, LedgerError> {
        transactions::credit(self.ctx, params).await
    }

    pub async fn debit(
        &self,
        params: &transactions::DebitParams,
    ) -> Result<transactions::TransactionResult, LedgerError> {
        transactions::debit(self.ctx, params).await
    }

    pub async fn transfer(
        &self,
        params: &transactions::TransferParams,
    ) -> Result<transactions::TransactionResult, LedgerError> {
        transactions::transfer(self.ctx, params).await
    }

    pub async fn multi_transfer(
        &self,
        params: &transactions::MultiTransferParams,
    ) -> Result<transactions::TransactionResult, LedgerError> {
        transactions::multi_transfer(self.ctx, params).await
    }

    pub async fn refund(
        &self,
        params: &transactions::RefundParams,
    ) -> Result<transactions::TransactionResult, LedgerError> {
        transactions::refund(self.ctx, params).await
    }

    pub async fn correct(
        &self,
        params: &transactions::CorrectionParams,
    ) -> Result<transactions::TransactionResult, LedgerError> {
        transactions::correct(self.ctx, params).await
    }

    pub async fn adjust(
        &self,
        params: &transactions::AdjustParams,
    ) -> Result<transactions::TransactionResult, LedgerError> {
        transactions::adjust(self.ctx, params).await
    }

    pub async fn journal(
        &self,
        params: &transactions::JournalParams,
    ) -> Result<transactions::TransactionResult, LedgerError> {
        transactions::journal(self.ctx, params).await
    }

    pub async fn get(
        &self,
        id: &TransferId,
    ) -> Result<Transfer, LedgerError> {
        transactions::get(self.ctx, id).await
    }

    pub async fn get_by_reference(
        &self,
        reference: &str,
    ) -> Result<Transfer, LedgerError> {
        transactions::get_by_reference(self.ctx, reference).await
    }

    pub async fn list(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Transfer>, LedgerError> {
        transactions::list(self.ctx, limit, offset).await
    }

    pub async fn entries_for(
        &self,
        id: &TransferId,
    ) -> Result<Vec<Entry>, LedgerError> {
        transactions::entries_for(self.ctx, id).await
    }
}

pub struct Holds<'a> {
    ctx: &'a LedgerCtx,
}

impl Holds<'_> {
    pub async fn create(
        &self,
        params: &holds::CreateHoldParams,
    ) -> Result<Transfer, LedgerError> {
        holds::create(self.ctx, params).await
    }

    /// A hold that settles to several payees on commit.
    pub async fn create_multi_destination(
        &self,
        params: &holds::CreateHoldParams,
    ) -> Result<Transfer, LedgerError> {
        if params.destinations.len() < 2 {
            return Err(LedgerError::InvalidArgument(
                "multi-destination holds need at least two destinations"
                    .into(),
            ));
        }
        holds::create(self.ctx, params).await
    }

    pub async fn commit(
        &self,
        hold_id: &TransferId,
        amount: Option<i64>,
    ) -> Result<Transfer, LedgerError> {
        holds::commit(self.ctx, hold_id, amount).await
    }

    pub async fn void(
        &self,
        hold_id: &TransferId,
    ) -> Result<Transfer, LedgerError> {
        holds::void(self.ctx, hold_id).await
    }

    pub async fn expire_all(&self) -> Result<u64, LedgerError> {
        holds::expire_all(self.ctx).await
    }

    pub async fn get(
        &self,
        hold_id: &TransferId,
    ) -> Result<Transfer, LedgerError> {
        holds::get(self.ctx, hold_id).await
    }

    pub async fn list_active(&self) -> Result<Vec<Transfer>, LedgerError> {
        holds::list_active(self.ctx).await
    }

    pub async fn list_all(&self) -> Result<Vec<Transfer>, LedgerError> {
        holds::list_all(self.ctx).await
    }
}

pub struct Events<'a> {
    ctx: &'a LedgerCtx,
}

impl Events<'_> {
    pub async fn get_for_aggregate(
        &self,
        aggregate_type: AggregateType,
        aggregate_id: Uuid,
    ) -> Result<Vec<LedgerEvent>, LedgerError> {
        events_store::get_for_aggregate(self.ctx, aggregate_type, aggregate_id)
            .await
    }

    pub async fn get_by_correlation(
        &self,
        correlation_id: Uuid,
    ) -> Result<Vec<LedgerEvent>, LedgerError> {
        events_store::get_by_correlation(self.ctx, correlation_id).await
    }

    pub async fn verify_chain(
        &self,
        aggregate_type: AggregateType,
        aggregate_id: Uuid,
    ) -> Result<events_store::ChainVerification, LedgerError> {
        events_store::verify_chain(self.ctx, aggregate_type, aggregate_id)
            .await
    }

    /// Build the next block checkpoint immediately (the checkpoint worker
    /// does this periodically).
    pub async fn checkpoint_now(&self) -> Result<Option<Block>, LedgerError> {
        checkpoint::create_checkpoint(self.ctx).await
    }

    pub async fn latest_block(&self) -> Result<Option<Block>, LedgerError> {
        checkpoint::latest_block(self.ctx).await
    }

    pub async fn verify_block(
        &self,
        block_sequence: i64,
    ) -> Result<checkpoint::BlockVerification, LedgerError> {
        checkpoint::verify_block(self.ctx, block_sequence).await
    }

    pub async fn verify_external_anchor(
        &self,
        block_sequence: i64,
        external_hash: &str,
    ) -> Result<checkpoint::AnchorCheck, LedgerError> {
        checkpoint::verify_external_anchor(
            self.ctx,
            block_sequence,
            external_hash,
        )
        .await
    }

    pub async fn generate_proof(
        &self,
        event_id: &store::EventId,
    ) -> Result<hash::MerkleProof, LedgerError> {
        checkpoint::generate_event_proof(self.ctx, event_id).await
    }

    pub fn verify_proof(&self, proof: &hash::MerkleProof) -> bool {
        hash::verify_merkle_proof(proof)
    }
}

pub struct Maintenance<'a> {
    ctx: &'a LedgerCtx,
}

impl Maintenance<'_> {
    /// Publish one batch of pending outbox rows. Returns the number
    /// claimed.
    pub async fn drain_outbox(&self) -> Result<usize, LedgerError> {
        outbox::drain_once(self.ctx).await
    }

    /// Delete published outbox rows older than the retention window.
    pub async fn cleanup_outbox(
        &self,
        retention: jiff::Span,
    ) -> Result<u64, LedgerError> {
        outbox::cleanup(self.ctx, retention).await
    }

    /// Fold one batch of hot system-account entries.
    pub async fn aggregate_hot_accounts(&self) -> Result<u64, LedgerError> {
        hot_accounts::aggregate_once(self.ctx).await
    }

    /// Delete expired idempotency keys.
    pub async fn prune_idempotency(&self) -> Result<u64, LedgerError> {
        store::idempotency::prune(
            &self.ctx.pool,
            self.ctx.time_source.now(),
        )
        .await
    }

    /// Try to win (or renew) the single-holder lease for a worker cycle.
    pub async fn try_acquire_lease(
        &self,
        worker_id: &str,
        holder: Uuid,
        interval: std::time::Duration,
    ) -> Result<bool, LedgerError> {
        scheduler::acquire_lease(self.ctx, worker_id, holder, interval).await
    }

    /// Drop every lease held by the given runner instance.
    pub async fn release_leases(&self, holder: Uuid) {
        scheduler::release_leases(self.ctx, holder).await
    }
}

pub struct Limits<'a> {
    ctx: &'a LedgerCtx,
}

impl Limits<'_> {
    pub async fn set(
        &self,
        account: &AccountRef,
        params: &limits_store::SetLimitsParams,
    ) -> Result<limits_store::AccountLimits, LedgerError> {
        limits_store::set(self.ctx, account, params).await
    }

    pub async fn get(
        &self,
        account: &AccountRef,
    ) -> Result<Option<limits_store::AccountLimits>, LedgerError> {
        limits_store::get(self.ctx, account).await
    }

    pub async fn remove(
        &self,
        account: &AccountRef,
    ) -> Result<bool, LedgerError> {
        limits_store::remove(self.ctx, account).await
    }

    pub async fn get_usage(
        &self,
        account: &AccountRef,
    ) -> Result<limits_store::LimitUsage, LedgerError> {
        limits_store::get_usage(self.ctx, account).await
    }
}
