//! Engine configuration.
//!
//! Everything tunable lives here as a typed field with a default; there is
//! no dynamic option bag. `Config` is consumed by [`crate::Summa::build`].

use std::collections::HashMap;
use std::sync::Arc;

use secrecy::SecretBox;

use crate::plugin::Plugin;
use crate::store::LedgerId;
use crate::store::outbox::Publisher;

/// Logical name of the default system counterparty account.
pub const WORLD_ACCOUNT: &str = "world";

/// Which ledger (tenant) this engine instance operates on.
pub enum LedgerRef {
    ById(LedgerId),
    /// Resolved by unique name; created on first use.
    ByName(String),
}

/// Row-locking strategy for the entry engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    /// `SELECT ... FOR UPDATE`, blocking up to `lock_timeout_ms`.
    Wait,
    /// `SELECT ... FOR UPDATE NOWAIT`; contention surfaces immediately as
    /// a timeout error.
    Nowait,
    /// No row lock; relies on the `WHERE version = $n` predicate plus the
    /// retry loop.
    Optimistic,
}

pub struct Config {
    /// Default currency for system accounts created on demand.
    pub currency: String,
    /// Reporting currency; recorded on FX entries, never converted by the
    /// core.
    pub functional_currency: Option<String>,
    /// PostgreSQL schema the tables live in, applied as `search_path` when
    /// the engine opens its own pool.
    pub schema: String,
    pub ledger: LedgerRef,
    /// Logical name -> system identifier, e.g. `world -> @World`.
    pub system_accounts: HashMap<String, String>,
    /// Outbox delivery target; defaults to a tracing-backed publisher.
    pub publisher: Option<Arc<dyn Publisher>>,
    pub plugins: Vec<Arc<dyn Plugin>>,
    pub advanced: AdvancedConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            currency: "USD".into(),
            functional_currency: None,
            schema: "summa".into(),
            ledger: LedgerRef::ByName("default".into()),
            system_accounts: HashMap::from([(
                WORLD_ACCOUNT.to_string(),
                "@World".to_string(),
            )]),
            publisher: None,
            plugins: Vec::new(),
            advanced: AdvancedConfig::default(),
        }
    }
}

pub struct AdvancedConfig {
    /// Max hot-account entries folded per aggregator cycle.
    pub hot_account_threshold: i64,
    /// Idempotency key retention.
    pub idempotency_ttl_ms: i64,
    /// `SET LOCAL statement_timeout` applied to every mutation transaction.
    pub transaction_timeout_ms: i64,
    /// `SET LOCAL lock_timeout` applied to every mutation transaction.
    pub lock_timeout_ms: i64,
    /// Hard cap on a single mutation's amount.
    pub max_transaction_amount: i64,
    /// Keys the event hash chain and balance checksums. When absent the
    /// engine falls back to plain SHA-256 and logs a warning at startup.
    pub hmac_secret: Option<SecretBox<String>>,
    /// Recompute and compare the balance checksum on every account read.
    pub verify_entry_hash_on_read: bool,
    pub lock_retry_count: u32,
    pub lock_retry_base_delay_ms: u64,
    pub lock_retry_max_delay_ms: u64,
    pub lock_mode: LockMode,
    /// Retries for version-predicate conflicts and serialization failures.
    pub optimistic_retry_count: u32,
    /// Drain the outbox until empty each worker firing instead of one
    /// batch per cycle.
    pub enable_batching: bool,
    /// Row cap for outbox drain batches and merkle-node insert chunks.
    pub batch_max_size: usize,
    /// Sleep between back-to-back full outbox drain batches.
    pub batch_flush_interval_ms: u64,
}

impl Default for AdvancedConfig {
    fn default() -> Self {
        Self {
            hot_account_threshold: 1_000,
            idempotency_ttl_ms: 24 * 60 * 60 * 1_000,
            transaction_timeout_ms: 5_000,
            lock_timeout_ms: 3_000,
            max_transaction_amount: 100_000_000_000,
            hmac_secret: None,
            verify_entry_hash_on_read: true,
            lock_retry_count: 0,
            lock_retry_base_delay_ms: 50,
            lock_retry_max_delay_ms: 500,
            lock_mode: LockMode::Wait,
            optimistic_retry_count: 3,
            enable_batching: false,
            batch_max_size: 200,
            batch_flush_interval_ms: 5,
        }
    }
}
