//! Background worker runner.
//!
//! One tokio task per worker: sleep a jittered interval, optionally take
//! the single-holder database lease, run the handler, repeat. A worker is
//! never re-fired while its handler is in flight. Shutdown cancels the
//! timers, gives running handlers ten seconds to drain, then deletes
//! every lease held by this runner instance.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jiff_sqlx::ToSqlx;
use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::error::LedgerError;
use crate::store::{
    LedgerCtx, checkpoint, holds, hot_accounts, idempotency, outbox,
};
use crate::telemetry::log_error;

#[derive(Debug, Clone)]
pub struct WorkerSpec {
    pub id: String,
    /// Human interval: "5s", "1m", "1h" or "1d".
    pub every: String,
    /// Take the single-holder database lease before each firing.
    pub lease_required: bool,
}

#[async_trait]
pub trait Worker: Send + Sync {
    fn spec(&self) -> WorkerSpec;
    async fn run(&self, ctx: &LedgerCtx) -> anyhow::Result<()>;
}

/// Parse a human interval ("5s", "1m", "1h", "1d") to a duration.
pub fn parse_interval(every: &str) -> Result<Duration, LedgerError> {
    let bad = || {
        LedgerError::InvalidArgument(format!(
            "invalid worker interval {every:?}; expected e.g. 5s, 1m, 1h, 1d"
        ))
    };
    let (value, unit) = every.split_at(every.len().saturating_sub(1));
    let value: u64 = value.parse().map_err(|_| bad())?;
    if value == 0 {
        return Err(bad());
    }
    let seconds = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 60 * 60,
        "d" => value * 60 * 60 * 24,
        _ => return Err(bad()),
    };
    Ok(Duration::from_secs(seconds))
}

/// +/- 25% so a fleet of runners does not fire in lockstep.
fn jittered(interval: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.75..=1.25);
    interval.mul_f64(factor)
}

/// Try to win (or renew) the row lease for one worker cycle. The lease
/// outlives two intervals so a crashed holder's lease expires before the
/// next-but-one cycle.
pub(crate) async fn acquire_lease(
    ctx: &LedgerCtx,
    worker_id: &str,
    holder: Uuid,
    interval: Duration,
) -> Result<bool, LedgerError> {
    let now = ctx.time_source.now();
    let lease_until = now
        .checked_add(jiff::Span::new().milliseconds(
            (interval.as_millis() as i64).saturating_mul(2),
        ))
        .map_err(|e| LedgerError::InvalidArgument(e.to_string()))?;
    let won: Option<String> = sqlx::query_scalar(
        "INSERT INTO worker_leases (
            worker_id, lease_holder, lease_until, acquired_at
        ) VALUES ($1, $2, $3, $4)
        ON CONFLICT (worker_id) DO UPDATE SET
            lease_holder = EXCLUDED.lease_holder,
            lease_until = EXCLUDED.lease_until,
            acquired_at = EXCLUDED.acquired_at
        WHERE worker_leases.lease_until < $4
           OR worker_leases.lease_holder = EXCLUDED.lease_holder
        RETURNING worker_id",
    )
    .bind(worker_id)
    .bind(holder)
    .bind(lease_until.to_sqlx())
    .bind(now.to_sqlx())
    .fetch_optional(&ctx.pool)
    .await?;
    Ok(won.is_some())
}

pub(crate) async fn release_leases(ctx: &LedgerCtx, holder: Uuid) {
    let result = sqlx::query(
        "DELETE FROM worker_leases WHERE lease_holder = $1",
    )
    .bind(holder)
    .execute(&ctx.pool)
    .await;
    if let Err(e) = result {
        log_error(anyhow::Error::from(e).context("releasing worker leases"));
    }
}

pub struct WorkerRunner {
    holder: Uuid,
    ctx: Arc<LedgerCtx>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

impl WorkerRunner {
    /// Validate every worker definition and spawn its timer task.
    pub fn start(
        ctx: Arc<LedgerCtx>,
        workers: Vec<Arc<dyn Worker>>,
    ) -> Result<Self, LedgerError> {
        let holder = Uuid::new_v4();
        let (shutdown, _) = watch::channel(false);
        let mut tasks = Vec::with_capacity(workers.len());
        for worker in workers {
            let spec = worker.spec();
            let interval = parse_interval(&spec.every)?;
            let ctx = Arc::clone(&ctx);
            let mut shutdown_rx = shutdown.subscribe();
            tasks.push(tokio::spawn(async move {
                tracing::info!(
                    worker = spec.id,
                    every = spec.every,
                    "worker scheduled"
                );
                loop {
                    tokio::select! {
                        _ = tokio::time::sleep(jittered(interval)) => {}
                        _ = shutdown_rx.changed() => break,
                    }
                    if spec.lease_required {
                        match acquire_lease(&ctx, &spec.id, holder, interval)
                            .await
                        {
                            Ok(true) => {}
                            Ok(false) => continue,
                            Err(e) => {
                                log_error(anyhow::Error::from(e).context(
                                    format!("lease for {}", spec.id),
                                ));
                                continue;
                            }
                        }
                    }
                    if let Err(e) = worker.run(&ctx).await {
                        log_error(e.context(format!("worker {}", spec.id)));
                    }
                }
            }));
        }
        Ok(Self {
            holder,
            ctx,
            shutdown,
            tasks,
        })
    }

    /// Cancel timers, wait for running handlers, drop our leases.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let drain = async {
            for task in self.tasks {
                let _ = task.await;
            }
        };
        if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
            tracing::warn!(
                "workers did not drain within {SHUTDOWN_GRACE:?}; abandoning"
            );
        }
        release_leases(&self.ctx, self.holder).await;
    }
}

/// The engine's own periodic maintenance workers. Plugins append theirs
/// to this set.
pub fn built_in_workers() -> Vec<Arc<dyn Worker>> {
    vec![
        Arc::new(OutboxDrainWorker),
        Arc::new(OutboxCleanupWorker),
        Arc::new(BlockCheckpointWorker),
        Arc::new(HotAccountAggregationWorker),
        Arc::new(HoldExpiryWorker),
        Arc::new(IdempotencyPruneWorker),
    ]
}

struct OutboxDrainWorker;

#[async_trait]
impl Worker for OutboxDrainWorker {
    fn spec(&self) -> WorkerSpec {
        WorkerSpec {
            id: "outbox-drain".into(),
            every: "5s".into(),
            lease_required: true,
        }
    }

    async fn run(&self, ctx: &LedgerCtx) -> anyhow::Result<()> {
        if !ctx.advanced.enable_batching {
            outbox::drain_once(ctx).await?;
            return Ok(());
        }
        // Batching mode: keep draining while batches come back full.
        loop {
            let drained = outbox::drain_once(ctx).await?;
            if drained < ctx.advanced.batch_max_size {
                break;
            }
            tokio::time::sleep(Duration::from_millis(
                ctx.advanced.batch_flush_interval_ms,
            ))
            .await;
        }
        Ok(())
    }
}

struct OutboxCleanupWorker;

#[async_trait]
impl Worker for OutboxCleanupWorker {
    fn spec(&self) -> WorkerSpec {
        WorkerSpec {
            id: "outbox-cleanup".into(),
            every: "1h".into(),
            lease_required: true,
        }
    }

    async fn run(&self, ctx: &LedgerCtx) -> anyhow::Result<()> {
        let removed = outbox::cleanup(ctx, jiff::Span::new().hours(24))
            .await?;
        if removed > 0 {
            tracing::info!(removed, "outbox rows past retention removed");
        }
        Ok(())
    }
}

struct BlockCheckpointWorker;

#[async_trait]
impl Worker for BlockCheckpointWorker {
    fn spec(&self) -> WorkerSpec {
        WorkerSpec {
            id: "block-checkpoint".into(),
            every: "1m".into(),
            lease_required: true,
        }
    }

    async fn run(&self, ctx: &LedgerCtx) -> anyhow::Result<()> {
        checkpoint::create_checkpoint(ctx).await?;
        Ok(())
    }
}

struct HotAccountAggregationWorker;

#[async_trait]
impl Worker for HotAccountAggregationWorker {
    fn spec(&self) -> WorkerSpec {
        WorkerSpec {
            id: "hot-account-aggregation".into(),
            every: "5s".into(),
            lease_required: true,
        }
    }

    async fn run(&self, ctx: &LedgerCtx) -> anyhow::Result<()> {
        // Full batches mean a backlog; keep folding until it is gone.
        while hot_accounts::aggregate_once(ctx).await?
            == ctx.advanced.hot_account_threshold as u64
        {}
        Ok(())
    }
}

struct HoldExpiryWorker;

#[async_trait]
impl Worker for HoldExpiryWorker {
    fn spec(&self) -> WorkerSpec {
        WorkerSpec {
            id: "hold-expiry".into(),
            every: "1m".into(),
            lease_required: true,
        }
    }

    async fn run(&self, ctx: &LedgerCtx) -> anyhow::Result<()> {
        let expired = holds::expire_all(ctx).await?;
        if expired > 0 {
            tracing::info!(expired, "expired holds released");
        }
        Ok(())
    }
}

struct IdempotencyPruneWorker;

#[async_trait]
impl Worker for IdempotencyPruneWorker {
    fn spec(&self) -> WorkerSpec {
        WorkerSpec {
            id: "idempotency-prune".into(),
            every: "1h".into(),
            lease_required: true,
        }
    }

    async fn run(&self, ctx: &LedgerCtx) -> anyhow::Result<()> {
        idempotency::prune(&ctx.pool, ctx.time_source.now()).await?;
        Ok(())
    }
}
