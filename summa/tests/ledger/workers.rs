//! Outbox delivery, hot-account aggregation, leases and the runner.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use jiff::Span;
use summa::store::outbox::Publisher;
use summa::store::{
    AccountRef, OutboxStatus,
    transactions::{CreditParams, DebitParams},
};
use test_helpers::{spawn_ledger, spawn_ledger_with_config, test_config};
use uuid::Uuid;

#[tokio::test]
async fn outbox_rows_ride_the_mutation_transaction() -> anyhow::Result<()> {
    let app = spawn_ledger().await;
    app.open_account("noisy").await;
    app.summa
        .transactions()
        .credit(&CreditParams::new("noisy", 1_000, "c1"))
        .await?;

    // account-created + transaction-posted, both pending.
    let topics: Vec<String> = sqlx::query_scalar(
        "SELECT topic FROM outbox WHERE status = 'pending'
        ORDER BY created_at",
    )
    .fetch_all(&app.db_pool)
    .await?;
    assert!(topics.contains(&"ledger-account-created".to_string()));
    assert!(topics.contains(&"ledger-transaction-posted".to_string()));

    let drained = app.summa.maintenance().drain_outbox().await?;
    assert_eq!(drained, topics.len());

    let pending: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM outbox WHERE status = 'pending'",
    )
    .fetch_one(&app.db_pool)
    .await?;
    assert_eq!(pending, 0);

    // Consumer-side dedup table mirrors what was published.
    let processed: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM processed_events")
            .fetch_one(&app.db_pool)
            .await?;
    assert_eq!(processed as usize, drained);

    // Published rows age out of the table after the retention window.
    app.time_source.advance(Span::new().hours(25));
    let removed = app
        .summa
        .maintenance()
        .cleanup_outbox(Span::new().hours(24))
        .await?;
    assert_eq!(removed as usize, drained);

    Ok(())
}

struct FlakyPublisher {
    attempts: AtomicUsize,
}

#[async_trait]
impl Publisher for FlakyPublisher {
    async fn publish(
        &self,
        _topic: &str,
        _payload: &serde_json::Value,
    ) -> anyhow::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("broker unavailable")
    }
}

#[tokio::test]
async fn failing_rows_retry_then_dead_letter() -> anyhow::Result<()> {
    let publisher = Arc::new(FlakyPublisher {
        attempts: AtomicUsize::new(0),
    });
    let mut config = test_config();
    config.publisher = Some(publisher.clone());
    let app = spawn_ledger_with_config(config).await;

    app.open_account("doomed").await;

    // Default max_retries is 5; drain until everything dead-letters.
    for _ in 0..5 {
        app.summa.maintenance().drain_outbox().await?;
    }
    assert!(publisher.attempts.load(Ordering::SeqCst) >= 5);

    let statuses: Vec<OutboxStatus> =
        sqlx::query_scalar("SELECT status FROM outbox")
            .fetch_all(&app.db_pool)
            .await?;
    assert!(!statuses.is_empty());
    assert!(statuses.iter().all(|s| *s == OutboxStatus::Failed));

    let dead: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM outbox_dead_letters")
            .fetch_one(&app.db_pool)
            .await?;
    assert_eq!(dead as usize, statuses.len());
    let last_error: String = sqlx::query_scalar(
        "SELECT last_error FROM outbox_dead_letters LIMIT 1",
    )
    .fetch_one(&app.db_pool)
    .await?;
    assert!(last_error.contains("broker unavailable"));

    Ok(())
}

#[tokio::test]
async fn hot_account_entries_fold_through_the_watermark()
-> anyhow::Result<()> {
    let app = spawn_ledger().await;
    app.open_account("spender").await;
    // First mutation creates the world account; then flip it hot.
    app.summa
        .transactions()
        .credit(&CreditParams::new("spender", 50_000, "seed"))
        .await?;
    app.summa
        .accounts()
        .set_hot(&AccountRef::system("@World"), true)
        .await?;
    let world_before = app
        .summa
        .accounts()
        .get_balance(&AccountRef::system("@World"))
        .await?
        .balance;

    for i in 0..5 {
        app.summa
            .transactions()
            .debit(&DebitParams::new("spender", 1_000, format!("d{i}")))
            .await?;
    }

    // The row has not moved; the realtime view includes the tail.
    let world_row = app
        .summa
        .accounts()
        .get_balance(&AccountRef::system("@World"))
        .await?
        .balance;
    assert_eq!(world_row, world_before);
    assert_eq!(
        app.summa.accounts().realtime_balance("@World").await?,
        world_before + 5_000
    );

    let folded = app.summa.maintenance().aggregate_hot_accounts().await?;
    assert_eq!(folded, 5);
    let world_after = app
        .summa
        .accounts()
        .get_balance(&AccountRef::system("@World"))
        .await?
        .balance;
    assert_eq!(world_after, world_before + 5_000);
    assert_eq!(
        app.summa.accounts().realtime_balance("@World").await?,
        world_after
    );

    // Watermark advanced; a second pass finds nothing.
    let (aggregated,): (i64,) = sqlx::query_as(
        "SELECT entries_aggregated FROM hot_account_watermarks
        JOIN accounts ON accounts.id = hot_account_watermarks.account_id
        WHERE accounts.system_identifier = '@World'",
    )
    .fetch_one(&app.db_pool)
    .await?;
    assert_eq!(aggregated, 5);
    assert_eq!(app.summa.maintenance().aggregate_hot_accounts().await?, 0);

    Ok(())
}

#[tokio::test]
async fn idempotency_keys_expire_and_prune() -> anyhow::Result<()> {
    let app = spawn_ledger().await;
    app.open_account("keyed").await;

    let mut credit = CreditParams::new("keyed", 1_000, "c1");
    credit.idempotency_key = Some("prune-me".into());
    app.summa.transactions().credit(&credit).await?;

    assert_eq!(app.summa.maintenance().prune_idempotency().await?, 0);
    app.time_source.advance(Span::new().hours(25));
    assert_eq!(app.summa.maintenance().prune_idempotency().await?, 1);

    Ok(())
}

#[tokio::test]
async fn leases_have_a_single_holder_per_cycle() -> anyhow::Result<()> {
    let app = spawn_ledger().await;
    let maintenance = app.summa.maintenance();
    let interval = Duration::from_secs(60);
    let holder_a = Uuid::new_v4();
    let holder_b = Uuid::new_v4();

    assert!(
        maintenance
            .try_acquire_lease("outbox-drain", holder_a, interval)
            .await?
    );
    // Another instance loses while the lease is live.
    assert!(
        !maintenance
            .try_acquire_lease("outbox-drain", holder_b, interval)
            .await?
    );
    // The current holder renews freely.
    assert!(
        maintenance
            .try_acquire_lease("outbox-drain", holder_a, interval)
            .await?
    );
    // Distinct workers lease independently.
    assert!(
        maintenance
            .try_acquire_lease("hold-expiry", holder_b, interval)
            .await?
    );

    // Once the lease lapses (2x interval), anyone may take it.
    app.time_source.advance(Span::new().minutes(3));
    assert!(
        maintenance
            .try_acquire_lease("outbox-drain", holder_b, interval)
            .await?
    );

    // Shutdown cleanup removes only the holder's leases.
    maintenance.release_leases(holder_b).await;
    let remaining: Vec<String> =
        sqlx::query_scalar("SELECT worker_id FROM worker_leases")
            .fetch_all(&app.db_pool)
            .await?;
    assert!(remaining.is_empty());

    Ok(())
}

#[tokio::test]
async fn runner_starts_and_stops_cleanly() -> anyhow::Result<()> {
    let app = spawn_ledger().await;

    let runner = app.summa.start_workers()?;
    // Workers are parked in their first jittered sleep; stopping must not
    // hang or leave leases behind.
    runner.stop().await;

    let leases: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM worker_leases")
            .fetch_one(&app.db_pool)
            .await?;
    assert_eq!(leases, 0);

    Ok(())
}
