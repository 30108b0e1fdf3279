mod accounts;
mod concurrency;
mod events;
mod holds;
mod transactions;
mod workers;

use test_helpers::spawn_ledger;

#[tokio::test]
async fn engine_builds_against_fresh_database() -> anyhow::Result<()> {
    let app = spawn_ledger().await;

    assert_eq!(app.summa.ledger().name, "test-ledger");
    let dialect = app.summa.dialect();
    assert_eq!(dialect.name, "postgresql");
    assert!(dialect.supports_advisory_locks);
    assert!(dialect.supports_for_update);
    assert!(dialect.supports_returning);

    Ok(())
}
