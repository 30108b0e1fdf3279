//! Races: concurrent debits against one balance, and concurrent
//! idempotent retries.

use summa::ErrorCode;
use summa::store::transactions::{CreditParams, DebitParams};
use test_helpers::spawn_ledger;

#[tokio::test]
async fn concurrent_debits_never_overdraw() -> anyhow::Result<()> {
    let app = spawn_ledger().await;
    app.open_account("contended").await;
    app.summa
        .transactions()
        .credit(&CreditParams::new("contended", 10_000, "seed"))
        .await?;

    let tx = app.summa.transactions();
    let debit =
        |reference: &str| DebitParams::new("contended", 3_000, reference);
    let (d1, d2, d3, d4, d5) =
        (debit("d1"), debit("d2"), debit("d3"), debit("d4"), debit("d5"));
    let results = tokio::join!(
        tx.debit(&d1),
        tx.debit(&d2),
        tx.debit(&d3),
        tx.debit(&d4),
        tx.debit(&d5),
    );
    let outcomes = [results.0, results.1, results.2, results.3, results.4];

    let mut succeeded = 0;
    for outcome in outcomes {
        match outcome {
            Ok(_) => succeeded += 1,
            Err(e) => {
                assert_eq!(e.code(), ErrorCode::InsufficientFunds)
            }
        }
    }
    assert!(succeeded <= 3, "only three 3k debits fit in 10k");

    let balance = app.balance("contended").await;
    assert_eq!(balance, 10_000 - 3_000 * succeeded);
    assert!(balance >= 0);
    app.assert_double_entry_holds().await;
    app.assert_balance_matches_entries("contended").await;

    Ok(())
}

#[tokio::test]
async fn concurrent_idempotent_debits_post_once() -> anyhow::Result<()> {
    let app = spawn_ledger().await;
    app.open_account("idem-race").await;
    app.summa
        .transactions()
        .credit(&CreditParams::new("idem-race", 50_000, "seed"))
        .await?;

    let tx = app.summa.transactions();
    let mut params = DebitParams::new("idem-race", 10_000, "d1");
    params.idempotency_key = Some("race-key".into());
    let results = tokio::join!(
        tx.debit(&params),
        tx.debit(&params),
        tx.debit(&params),
        tx.debit(&params),
        tx.debit(&params),
    );
    let outcomes = [results.0, results.1, results.2, results.3, results.4];

    // Exactly one debit posted.
    assert_eq!(app.balance("idem-race").await, 40_000);
    let legs: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM entries e
        JOIN transfers t ON e.transfer_id = t.id
        WHERE t.reference = 'd1'",
    )
    .fetch_one(&app.db_pool)
    .await?;
    assert_eq!(legs, 2);

    // Every caller that got an answer saw the same transaction.
    let ids: Vec<_> = outcomes
        .into_iter()
        .filter_map(|outcome| outcome.ok().map(|r| r.transaction_id))
        .collect();
    assert!(!ids.is_empty());
    assert!(ids.iter().all(|id| *id == ids[0]));

    app.assert_double_entry_holds().await;

    Ok(())
}
