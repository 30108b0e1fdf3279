//! Event chains, block checkpoints and Merkle proofs.

use summa::store::{
    AccountRef, AggregateType, LedgerEvent,
    transactions::{CreditParams, DebitParams, RefundParams, TransferParams},
};
use test_helpers::spawn_ledger;

#[tokio::test]
async fn chains_verify_after_a_mix_of_operations() -> anyhow::Result<()> {
    let app = spawn_ledger().await;
    let account = app.open_account("chained").await;

    app.summa
        .transactions()
        .credit(&CreditParams::new("chained", 10_000, "c1"))
        .await?;
    app.summa
        .transactions()
        .debit(&DebitParams::new("chained", 2_500, "d1"))
        .await?;
    app.summa
        .accounts()
        .freeze(&AccountRef::holder("chained"), Some("audit"))
        .await?;
    app.summa
        .accounts()
        .unfreeze(&AccountRef::holder("chained"))
        .await?;

    let verification = app
        .summa
        .events()
        .verify_chain(AggregateType::Account, account.id.0)
        .await?;
    assert!(verification.valid);
    // created, frozen, unfrozen
    assert_eq!(verification.events_checked, 3);
    assert_eq!(verification.broken_at_version, None);

    let stream = app
        .summa
        .events()
        .get_for_aggregate(AggregateType::Account, account.id.0)
        .await?;
    assert_eq!(stream.len(), 3);
    // Versions are dense and the chain links by hash.
    for (i, event) in stream.iter().enumerate() {
        assert_eq!(event.aggregate_version, i as i64 + 1);
        if i == 0 {
            assert_eq!(event.prev_hash, None);
        } else {
            assert_eq!(
                event.prev_hash.as_deref(),
                Some(stream[i - 1].hash.as_str())
            );
        }
    }

    Ok(())
}

#[tokio::test]
async fn tampering_breaks_the_chain_at_the_right_version()
-> anyhow::Result<()> {
    let app = spawn_ledger().await;
    let account = app.open_account("sealed").await;
    app.summa
        .transactions()
        .credit(&CreditParams::new("sealed", 1_000, "c1"))
        .await?;
    app.summa
        .accounts()
        .freeze(&AccountRef::holder("sealed"), None)
        .await?;

    sqlx::query(
        "UPDATE ledger_events
        SET event_data = jsonb_set(event_data, '{reason}', '\"forged\"')
        WHERE aggregate_type = 'account'
          AND aggregate_id = $1
          AND aggregate_version = 2",
    )
    .bind(account.id.0)
    .execute(&app.db_pool)
    .await?;

    let verification = app
        .summa
        .events()
        .verify_chain(AggregateType::Account, account.id.0)
        .await?;
    assert!(!verification.valid);
    assert_eq!(verification.broken_at_version, Some(2));

    Ok(())
}

#[tokio::test]
async fn checkpoints_cover_events_and_chain_together() -> anyhow::Result<()> {
    let app = spawn_ledger().await;
    app.open_account("blocky").await;
    app.summa
        .transactions()
        .credit(&CreditParams::new("blocky", 10_000, "c1"))
        .await?;

    let first = app
        .summa
        .events()
        .checkpoint_now()
        .await?
        .expect("events to checkpoint");
    assert_eq!(first.block_sequence, 1);
    assert_eq!(first.prev_block_hash, None);
    assert!(first.event_count >= 2);

    // No new events, no new block.
    assert!(app.summa.events().checkpoint_now().await?.is_none());

    app.summa
        .transactions()
        .debit(&DebitParams::new("blocky", 4_000, "d1"))
        .await?;
    let second = app
        .summa
        .events()
        .checkpoint_now()
        .await?
        .expect("new events to checkpoint");
    assert_eq!(second.block_sequence, 2);
    assert_eq!(second.prev_block_id, Some(first.id));
    assert_eq!(
        second.prev_block_hash.as_deref(),
        Some(first.block_hash.as_str())
    );
    assert_eq!(second.from_event_sequence, first.to_event_sequence + 1);

    for sequence in [1, 2] {
        let verification =
            app.summa.events().verify_block(sequence).await?;
        assert!(verification.valid, "block {sequence} failed verification");
    }

    let anchor = app
        .summa
        .events()
        .verify_external_anchor(1, &first.block_hash)
        .await?;
    assert!(anchor.matches);
    assert_eq!(anchor.merkle_root, first.merkle_root);
    let bad_anchor = app
        .summa
        .events()
        .verify_external_anchor(1, &second.block_hash)
        .await?;
    assert!(!bad_anchor.matches);

    Ok(())
}

#[tokio::test]
async fn every_checkpointed_event_proves_inclusion() -> anyhow::Result<()> {
    let app = spawn_ledger().await;
    app.open_account("proven").await;
    app.summa
        .transactions()
        .credit(&CreditParams::new("proven", 10_000, "c1"))
        .await?;
    app.summa
        .transactions()
        .debit(&DebitParams::new("proven", 1_000, "d1"))
        .await?;
    app.summa
        .transactions()
        .debit(&DebitParams::new("proven", 2_000, "d2"))
        .await?;

    let block = app
        .summa
        .events()
        .checkpoint_now()
        .await?
        .expect("events to checkpoint");

    let covered: Vec<LedgerEvent> = sqlx::query_as(
        "SELECT * FROM ledger_events
        WHERE sequence_number BETWEEN $1 AND $2
        ORDER BY sequence_number",
    )
    .bind(block.from_event_sequence)
    .bind(block.to_event_sequence)
    .fetch_all(&app.db_pool)
    .await?;
    assert_eq!(covered.len() as i64, block.event_count);

    for event in &covered {
        let proof = app.summa.events().generate_proof(&event.id).await?;
        assert!(app.summa.events().verify_proof(&proof), "{}", event.id);
        assert_eq!(proof.root, block.merkle_root);
        assert_eq!(proof.leaf, event.hash);
    }

    Ok(())
}

#[tokio::test]
async fn correlation_groups_a_refund_pair() -> anyhow::Result<()> {
    let app = spawn_ledger().await;
    app.open_account("payer").await;
    app.open_account("payee").await;
    app.summa
        .transactions()
        .credit(&CreditParams::new("payer", 5_000, "c1"))
        .await?;
    let sale = app
        .summa
        .transactions()
        .transfer(&TransferParams::new("payer", "payee", 2_000, "sale"))
        .await?;
    let refund = app
        .summa
        .transactions()
        .refund(&RefundParams {
            transaction_id: sale.transaction_id,
            amount: None,
            reason: None,
        })
        .await?;

    let related = app
        .summa
        .events()
        .get_by_correlation(sale.correlation_id)
        .await?;
    // Sale posted, refund posted, original marked refunded.
    assert_eq!(related.len(), 3);
    assert!(
        related
            .iter()
            .any(|e| e.aggregate_id == refund.transaction_id.0)
    );

    // Both transfer chains verify independently.
    for id in [sale.transaction_id, refund.transaction_id] {
        let verification = app
            .summa
            .events()
            .verify_chain(AggregateType::Transaction, id.0)
            .await?;
        assert!(verification.valid);
    }

    Ok(())
}
