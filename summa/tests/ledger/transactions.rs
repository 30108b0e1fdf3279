//! The mutation operations: credit, debit, transfer, multi-transfer,
//! refund, correction, adjustment and journal entries.

use summa::ErrorCode;
use summa::store::{
    AccountRef, AdjustmentType, EntryType, HolderType, TransferStatus,
    TransferType,
    accounts::CreateAccountParams,
    transactions::{
        AdjustParams, CorrectionParams, CreditParams, DebitParams,
        JournalLeg, JournalParams, MultiTransferDestination,
        MultiTransferParams, RefundParams, TransferParams,
    },
};
use test_helpers::spawn_ledger;

#[tokio::test]
async fn credit_then_debit_moves_the_balance() -> anyhow::Result<()> {
    let app = spawn_ledger().await;
    app.open_account("user-1").await;

    let credit = app
        .summa
        .transactions()
        .credit(&CreditParams::new("user-1", 10_000, "c1"))
        .await?;
    assert_eq!(credit.transfer_type, TransferType::Credit);
    assert_eq!(credit.status, TransferStatus::Posted);
    assert_eq!(app.balance("user-1").await, 10_000);

    app.summa
        .transactions()
        .debit(&DebitParams::new("user-1", 3_000, "d1"))
        .await?;
    assert_eq!(app.balance("user-1").await, 7_000);

    // The world absorbed the mirror legs.
    let world = app
        .summa
        .accounts()
        .get_balance(&AccountRef::system("@World"))
        .await?;
    assert_eq!(world.balance, -7_000);

    app.assert_double_entry_holds().await;
    app.assert_balance_matches_entries("user-1").await;

    Ok(())
}

#[tokio::test]
async fn entries_record_running_balances() -> anyhow::Result<()> {
    let app = spawn_ledger().await;
    app.open_account("runner").await;

    let credit = app
        .summa
        .transactions()
        .credit(&CreditParams::new("runner", 10_000, "c1"))
        .await?;
    let debit = app
        .summa
        .transactions()
        .debit(&DebitParams::new("runner", 4_000, "d1"))
        .await?;

    let account = app.summa.accounts().get("runner", None).await?;
    let credit_entries = app
        .summa
        .transactions()
        .entries_for(&credit.transaction_id)
        .await?;
    assert_eq!(credit_entries.len(), 2);
    let user_leg = credit_entries
        .iter()
        .find(|e| e.account_id == account.id)
        .expect("user leg");
    assert_eq!(user_leg.entry_type, EntryType::Credit);
    assert_eq!(user_leg.balance_before, 0);
    assert_eq!(user_leg.balance_after, 10_000);

    let debit_entries = app
        .summa
        .transactions()
        .entries_for(&debit.transaction_id)
        .await?;
    let user_leg = debit_entries
        .iter()
        .find(|e| e.account_id == account.id)
        .expect("user leg");
    assert_eq!(user_leg.balance_before, 10_000);
    assert_eq!(user_leg.balance_after, 6_000);
    // Entry sequence numbers are globally monotone.
    let mut sequences: Vec<i64> = credit_entries
        .iter()
        .chain(&debit_entries)
        .map(|e| e.sequence_number)
        .collect();
    let sorted = {
        let mut s = sequences.clone();
        s.sort();
        s.dedup();
        s
    };
    sequences.sort();
    assert_eq!(sequences, sorted);

    Ok(())
}

#[tokio::test]
async fn transfer_between_holders() -> anyhow::Result<()> {
    let app = spawn_ledger().await;
    app.open_account("alice").await;
    app.open_account("bob").await;

    app.summa
        .transactions()
        .credit(&CreditParams::new("alice", 50_000, "c1"))
        .await?;
    app.summa
        .transactions()
        .transfer(&TransferParams::new("alice", "bob", 20_000, "t1"))
        .await?;

    assert_eq!(app.balance("alice").await, 30_000);
    assert_eq!(app.balance("bob").await, 20_000);
    assert_eq!(
        app.balance("alice").await + app.balance("bob").await,
        50_000
    );
    app.assert_double_entry_holds().await;

    Ok(())
}

#[tokio::test]
async fn insufficient_funds_leaves_balance_untouched() -> anyhow::Result<()> {
    let app = spawn_ledger().await;
    app.open_account("poor").await;
    app.summa
        .transactions()
        .credit(&CreditParams::new("poor", 5_000, "c1"))
        .await?;

    let err = app
        .summa
        .transactions()
        .debit(&DebitParams::new("poor", 10_000, "big"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InsufficientFunds);
    assert_eq!(app.balance("poor").await, 5_000);

    // The failed mutation left no trace.
    assert!(
        app.summa.transactions().get_by_reference("big").await.is_err()
    );
    app.assert_double_entry_holds().await;

    Ok(())
}

#[tokio::test]
async fn overdraft_needs_both_account_and_caller_opt_in()
-> anyhow::Result<()> {
    let app = spawn_ledger().await;
    let mut params =
        CreateAccountParams::new("borrower", HolderType::Individual);
    params.allow_overdraft = true;
    params.overdraft_limit = 2_000;
    app.summa.accounts().create(&params).await?;

    app.summa
        .transactions()
        .credit(&CreditParams::new("borrower", 1_000, "c1"))
        .await?;

    // Caller did not opt in: the floor stays at zero.
    let err = app
        .summa
        .transactions()
        .debit(&DebitParams::new("borrower", 2_500, "d1"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InsufficientFunds);

    let mut overdraw = DebitParams::new("borrower", 2_500, "d1");
    overdraw.allow_overdraft = true;
    app.summa.transactions().debit(&overdraw).await?;
    assert_eq!(app.balance("borrower").await, -1_500);

    // The overdraft limit is still a floor.
    let mut too_far = DebitParams::new("borrower", 1_000, "d2");
    too_far.allow_overdraft = true;
    let err =
        app.summa.transactions().debit(&too_far).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InsufficientFunds);

    Ok(())
}

#[tokio::test]
async fn idempotency_key_replays_the_result() -> anyhow::Result<()> {
    let app = spawn_ledger().await;
    app.open_account("idem").await;
    app.summa
        .transactions()
        .credit(&CreditParams::new("idem", 50_000, "c1"))
        .await?;

    let mut debit = DebitParams::new("idem", 10_000, "d1");
    debit.idempotency_key = Some("k1".into());
    let first = app.summa.transactions().debit(&debit).await?;
    let second = app.summa.transactions().debit(&debit).await?;
    assert_eq!(first.transaction_id, second.transaction_id);
    assert_eq!(app.balance("idem").await, 40_000);

    // One entry pair, not two.
    let legs: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM entries WHERE transfer_id = $1",
    )
    .bind(first.transaction_id)
    .fetch_one(&app.db_pool)
    .await?;
    assert_eq!(legs, 2);

    // The same key with a different reference is a collision.
    let mut collision = DebitParams::new("idem", 10_000, "other-ref");
    collision.idempotency_key = Some("k1".into());
    let err =
        app.summa.transactions().debit(&collision).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::Conflict);

    Ok(())
}

#[tokio::test]
async fn duplicate_reference_is_rejected() -> anyhow::Result<()> {
    let app = spawn_ledger().await;
    app.open_account("refs").await;

    app.summa
        .transactions()
        .credit(&CreditParams::new("refs", 1_000, "same-ref"))
        .await?;
    let err = app
        .summa
        .transactions()
        .credit(&CreditParams::new("refs", 1_000, "same-ref"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::Conflict);
    assert_eq!(app.balance("refs").await, 1_000);

    Ok(())
}

#[tokio::test]
async fn multi_transfer_splits_across_destinations() -> anyhow::Result<()> {
    let app = spawn_ledger().await;
    app.open_account("payer").await;
    app.open_account("seller").await;
    app.open_account("platform").await;

    app.summa
        .transactions()
        .credit(&CreditParams::new("payer", 100_000, "c1"))
        .await?;
    app.summa
        .transactions()
        .multi_transfer(&MultiTransferParams {
            source_holder_id: "payer".into(),
            source_holder_type: None,
            amount: 100_000,
            destinations: vec![
                MultiTransferDestination {
                    holder_id: "seller".into(),
                    holder_type: None,
                    amount: 95_000,
                },
                MultiTransferDestination {
                    holder_id: "platform".into(),
                    holder_type: None,
                    amount: 5_000,
                },
            ],
            reference: "mt1".into(),
            idempotency_key: None,
            metadata: serde_json::json!({}),
        })
        .await?;

    assert_eq!(app.balance("payer").await, 0);
    assert_eq!(app.balance("seller").await, 95_000);
    assert_eq!(app.balance("platform").await, 5_000);
    app.assert_double_entry_holds().await;

    Ok(())
}

#[tokio::test]
async fn multi_transfer_validates_destinations() -> anyhow::Result<()> {
    let app = spawn_ledger().await;
    app.open_account("payer").await;
    app.open_account("seller").await;

    let base = MultiTransferParams {
        source_holder_id: "payer".into(),
        source_holder_type: None,
        amount: 100,
        destinations: vec![MultiTransferDestination {
            holder_id: "seller".into(),
            holder_type: None,
            amount: 60,
        }],
        reference: "mt-bad".into(),
        idempotency_key: None,
        metadata: serde_json::json!({}),
    };
    // Destination sum must equal the total.
    let err = app
        .summa
        .transactions()
        .multi_transfer(&base)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);

    // Destinations must be distinct.
    let mut dup = base.clone();
    dup.destinations = vec![
        MultiTransferDestination {
            holder_id: "seller".into(),
            holder_type: None,
            amount: 50,
        },
        MultiTransferDestination {
            holder_id: "seller".into(),
            holder_type: None,
            amount: 50,
        },
    ];
    let err =
        app.summa.transactions().multi_transfer(&dup).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);

    Ok(())
}

#[tokio::test]
async fn full_refund_reverses_and_marks_original() -> anyhow::Result<()> {
    let app = spawn_ledger().await;
    app.open_account("shopper").await;
    app.open_account("store").await;

    app.summa
        .transactions()
        .credit(&CreditParams::new("shopper", 10_000, "c1"))
        .await?;
    let sale = app
        .summa
        .transactions()
        .transfer(&TransferParams::new("shopper", "store", 6_000, "sale"))
        .await?;

    let refund = app
        .summa
        .transactions()
        .refund(&RefundParams {
            transaction_id: sale.transaction_id,
            amount: None,
            reason: Some("returned goods".into()),
        })
        .await?;
    assert_eq!(refund.transfer_type, TransferType::Refund);
    assert_eq!(refund.amount, 6_000);
    assert_eq!(refund.correlation_id, sale.correlation_id);

    let original =
        app.summa.transactions().get(&sale.transaction_id).await?;
    assert_eq!(original.status, TransferStatus::Reversed);
    assert_eq!(original.refunded_amount, 6_000);
    assert_eq!(app.balance("shopper").await, 10_000);
    assert_eq!(app.balance("store").await, 0);
    app.assert_double_entry_holds().await;

    // Refunding a reversal, or refunding past the amount, is rejected.
    let err = app
        .summa
        .transactions()
        .refund(&RefundParams {
            transaction_id: refund.transaction_id,
            amount: None,
            reason: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);
    let err = app
        .summa
        .transactions()
        .refund(&RefundParams {
            transaction_id: sale.transaction_id,
            amount: Some(1),
            reason: None,
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);

    Ok(())
}

#[tokio::test]
async fn partial_refunds_accumulate() -> anyhow::Result<()> {
    let app = spawn_ledger().await;
    app.open_account("buyer").await;
    app.open_account("shop").await;

    app.summa
        .transactions()
        .credit(&CreditParams::new("buyer", 10_000, "c1"))
        .await?;
    let sale = app
        .summa
        .transactions()
        .transfer(&TransferParams::new("buyer", "shop", 8_000, "sale"))
        .await?;

    app.summa
        .transactions()
        .refund(&RefundParams {
            transaction_id: sale.transaction_id,
            amount: Some(3_000),
            reason: None,
        })
        .await?;
    let original =
        app.summa.transactions().get(&sale.transaction_id).await?;
    assert_eq!(original.status, TransferStatus::Posted);
    assert_eq!(original.refunded_amount, 3_000);
    assert_eq!(app.balance("buyer").await, 5_000);

    // Refund the remainder; the original flips to reversed.
    app.summa
        .transactions()
        .refund(&RefundParams {
            transaction_id: sale.transaction_id,
            amount: None,
            reason: None,
        })
        .await?;
    let original =
        app.summa.transactions().get(&sale.transaction_id).await?;
    assert_eq!(original.status, TransferStatus::Reversed);
    assert_eq!(app.balance("buyer").await, 10_000);
    assert_eq!(app.balance("shop").await, 0);
    app.assert_double_entry_holds().await;

    Ok(())
}

#[tokio::test]
async fn correction_reverses_then_reposts() -> anyhow::Result<()> {
    let app = spawn_ledger().await;
    app.open_account("alice").await;
    app.open_account("bob").await;

    app.summa
        .transactions()
        .credit(&CreditParams::new("alice", 1_000, "c1"))
        .await?;
    // Fat-fingered: should have been 50.
    let wrong = app
        .summa
        .transactions()
        .transfer(&TransferParams::new("alice", "bob", 500, "t1"))
        .await?;

    let correction = app
        .summa
        .transactions()
        .correct(&CorrectionParams {
            transaction_id: wrong.transaction_id,
            entries: vec![
                JournalLeg {
                    account: AccountRef::holder("alice"),
                    entry_type: EntryType::Debit,
                    amount: 50,
                },
                JournalLeg {
                    account: AccountRef::holder("bob"),
                    entry_type: EntryType::Credit,
                    amount: 50,
                },
            ],
            reason: Some("wrong amount".into()),
        })
        .await?;
    assert_eq!(correction.transfer_type, TransferType::Correction);
    assert_eq!(correction.correlation_id, wrong.correlation_id);

    let original =
        app.summa.transactions().get(&wrong.transaction_id).await?;
    assert_eq!(original.status, TransferStatus::Reversed);
    assert_eq!(app.balance("alice").await, 950);
    assert_eq!(app.balance("bob").await, 50);
    app.assert_double_entry_holds().await;

    // The whole story shares one correlation id.
    let related = app
        .summa
        .events()
        .get_by_correlation(wrong.correlation_id)
        .await?;
    assert!(related.len() >= 3);

    Ok(())
}

#[tokio::test]
async fn journal_and_adjust_post_balanced_legs() -> anyhow::Result<()> {
    let app = spawn_ledger().await;
    app.open_account("books-a").await;
    app.open_account("books-b").await;
    app.summa
        .transactions()
        .credit(&CreditParams::new("books-a", 2_000, "c1"))
        .await?;

    let journal = app
        .summa
        .transactions()
        .journal(&JournalParams {
            entries: vec![
                JournalLeg {
                    account: AccountRef::holder("books-a"),
                    entry_type: EntryType::Debit,
                    amount: 700,
                },
                JournalLeg {
                    account: AccountRef::holder("books-b"),
                    entry_type: EntryType::Credit,
                    amount: 700,
                },
            ],
            reference: "j1".into(),
            idempotency_key: None,
            metadata: serde_json::json!({}),
        })
        .await?;
    assert_eq!(journal.transfer_type, TransferType::Journal);
    assert_eq!(app.balance("books-a").await, 1_300);
    assert_eq!(app.balance("books-b").await, 700);

    let adjust = app
        .summa
        .transactions()
        .adjust(&AdjustParams {
            entries: vec![
                JournalLeg {
                    account: AccountRef::system("@World"),
                    entry_type: EntryType::Debit,
                    amount: 300,
                },
                JournalLeg {
                    account: AccountRef::holder("books-b"),
                    entry_type: EntryType::Credit,
                    amount: 300,
                },
            ],
            adjustment_type: AdjustmentType::Accrual,
            reference: "adj1".into(),
            idempotency_key: None,
            metadata: serde_json::json!({}),
        })
        .await?;
    assert_eq!(adjust.transfer_type, TransferType::Adjustment);
    assert_eq!(app.balance("books-b").await, 1_000);
    app.assert_double_entry_holds().await;

    // Unbalanced legs never reach the database.
    let err = app
        .summa
        .transactions()
        .journal(&JournalParams {
            entries: vec![
                JournalLeg {
                    account: AccountRef::holder("books-a"),
                    entry_type: EntryType::Debit,
                    amount: 100,
                },
                JournalLeg {
                    account: AccountRef::holder("books-b"),
                    entry_type: EntryType::Credit,
                    amount: 90,
                },
            ],
            reference: "j2".into(),
            idempotency_key: None,
            metadata: serde_json::json!({}),
        })
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);

    Ok(())
}

#[tokio::test]
async fn cross_currency_transfer_records_fx() -> anyhow::Result<()> {
    let app = spawn_ledger().await;
    app.open_account("us-payer").await;
    let mut eur = CreateAccountParams::new("eu-payee", HolderType::Individual);
    eur.currency = Some("EUR".into());
    app.summa.accounts().create(&eur).await?;

    app.summa
        .transactions()
        .credit(&CreditParams::new("us-payer", 10_000, "c1"))
        .await?;

    // Missing rate is rejected outright.
    let err = app
        .summa
        .transactions()
        .transfer(&TransferParams::new("us-payer", "eu-payee", 10_000, "fx0"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);

    let mut fx = TransferParams::new("us-payer", "eu-payee", 10_000, "fx1");
    fx.exchange_rate = Some(920_000); // 0.92, scaled by 1e6
    let result = app.summa.transactions().transfer(&fx).await?;

    assert_eq!(app.balance("us-payer").await, 0);
    assert_eq!(app.balance("eu-payee").await, 9_200);

    let legs = app
        .summa
        .transactions()
        .entries_for(&result.transaction_id)
        .await?;
    let credit_leg = legs
        .iter()
        .find(|e| e.entry_type == EntryType::Credit)
        .expect("credit leg");
    assert_eq!(credit_leg.amount, 9_200);
    assert_eq!(credit_leg.currency, "EUR");
    assert_eq!(credit_leg.original_amount, Some(10_000));
    assert_eq!(credit_leg.original_currency.as_deref(), Some("USD"));
    assert_eq!(credit_leg.exchange_rate, Some(920_000));

    Ok(())
}

#[tokio::test]
async fn validation_rejects_nonsense() -> anyhow::Result<()> {
    let app = spawn_ledger().await;
    app.open_account("victim").await;

    for amount in [0, -5] {
        let err = app
            .summa
            .transactions()
            .credit(&CreditParams::new("victim", amount, "ref"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument);
    }

    let err = app
        .summa
        .transactions()
        .credit(&CreditParams::new("victim", 100, ""))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);

    // Engine-wide cap.
    let err = app
        .summa
        .transactions()
        .credit(&CreditParams::new("victim", i64::MAX, "huge"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::LimitExceeded);

    let err = app
        .summa
        .transactions()
        .credit(&CreditParams::new("ghost", 100, "ref"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NotFound);

    Ok(())
}
