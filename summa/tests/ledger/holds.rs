//! Two-phase holds: reserve, commit (full and partial), void, expiry.

use jiff::Span;
use summa::ErrorCode;
use summa::store::{
    AccountRef, TransferStatus,
    holds::{CreateHoldParams, HoldDestination},
    transactions::CreditParams,
};
use test_helpers::spawn_ledger;

#[tokio::test]
async fn hold_reserves_then_commits() -> anyhow::Result<()> {
    let app = spawn_ledger().await;
    app.open_account("holder").await;
    app.summa
        .transactions()
        .credit(&CreditParams::new("holder", 20_000, "c1"))
        .await?;

    let hold = app
        .summa
        .holds()
        .create(&CreateHoldParams::new("holder", 8_000, "h1"))
        .await?;
    assert_eq!(hold.status, TransferStatus::Inflight);
    assert!(hold.is_hold);

    // Reserved but not moved.
    assert_eq!(app.balance("holder").await, 20_000);
    assert_eq!(app.available_balance("holder").await, 12_000);

    let committed = app.summa.holds().commit(&hold.id, None).await?;
    assert_eq!(committed.status, TransferStatus::Posted);
    assert_eq!(committed.committed_amount, Some(8_000));
    assert_eq!(app.balance("holder").await, 12_000);
    assert_eq!(app.available_balance("holder").await, 12_000);
    app.assert_double_entry_holds().await;

    Ok(())
}

#[tokio::test]
async fn partial_commit_releases_the_rest() -> anyhow::Result<()> {
    let app = spawn_ledger().await;
    app.open_account("partial").await;
    app.open_account("merchant").await;
    app.summa
        .transactions()
        .credit(&CreditParams::new("partial", 10_000, "c1"))
        .await?;

    let mut params = CreateHoldParams::new("partial", 6_000, "h1");
    params.destinations = vec![HoldDestination {
        account: AccountRef::holder("merchant"),
        amount: 6_000,
    }];
    let hold = app.summa.holds().create(&params).await?;
    assert_eq!(app.available_balance("partial").await, 4_000);

    let committed =
        app.summa.holds().commit(&hold.id, Some(4_500)).await?;
    assert_eq!(committed.committed_amount, Some(4_500));
    assert_eq!(app.balance("partial").await, 5_500);
    assert_eq!(app.available_balance("partial").await, 5_500);
    assert_eq!(app.balance("merchant").await, 4_500);
    app.assert_double_entry_holds().await;

    // A settled hold cannot be committed again.
    let err =
        app.summa.holds().commit(&hold.id, None).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);

    Ok(())
}

#[tokio::test]
async fn hold_cannot_exceed_available_funds() -> anyhow::Result<()> {
    let app = spawn_ledger().await;
    app.open_account("tight").await;
    app.summa
        .transactions()
        .credit(&CreditParams::new("tight", 5_000, "c1"))
        .await?;

    app.summa
        .holds()
        .create(&CreateHoldParams::new("tight", 4_000, "h1"))
        .await?;
    // 1_000 available; a second 2_000 hold must not fit.
    let err = app
        .summa
        .holds()
        .create(&CreateHoldParams::new("tight", 2_000, "h2"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InsufficientFunds);
    assert_eq!(app.available_balance("tight").await, 1_000);

    Ok(())
}

#[tokio::test]
async fn void_releases_the_reservation() -> anyhow::Result<()> {
    let app = spawn_ledger().await;
    app.open_account("cancel").await;
    app.summa
        .transactions()
        .credit(&CreditParams::new("cancel", 9_000, "c1"))
        .await?;

    let hold = app
        .summa
        .holds()
        .create(&CreateHoldParams::new("cancel", 3_000, "h1"))
        .await?;
    let voided = app.summa.holds().void(&hold.id).await?;
    assert_eq!(voided.status, TransferStatus::Voided);
    assert_eq!(app.balance("cancel").await, 9_000);
    assert_eq!(app.available_balance("cancel").await, 9_000);

    // No entries were ever written for the hold.
    let legs: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM entries WHERE transfer_id = $1",
    )
    .bind(hold.id)
    .fetch_one(&app.db_pool)
    .await?;
    assert_eq!(legs, 0);

    Ok(())
}

#[tokio::test]
async fn expired_holds_are_swept_by_the_worker_action()
-> anyhow::Result<()> {
    let app = spawn_ledger().await;
    app.open_account("sleepy").await;
    app.summa
        .transactions()
        .credit(&CreditParams::new("sleepy", 5_000, "c1"))
        .await?;

    let mut params = CreateHoldParams::new("sleepy", 2_000, "h1");
    params.expires_in_minutes = Some(30);
    let hold = app.summa.holds().create(&params).await?;

    // Not yet expired; nothing to sweep.
    assert_eq!(app.summa.holds().expire_all().await?, 0);

    app.time_source.advance(Span::new().minutes(31));
    // A commit after expiry is refused.
    let err =
        app.summa.holds().commit(&hold.id, None).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);

    assert_eq!(app.summa.holds().expire_all().await?, 1);
    let swept = app.summa.holds().get(&hold.id).await?;
    assert_eq!(swept.status, TransferStatus::Expired);
    assert_eq!(app.available_balance("sleepy").await, 5_000);

    let active = app.summa.holds().list_active().await?;
    assert!(active.is_empty());
    assert_eq!(app.summa.holds().list_all().await?.len(), 1);

    Ok(())
}

#[tokio::test]
async fn multi_destination_holds_commit_in_full() -> anyhow::Result<()> {
    let app = spawn_ledger().await;
    app.open_account("payer").await;
    app.open_account("seller").await;
    app.open_account("platform").await;
    app.summa
        .transactions()
        .credit(&CreditParams::new("payer", 10_000, "c1"))
        .await?;

    let mut params = CreateHoldParams::new("payer", 10_000, "h1");
    params.destinations = vec![
        HoldDestination {
            account: AccountRef::holder("seller"),
            amount: 9_500,
        },
        HoldDestination {
            account: AccountRef::holder("platform"),
            amount: 500,
        },
    ];
    let hold =
        app.summa.holds().create_multi_destination(&params).await?;

    // Partial commits don't scale across several payees.
    let err = app
        .summa
        .holds()
        .commit(&hold.id, Some(5_000))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);

    app.summa.holds().commit(&hold.id, None).await?;
    assert_eq!(app.balance("payer").await, 0);
    assert_eq!(app.balance("seller").await, 9_500);
    assert_eq!(app.balance("platform").await, 500);
    app.assert_double_entry_holds().await;

    Ok(())
}
