//! Account lifecycle: idempotent creation, the status state machine,
//! closure with sweep, and checksum tamper detection.

use jiff::Span;
use summa::ErrorCode;
use summa::store::{
    AccountRef, AccountStatus, HolderType, accounts::CreateAccountParams,
    transactions::{CreditParams, DebitParams},
};
use test_helpers::spawn_ledger;

#[tokio::test]
async fn create_is_idempotent_on_natural_key() -> anyhow::Result<()> {
    let app = spawn_ledger().await;

    let first = app.open_account("user-1").await;
    let second = app.open_account("user-1").await;
    assert_eq!(first.id, second.id);
    assert_eq!(first.version, 0);
    assert_eq!(first.balance, 0);
    assert_eq!(first.status, AccountStatus::Active);

    Ok(())
}

#[tokio::test]
async fn concurrent_creates_converge_on_one_account() -> anyhow::Result<()> {
    let app = spawn_ledger().await;
    let accounts = app.summa.accounts();
    let params =
        CreateAccountParams::new("race-holder", HolderType::Individual);

    let (a, b, c, d, e) = tokio::join!(
        accounts.create(&params),
        accounts.create(&params),
        accounts.create(&params),
        accounts.create(&params),
        accounts.create(&params),
    );
    let ids = [a?.id, b?.id, c?.id, d?.id, e?.id];
    assert!(ids.iter().all(|id| *id == ids[0]));

    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM accounts WHERE holder_id = 'race-holder'",
    )
    .fetch_one(&app.db_pool)
    .await?;
    assert_eq!(count, 1);

    Ok(())
}

#[tokio::test]
async fn same_holder_id_needs_type_to_disambiguate() -> anyhow::Result<()> {
    let app = spawn_ledger().await;
    let accounts = app.summa.accounts();

    accounts
        .create(&CreateAccountParams::new("acme", HolderType::Individual))
        .await?;
    accounts
        .create(&CreateAccountParams::new("acme", HolderType::Organization))
        .await?;

    let err = accounts.get("acme", None).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);

    let org = accounts
        .get("acme", Some(HolderType::Organization))
        .await?;
    assert_eq!(org.holder_type, HolderType::Organization);

    Ok(())
}

#[tokio::test]
async fn invalid_create_params_are_rejected() -> anyhow::Result<()> {
    let app = spawn_ledger().await;
    let accounts = app.summa.accounts();

    let err = accounts
        .create(&CreateAccountParams::new("", HolderType::Individual))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);

    let err = accounts
        .create(&CreateAccountParams::new(
            "x".repeat(256),
            HolderType::Individual,
        ))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);

    let mut bad_currency =
        CreateAccountParams::new("user-2", HolderType::Individual);
    bad_currency.currency = Some("usd".into());
    let err = accounts.create(&bad_currency).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);

    Ok(())
}

#[tokio::test]
async fn freeze_blocks_mutations_until_unfrozen() -> anyhow::Result<()> {
    let app = spawn_ledger().await;
    app.open_account("frosty").await;
    let account = AccountRef::holder("frosty");

    app.summa
        .transactions()
        .credit(&CreditParams::new("frosty", 5_000, "c1"))
        .await?;

    let frozen = app.summa.accounts().freeze(&account, Some("risk")).await?;
    assert_eq!(frozen.status, AccountStatus::Frozen);

    let err = app
        .summa
        .transactions()
        .credit(&CreditParams::new("frosty", 1_000, "c2"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::AccountFrozen);

    // Freezing a frozen account does not follow the state machine.
    let err =
        app.summa.accounts().freeze(&account, None).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);

    let active = app.summa.accounts().unfreeze(&account).await?;
    assert_eq!(active.status, AccountStatus::Active);
    app.summa
        .transactions()
        .credit(&CreditParams::new("frosty", 1_000, "c2"))
        .await?;
    assert_eq!(app.balance("frosty").await, 6_000);

    Ok(())
}

#[tokio::test]
async fn close_requires_zero_balance_or_sweep() -> anyhow::Result<()> {
    let app = spawn_ledger().await;
    app.open_account("leaver").await;
    app.open_account("keeper").await;

    app.summa
        .transactions()
        .credit(&CreditParams::new("leaver", 7_500, "c1"))
        .await?;

    let err = app
        .summa
        .accounts()
        .close(&AccountRef::holder("leaver"), None, None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);

    let closed = app
        .summa
        .accounts()
        .close(
            &AccountRef::holder("leaver"),
            Some(&AccountRef::holder("keeper")),
            Some("account closure"),
        )
        .await?;
    assert_eq!(closed.status, AccountStatus::Closed);
    assert_eq!(closed.balance, 0);
    assert_eq!(app.balance("keeper").await, 7_500);
    app.assert_double_entry_holds().await;
    app.assert_balance_matches_entries("keeper").await;

    // A closed account accepts no further mutations.
    let err = app
        .summa
        .transactions()
        .credit(&CreditParams::new("leaver", 100, "c2"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::AccountClosed);

    // The full transition history is on the audit log.
    let transitions: Vec<(Option<AccountStatus>, AccountStatus)> =
        sqlx::query_as(
            "SELECT l.from_status, l.to_status
            FROM account_status_log l
            JOIN accounts a ON a.id = l.account_id
            WHERE a.holder_id = 'leaver'
            ORDER BY l.created_at",
        )
        .fetch_all(&app.db_pool)
        .await?;
    assert_eq!(transitions, vec![
        (None, AccountStatus::Active),
        (Some(AccountStatus::Active), AccountStatus::Closed),
    ]);

    Ok(())
}

#[tokio::test]
async fn tampered_balance_is_a_fatal_integrity_error() -> anyhow::Result<()> {
    let app = spawn_ledger().await;
    app.open_account("victim").await;
    app.summa
        .transactions()
        .credit(&CreditParams::new("victim", 1_000, "c1"))
        .await?;

    // Write around the engine.
    sqlx::query(
        "UPDATE accounts SET balance = balance + 1000000
        WHERE holder_id = 'victim'",
    )
    .execute(&app.db_pool)
    .await?;

    let err = app
        .summa
        .accounts()
        .get_balance(&AccountRef::holder("victim"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ChainIntegrityViolation);

    // Mutations refuse the row too.
    let err = app
        .summa
        .transactions()
        .debit(&DebitParams::new("victim", 100, "d1"))
        .await
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::ChainIntegrityViolation);

    Ok(())
}

#[tokio::test]
async fn balance_as_of_reads_history() -> anyhow::Result<()> {
    let app = spawn_ledger().await;
    app.open_account("history").await;

    app.summa
        .transactions()
        .credit(&CreditParams::new("history", 10_000, "c1"))
        .await?;
    let between = app.time_source.now() + Span::new().minutes(30);
    app.time_source.advance(Span::new().hours(1));
    app.summa
        .transactions()
        .debit(&DebitParams::new("history", 3_000, "d1"))
        .await?;

    assert_eq!(app.balance("history").await, 7_000);
    let historical = app
        .summa
        .accounts()
        .get_balance_as_of(&AccountRef::holder("history"), between)
        .await?;
    assert_eq!(historical.balance, 10_000);

    Ok(())
}
