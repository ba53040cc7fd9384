//! Runs against a live PostgreSQL: `DATABASE_URL=... cargo test -- --ignored`.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::random_owner;
use simplebank_ledger::{
    AccountStore, Currency, ErrorKind, Ledger, LedgerConfig, LedgerError, PgStore, Store,
    UnitOfWork,
};

async fn pg_ledger() -> Ledger<PgStore> {
    let mut config = LedgerConfig::default();
    if let Ok(url) = std::env::var("DATABASE_URL") {
        config.store.database_url = url;
    }
    config.store.lock_timeout = Duration::from_millis(200);
    config.retry.base_delay = Duration::from_millis(1);
    config.retry.max_delay = Duration::from_millis(20);
    config.retry.max_attempts = 20;

    let ledger = Ledger::connect(config).await.expect("Failed to connect");
    ledger.store().apply_schema().await.expect("Failed to apply schema");
    ledger
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn pg_account_crud() {
    let ledger = pg_ledger().await;
    ledger.store().health_check().await.unwrap();

    let owner = random_owner();
    let account = ledger.create_account(&owner, 250, Currency::cad()).await.unwrap();
    assert_eq!(account.owner, owner);
    assert_eq!(ledger.get_account(account.id).await.unwrap(), account);

    let updated = ledger.update_account_balance(account.id, 10).await.unwrap();
    assert_eq!(updated.balance, 10);

    ledger.delete_account(account.id).await.unwrap();
    assert_eq!(
        ledger.get_account(account.id).await.unwrap_err(),
        LedgerError::AccountNotFound(account.id)
    );
    assert!(ledger.list_accounts(5, 0).await.unwrap().len() <= 5);
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn pg_transfer_example() {
    let ledger = pg_ledger().await;
    let a = ledger.create_account(random_owner(), 1000, Currency::usd()).await.unwrap();
    let b = ledger.create_account(random_owner(), 500, Currency::usd()).await.unwrap();

    let result = ledger.execute_transfer(a.id, b.id, 300, None).await.unwrap();

    assert_eq!(result.from_account.balance, 700);
    assert_eq!(result.to_account.balance, 800);
    assert_eq!(result.from_entry.amount, -300);
    assert_eq!(result.to_entry.amount, 300);

    let err = ledger.delete_account(a.id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Fatal);
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn pg_insufficient_funds_rolls_back() {
    let ledger = pg_ledger().await;
    let a = ledger.create_account(random_owner(), 100, Currency::usd()).await.unwrap();
    let b = ledger.create_account(random_owner(), 100, Currency::usd()).await.unwrap();

    let err = ledger.execute_transfer(b.id, a.id, 150, None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InsufficientFunds);

    assert_eq!(ledger.get_account(a.id).await.unwrap().balance, 100);
    assert!(ledger.list_account_entries(a.id, 10, 0).await.unwrap().is_empty());
    assert!(ledger.list_transfers_involving(a.id, 10, 0).await.unwrap().is_empty());
}

#[tokio::test]
#[ignore] // Requires PostgreSQL
async fn pg_lock_timeout_is_transient() {
    let ledger = pg_ledger().await;
    let a = ledger.create_account(random_owner(), 100, Currency::usd()).await.unwrap();

    let mut holder = ledger.store().begin().await.unwrap();
    holder.get_account_for_update(a.id).await.unwrap();

    let mut waiter = ledger.store().begin().await.unwrap();
    let err = waiter.add_account_balance(a.id, 1).await.unwrap_err();
    assert!(err.is_retryable(), "{err}");

    holder.rollback().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore] // Requires PostgreSQL
async fn pg_opposite_transfers_never_deadlock() {
    let ledger = Arc::new(pg_ledger().await);
    let a = ledger.create_account(random_owner(), 1000, Currency::usd()).await.unwrap();
    let b = ledger.create_account(random_owner(), 1000, Currency::usd()).await.unwrap();

    let mut handles = Vec::new();
    for i in 0..20 {
        let ledger = ledger.clone();
        let (from, to) = if i % 2 == 0 { (a.id, b.id) } else { (b.id, a.id) };
        handles.push(tokio::spawn(async move {
            ledger.execute_transfer(from, to, 10, None).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    assert_eq!(ledger.get_account(a.id).await.unwrap().balance, 1000);
    assert_eq!(ledger.get_account(b.id).await.unwrap().balance, 1000);
    assert_eq!(
        ledger.list_transfers_involving(a.id, 100, 0).await.unwrap().len(),
        20
    );
}
