//! Fixtures shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use rand::distributions::Alphanumeric;
use rand::Rng;

use simplebank_ledger::{
    Account, AccountStore, Currency, Ledger, LedgerConfig, MemoryStore, NewAccount, Store,
    UnitOfWork,
};

pub fn random_owner() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

pub fn random_money() -> i64 {
    rand::thread_rng().gen_range(0..=1000)
}

pub fn random_currency() -> Currency {
    match rand::thread_rng().gen_range(0..3) {
        0 => Currency::usd(),
        1 => Currency::eur(),
        _ => Currency::cad(),
    }
}

/// Commit a random account straight through the store.
pub async fn create_random_account(store: &MemoryStore) -> Account {
    let params = NewAccount::new(random_owner(), random_money(), random_currency()).unwrap();
    let mut unit = store.begin().await.unwrap();
    let account = unit.create_account(params.clone()).await.unwrap();
    unit.commit().await.unwrap();

    assert_eq!(account.owner, params.owner);
    assert_eq!(account.balance, params.balance);
    assert_eq!(account.currency, params.currency);
    assert!(account.id.get() > 0);
    account
}

/// Config with short retry sleeps so contention tests stay quick.
pub fn fast_config() -> LedgerConfig {
    let mut config = LedgerConfig::default();
    config.store.lock_timeout = Duration::from_millis(200);
    config.retry.base_delay = Duration::from_millis(1);
    config.retry.max_delay = Duration::from_millis(20);
    config.retry.max_attempts = 20;
    config
}

pub fn memory_ledger(config: LedgerConfig) -> (Arc<MemoryStore>, Ledger<MemoryStore>) {
    let store = Arc::new(MemoryStore::from_config(&config.store));
    let ledger = Ledger::new(store.clone(), config).unwrap();
    (store, ledger)
}
