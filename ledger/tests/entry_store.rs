mod common;

use common::{create_random_account, random_money};
use simplebank_ledger::{
    Account, AccountId, AccountStore, Entry, EntryId, EntryStore, LedgerError, MemoryStore, Page,
    Store, UnitOfWork,
};

async fn create_random_entry(store: &MemoryStore) -> (Account, Entry) {
    let account = create_random_account(store).await;
    let amount = random_money() + 1;

    let mut unit = store.begin().await.unwrap();
    let entry = unit.create_entry(account.id, amount).await.unwrap();
    let updated = unit.add_account_balance(account.id, amount).await.unwrap();
    unit.commit().await.unwrap();

    assert_eq!(entry.account_id, account.id);
    assert_eq!(entry.amount, amount);
    assert!(entry.id.get() > 0);
    assert_eq!(updated.balance, account.balance + amount);
    (updated, entry)
}

#[tokio::test]
async fn create_entry() {
    let store = MemoryStore::default();
    create_random_entry(&store).await;
}

#[tokio::test]
async fn create_entry_for_missing_account() {
    let store = MemoryStore::default();

    let mut unit = store.begin().await.unwrap();
    let err = unit.create_entry(AccountId::new(7), 10).await.unwrap_err();

    assert_eq!(err, LedgerError::AccountNotFound(AccountId::new(7)));
}

#[tokio::test]
async fn get_entry() {
    let store = MemoryStore::default();
    let (_, created) = create_random_entry(&store).await;

    let mut unit = store.begin().await.unwrap();
    let fetched = unit.get_entry(created.id).await.unwrap();

    assert_eq!(fetched, created);
}

#[tokio::test]
async fn delete_entry() {
    let store = MemoryStore::default();
    let (_, created) = create_random_entry(&store).await;

    let mut unit = store.begin().await.unwrap();
    unit.delete_entry(created.id).await.unwrap();
    unit.commit().await.unwrap();

    let mut unit = store.begin().await.unwrap();
    assert_eq!(
        unit.get_entry(created.id).await.unwrap_err(),
        LedgerError::EntryNotFound(created.id)
    );
    assert_eq!(
        unit.delete_entry(EntryId::new(999)).await.unwrap_err(),
        LedgerError::EntryNotFound(EntryId::new(999))
    );
}

#[tokio::test]
async fn list_entries() {
    let store = MemoryStore::default();
    for _ in 0..10 {
        create_random_entry(&store).await;
    }

    let mut unit = store.begin().await.unwrap();
    let entries = unit.list_entries(Page::new(5, 5).unwrap()).await.unwrap();

    assert_eq!(entries.len(), 5);
    assert!(entries.windows(2).all(|pair| pair[0].id < pair[1].id));
}

#[tokio::test]
async fn list_entries_for_account() {
    let store = MemoryStore::default();
    let account = create_random_account(&store).await;
    let other = create_random_account(&store).await;

    let mut unit = store.begin().await.unwrap();
    for amount in 1..=10 {
        unit.create_entry(account.id, amount).await.unwrap();
        unit.create_entry(other.id, -amount).await.unwrap();
    }
    unit.commit().await.unwrap();

    let mut unit = store.begin().await.unwrap();
    let entries = unit
        .list_entries_for_account(account.id, Page::new(5, 5).unwrap())
        .await
        .unwrap();

    assert_eq!(entries.len(), 5);
    assert!(entries.iter().all(|e| e.account_id == account.id));
    assert_eq!(
        entries.iter().map(|e| e.amount).collect::<Vec<_>>(),
        vec![6, 7, 8, 9, 10]
    );
}
