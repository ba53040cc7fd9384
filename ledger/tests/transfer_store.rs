mod common;

use common::{create_random_account, random_money};
use simplebank_ledger::{
    Account, AccountId, LedgerError, MemoryStore, Page, Store, Transfer, TransferId,
    TransferStore, UnitOfWork,
};

async fn create_random_transfer(store: &MemoryStore, from: &Account, to: &Account) -> Transfer {
    let amount = random_money() + 1;

    let mut unit = store.begin().await.unwrap();
    let transfer = unit.create_transfer(from.id, to.id, amount).await.unwrap();
    unit.commit().await.unwrap();

    assert_eq!(transfer.from_account_id, from.id);
    assert_eq!(transfer.to_account_id, to.id);
    assert_eq!(transfer.amount, amount);
    assert!(transfer.id.get() > 0);
    transfer
}

#[tokio::test]
async fn create_transfer() {
    let store = MemoryStore::default();
    let from = create_random_account(&store).await;
    let to = create_random_account(&store).await;

    create_random_transfer(&store, &from, &to).await;
}

#[tokio::test]
async fn create_transfer_rejects_bad_input() {
    let store = MemoryStore::default();
    let from = create_random_account(&store).await;
    let to = create_random_account(&store).await;

    let mut unit = store.begin().await.unwrap();
    for (a, b, amount) in [(from.id, from.id, 10), (from.id, to.id, 0), (from.id, to.id, -5)] {
        assert!(matches!(
            unit.create_transfer(a, b, amount).await,
            Err(LedgerError::InvalidArgument(_))
        ));
    }
    assert_eq!(
        unit.create_transfer(from.id, AccountId::new(99), 10)
            .await
            .unwrap_err(),
        LedgerError::AccountNotFound(AccountId::new(99))
    );
}

#[tokio::test]
async fn get_transfer() {
    let store = MemoryStore::default();
    let from = create_random_account(&store).await;
    let to = create_random_account(&store).await;
    let created = create_random_transfer(&store, &from, &to).await;

    let mut unit = store.begin().await.unwrap();
    assert_eq!(unit.get_transfer(created.id).await.unwrap(), created);
    assert_eq!(
        unit.get_transfer(TransferId::new(404)).await.unwrap_err(),
        LedgerError::TransferNotFound(TransferId::new(404))
    );
}

#[tokio::test]
async fn list_transfers() {
    let store = MemoryStore::default();
    let from = create_random_account(&store).await;
    let to = create_random_account(&store).await;
    for _ in 0..10 {
        create_random_transfer(&store, &from, &to).await;
    }

    let mut unit = store.begin().await.unwrap();
    let transfers = unit.list_transfers(Page::new(5, 5).unwrap()).await.unwrap();

    assert_eq!(transfers.len(), 5);
    assert!(transfers.windows(2).all(|pair| pair[0].id < pair[1].id));
}

#[tokio::test]
async fn list_transfers_by_account() {
    let store = MemoryStore::default();
    let a = create_random_account(&store).await;
    let b = create_random_account(&store).await;
    for _ in 0..10 {
        create_random_transfer(&store, &a, &b).await;
        create_random_transfer(&store, &b, &a).await;
    }

    let mut unit = store.begin().await.unwrap();
    let sent = unit
        .list_transfers_from(a.id, Page::new(5, 5).unwrap())
        .await
        .unwrap();
    assert_eq!(sent.len(), 5);
    assert!(sent.iter().all(|t| t.from_account_id == a.id));

    let involving = unit
        .list_transfers_involving(a.id, Page::first(100).unwrap())
        .await
        .unwrap();
    assert_eq!(involving.len(), 20);
}
