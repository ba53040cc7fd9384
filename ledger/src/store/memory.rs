//! In-process store with row-level locking.
//!
//! Committed rows live in ordered tables behind one `RwLock`. Each account
//! row has its own async mutex; a unit takes it on the first write (or
//! `get_account_for_update`) and keeps it until the unit ends, mirroring
//! PostgreSQL row locks under read committed. Writes are staged in the
//! unit and published in one step on commit.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use simplebank_common::{AccountId, EntryId, LedgerError, Result, TransferId};

use crate::account::{Account, NewAccount};
use crate::config::StoreConfig;
use crate::journal::Entry;
use crate::store::{AccountStore, EntryStore, Page, Store, TransferStore, UnitOfWork};
use crate::transfer::{validate_transfer, Transfer};

#[derive(Debug, Default)]
struct Tables {
    accounts: BTreeMap<AccountId, Account>,
    entries: BTreeMap<EntryId, Entry>,
    transfers: BTreeMap<TransferId, Transfer>,
}

#[derive(Debug)]
struct Shared {
    tables: RwLock<Tables>,
    row_locks: DashMap<AccountId, Arc<Mutex<()>>>,
    account_seq: AtomicI64,
    entry_seq: AtomicI64,
    transfer_seq: AtomicI64,
    lock_timeout: Duration,
    commit_faults: AtomicU32,
}

impl Shared {
    fn next_id(seq: &AtomicI64) -> i64 {
        seq.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn take_commit_fault(&self) -> bool {
        self.commit_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

/// In-memory [`Store`].
///
/// Cloning is cheap and every clone sees the same tables.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl MemoryStore {
    /// Create an empty store whose row-lock waits give up after `lock_timeout`.
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: RwLock::new(Tables::default()),
                row_locks: DashMap::new(),
                account_seq: AtomicI64::new(0),
                entry_seq: AtomicI64::new(0),
                transfer_seq: AtomicI64::new(0),
                lock_timeout,
                commit_faults: AtomicU32::new(0),
            }),
        }
    }

    pub fn from_config(config: &StoreConfig) -> Self {
        Self::new(config.lock_timeout)
    }

    /// Make the next `count` commits fail with a transient conflict.
    ///
    /// Used by the simulator's conflict scenario and by retry tests.
    pub fn inject_commit_conflicts(&self, count: u32) {
        self.shared.commit_faults.fetch_add(count, Ordering::SeqCst);
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(StoreConfig::default().lock_timeout)
    }
}

#[async_trait]
impl Store for MemoryStore {
    type Unit = MemoryUnit;

    async fn begin(&self) -> Result<MemoryUnit> {
        Ok(MemoryUnit {
            shared: self.shared.clone(),
            row_guards: HashMap::new(),
            accounts: BTreeMap::new(),
            entries: BTreeMap::new(),
            transfers: BTreeMap::new(),
            finished: false,
        })
    }
}

/// A unit of work against a [`MemoryStore`].
///
/// Staged rows map to `None` when the unit deleted them.
pub struct MemoryUnit {
    shared: Arc<Shared>,
    row_guards: HashMap<AccountId, OwnedMutexGuard<()>>,
    accounts: BTreeMap<AccountId, Option<Account>>,
    entries: BTreeMap<EntryId, Option<Entry>>,
    transfers: BTreeMap<TransferId, Transfer>,
    finished: bool,
}

impl MemoryUnit {
    async fn lock_row(&mut self, id: AccountId) -> Result<()> {
        if self.row_guards.contains_key(&id) {
            return Ok(());
        }

        let row_lock = self.shared.row_locks.entry(id).or_default().clone();
        match tokio::time::timeout(self.shared.lock_timeout, row_lock.lock_owned()).await {
            Ok(guard) => {
                debug!(account_id = %id, "Row lock acquired");
                self.row_guards.insert(id, guard);
                Ok(())
            }
            Err(_) => Err(LedgerError::TransientConflict(format!(
                "lock timeout after {:?} waiting for account {id}",
                self.shared.lock_timeout
            ))),
        }
    }

    fn visible_account(&self, id: AccountId) -> Option<Account> {
        match self.accounts.get(&id) {
            Some(staged) => staged.clone(),
            None => self.shared.tables.read().accounts.get(&id).cloned(),
        }
    }

    fn require_account(&self, id: AccountId) -> Result<Account> {
        self.visible_account(id)
            .ok_or(LedgerError::AccountNotFound(id))
    }

    fn visible_entry(&self, id: EntryId) -> Option<Entry> {
        match self.entries.get(&id) {
            Some(staged) => staged.clone(),
            None => self.shared.tables.read().entries.get(&id).cloned(),
        }
    }

    fn visible_accounts(&self) -> BTreeMap<AccountId, Account> {
        let mut merged = self.shared.tables.read().accounts.clone();
        for (id, staged) in &self.accounts {
            match staged {
                Some(account) => merged.insert(*id, account.clone()),
                None => merged.remove(id),
            };
        }
        merged
    }

    fn visible_entries(&self) -> BTreeMap<EntryId, Entry> {
        let mut merged = self.shared.tables.read().entries.clone();
        for (id, staged) in &self.entries {
            match staged {
                Some(entry) => merged.insert(*id, entry.clone()),
                None => merged.remove(id),
            };
        }
        merged
    }

    fn visible_transfers(&self) -> BTreeMap<TransferId, Transfer> {
        let mut merged = self.shared.tables.read().transfers.clone();
        merged.extend(self.transfers.iter().map(|(id, t)| (*id, t.clone())));
        merged
    }

    fn is_referenced(&self, id: AccountId) -> bool {
        self.visible_entries().values().any(|e| e.account_id == id)
            || self.visible_transfers().values().any(|t| t.involves(id))
    }

    /// Deferred foreign-key checks against the latest committed tables.
    fn check_references(&self, tables: &Tables) -> Result<()> {
        let account_exists = |id: &AccountId| match self.accounts.get(id) {
            Some(staged) => staged.is_some(),
            None => tables.accounts.contains_key(id),
        };

        for entry in self.entries.values().flatten() {
            if !account_exists(&entry.account_id) {
                return Err(LedgerError::MissingReference(format!(
                    "entry {} references deleted account {}",
                    entry.id, entry.account_id
                )));
            }
        }

        for transfer in self.transfers.values() {
            for id in [transfer.from_account_id, transfer.to_account_id] {
                if !account_exists(&id) {
                    return Err(LedgerError::MissingReference(format!(
                        "transfer {} references deleted account {id}",
                        transfer.id
                    )));
                }
            }
        }

        for (id, staged) in &self.entries {
            if staged.is_none() && !tables.entries.contains_key(id) {
                return Err(LedgerError::EntryNotFound(*id));
            }
        }

        for (id, staged) in &self.accounts {
            if staged.is_some() {
                continue;
            }
            let referenced_by_entry = tables
                .entries
                .iter()
                .filter(|(entry_id, _)| !matches!(self.entries.get(*entry_id), Some(None)))
                .map(|(_, e)| e)
                .chain(self.entries.values().flatten())
                .any(|e| e.account_id == *id);
            let referenced_by_transfer = tables
                .transfers
                .values()
                .chain(self.transfers.values())
                .any(|t| t.involves(*id));
            if referenced_by_entry || referenced_by_transfer {
                return Err(LedgerError::ConstraintViolation(format!(
                    "account {id} is still referenced by entries or transfers"
                )));
            }
        }

        Ok(())
    }

    fn publish(&mut self) -> Result<()> {
        let mut tables = self.shared.tables.write();
        self.check_references(&tables)?;

        for (id, staged) in std::mem::take(&mut self.accounts) {
            match staged {
                Some(account) => tables.accounts.insert(id, account),
                None => tables.accounts.remove(&id),
            };
        }
        for (id, staged) in std::mem::take(&mut self.entries) {
            match staged {
                Some(entry) => tables.entries.insert(id, entry),
                None => tables.entries.remove(&id),
            };
        }
        tables.transfers.append(&mut self.transfers);

        Ok(())
    }

    fn has_writes(&self) -> bool {
        !self.accounts.is_empty() || !self.entries.is_empty() || !self.transfers.is_empty()
    }
}

impl Drop for MemoryUnit {
    fn drop(&mut self) {
        if !self.finished && self.has_writes() {
            debug!(
                accounts = self.accounts.len(),
                entries = self.entries.len(),
                transfers = self.transfers.len(),
                "Unit of work dropped, discarding staged writes"
            );
        }

        // Forget row locks nobody else holds or waits on.
        for (id, guard) in self.row_guards.drain() {
            drop(guard);
            self.shared
                .row_locks
                .remove_if(&id, |_, lock| Arc::strong_count(lock) == 1);
        }
    }
}

#[async_trait]
impl AccountStore for MemoryUnit {
    async fn create_account(&mut self, account: NewAccount) -> Result<Account> {
        let id = AccountId::new(Shared::next_id(&self.shared.account_seq));
        let account = account.into_account(id, simplebank_common::now());
        self.accounts.insert(id, Some(account.clone()));
        Ok(account)
    }

    async fn get_account(&mut self, id: AccountId) -> Result<Account> {
        self.require_account(id)
    }

    async fn get_account_for_update(&mut self, id: AccountId) -> Result<Account> {
        self.lock_row(id).await?;
        self.require_account(id)
    }

    async fn update_account_balance(&mut self, id: AccountId, balance: i64) -> Result<Account> {
        self.lock_row(id).await?;
        let mut account = self.require_account(id)?;
        account.balance = balance;
        self.accounts.insert(id, Some(account.clone()));
        Ok(account)
    }

    async fn add_account_balance(&mut self, id: AccountId, delta: i64) -> Result<Account> {
        self.lock_row(id).await?;
        let mut account = self.require_account(id)?;
        account.balance = account.balance.checked_add(delta).ok_or_else(|| {
            LedgerError::ConstraintViolation(format!("balance overflow on account {id}"))
        })?;
        self.accounts.insert(id, Some(account.clone()));
        Ok(account)
    }

    async fn delete_account(&mut self, id: AccountId) -> Result<()> {
        self.lock_row(id).await?;
        self.require_account(id)?;
        if self.is_referenced(id) {
            return Err(LedgerError::ConstraintViolation(format!(
                "account {id} is still referenced by entries or transfers"
            )));
        }

        let committed = self.shared.tables.read().accounts.contains_key(&id);
        if committed {
            self.accounts.insert(id, None);
        } else {
            self.accounts.remove(&id);
        }
        Ok(())
    }

    async fn list_accounts(&mut self, page: Page) -> Result<Vec<Account>> {
        Ok(page.slice(self.visible_accounts().into_values()))
    }
}

#[async_trait]
impl EntryStore for MemoryUnit {
    async fn create_entry(&mut self, account_id: AccountId, amount: i64) -> Result<Entry> {
        self.require_account(account_id)?;

        let entry = Entry {
            id: EntryId::new(Shared::next_id(&self.shared.entry_seq)),
            account_id,
            amount,
            created_at: simplebank_common::now(),
        };
        self.entries.insert(entry.id, Some(entry.clone()));
        Ok(entry)
    }

    async fn get_entry(&mut self, id: EntryId) -> Result<Entry> {
        self.visible_entry(id).ok_or(LedgerError::EntryNotFound(id))
    }

    async fn delete_entry(&mut self, id: EntryId) -> Result<()> {
        if self.visible_entry(id).is_none() {
            return Err(LedgerError::EntryNotFound(id));
        }

        let committed = self.shared.tables.read().entries.contains_key(&id);
        if committed {
            self.entries.insert(id, None);
        } else {
            self.entries.remove(&id);
        }
        Ok(())
    }

    async fn list_entries(&mut self, page: Page) -> Result<Vec<Entry>> {
        Ok(page.slice(self.visible_entries().into_values()))
    }

    async fn list_entries_for_account(
        &mut self,
        account_id: AccountId,
        page: Page,
    ) -> Result<Vec<Entry>> {
        Ok(page.slice(
            self.visible_entries()
                .into_values()
                .filter(|e| e.account_id == account_id),
        ))
    }
}

#[async_trait]
impl TransferStore for MemoryUnit {
    async fn create_transfer(
        &mut self,
        from_account_id: AccountId,
        to_account_id: AccountId,
        amount: i64,
    ) -> Result<Transfer> {
        validate_transfer(from_account_id, to_account_id, amount)?;
        self.require_account(from_account_id)?;
        self.require_account(to_account_id)?;

        let transfer = Transfer {
            id: TransferId::new(Shared::next_id(&self.shared.transfer_seq)),
            from_account_id,
            to_account_id,
            amount,
            created_at: simplebank_common::now(),
        };
        self.transfers.insert(transfer.id, transfer.clone());
        Ok(transfer)
    }

    async fn get_transfer(&mut self, id: TransferId) -> Result<Transfer> {
        if let Some(transfer) = self.transfers.get(&id) {
            return Ok(transfer.clone());
        }
        self.shared
            .tables
            .read()
            .transfers
            .get(&id)
            .cloned()
            .ok_or(LedgerError::TransferNotFound(id))
    }

    async fn list_transfers(&mut self, page: Page) -> Result<Vec<Transfer>> {
        Ok(page.slice(self.visible_transfers().into_values()))
    }

    async fn list_transfers_from(
        &mut self,
        from_account_id: AccountId,
        page: Page,
    ) -> Result<Vec<Transfer>> {
        Ok(page.slice(
            self.visible_transfers()
                .into_values()
                .filter(|t| t.from_account_id == from_account_id),
        ))
    }

    async fn list_transfers_involving(
        &mut self,
        account_id: AccountId,
        page: Page,
    ) -> Result<Vec<Transfer>> {
        Ok(page.slice(
            self.visible_transfers()
                .into_values()
                .filter(|t| t.involves(account_id)),
        ))
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnit {
    async fn commit(mut self) -> Result<()> {
        if self.shared.take_commit_fault() {
            return Err(LedgerError::TransientConflict(
                "injected commit conflict".to_string(),
            ));
        }

        self.publish()?;
        self.finished = true;
        // Row locks release when `self` drops, after the rows are published.
        Ok(())
    }

    async fn rollback(mut self) -> Result<()> {
        self.accounts.clear();
        self.entries.clear();
        self.transfers.clear();
        self.finished = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simplebank_common::Currency;

    async fn seeded(store: &MemoryStore, balance: i64) -> Account {
        let mut unit = store.begin().await.unwrap();
        let account = unit
            .create_account(NewAccount::new("owner", balance, Currency::usd()).unwrap())
            .await
            .unwrap();
        unit.commit().await.unwrap();
        account
    }

    #[tokio::test]
    async fn test_writes_invisible_until_commit() {
        let store = MemoryStore::default();
        let account = seeded(&store, 100).await;

        let mut writer = store.begin().await.unwrap();
        writer.add_account_balance(account.id, 50).await.unwrap();

        let mut reader = store.begin().await.unwrap();
        assert_eq!(reader.get_account(account.id).await.unwrap().balance, 100);
        assert_eq!(writer.get_account(account.id).await.unwrap().balance, 150);

        writer.commit().await.unwrap();
        assert_eq!(reader.get_account(account.id).await.unwrap().balance, 150);
    }

    #[tokio::test]
    async fn test_drop_discards_writes_and_releases_lock() {
        let store = MemoryStore::new(Duration::from_millis(50));
        let account = seeded(&store, 100).await;

        {
            let mut unit = store.begin().await.unwrap();
            unit.add_account_balance(account.id, -40).await.unwrap();
            unit.create_entry(account.id, -40).await.unwrap();
        }

        let mut unit = store.begin().await.unwrap();
        let locked = unit.get_account_for_update(account.id).await.unwrap();
        assert_eq!(locked.balance, 100);
        assert!(unit.list_entries(Page::first(10).unwrap()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_row_lock_timeout_is_transient() {
        let store = MemoryStore::new(Duration::from_millis(20));
        let account = seeded(&store, 100).await;

        let mut holder = store.begin().await.unwrap();
        holder.get_account_for_update(account.id).await.unwrap();

        let mut waiter = store.begin().await.unwrap();
        let err = waiter.add_account_balance(account.id, 1).await.unwrap_err();
        assert!(err.is_retryable(), "{err}");

        holder.rollback().await.unwrap();
        assert_eq!(waiter.add_account_balance(account.id, 1).await.unwrap().balance, 101);
    }

    #[tokio::test]
    async fn test_injected_commit_conflict() {
        let store = MemoryStore::default();
        let account = seeded(&store, 10).await;
        store.inject_commit_conflicts(1);

        let mut unit = store.begin().await.unwrap();
        unit.add_account_balance(account.id, 5).await.unwrap();
        let err = unit.commit().await.unwrap_err();
        assert!(matches!(err, LedgerError::TransientConflict(_)));

        let mut unit = store.begin().await.unwrap();
        assert_eq!(unit.get_account(account.id).await.unwrap().balance, 10);
        unit.add_account_balance(account.id, 5).await.unwrap();
        unit.commit().await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_referenced_account_is_rejected() {
        let store = MemoryStore::default();
        let account = seeded(&store, 10).await;

        let mut unit = store.begin().await.unwrap();
        unit.create_entry(account.id, 10).await.unwrap();
        unit.commit().await.unwrap();

        let mut unit = store.begin().await.unwrap();
        let err = unit.delete_account(account.id).await.unwrap_err();
        assert!(matches!(err, LedgerError::ConstraintViolation(_)));
    }

    #[tokio::test]
    async fn test_entry_for_concurrently_deleted_account_fails_commit() {
        let store = MemoryStore::default();
        let account = seeded(&store, 10).await;

        let mut writer = store.begin().await.unwrap();
        writer.create_entry(account.id, 5).await.unwrap();

        let mut deleter = store.begin().await.unwrap();
        deleter.delete_account(account.id).await.unwrap();
        deleter.commit().await.unwrap();

        let err = writer.commit().await.unwrap_err();
        assert!(matches!(err, LedgerError::MissingReference(_)));
    }

    #[tokio::test]
    async fn test_ids_are_not_reused_after_rollback() {
        let store = MemoryStore::default();

        let mut unit = store.begin().await.unwrap();
        let discarded = unit
            .create_account(NewAccount::new("a", 0, Currency::usd()).unwrap())
            .await
            .unwrap();
        unit.rollback().await.unwrap();

        let kept = seeded(&store, 0).await;
        assert!(kept.id > discarded.id);
    }

    #[tokio::test]
    async fn test_admin_update_waits_for_transfer_unit() {
        let store = MemoryStore::new(Duration::from_millis(30));
        let from = seeded(&store, 100).await;
        let to = seeded(&store, 0).await;

        let mut transfer = store.begin().await.unwrap();
        transfer.create_transfer(from.id, to.id, 40).await.unwrap();
        transfer.create_entry(from.id, -40).await.unwrap();
        transfer.add_account_balance(from.id, -40).await.unwrap();

        let mut admin = store.begin().await.unwrap();
        let err = admin.update_account_balance(from.id, 500).await.unwrap_err();
        assert!(err.is_retryable(), "{err}");

        transfer.commit().await.unwrap();
        let updated = admin.update_account_balance(from.id, 500).await.unwrap();
        assert_eq!(updated.balance, 500);
    }

    #[tokio::test]
    async fn test_row_locks_are_forgotten_when_units_end() {
        let store = MemoryStore::default();
        let account = seeded(&store, 100).await;

        let mut unit = store.begin().await.unwrap();
        unit.add_account_balance(account.id, 5).await.unwrap();
        assert_eq!(store.shared.row_locks.len(), 1);
        unit.commit().await.unwrap();
        assert!(store.shared.row_locks.is_empty());

        let mut unit = store.begin().await.unwrap();
        unit.delete_account(account.id).await.unwrap();
        unit.commit().await.unwrap();
        assert!(store.shared.row_locks.is_empty());
    }

    #[tokio::test]
    async fn test_row_lock_kept_while_another_unit_waits() {
        let store = MemoryStore::new(Duration::from_secs(5));
        let account = seeded(&store, 100).await;

        let mut holder = store.begin().await.unwrap();
        holder.add_account_balance(account.id, 10).await.unwrap();

        let waiter_store = store.clone();
        let waiter = tokio::spawn(async move {
            let mut unit = waiter_store.begin().await.unwrap();
            let account = unit.add_account_balance(account.id, 1).await.unwrap();
            unit.commit().await.unwrap();
            account.balance
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        holder.commit().await.unwrap();
        assert_eq!(waiter.await.unwrap(), 111);
        assert!(store.shared.row_locks.is_empty());
    }
}
