//! The ledger facade: transfers plus the CRUD read paths.

use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::{info, instrument};

use simplebank_common::{AccountId, Currency, Deadline, EntryId, Result, TransferId};

use crate::account::{Account, NewAccount};
use crate::config::LedgerConfig;
use crate::engine::TransferEngine;
use crate::journal::Entry;
use crate::metrics::{Metrics, SharedMetrics};
use crate::store::{
    AccountStore, EntryStore, MemoryStore, Page, PgStore, Store, TransferStore, UnitOfWork,
};
use crate::transfer::{
    AdjustmentRequest, AdjustmentResult, Transfer, TransferRequest, TransferResult,
};

/// Entry point for callers of the ledger.
///
/// Every call runs in its own unit of work. Reads roll their unit back,
/// writes commit it. Transfers and adjustments go through the
/// [`TransferEngine`] and get its retry and deadline handling; the plain CRUD
/// writes surface a `TransientConflict` to the caller instead.
pub struct Ledger<S: Store> {
    store: Arc<S>,
    engine: TransferEngine<S>,
    config: LedgerConfig,
}

impl Ledger<MemoryStore> {
    /// A ledger over a fresh in-memory store.
    pub fn in_memory(config: LedgerConfig) -> Result<Self> {
        let store = MemoryStore::from_config(&config.store);
        Self::new(Arc::new(store), config)
    }
}

impl Ledger<PgStore> {
    /// A ledger over PostgreSQL at `config.store.database_url`.
    pub async fn connect(config: LedgerConfig) -> Result<Self> {
        let store = PgStore::connect(&config.store).await?;
        Self::new(Arc::new(store), config)
    }
}

impl<S: Store> Ledger<S> {
    pub fn new(store: Arc<S>, config: LedgerConfig) -> Result<Self> {
        config.validate()?;
        let metrics: SharedMetrics = Arc::new(Metrics::new());
        let engine = TransferEngine::new(store.clone(), &config, metrics);

        info!(
            overdraft = %config.overdraft,
            max_attempts = config.retry.max_attempts,
            transfer_timeout_ms = config.transfer_timeout.map(|t| t.as_millis() as u64),
            "Ledger initialised"
        );
        Ok(Self {
            store,
            engine,
            config,
        })
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn engine(&self) -> &TransferEngine<S> {
        &self.engine
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        self.engine.metrics()
    }

    // Transfers

    /// Move `amount` from `from` to `to` atomically.
    pub async fn execute_transfer(
        &self,
        from: AccountId,
        to: AccountId,
        amount: i64,
        deadline: Option<Deadline>,
    ) -> Result<TransferResult> {
        let request = TransferRequest::new(from, to, amount);
        let request = match deadline {
            Some(deadline) => request.with_deadline(deadline),
            None => request,
        };
        self.engine.execute(request).await
    }

    pub async fn execute(&self, request: TransferRequest) -> Result<TransferResult> {
        self.engine.execute(request).await
    }

    /// Credit (positive) or debit (negative) one account with a matching entry.
    pub async fn adjust_balance(&self, request: AdjustmentRequest) -> Result<AdjustmentResult> {
        self.engine.adjust_balance(request).await
    }

    // Accounts

    #[instrument(skip(self, owner, currency))]
    pub async fn create_account(
        &self,
        owner: impl Into<String>,
        initial_balance: i64,
        currency: Currency,
    ) -> Result<Account> {
        let account = NewAccount::new(owner, initial_balance, currency)?;
        let created = self
            .write(move |unit| unit.create_account(account))
            .await?;
        info!(account_id = %created.id, currency = %created.currency, "Account created");
        Ok(created)
    }

    pub async fn get_account(&self, id: AccountId) -> Result<Account> {
        self.read(move |unit| unit.get_account(id)).await
    }

    /// Overwrite a balance without writing an entry. Administrative only.
    #[instrument(skip(self))]
    pub async fn update_account_balance(&self, id: AccountId, balance: i64) -> Result<Account> {
        self.write(move |unit| unit.update_account_balance(id, balance))
            .await
    }

    #[instrument(skip(self))]
    pub async fn delete_account(&self, id: AccountId) -> Result<()> {
        self.write(move |unit| unit.delete_account(id)).await
    }

    pub async fn list_accounts(&self, limit: u32, offset: u32) -> Result<Vec<Account>> {
        let page = Page::new(limit, offset)?;
        self.read(move |unit| unit.list_accounts(page)).await
    }

    // Entries

    pub async fn get_entry(&self, id: EntryId) -> Result<Entry> {
        self.read(move |unit| unit.get_entry(id)).await
    }

    /// Remove an entry as compensation. Balances are not touched.
    #[instrument(skip(self))]
    pub async fn delete_entry(&self, id: EntryId) -> Result<()> {
        self.write(move |unit| unit.delete_entry(id)).await
    }

    pub async fn list_entries(&self, limit: u32, offset: u32) -> Result<Vec<Entry>> {
        let page = Page::new(limit, offset)?;
        self.read(move |unit| unit.list_entries(page)).await
    }

    pub async fn list_account_entries(
        &self,
        account_id: AccountId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Entry>> {
        let page = Page::new(limit, offset)?;
        self.read(move |unit| unit.list_entries_for_account(account_id, page))
            .await
    }

    // Transfer records

    pub async fn get_transfer(&self, id: TransferId) -> Result<Transfer> {
        self.read(move |unit| unit.get_transfer(id)).await
    }

    pub async fn list_transfers(&self, limit: u32, offset: u32) -> Result<Vec<Transfer>> {
        let page = Page::new(limit, offset)?;
        self.read(move |unit| unit.list_transfers(page)).await
    }

    /// Transfers sent from `from_account_id`.
    pub async fn list_account_transfers(
        &self,
        from_account_id: AccountId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Transfer>> {
        let page = Page::new(limit, offset)?;
        self.read(move |unit| unit.list_transfers_from(from_account_id, page))
            .await
    }

    pub async fn list_transfers_involving(
        &self,
        account_id: AccountId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<Transfer>> {
        let page = Page::new(limit, offset)?;
        self.read(move |unit| unit.list_transfers_involving(account_id, page))
            .await
    }

    async fn read<T, F>(&self, op: F) -> Result<T>
    where
        F: for<'u> FnOnce(&'u mut S::Unit) -> BoxFuture<'u, Result<T>>,
    {
        let mut unit = self.store.begin().await?;
        let value = op(&mut unit).await?;
        unit.rollback().await?;
        Ok(value)
    }

    async fn write<T, F>(&self, op: F) -> Result<T>
    where
        F: for<'u> FnOnce(&'u mut S::Unit) -> BoxFuture<'u, Result<T>>,
    {
        let mut unit = self.store.begin().await?;
        let value = op(&mut unit).await?;
        unit.commit().await?;
        Ok(value)
    }
}

impl<S: Store> std::fmt::Debug for Ledger<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ledger")
            .field("overdraft", &self.config.overdraft)
            .field("retry", &self.config.retry)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use simplebank_common::LedgerError;

    fn ledger() -> Ledger<MemoryStore> {
        Ledger::in_memory(LedgerConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_execute_transfer_example() {
        let ledger = ledger();
        let a = ledger.create_account("alice", 1000, Currency::usd()).await.unwrap();
        let b = ledger.create_account("bob", 500, Currency::usd()).await.unwrap();

        let result = ledger.execute_transfer(a.id, b.id, 300, None).await.unwrap();

        assert_eq!(result.from_account.balance, 700);
        assert_eq!(result.to_account.balance, 800);
        assert_eq!(result.from_entry.amount, -300);
        assert_eq!(result.to_entry.amount, 300);
        assert_eq!(ledger.get_account(a.id).await.unwrap().balance, 700);
        assert_eq!(ledger.get_account(b.id).await.unwrap().balance, 800);
    }

    #[tokio::test]
    async fn test_rejects_invalid_config() {
        let mut config = LedgerConfig::default();
        config.retry.max_attempts = 0;
        assert!(matches!(
            Ledger::in_memory(config),
            Err(LedgerError::ConfigurationError(_))
        ));
    }

    #[tokio::test]
    async fn test_bad_page_is_invalid_argument() {
        let ledger = ledger();
        assert!(matches!(
            ledger.list_accounts(0, 0).await,
            Err(LedgerError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn test_currency_mismatch_is_rejected() {
        let ledger = ledger();
        let usd = ledger.create_account("alice", 100, Currency::usd()).await.unwrap();
        let eur = ledger.create_account("bob", 100, Currency::eur()).await.unwrap();

        let err = ledger.execute_transfer(usd.id, eur.id, 10, None).await.unwrap_err();
        assert!(matches!(err, LedgerError::CurrencyMismatch { .. }));
        assert!(ledger.list_transfers(10, 0).await.unwrap().is_empty());
    }
}
