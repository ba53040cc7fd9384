//! Storage seam.
//!
//! A [`Store`] hands out [`UnitOfWork`]s. Every read and write goes through a
//! unit; nothing is visible to other units until [`UnitOfWork::commit`].
//! Dropping a unit without committing rolls it back, so early returns and
//! cancelled futures never leave partial writes behind.

use async_trait::async_trait;

use simplebank_common::{AccountId, EntryId, LedgerError, Result, TransferId};

use crate::account::{Account, NewAccount};
use crate::journal::Entry;
use crate::transfer::Transfer;

pub mod memory;
pub mod postgres;

pub use memory::{MemoryStore, MemoryUnit};
pub use postgres::{PgStore, PgUnit};

/// Largest page a list call may request.
pub const MAX_PAGE_SIZE: u32 = 1000;

/// Limit/offset pagination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    limit: u32,
    offset: u32,
}

impl Page {
    /// Validate a page request.
    pub fn new(limit: u32, offset: u32) -> Result<Self> {
        if limit == 0 || limit > MAX_PAGE_SIZE {
            return Err(LedgerError::InvalidArgument(format!(
                "page limit must be between 1 and {MAX_PAGE_SIZE}, got {limit}"
            )));
        }
        Ok(Self { limit, offset })
    }

    /// First page of `limit` rows.
    pub fn first(limit: u32) -> Result<Self> {
        Self::new(limit, 0)
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Apply this page to an already ordered iterator.
    pub fn slice<T>(&self, rows: impl Iterator<Item = T>) -> Vec<T> {
        rows.skip(self.offset as usize)
            .take(self.limit as usize)
            .collect()
    }
}

/// CRUD over account rows.
#[async_trait]
pub trait AccountStore: Send {
    async fn create_account(&mut self, account: NewAccount) -> Result<Account>;

    async fn get_account(&mut self, id: AccountId) -> Result<Account>;

    /// Read an account and hold its row lock until the unit ends.
    async fn get_account_for_update(&mut self, id: AccountId) -> Result<Account>;

    /// Overwrite the balance under the row lock.
    async fn update_account_balance(&mut self, id: AccountId, balance: i64) -> Result<Account>;

    /// Apply `balance = balance + delta` as one step under the row lock.
    async fn add_account_balance(&mut self, id: AccountId, delta: i64) -> Result<Account>;

    /// Fails with a constraint violation while entries or transfers reference the account.
    async fn delete_account(&mut self, id: AccountId) -> Result<()>;

    /// Accounts ordered by id.
    async fn list_accounts(&mut self, page: Page) -> Result<Vec<Account>>;
}

/// Append-only access to journal entries.
#[async_trait]
pub trait EntryStore: Send {
    /// Fails with not-found when the account does not exist.
    async fn create_entry(&mut self, account_id: AccountId, amount: i64) -> Result<Entry>;

    async fn get_entry(&mut self, id: EntryId) -> Result<Entry>;

    /// Compensation only.
    async fn delete_entry(&mut self, id: EntryId) -> Result<()>;

    async fn list_entries(&mut self, page: Page) -> Result<Vec<Entry>>;

    async fn list_entries_for_account(
        &mut self,
        account_id: AccountId,
        page: Page,
    ) -> Result<Vec<Entry>>;
}

/// Access to transfer records.
#[async_trait]
pub trait TransferStore: Send {
    /// Validates the amount and the distinct accounts before writing.
    async fn create_transfer(
        &mut self,
        from_account_id: AccountId,
        to_account_id: AccountId,
        amount: i64,
    ) -> Result<Transfer>;

    async fn get_transfer(&mut self, id: TransferId) -> Result<Transfer>;

    async fn list_transfers(&mut self, page: Page) -> Result<Vec<Transfer>>;

    /// Transfers sent from the account.
    async fn list_transfers_from(
        &mut self,
        from_account_id: AccountId,
        page: Page,
    ) -> Result<Vec<Transfer>>;

    /// Transfers where the account is either side.
    async fn list_transfers_involving(
        &mut self,
        account_id: AccountId,
        page: Page,
    ) -> Result<Vec<Transfer>>;
}

/// One atomic unit of work spanning all three stores.
#[async_trait]
pub trait UnitOfWork: AccountStore + EntryStore + TransferStore + Send + Sized {
    /// Publish every write made through this unit and release its row locks.
    async fn commit(self) -> Result<()>;

    /// Discard every write. Dropping the unit has the same effect.
    async fn rollback(self) -> Result<()>;
}

/// A backing store able to open units of work.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    type Unit: UnitOfWork + 'static;

    async fn begin(&self) -> Result<Self::Unit>;
}
