//! PostgreSQL store.
//!
//! Each unit of work is one `sqlx` transaction at read committed. Row locks
//! come from `UPDATE` and `SELECT ... FOR NO KEY UPDATE`, bounded by a
//! per-transaction `lock_timeout`. Dropping a [`PgUnit`] rolls the
//! transaction back.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Executor, Postgres, Row, Transaction};
use tracing::{debug, info, instrument};

use simplebank_common::{AccountId, Currency, EntryId, LedgerError, Result, TransferId};

use crate::account::{Account, NewAccount};
use crate::config::StoreConfig;
use crate::journal::Entry;
use crate::store::{AccountStore, EntryStore, Page, Store, TransferStore, UnitOfWork};
use crate::transfer::{validate_transfer, Transfer};

const ACCOUNT_COLUMNS: &str = "id, owner, balance, currency, created_at";
const ENTRY_COLUMNS: &str = "id, account_id, amount, created_at";
const TRANSFER_COLUMNS: &str = "id, from_account_id, to_account_id, amount, created_at";

const FOREIGN_KEY_VIOLATION: &str = "23503";

/// Map a SQLSTATE to the ledger taxonomy.
pub fn classify_sqlstate(code: &str, message: &str) -> LedgerError {
    match code {
        // serialization_failure, deadlock_detected, lock_not_available
        "40001" | "40P01" | "55P03" => LedgerError::TransientConflict(format!("{code}: {message}")),
        FOREIGN_KEY_VIOLATION => LedgerError::MissingReference(message.to_string()),
        // unique_violation, check_violation, not_null_violation
        "23505" | "23514" | "23502" => LedgerError::ConstraintViolation(message.to_string()),
        _ => LedgerError::DatabaseError(format!("{code}: {message}")),
    }
}

fn db_err(err: sqlx::Error) -> LedgerError {
    match &err {
        sqlx::Error::PoolTimedOut => {
            LedgerError::TransientConflict("timed out acquiring a pooled connection".to_string())
        }
        sqlx::Error::Database(db) => match db.code() {
            Some(code) => classify_sqlstate(&code, db.message()),
            None => LedgerError::DatabaseError(db.message().to_string()),
        },
        _ => LedgerError::DatabaseError(err.to_string()),
    }
}

/// Name of the violated foreign key, if `err` is a foreign key violation.
fn violated_foreign_key(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) if db.code().as_deref() == Some(FOREIGN_KEY_VIOLATION) => {
            Some(db.constraint().unwrap_or_default().to_string())
        }
        _ => None,
    }
}

fn account_from_row(row: &PgRow) -> Result<Account> {
    let currency: String = row.try_get("currency").map_err(db_err)?;
    Ok(Account {
        id: AccountId::new(row.try_get("id").map_err(db_err)?),
        owner: row.try_get("owner").map_err(db_err)?,
        balance: row.try_get("balance").map_err(db_err)?,
        currency: Currency::parse(&currency).map_err(|_| {
            LedgerError::DatabaseError(format!("stored currency {currency:?} is malformed"))
        })?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn entry_from_row(row: &PgRow) -> Result<Entry> {
    Ok(Entry {
        id: EntryId::new(row.try_get("id").map_err(db_err)?),
        account_id: AccountId::new(row.try_get("account_id").map_err(db_err)?),
        amount: row.try_get("amount").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn transfer_from_row(row: &PgRow) -> Result<Transfer> {
    Ok(Transfer {
        id: TransferId::new(row.try_get("id").map_err(db_err)?),
        from_account_id: AccountId::new(row.try_get("from_account_id").map_err(db_err)?),
        to_account_id: AccountId::new(row.try_get("to_account_id").map_err(db_err)?),
        amount: row.try_get("amount").map_err(db_err)?,
        created_at: row.try_get("created_at").map_err(db_err)?,
    })
}

fn collect<T>(rows: Vec<PgRow>, map: fn(&PgRow) -> Result<T>) -> Result<Vec<T>> {
    rows.iter().map(map).collect()
}

/// PostgreSQL-backed [`Store`].
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
    lock_timeout: Duration,
}

impl PgStore {
    /// DDL for the three ledger tables. Idempotent.
    pub const SCHEMA: &'static str = include_str!("../../schema.sql");

    /// Open a connection pool.
    #[instrument(skip(config), fields(max_connections = config.max_connections))]
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(config.acquire_timeout)
            .connect(&config.database_url)
            .await
            .map_err(db_err)?;

        info!(
            max_connections = config.max_connections,
            "PostgreSQL connection pool established"
        );
        Ok(Self::from_pool(pool, config.lock_timeout))
    }

    pub fn from_pool(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Create the ledger tables if they are missing.
    pub async fn apply_schema(&self) -> Result<()> {
        self.pool.execute(Self::SCHEMA).await.map_err(db_err)?;
        Ok(())
    }
}

#[async_trait]
impl Store for PgStore {
    type Unit = PgUnit;

    #[instrument(level = "debug", skip(self))]
    async fn begin(&self) -> Result<PgUnit> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        sqlx::query("SELECT set_config('lock_timeout', $1, true)")
            .bind(format!("{}ms", self.lock_timeout.as_millis()))
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        Ok(PgUnit { tx })
    }
}

/// A unit of work backed by one PostgreSQL transaction.
pub struct PgUnit {
    tx: Transaction<'static, Postgres>,
}

#[async_trait]
impl AccountStore for PgUnit {
    async fn create_account(&mut self, account: NewAccount) -> Result<Account> {
        let row = sqlx::query(&format!(
            "INSERT INTO accounts (owner, balance, currency) VALUES ($1, $2, $3) \
             RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(&account.owner)
        .bind(account.balance)
        .bind(account.currency.code())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err)?;
        account_from_row(&row)
    }

    async fn get_account(&mut self, id: AccountId) -> Result<Account> {
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1"
        ))
        .bind(id.get())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?
        .ok_or(LedgerError::AccountNotFound(id))?;
        account_from_row(&row)
    }

    async fn get_account_for_update(&mut self, id: AccountId) -> Result<Account> {
        // NO KEY UPDATE leaves the row's key lockable, so concurrent entry and
        // transfer inserts referencing the account do not block on us.
        let row = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1 FOR NO KEY UPDATE"
        ))
        .bind(id.get())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?
        .ok_or(LedgerError::AccountNotFound(id))?;
        debug!(account_id = %id, "Row lock acquired");
        account_from_row(&row)
    }

    async fn update_account_balance(&mut self, id: AccountId, balance: i64) -> Result<Account> {
        let row = sqlx::query(&format!(
            "UPDATE accounts SET balance = $2 WHERE id = $1 RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(id.get())
        .bind(balance)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?
        .ok_or(LedgerError::AccountNotFound(id))?;
        account_from_row(&row)
    }

    async fn add_account_balance(&mut self, id: AccountId, delta: i64) -> Result<Account> {
        let row = sqlx::query(&format!(
            "UPDATE accounts SET balance = balance + $2 WHERE id = $1 RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(id.get())
        .bind(delta)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?
        .ok_or(LedgerError::AccountNotFound(id))?;
        account_from_row(&row)
    }

    async fn delete_account(&mut self, id: AccountId) -> Result<()> {
        let result = sqlx::query("DELETE FROM accounts WHERE id = $1")
            .bind(id.get())
            .execute(&mut *self.tx)
            .await
            .map_err(|err| match violated_foreign_key(&err) {
                Some(constraint) => LedgerError::ConstraintViolation(format!(
                    "account {id} is still referenced ({constraint})"
                )),
                None => db_err(err),
            })?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::AccountNotFound(id));
        }
        Ok(())
    }

    async fn list_accounts(&mut self, page: Page) -> Result<Vec<Account>> {
        let rows = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts ORDER BY id LIMIT $1 OFFSET $2"
        ))
        .bind(i64::from(page.limit()))
        .bind(i64::from(page.offset()))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?;
        collect(rows, account_from_row)
    }
}

#[async_trait]
impl EntryStore for PgUnit {
    async fn create_entry(&mut self, account_id: AccountId, amount: i64) -> Result<Entry> {
        let row = sqlx::query(&format!(
            "INSERT INTO entries (account_id, amount) VALUES ($1, $2) RETURNING {ENTRY_COLUMNS}"
        ))
        .bind(account_id.get())
        .bind(amount)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|err| match violated_foreign_key(&err) {
            Some(_) => LedgerError::AccountNotFound(account_id),
            None => db_err(err),
        })?;
        entry_from_row(&row)
    }

    async fn get_entry(&mut self, id: EntryId) -> Result<Entry> {
        let row = sqlx::query(&format!("SELECT {ENTRY_COLUMNS} FROM entries WHERE id = $1"))
            .bind(id.get())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_err)?
            .ok_or(LedgerError::EntryNotFound(id))?;
        entry_from_row(&row)
    }

    async fn delete_entry(&mut self, id: EntryId) -> Result<()> {
        let result = sqlx::query("DELETE FROM entries WHERE id = $1")
            .bind(id.get())
            .execute(&mut *self.tx)
            .await
            .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::EntryNotFound(id));
        }
        Ok(())
    }

    async fn list_entries(&mut self, page: Page) -> Result<Vec<Entry>> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries ORDER BY id LIMIT $1 OFFSET $2"
        ))
        .bind(i64::from(page.limit()))
        .bind(i64::from(page.offset()))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?;
        collect(rows, entry_from_row)
    }

    async fn list_entries_for_account(
        &mut self,
        account_id: AccountId,
        page: Page,
    ) -> Result<Vec<Entry>> {
        let rows = sqlx::query(&format!(
            "SELECT {ENTRY_COLUMNS} FROM entries WHERE account_id = $1 \
             ORDER BY id LIMIT $2 OFFSET $3"
        ))
        .bind(account_id.get())
        .bind(i64::from(page.limit()))
        .bind(i64::from(page.offset()))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?;
        collect(rows, entry_from_row)
    }
}

#[async_trait]
impl TransferStore for PgUnit {
    async fn create_transfer(
        &mut self,
        from_account_id: AccountId,
        to_account_id: AccountId,
        amount: i64,
    ) -> Result<Transfer> {
        validate_transfer(from_account_id, to_account_id, amount)?;

        let row = sqlx::query(&format!(
            "INSERT INTO transfers (from_account_id, to_account_id, amount) VALUES ($1, $2, $3) \
             RETURNING {TRANSFER_COLUMNS}"
        ))
        .bind(from_account_id.get())
        .bind(to_account_id.get())
        .bind(amount)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|err| match violated_foreign_key(&err) {
            Some(constraint) if constraint.contains("to_account") => {
                LedgerError::AccountNotFound(to_account_id)
            }
            Some(_) => LedgerError::AccountNotFound(from_account_id),
            None => db_err(err),
        })?;
        transfer_from_row(&row)
    }

    async fn get_transfer(&mut self, id: TransferId) -> Result<Transfer> {
        let row = sqlx::query(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers WHERE id = $1"
        ))
        .bind(id.get())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_err)?
        .ok_or(LedgerError::TransferNotFound(id))?;
        transfer_from_row(&row)
    }

    async fn list_transfers(&mut self, page: Page) -> Result<Vec<Transfer>> {
        let rows = sqlx::query(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers ORDER BY id LIMIT $1 OFFSET $2"
        ))
        .bind(i64::from(page.limit()))
        .bind(i64::from(page.offset()))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?;
        collect(rows, transfer_from_row)
    }

    async fn list_transfers_from(
        &mut self,
        from_account_id: AccountId,
        page: Page,
    ) -> Result<Vec<Transfer>> {
        let rows = sqlx::query(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers WHERE from_account_id = $1 \
             ORDER BY id LIMIT $2 OFFSET $3"
        ))
        .bind(from_account_id.get())
        .bind(i64::from(page.limit()))
        .bind(i64::from(page.offset()))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?;
        collect(rows, transfer_from_row)
    }

    async fn list_transfers_involving(
        &mut self,
        account_id: AccountId,
        page: Page,
    ) -> Result<Vec<Transfer>> {
        let rows = sqlx::query(&format!(
            "SELECT {TRANSFER_COLUMNS} FROM transfers \
             WHERE from_account_id = $1 OR to_account_id = $1 \
             ORDER BY id LIMIT $2 OFFSET $3"
        ))
        .bind(account_id.get())
        .bind(i64::from(page.limit()))
        .bind(i64::from(page.offset()))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?;
        collect(rows, transfer_from_row)
    }
}

#[async_trait]
impl UnitOfWork for PgUnit {
    async fn commit(self) -> Result<()> {
        self.tx.commit().await.map_err(db_err)
    }

    async fn rollback(self) -> Result<()> {
        self.tx.rollback().await.map_err(db_err)
    }
}
