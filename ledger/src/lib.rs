//! SimpleBank Ledger
//!
//! Accounts, journal entries and transfers behind a pluggable store, with an
//! engine that moves money between two accounts in one atomic unit of work.

pub mod account;
pub mod balance;
pub mod config;
pub mod engine;
pub mod journal;
pub mod metrics;
pub mod retry;
pub mod service;
pub mod store;
pub mod transfer;

pub use account::{ensure_same_currency, Account, NewAccount};
pub use balance::{BalanceMutator, OverdraftPolicy};
pub use config::{LedgerConfig, RetryConfig, StoreConfig};
pub use engine::{lock_order, TransferEngine};
pub use journal::{Entry, EntryType};
pub use metrics::{ActiveTransfer, Metrics, MetricsSnapshot, RetryCounters, SharedMetrics};
pub use retry::RetryPolicy;
pub use service::Ledger;
pub use store::{
    AccountStore, EntryStore, MemoryStore, MemoryUnit, Page, PgStore, PgUnit, Store,
    TransferStore, UnitOfWork,
};
pub use transfer::{
    validate_transfer, AdjustmentRequest, AdjustmentResult, Transfer, TransferRequest,
    TransferResult,
};

pub use simplebank_common::{
    AccountId, Currency, Deadline, EntryId, ErrorKind, LedgerError, RequestId, Result, TransferId,
};
