//! Error types for ledger operations.

use crate::{AccountId, EntryId, TransferId};
use thiserror::Error;

/// Coarse classification of a [`LedgerError`].
///
/// The transfer engine decides retry versus abort from the kind alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed input, rejected before touching the store.
    InvalidArgument,
    /// A referenced row does not exist.
    NotFound,
    /// The balance policy forbids the mutation.
    InsufficientFunds,
    /// The store asked us to try again (lock timeout, deadlock, serialization failure).
    TransientConflict,
    /// Transient conflicts persisted through every retry.
    Conflict,
    /// The caller's deadline passed.
    Timeout,
    /// Anything else the store reported.
    Fatal,
}

/// Main error type for ledger operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LedgerError {
    /// Malformed request.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Transfer between accounts held in different currencies.
    #[error("Currency mismatch: account {from_account} is {from_currency}, account {to_account} is {to_currency}")]
    CurrencyMismatch {
        from_account: AccountId,
        from_currency: String,
        to_account: AccountId,
        to_currency: String,
    },

    /// Account not found.
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    /// Entry not found.
    #[error("Entry not found: {0}")]
    EntryNotFound(EntryId),

    /// Transfer not found.
    #[error("Transfer not found: {0}")]
    TransferNotFound(TransferId),

    /// A foreign key pointed at a missing row.
    #[error("Referenced row not found: {0}")]
    MissingReference(String),

    /// Applying the change would overdraw the account.
    #[error("Insufficient funds in account {account_id}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        account_id: AccountId,
        balance: i64,
        requested: i64,
    },

    /// Retryable store conflict.
    #[error("Transient conflict: {0}")]
    TransientConflict(String),

    /// Retry budget exhausted.
    #[error("Conflict persisted after {attempts} attempts: {last_error}")]
    Conflict { attempts: u32, last_error: String },

    /// Deadline exceeded.
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// A store constraint rejected the write.
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Database error.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

impl LedgerError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            LedgerError::InvalidArgument(_) | LedgerError::CurrencyMismatch { .. } => {
                ErrorKind::InvalidArgument
            }
            LedgerError::AccountNotFound(_)
            | LedgerError::EntryNotFound(_)
            | LedgerError::TransferNotFound(_)
            | LedgerError::MissingReference(_) => ErrorKind::NotFound,
            LedgerError::InsufficientFunds { .. } => ErrorKind::InsufficientFunds,
            LedgerError::TransientConflict(_) => ErrorKind::TransientConflict,
            LedgerError::Conflict { .. } => ErrorKind::Conflict,
            LedgerError::Timeout(_) => ErrorKind::Timeout,
            LedgerError::ConstraintViolation(_)
            | LedgerError::DatabaseError(_)
            | LedgerError::ConfigurationError(_) => ErrorKind::Fatal,
        }
    }

    /// Check if the engine may retry the unit of work after this error.
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::TransientConflict
    }

    /// Get a stable error code for an API layer.
    pub fn error_code(&self) -> &'static str {
        match self {
            LedgerError::InvalidArgument(_) => "INVALID_ARGUMENT",
            LedgerError::CurrencyMismatch { .. } => "CURRENCY_MISMATCH",
            LedgerError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            LedgerError::EntryNotFound(_) => "ENTRY_NOT_FOUND",
            LedgerError::TransferNotFound(_) => "TRANSFER_NOT_FOUND",
            LedgerError::MissingReference(_) => "MISSING_REFERENCE",
            LedgerError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            LedgerError::TransientConflict(_) => "TRANSIENT_CONFLICT",
            LedgerError::Conflict { .. } => "CONFLICT",
            LedgerError::Timeout(_) => "TIMEOUT",
            LedgerError::ConstraintViolation(_) => "CONSTRAINT_VIOLATION",
            LedgerError::DatabaseError(_) => "DATABASE_ERROR",
            LedgerError::ConfigurationError(_) => "CONFIGURATION_ERROR",
        }
    }
}

/// Result type alias for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;
