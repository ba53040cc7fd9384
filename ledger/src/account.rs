//! Account records.

use serde::{Deserialize, Serialize};

use simplebank_common::{AccountId, Currency, LedgerError, Result, Timestamp};

/// A ledger account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Store-assigned identifier.
    pub id: AccountId,
    /// Account owner.
    pub owner: String,
    /// Current balance in minor units.
    pub balance: i64,
    /// Account currency.
    pub currency: Currency,
    /// When the account was created.
    pub created_at: Timestamp,
}

/// Parameters for opening an account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewAccount {
    pub owner: String,
    pub balance: i64,
    pub currency: Currency,
}

impl NewAccount {
    /// Build and validate account parameters.
    pub fn new(owner: impl Into<String>, balance: i64, currency: Currency) -> Result<Self> {
        let owner = owner.into();
        if owner.trim().is_empty() {
            return Err(LedgerError::InvalidArgument(
                "account owner cannot be empty".to_string(),
            ));
        }

        Ok(Self {
            owner,
            balance,
            currency,
        })
    }

    /// Materialise the row once the store has assigned an id.
    pub(crate) fn into_account(self, id: AccountId, created_at: Timestamp) -> Account {
        Account {
            id,
            owner: self.owner,
            balance: self.balance,
            currency: self.currency,
            created_at,
        }
    }
}

/// Fail unless both accounts hold the same currency. No conversion happens.
pub fn ensure_same_currency(from: &Account, to: &Account) -> Result<()> {
    if from.currency == to.currency {
        return Ok(());
    }
    Err(LedgerError::CurrencyMismatch {
        from_account: from.id,
        from_currency: from.currency.to_string(),
        to_account: to.id,
        to_currency: to.currency.to_string(),
    })
}
