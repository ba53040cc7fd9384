//! Transfer records and the engine's request/result types.

use serde::{Deserialize, Serialize};

use simplebank_common::{
    AccountId, Deadline, LedgerError, RequestId, Result, Timestamp, TransferId,
};

use crate::account::Account;
use crate::journal::Entry;

/// A recorded movement of funds between two accounts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transfer {
    /// Store-assigned identifier.
    pub id: TransferId,
    /// Debited account.
    pub from_account_id: AccountId,
    /// Credited account.
    pub to_account_id: AccountId,
    /// Positive amount in minor units.
    pub amount: i64,
    /// When the transfer was recorded.
    pub created_at: Timestamp,
}

impl Transfer {
    /// Check if the account is either side of this transfer.
    pub fn involves(&self, account_id: AccountId) -> bool {
        self.from_account_id == account_id || self.to_account_id == account_id
    }
}

/// Reject same-account and non-positive transfers.
pub fn validate_transfer(from: AccountId, to: AccountId, amount: i64) -> Result<()> {
    if from == to {
        return Err(LedgerError::InvalidArgument(format!(
            "cannot transfer from account {from} to itself"
        )));
    }

    if amount <= 0 {
        return Err(LedgerError::InvalidArgument(format!(
            "transfer amount must be positive, got {amount}"
        )));
    }

    Ok(())
}

/// A request to move funds.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    /// Correlates log lines across retries.
    pub request_id: RequestId,
    pub from_account_id: AccountId,
    pub to_account_id: AccountId,
    pub amount: i64,
    /// Optional caller deadline covering every attempt.
    pub deadline: Option<Deadline>,
}

impl TransferRequest {
    pub fn new(from_account_id: AccountId, to_account_id: AccountId, amount: i64) -> Self {
        Self {
            request_id: RequestId::new(),
            from_account_id,
            to_account_id,
            amount,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Everything a committed transfer wrote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResult {
    pub transfer: Transfer,
    pub from_entry: Entry,
    pub to_entry: Entry,
    /// Source account after the debit.
    pub from_account: Account,
    /// Destination account after the credit.
    pub to_account: Account,
}

/// A single-account balance adjustment (deposit or withdrawal).
#[derive(Debug, Clone)]
pub struct AdjustmentRequest {
    pub request_id: RequestId,
    pub account_id: AccountId,
    /// Signed delta in minor units, never zero.
    pub amount: i64,
    pub deadline: Option<Deadline>,
}

impl AdjustmentRequest {
    pub fn new(account_id: AccountId, amount: i64) -> Self {
        Self {
            request_id: RequestId::new(),
            account_id,
            amount,
            deadline: None,
        }
    }

    pub fn with_deadline(mut self, deadline: Deadline) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// The entry and account snapshot written by an adjustment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustmentResult {
    pub entry: Entry,
    pub account: Account,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_transfer() {
        let a = AccountId::new(1);
        let b = AccountId::new(2);

        assert!(validate_transfer(a, b, 1).is_ok());
        assert!(matches!(
            validate_transfer(a, a, 10),
            Err(LedgerError::InvalidArgument(_))
        ));
        assert!(matches!(
            validate_transfer(a, b, 0),
            Err(LedgerError::InvalidArgument(_))
        ));
        assert!(matches!(
            validate_transfer(a, b, -5),
            Err(LedgerError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_transfer_involves() {
        let transfer = Transfer {
            id: TransferId::new(1),
            from_account_id: AccountId::new(1),
            to_account_id: AccountId::new(2),
            amount: 10,
            created_at: simplebank_common::now(),
        };

        assert!(transfer.involves(AccountId::new(1)));
        assert!(transfer.involves(AccountId::new(2)));
        assert!(!transfer.involves(AccountId::new(3)));
    }
}
