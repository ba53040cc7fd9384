//! Journal entries: immutable signed balance deltas.

use serde::{Deserialize, Serialize};

use simplebank_common::{AccountId, EntryId, Timestamp};

/// Direction of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryType {
    /// Balance decreases.
    Debit,
    /// Balance increases.
    Credit,
}

/// A single journal entry in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    /// Store-assigned identifier.
    pub id: EntryId,
    /// Account affected.
    pub account_id: AccountId,
    /// Signed amount in minor units: positive credits, negative debits.
    pub amount: i64,
    /// When this entry was created.
    pub created_at: Timestamp,
}

impl Entry {
    /// Direction of this entry.
    pub fn entry_type(&self) -> EntryType {
        if self.amount < 0 {
            EntryType::Debit
        } else {
            EntryType::Credit
        }
    }
}

/// Check that a set of entries nets to zero, as the two legs of a transfer must.
pub fn is_balanced<'a>(entries: impl IntoIterator<Item = &'a Entry>) -> bool {
    entries
        .into_iter()
        .try_fold(0_i64, |sum, entry| sum.checked_add(entry.amount))
        == Some(0)
}

/// Sum of entry amounts for one account.
pub fn net_change<'a>(account_id: AccountId, entries: impl IntoIterator<Item = &'a Entry>) -> i64 {
    entries
        .into_iter()
        .filter(|e| e.account_id == account_id)
        .map(|e| e.amount)
        .sum()
}
