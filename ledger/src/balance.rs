//! Balance mutation under the overdraft policy.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::debug;

use simplebank_common::{AccountId, LedgerError, Result};

use crate::account::Account;
use crate::store::AccountStore;

/// How far below zero a debit may take a balance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum OverdraftPolicy {
    /// Balances never go negative.
    #[default]
    Deny,
    /// Any negative balance is accepted.
    Allow,
    /// Balances may go down to `-limit`.
    Limit(i64),
}

impl OverdraftPolicy {
    /// Lowest balance the policy accepts, if any.
    pub fn floor(&self) -> Option<i64> {
        match self {
            OverdraftPolicy::Deny => Some(0),
            OverdraftPolicy::Allow => None,
            OverdraftPolicy::Limit(limit) => Some(limit.saturating_neg()),
        }
    }

    /// Check if a balance is acceptable.
    pub fn permits(&self, balance: i64) -> bool {
        self.floor().map_or(true, |floor| balance >= floor)
    }
}

impl fmt::Display for OverdraftPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverdraftPolicy::Deny => write!(f, "deny"),
            OverdraftPolicy::Allow => write!(f, "allow"),
            OverdraftPolicy::Limit(limit) => write!(f, "limit:{limit}"),
        }
    }
}

impl FromStr for OverdraftPolicy {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "deny" => Ok(OverdraftPolicy::Deny),
            "allow" => Ok(OverdraftPolicy::Allow),
            _ => s
                .strip_prefix("limit:")
                .and_then(|n| n.parse::<i64>().ok())
                .filter(|n| *n >= 0)
                .map(OverdraftPolicy::Limit)
                .ok_or_else(|| {
                    LedgerError::ConfigurationError(format!(
                        "overdraft policy must be deny, allow or limit:<n>, got {s:?}"
                    ))
                }),
        }
    }
}

/// Applies signed deltas to account balances.
#[derive(Debug, Clone, Copy, Default)]
pub struct BalanceMutator {
    policy: OverdraftPolicy,
}

impl BalanceMutator {
    pub fn new(policy: OverdraftPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> OverdraftPolicy {
        self.policy
    }

    /// Add `delta` to the account's balance inside `unit`.
    ///
    /// Returns the post-mutation account. The read and write happen under the
    /// account's row lock, which the unit keeps until it ends. On
    /// `InsufficientFunds` the write has already been staged, so the caller
    /// must abort the unit.
    pub async fn add_to_balance<U>(&self, unit: &mut U, account_id: AccountId, delta: i64) -> Result<Account>
    where
        U: AccountStore + ?Sized,
    {
        let account = unit.add_account_balance(account_id, delta).await?;

        // Credits never fail the policy, even on an overdrawn account.
        if delta < 0 && !self.policy.permits(account.balance) {
            return Err(LedgerError::InsufficientFunds {
                account_id,
                balance: account.balance.saturating_sub(delta),
                requested: delta.saturating_neg(),
            });
        }

        debug!(
            account_id = %account_id,
            delta,
            balance = account.balance,
            "Balance updated"
        );
        Ok(account)
    }
}
