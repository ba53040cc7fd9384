//! Seeded accounts and end-of-run reconciliation.

use std::collections::{BTreeMap, HashSet};
use std::future::Future;

use anyhow::{bail, Result};
use rand::Rng;
use serde::Serialize;
use tracing::info;

use simplebank_ledger::{AccountId, Currency, EntryType, Ledger, Store};

const PAGE_SIZE: u32 = 500;

/// The accounts a simulation run owns.
pub struct Bank {
    accounts: Vec<AccountId>,
    initial: BTreeMap<AccountId, i64>,
    currency: Currency,
}

/// Result of checking the ledger against the bank's starting state.
#[derive(Debug, Clone, Serialize)]
pub struct Reconciliation {
    pub balances: BTreeMap<AccountId, i64>,
    pub expected_total: i64,
    pub actual_total: i64,
    pub transfers: usize,
    pub entries: usize,
    pub mismatches: Vec<String>,
}

impl Reconciliation {
    pub fn is_consistent(&self) -> bool {
        self.mismatches.is_empty()
    }
}

impl Bank {
    /// Open `count` accounts holding `initial_balance` each.
    pub async fn open<S: Store>(
        ledger: &Ledger<S>,
        count: usize,
        initial_balance: i64,
        currency: Currency,
    ) -> Result<Self> {
        if count < 2 {
            bail!("a simulation needs at least two accounts, got {count}");
        }

        let mut accounts = Vec::with_capacity(count);
        let mut initial = BTreeMap::new();
        for i in 0..count {
            let account = ledger
                .create_account(format!("sim-{}", i + 1), initial_balance, currency.clone())
                .await?;
            accounts.push(account.id);
            initial.insert(account.id, account.balance);
        }

        info!(
            count,
            initial_balance = %currency.format_minor(initial_balance),
            currency = %currency,
            "Accounts opened"
        );
        Ok(Self {
            accounts,
            initial,
            currency,
        })
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn account(&self, index: usize) -> AccountId {
        self.accounts[index % self.accounts.len()]
    }

    pub fn currency(&self) -> &Currency {
        &self.currency
    }

    pub fn initial_balance(&self, id: AccountId) -> i64 {
        self.initial.get(&id).copied().unwrap_or(0)
    }

    pub fn initial_total(&self) -> i64 {
        self.initial.values().sum()
    }

    /// Two distinct accounts.
    pub fn pick_pair(&self, rng: &mut impl Rng) -> (AccountId, AccountId) {
        let from = rng.gen_range(0..self.accounts.len());
        let mut to = rng.gen_range(0..self.accounts.len() - 1);
        if to >= from {
            to += 1;
        }
        (self.accounts[from], self.accounts[to])
    }

    /// Compare every account against its starting balance plus its entries.
    pub async fn reconcile<S: Store>(&self, ledger: &Ledger<S>) -> Result<Reconciliation> {
        let mut balances = BTreeMap::new();
        let mut transfer_ids = HashSet::new();
        let mut entries = 0;
        let mut debits = 0;
        let mut mismatches = Vec::new();

        for &id in &self.accounts {
            let account = ledger.get_account(id).await?;
            let account_entries =
                all_pages(move |offset| ledger.list_account_entries(id, PAGE_SIZE, offset)).await?;
            let transfers =
                all_pages(move |offset| ledger.list_transfers_involving(id, PAGE_SIZE, offset)).await?;

            let net: i64 = account_entries.iter().map(|e| e.amount).sum();
            let expected = self.initial_balance(id) + net;
            if account.balance != expected {
                mismatches.push(format!(
                    "account {id}: balance {} but initial plus entries is {expected}",
                    account.balance
                ));
            }
            if account.balance < 0 && ledger.config().overdraft.floor() == Some(0) {
                mismatches.push(format!("account {id} is overdrawn: {}", account.balance));
            }

            entries += account_entries.len();
            debits += account_entries
                .iter()
                .filter(|e| e.entry_type() == EntryType::Debit)
                .count();
            transfer_ids.extend(transfers.into_iter().map(|t| t.id));
            balances.insert(id, account.balance);
        }

        if entries != 2 * transfer_ids.len() {
            mismatches.push(format!(
                "{entries} entries for {} transfers",
                transfer_ids.len()
            ));
        }
        if debits != transfer_ids.len() {
            mismatches.push(format!(
                "{debits} debit entries for {} transfers",
                transfer_ids.len()
            ));
        }

        let actual_total = balances.values().sum();
        let expected_total = self.initial_total();
        if actual_total != expected_total {
            mismatches.push(format!(
                "total balance {actual_total} differs from initial {expected_total}"
            ));
        }

        Ok(Reconciliation {
            balances,
            expected_total,
            actual_total,
            transfers: transfer_ids.len(),
            entries,
            mismatches,
        })
    }
}

async fn all_pages<T, F, Fut>(mut fetch: F) -> Result<Vec<T>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = simplebank_ledger::Result<Vec<T>>>,
{
    let mut rows = Vec::new();
    let mut offset = 0;
    loop {
        let page = fetch(offset).await?;
        let fetched = page.len();
        rows.extend(page);
        if fetched < PAGE_SIZE as usize {
            return Ok(rows);
        }
        offset += PAGE_SIZE;
    }
}
