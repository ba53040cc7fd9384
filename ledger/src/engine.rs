//! Atomic transfer engine.
//!
//! One transfer is one unit of work: transfer record, debit entry, credit
//! entry and both balance mutations commit together or not at all. Balance
//! mutations always lock the lower account id first, so two transfers over
//! the same pair of accounts can never wait on each other in a cycle.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, instrument, warn};

use simplebank_common::{AccountId, Deadline, LedgerError, Result};

use crate::account::ensure_same_currency;
use crate::balance::BalanceMutator;
use crate::config::LedgerConfig;
use crate::metrics::Metrics;
use crate::retry::RetryPolicy;
use crate::store::{AccountStore, EntryStore, Store, TransferStore, UnitOfWork};
use crate::transfer::{
    validate_transfer, AdjustmentRequest, AdjustmentResult, TransferRequest, TransferResult,
};

/// The two balance mutations of a transfer, in lock order.
///
/// Depends only on the account ids, never on which side is the source.
pub fn lock_order(
    from_account_id: AccountId,
    to_account_id: AccountId,
    amount: i64,
) -> [(AccountId, i64); 2] {
    let debit = (from_account_id, -amount);
    let credit = (to_account_id, amount);
    if from_account_id < to_account_id {
        [debit, credit]
    } else {
        [credit, debit]
    }
}

/// Executes transfers against a [`Store`].
pub struct TransferEngine<S: Store> {
    store: Arc<S>,
    mutator: BalanceMutator,
    retry: RetryPolicy,
    default_timeout: Option<Duration>,
    metrics: Arc<Metrics>,
}

impl<S: Store> TransferEngine<S> {
    /// Create a new transfer engine.
    pub fn new(store: Arc<S>, config: &LedgerConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            mutator: BalanceMutator::new(config.overdraft),
            retry: RetryPolicy::new(&config.retry),
            default_timeout: config.transfer_timeout,
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Move `amount` from one account to another.
    ///
    /// Fails with `InvalidArgument` before touching the store for same-account
    /// or non-positive transfers. Transient conflicts are retried; every other
    /// error aborts the unit and is returned as-is.
    ///
    /// The deadline, if any, covers every attempt's writes and backoff sleep
    /// but not the commit itself: once a unit starts committing, the commit
    /// runs to completion and its real outcome is returned, so a `Timeout`
    /// always means nothing was applied.
    #[instrument(
        skip(self, request),
        fields(
            request_id = %request.request_id,
            from = %request.from_account_id,
            to = %request.to_account_id,
            amount = request.amount,
        )
    )]
    pub async fn execute(&self, request: TransferRequest) -> Result<TransferResult> {
        if let Err(err) =
            validate_transfer(request.from_account_id, request.to_account_id, request.amount)
        {
            self.metrics.transfer_rejected();
            return Err(err);
        }

        let _active = self.metrics.transfer_started();
        let deadline = self.deadline_for(request.deadline);
        let outcome = self
            .retry
            .run(&self.metrics.transfer_units, deadline, |attempt| {
                self.attempt_transfer(&request, attempt, deadline)
            })
            .await;

        match &outcome {
            Ok(result) => {
                self.metrics.transfer_committed();
                info!(
                    transfer_id = %result.transfer.id,
                    from_balance = result.from_account.balance,
                    to_balance = result.to_account.balance,
                    "Transfer committed"
                );
            }
            Err(err) => {
                self.metrics.transfer_failed(err.kind());
                warn!(error = %err, code = err.error_code(), "Transfer aborted");
            }
        }

        outcome
    }

    /// Apply a signed delta to one account, writing its entry in the same unit.
    ///
    /// The administrative counterpart of a transfer: it takes the same row
    /// lock and follows the same retry and deadline rules.
    #[instrument(
        skip(self, request),
        fields(request_id = %request.request_id, account = %request.account_id, amount = request.amount)
    )]
    pub async fn adjust_balance(&self, request: AdjustmentRequest) -> Result<AdjustmentResult> {
        if request.amount == 0 {
            return Err(LedgerError::InvalidArgument(
                "adjustment amount cannot be zero".to_string(),
            ));
        }

        self.metrics.adjustment_started();
        let deadline = self.deadline_for(request.deadline);
        let outcome = self
            .retry
            .run(&self.metrics.adjustment_units, deadline, |attempt| {
                self.attempt_adjustment(&request, attempt, deadline)
            })
            .await;
        self.metrics.adjustment_finished(outcome.is_ok());

        let result = outcome?;
        info!(
            entry_id = %result.entry.id,
            balance = result.account.balance,
            "Balance adjusted"
        );
        Ok(result)
    }

    fn deadline_for(&self, requested: Option<Deadline>) -> Option<Deadline> {
        Deadline::earliest(requested, self.default_timeout.map(Deadline::after))
    }

    async fn attempt_transfer(
        &self,
        request: &TransferRequest,
        attempt: u32,
        deadline: Option<Deadline>,
    ) -> Result<TransferResult> {
        let mut unit = with_deadline(deadline, "transfer", self.store.begin()).await?;
        let applied =
            with_deadline(deadline, "transfer", self.apply_transfer(&mut unit, request)).await;
        finish(unit, attempt, deadline, "transfer", applied).await
    }

    async fn apply_transfer(
        &self,
        unit: &mut S::Unit,
        request: &TransferRequest,
    ) -> Result<TransferResult> {
        let from_id = request.from_account_id;
        let to_id = request.to_account_id;
        let amount = request.amount;

        let from = unit.get_account(from_id).await?;
        let to = unit.get_account(to_id).await?;
        ensure_same_currency(&from, &to)?;

        let transfer = unit.create_transfer(from_id, to_id, amount).await?;
        let from_entry = unit.create_entry(from_id, -amount).await?;
        let to_entry = unit.create_entry(to_id, amount).await?;

        let [(first_id, first_delta), (second_id, second_delta)] =
            lock_order(from_id, to_id, amount);
        let first = self
            .mutator
            .add_to_balance(&mut *unit, first_id, first_delta)
            .await?;
        let second = self
            .mutator
            .add_to_balance(&mut *unit, second_id, second_delta)
            .await?;
        let (from_account, to_account) = if first.id == from_id {
            (first, second)
        } else {
            (second, first)
        };

        Ok(TransferResult {
            transfer,
            from_entry,
            to_entry,
            from_account,
            to_account,
        })
    }

    async fn attempt_adjustment(
        &self,
        request: &AdjustmentRequest,
        attempt: u32,
        deadline: Option<Deadline>,
    ) -> Result<AdjustmentResult> {
        let mut unit = with_deadline(deadline, "balance adjustment", self.store.begin()).await?;
        let applied = with_deadline(
            deadline,
            "balance adjustment",
            self.apply_adjustment(&mut unit, request),
        )
        .await;
        finish(unit, attempt, deadline, "balance adjustment", applied).await
    }

    async fn apply_adjustment(
        &self,
        unit: &mut S::Unit,
        request: &AdjustmentRequest,
    ) -> Result<AdjustmentResult> {
        let entry = unit.create_entry(request.account_id, request.amount).await?;
        let account = self
            .mutator
            .add_to_balance(&mut *unit, request.account_id, request.amount)
            .await?;
        Ok(AdjustmentResult { entry, account })
    }
}

/// Commit a unit whose writes succeeded, or roll it back.
///
/// The deadline is checked one last time before commit. The commit is not
/// raced against it: a commit the store may already have applied is never
/// abandoned.
async fn finish<U: UnitOfWork, T>(
    unit: U,
    attempt: u32,
    deadline: Option<Deadline>,
    operation: &str,
    applied: Result<T>,
) -> Result<T> {
    let value = match applied {
        Ok(_) if deadline.is_some_and(|d| d.is_expired()) => {
            let err = expired(operation);
            abort(unit, attempt, &err).await;
            return Err(err);
        }
        Ok(value) => value,
        Err(err) => {
            abort(unit, attempt, &err).await;
            return Err(err);
        }
    };
    unit.commit().await?;
    Ok(value)
}

/// Roll back a failed unit. A failing rollback is logged; the original error wins.
async fn abort<U: UnitOfWork>(unit: U, attempt: u32, cause: &LedgerError) {
    if let Err(rollback_err) = unit.rollback().await {
        warn!(
            attempt,
            cause = %cause,
            error = %rollback_err,
            "Rollback failed, unit is discarded on drop"
        );
    }
}

fn expired(operation: &str) -> LedgerError {
    LedgerError::Timeout(format!("{operation} did not finish before its deadline"))
}

/// Race `op` against an optional deadline. On expiry `op` is dropped before
/// it has committed anything.
async fn with_deadline<T>(
    deadline: Option<Deadline>,
    operation: &str,
    op: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    let Some(deadline) = deadline else {
        return op.await;
    };
    if deadline.is_expired() {
        return Err(expired(operation));
    }

    let at = tokio::time::Instant::from_std(deadline.instant());
    match tokio::time::timeout_at(at, op).await {
        Ok(result) => result,
        Err(_) => Err(expired(operation)),
    }
}
