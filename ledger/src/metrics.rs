//! Metrics collection for the transfer engine.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::Serialize;

use simplebank_common::ErrorKind;

/// Counters for units of work run under a retry policy.
#[derive(Debug, Default)]
pub struct RetryCounters {
    /// Units of work started, across all retries.
    pub attempts: AtomicU64,
    /// Units retried after a transient conflict.
    pub retries: AtomicU64,
    /// Operations whose retries ran out.
    pub exhausted: AtomicU64,
}

impl RetryCounters {
    pub fn attempt_started(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retried(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn conflict_exhausted(&self) {
        self.exhausted.fetch_add(1, Ordering::Relaxed);
    }
}

/// Transfer engine metrics.
#[derive(Debug, Default)]
pub struct Metrics {
    /// Requests that passed validation.
    pub transfers_total: AtomicU64,
    /// Requests that committed.
    pub transfers_committed: AtomicU64,
    /// Requests that failed after validation.
    pub transfers_failed: AtomicU64,
    /// Requests rejected as invalid.
    pub transfers_rejected: AtomicU64,
    /// Requests in flight.
    pub transfers_active: AtomicU64,
    /// Requests that hit their deadline.
    pub timeouts: AtomicU64,
    /// Requests refused by the overdraft policy.
    pub insufficient_funds: AtomicU64,
    /// Units of work run for transfers.
    pub transfer_units: RetryCounters,
    /// Balance adjustments accepted for execution.
    pub adjustments_total: AtomicU64,
    /// Balance adjustments committed.
    pub adjustments_committed: AtomicU64,
    /// Balance adjustments that failed.
    pub adjustments_failed: AtomicU64,
    /// Units of work run for balance adjustments.
    pub adjustment_units: RetryCounters,
}

/// Keeps a transfer counted as in flight until dropped.
#[must_use = "the transfer stops counting as active when the guard drops"]
#[derive(Debug)]
pub struct ActiveTransfer<'a> {
    metrics: &'a Metrics,
}

impl Drop for ActiveTransfer<'_> {
    fn drop(&mut self) {
        self.metrics.transfers_active.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Metrics {
    /// Create new metrics instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a transfer as started. It stays active until the guard drops,
    /// including when the caller abandons the future.
    pub fn transfer_started(&self) -> ActiveTransfer<'_> {
        self.transfers_total.fetch_add(1, Ordering::Relaxed);
        self.transfers_active.fetch_add(1, Ordering::Relaxed);
        ActiveTransfer { metrics: self }
    }

    pub fn transfer_committed(&self) {
        self.transfers_committed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a failure after validation, bucketed by kind.
    pub fn transfer_failed(&self, kind: ErrorKind) {
        self.transfers_failed.fetch_add(1, Ordering::Relaxed);
        match kind {
            ErrorKind::Timeout => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
            }
            ErrorKind::InsufficientFunds => {
                self.insufficient_funds.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }
    }

    pub fn transfer_rejected(&self) {
        self.transfers_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn adjustment_started(&self) {
        self.adjustments_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn adjustment_finished(&self, committed: bool) {
        let counter = if committed {
            &self.adjustments_committed
        } else {
            &self.adjustments_failed
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            transfers_total: self.transfers_total.load(Ordering::Relaxed),
            transfers_committed: self.transfers_committed.load(Ordering::Relaxed),
            transfers_failed: self.transfers_failed.load(Ordering::Relaxed),
            transfers_rejected: self.transfers_rejected.load(Ordering::Relaxed),
            transfers_active: self.transfers_active.load(Ordering::Relaxed),
            attempts: self.transfer_units.attempts.load(Ordering::Relaxed),
            retries: self.transfer_units.retries.load(Ordering::Relaxed),
            conflicts_exhausted: self.transfer_units.exhausted.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            insufficient_funds: self.insufficient_funds.load(Ordering::Relaxed),
            adjustments_total: self.adjustments_total.load(Ordering::Relaxed),
            adjustments_committed: self.adjustments_committed.load(Ordering::Relaxed),
            adjustments_failed: self.adjustments_failed.load(Ordering::Relaxed),
            adjustment_attempts: self.adjustment_units.attempts.load(Ordering::Relaxed),
            adjustment_retries: self.adjustment_units.retries.load(Ordering::Relaxed),
        }
    }

    /// Export metrics in Prometheus format.
    pub fn to_prometheus(&self) -> String {
        let s = self.snapshot();
        let series = [
            ("transfers_total", "counter", "Transfers accepted for execution", s.transfers_total),
            ("transfers_committed", "counter", "Transfers committed", s.transfers_committed),
            ("transfers_failed", "counter", "Transfers aborted after validation", s.transfers_failed),
            ("transfers_rejected", "counter", "Transfers rejected as invalid", s.transfers_rejected),
            ("transfers_active", "gauge", "Transfers in flight", s.transfers_active),
            ("transfer_attempts", "counter", "Units of work started", s.attempts),
            ("transfer_retries", "counter", "Units of work retried after a transient conflict", s.retries),
            ("transfer_conflicts_exhausted", "counter", "Transfers that ran out of retries", s.conflicts_exhausted),
            ("transfer_timeouts", "counter", "Transfers that exceeded their deadline", s.timeouts),
            ("transfer_insufficient_funds", "counter", "Transfers refused by the overdraft policy", s.insufficient_funds),
            ("adjustments_total", "counter", "Balance adjustments accepted for execution", s.adjustments_total),
            ("adjustments_committed", "counter", "Balance adjustments committed", s.adjustments_committed),
            ("adjustments_failed", "counter", "Balance adjustments aborted", s.adjustments_failed),
            ("adjustment_attempts", "counter", "Units of work started for adjustments", s.adjustment_attempts),
            ("adjustment_retries", "counter", "Adjustment units retried after a transient conflict", s.adjustment_retries),
        ];

        let mut out = String::new();
        for (name, kind, help, value) in series {
            out.push_str(&format!(
                "# HELP simplebank_{name} {help}\n# TYPE simplebank_{name} {kind}\nsimplebank_{name} {value}\n\n"
            ));
        }
        out
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub transfers_total: u64,
    pub transfers_committed: u64,
    pub transfers_failed: u64,
    pub transfers_rejected: u64,
    pub transfers_active: u64,
    pub attempts: u64,
    pub retries: u64,
    pub conflicts_exhausted: u64,
    pub timeouts: u64,
    pub insufficient_funds: u64,
    pub adjustments_total: u64,
    pub adjustments_committed: u64,
    pub adjustments_failed: u64,
    pub adjustment_attempts: u64,
    pub adjustment_retries: u64,
}

/// Shared metrics instance.
pub type SharedMetrics = Arc<Metrics>;
