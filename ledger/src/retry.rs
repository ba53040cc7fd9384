//! Bounded retry with exponential backoff for transient store conflicts.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use simplebank_common::{Deadline, LedgerError, Result};

use crate::config::RetryConfig;
use crate::metrics::RetryCounters;

/// Retry schedule derived from [`RetryConfig`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    jitter: bool,
}

impl RetryPolicy {
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            base_delay: config.base_delay,
            max_delay: config.max_delay,
            jitter: config.jitter,
        }
    }

    /// Upper bound of the sleep after failed attempt `attempt` (1-based).
    pub fn ceiling(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1 << exponent)
            .min(self.max_delay)
    }

    /// Sleep after failed attempt `attempt`, jittered into the upper half of the ceiling.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let ceiling = self.ceiling(attempt);
        if !self.jitter || ceiling.is_zero() {
            return ceiling;
        }
        let half = ceiling / 2;
        half + rand::thread_rng().gen_range(Duration::ZERO..=half)
    }

    /// Run `op` until it succeeds, fails permanently or exhausts the attempts.
    ///
    /// `op` receives the 1-based attempt number and must run a whole unit of
    /// work. Only retryable errors are retried; exhaustion turns the last one
    /// into [`LedgerError::Conflict`]. Backoff sleeps never run past
    /// `deadline`, and no new attempt starts once it has passed.
    pub async fn run<T, F, Fut>(
        &self,
        counters: &RetryCounters,
        deadline: Option<Deadline>,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            counters.attempt_started();
            let err = match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() => err,
                Err(err) => return Err(err),
            };

            if attempt >= self.max_attempts {
                counters.conflict_exhausted();
                return Err(LedgerError::Conflict {
                    attempts: attempt,
                    last_error: err.to_string(),
                });
            }

            let mut delay = self.backoff(attempt);
            if let Some(deadline) = deadline {
                delay = delay.min(deadline.remaining());
            }
            warn!(
                attempt,
                max_attempts = self.max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Transient conflict, retrying unit of work"
            );
            counters.retried();
            tokio::time::sleep(delay).await;

            if deadline.is_some_and(|d| d.is_expired()) {
                return Err(LedgerError::Timeout(format!(
                    "deadline passed after {attempt} attempts, last error: {err}"
                )));
            }
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_attempts: u32, jitter: bool) -> RetryPolicy {
        RetryPolicy::new(&RetryConfig {
            max_attempts,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            jitter,
        })
    }

    #[test]
    fn test_ceiling_doubles_then_caps() {
        let policy = policy(10, false);
        assert_eq!(policy.ceiling(1), Duration::from_millis(10));
        assert_eq!(policy.ceiling(2), Duration::from_millis(20));
        assert_eq!(policy.ceiling(3), Duration::from_millis(40));
        assert_eq!(policy.ceiling(4), Duration::from_millis(50));
        assert_eq!(policy.ceiling(60), Duration::from_millis(50));
    }

    #[test]
    fn test_jitter_stays_in_upper_half() {
        let policy = policy(10, true);
        for attempt in 1..6 {
            let ceiling = policy.ceiling(attempt);
            let delay = policy.backoff(attempt);
            assert!(delay <= ceiling && delay >= ceiling / 2, "{delay:?} vs {ceiling:?}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_until_success() {
        let metrics = Metrics::new();
        let calls = AtomicU32::new(0);

        let value = policy(5, true)
            .run(&metrics.transfer_units, None, |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(LedgerError::TransientConflict("deadlock detected".into()))
                    } else {
                        Ok(attempt)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.attempts, 3);
        assert_eq!(snapshot.retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_surfaces_conflict() {
        let metrics = Metrics::new();

        let err = policy(3, false)
            .run(&metrics.transfer_units, None, |_| async {
                Err::<(), _>(LedgerError::TransientConflict("lock timeout".into()))
            })
            .await
            .unwrap_err();

        match err {
            LedgerError::Conflict { attempts, last_error } => {
                assert_eq!(attempts, 3);
                assert!(last_error.contains("lock timeout"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(metrics.snapshot().conflicts_exhausted, 1);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let metrics = Metrics::new();
        let calls = AtomicU32::new(0);

        let err = policy(5, false)
            .run(&metrics.transfer_units, None, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(LedgerError::InvalidArgument("amount".into())) }
            })
            .await
            .unwrap_err();

        assert!(matches!(err, LedgerError::InvalidArgument(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.snapshot().retries, 0);
    }

    #[test]
    fn test_zero_delay_policy_retries_immediately() {
        let metrics = Metrics::new();
        let policy = RetryPolicy::new(&RetryConfig {
            max_attempts: 4,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: true,
        });
        assert_eq!(policy.backoff(3), Duration::ZERO);

        let value = tokio_test::block_on(policy.run(&metrics.transfer_units, None, |attempt| async move {
            if attempt < 4 {
                Err(LedgerError::TransientConflict("serialization failure".into()))
            } else {
                Ok(attempt)
            }
        }))
        .unwrap();

        assert_eq!(value, 4);
        assert_eq!(metrics.snapshot().retries, 3);
    }

    #[tokio::test]
    async fn test_deadline_cuts_backoff_short() {
        let metrics = Metrics::new();
        let policy = RetryPolicy::new(&RetryConfig {
            max_attempts: 10,
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(5),
            jitter: false,
        });
        let calls = AtomicU32::new(0);
        let started = std::time::Instant::now();

        let err = policy
            .run(
                &metrics.transfer_units,
                Some(Deadline::after(Duration::from_millis(50))),
                |_| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err::<(), _>(LedgerError::TransientConflict("lock timeout".into())) }
                },
            )
            .await
            .unwrap_err();

        assert!(matches!(err, LedgerError::Timeout(_)), "{err}");
        assert!(calls.load(Ordering::SeqCst) <= 2);
        assert!(started.elapsed() < Duration::from_secs(2));
    }
}
