//! Simulation controller.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use futures::stream::{self, StreamExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::{info, warn};

use simplebank_ledger::{
    AccountId, Deadline, ErrorKind, Ledger, MemoryStore, MetricsSnapshot, PgStore, Store,
    TransferResult,
};

use crate::bank::{Bank, Reconciliation};
use crate::metrics::SimulationMetrics;
use crate::scenario::{Scenario, ScenarioStep};

/// Backends that can be told to fail commits on purpose.
pub trait FaultInjection {
    /// Returns false when the backend has no fault hooks.
    fn inject_conflicts(&self, count: u32) -> bool;
}

impl FaultInjection for MemoryStore {
    fn inject_conflicts(&self, count: u32) -> bool {
        self.inject_commit_conflicts(count);
        true
    }
}

impl FaultInjection for PgStore {
    fn inject_conflicts(&self, _count: u32) -> bool {
        false
    }
}

/// Knobs for a run.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Transfers in flight at once.
    pub concurrency: usize,
    /// Upper bound for random transfer amounts.
    pub max_amount: i64,
    /// Per-transfer deadline.
    pub deadline: Option<Duration>,
    /// Random seed for reproducibility.
    pub seed: Option<u64>,
}

/// Everything a run produced.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    pub scenario: String,
    pub elapsed_ms: u64,
    pub throughput: f64,
    pub p50_latency_us: u64,
    pub p99_latency_us: u64,
    pub client: SimulationMetrics,
    pub engine: MetricsSnapshot,
    pub reconciliation: Option<Reconciliation>,
}

/// Controls the simulation.
pub struct SimulationController<S: Store> {
    ledger: Arc<Ledger<S>>,
    bank: Bank,
    settings: Settings,
    rng: StdRng,
    metrics: Arc<RwLock<SimulationMetrics>>,
    reconciliation: Option<Reconciliation>,
}

impl<S: Store + FaultInjection> SimulationController<S> {
    pub fn new(ledger: Arc<Ledger<S>>, bank: Bank, settings: Settings) -> Self {
        let rng = match settings.seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };

        Self {
            ledger,
            bank,
            settings,
            rng,
            metrics: Arc::new(RwLock::new(SimulationMetrics::new())),
            reconciliation: None,
        }
    }

    /// Run a scenario and summarise it.
    pub async fn run_scenario(&mut self, scenario: &Scenario) -> anyhow::Result<SimulationReport> {
        info!(
            scenario = %scenario.name,
            accounts = self.bank.len(),
            "Running scenario: {}",
            scenario.description
        );

        let started = Instant::now();
        for step in &scenario.steps {
            self.execute_step(step)
                .await
                .with_context(|| format!("step {step:?} failed"))?;
        }

        let report = self.report(&scenario.name, started.elapsed()).await;
        if report.client.failures("CONFLICT") > 0 {
            warn!(
                exhausted = report.client.failures("CONFLICT"),
                "Some transfers ran out of retries"
            );
        }
        Ok(report)
    }

    async fn execute_step(&mut self, step: &ScenarioStep) -> anyhow::Result<()> {
        match step {
            ScenarioStep::RandomTransfers { count } => self.random_transfers(*count).await,
            ScenarioStep::PingPong {
                rounds,
                amount,
                timeout_secs,
            } => {
                self.ping_pong(*rounds, *amount, Duration::from_secs(*timeout_secs))
                    .await
            }
            ScenarioStep::InjectCommitConflicts { count } => {
                if self.ledger.store().inject_conflicts(*count) {
                    info!(count, "Injected commit conflicts");
                } else {
                    warn!("Backend does not support fault injection, skipping");
                }
                Ok(())
            }
            ScenarioStep::Overdraw { account } => self.overdraw(*account).await,
            ScenarioStep::Wait { millis } => {
                tokio::time::sleep(Duration::from_millis(*millis)).await;
                Ok(())
            }
            ScenarioStep::Reconcile => {
                let report = self.bank.reconcile(&self.ledger).await?;
                if !report.is_consistent() {
                    bail!("reconciliation failed: {}", report.mismatches.join("; "));
                }
                info!(
                    transfers = report.transfers,
                    entries = report.entries,
                    total = %self.bank.currency().format_minor(report.actual_total),
                    "Ledger reconciled"
                );
                self.reconciliation = Some(report);
                Ok(())
            }
        }
    }

    async fn random_transfers(&mut self, count: usize) -> anyhow::Result<()> {
        let max_amount = self.settings.max_amount.max(1);
        let jobs: Vec<(AccountId, AccountId, i64)> = (0..count)
            .map(|_| {
                let (from, to) = self.bank.pick_pair(&mut self.rng);
                (from, to, self.rng.gen_range(1..=max_amount))
            })
            .collect();

        let deadline = self.settings.deadline;
        let handles = stream::iter(jobs)
            .map(|(from, to, amount)| {
                let ledger = self.ledger.clone();
                let metrics = self.metrics.clone();
                tokio::spawn(async move {
                    let started = Instant::now();
                    let outcome = ledger
                        .execute_transfer(from, to, amount, deadline.map(Deadline::after))
                        .await;
                    record(&metrics, started, &outcome).await;
                })
            })
            .buffer_unordered(self.settings.concurrency.max(1))
            .collect::<Vec<_>>()
            .await;

        for joined in handles {
            joined.context("transfer task panicked")?;
        }
        Ok(())
    }

    async fn ping_pong(&self, rounds: usize, amount: i64, timeout: Duration) -> anyhow::Result<()> {
        let a = self.bank.account(0);
        let b = self.bank.account(1);

        let run = |from: AccountId, to: AccountId| {
            let ledger = self.ledger.clone();
            let metrics = self.metrics.clone();
            tokio::spawn(async move {
                for _ in 0..rounds {
                    let started = Instant::now();
                    let outcome = ledger.execute_transfer(from, to, amount, None).await;
                    record(&metrics, started, &outcome).await;
                }
            })
        };

        let forward = run(a, b);
        let backward = run(b, a);
        let both = async {
            forward.await?;
            backward.await
        };

        match tokio::time::timeout(timeout, both).await {
            Ok(joined) => joined.context("ping-pong task panicked")?,
            Err(_) => bail!("opposite transfers between {a} and {b} did not finish in {timeout:?}"),
        }
        info!(%a, %b, rounds, "Ping-pong finished");
        Ok(())
    }

    async fn overdraw(&self, index: usize) -> anyhow::Result<()> {
        let from = self.bank.account(index);
        let to = self.bank.account(index + 1);
        let Some(floor) = self.ledger.config().overdraft.floor() else {
            warn!("Overdraft policy allows any balance, skipping overdraw step");
            return Ok(());
        };

        let balance = self.ledger.get_account(from).await?.balance;
        let amount = balance.saturating_sub(floor).saturating_add(1);
        let started = Instant::now();
        let outcome = self.ledger.execute_transfer(from, to, amount, None).await;
        record(&self.metrics, started, &outcome).await;

        match outcome {
            Err(err) if err.kind() == ErrorKind::InsufficientFunds => {
                info!(account = %from, amount, "Overdraw refused");
                Ok(())
            }
            Err(err) => Err(err.into()),
            Ok(result) => bail!(
                "transfer {} overdrew account {from} to {}",
                result.transfer.id,
                result.from_account.balance
            ),
        }
    }

    async fn report(&self, scenario: &str, elapsed: Duration) -> SimulationReport {
        let client = self.metrics.read().await.clone();
        SimulationReport {
            scenario: scenario.to_string(),
            elapsed_ms: elapsed.as_millis() as u64,
            throughput: client.throughput(elapsed.as_secs_f64()),
            p50_latency_us: client.p50_latency_us(),
            p99_latency_us: client.p99_latency_us(),
            engine: self.ledger.metrics().snapshot(),
            reconciliation: self.reconciliation.clone(),
            client,
        }
    }
}

async fn record(
    metrics: &RwLock<SimulationMetrics>,
    started: Instant,
    outcome: &simplebank_ledger::Result<TransferResult>,
) {
    let mut metrics = metrics.write().await;
    match outcome {
        Ok(_) => metrics.record_success(started.elapsed().as_micros() as u64),
        Err(err) => metrics.record_failure(err.error_code()),
    }
}
