//! SimpleBank Simulator
//!
//! Seeds accounts, drives concurrent transfers through the ledger and
//! reconciles the result.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use simplebank_ledger::{Currency, Ledger, LedgerConfig, Store};

mod bank;
mod controller;
mod metrics;
mod scenario;

use bank::Bank;
use controller::{FaultInjection, Settings, SimulationController};
use scenario::Scenario;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Backend {
    Memory,
    Postgres,
}

/// SimpleBank Simulator CLI
#[derive(Parser, Debug)]
#[command(name = "simulator")]
#[command(about = "Drive concurrent transfers through the SimpleBank ledger")]
struct Args {
    /// Storage backend
    #[arg(short, long, value_enum, default_value = "memory")]
    backend: Backend,

    /// Built-in scenario: random, ping-pong, conflict-storm, overdraft
    #[arg(short, long, default_value = "random")]
    scenario: String,

    /// Load the scenario from a JSON file instead
    #[arg(long)]
    scenario_file: Option<PathBuf>,

    /// Number of accounts to open
    #[arg(short, long, default_value = "4")]
    accounts: usize,

    /// Transfers (or ping-pong rounds) to run
    #[arg(short, long, default_value = "200")]
    transfers: usize,

    /// Transfers in flight at once
    #[arg(short, long, default_value = "16")]
    concurrency: usize,

    /// Opening balance of each account, in minor units
    #[arg(long, default_value = "100000")]
    initial_balance: i64,

    /// Largest random transfer, in minor units
    #[arg(long, default_value = "1000")]
    max_amount: i64,

    /// Per-transfer deadline in milliseconds
    #[arg(long)]
    deadline_ms: Option<u64>,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,

    /// Create the ledger tables before running (postgres only)
    #[arg(long)]
    apply_schema: bool,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,

    /// Also print engine metrics in Prometheus text format
    #[arg(long)]
    prometheus: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = LedgerConfig::from_env()?;

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    let registry = tracing_subscriber::registry().with(filter);
    if std::env::var("LOG_FORMAT").as_deref() == Ok("json") {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }

    info!(backend = ?args.backend, "Starting SimpleBank Simulator");

    let outcome = match args.backend {
        Backend::Memory => run(Ledger::in_memory(config)?, &args).await,
        Backend::Postgres => {
            let ledger = Ledger::connect(config).await?;
            if args.apply_schema {
                ledger.store().apply_schema().await?;
                info!("Ledger schema applied");
            }
            run(ledger, &args).await
        }
    };

    if let Err(e) = &outcome {
        error!(error = %e, "Simulation failed");
    }
    outcome
}

async fn run<S: Store + FaultInjection>(ledger: Ledger<S>, args: &Args) -> anyhow::Result<()> {
    let ledger = Arc::new(ledger);
    let scenario = match &args.scenario_file {
        Some(path) => Scenario::from_file(path)?,
        None => Scenario::load(&args.scenario, args.transfers)?,
    };

    let bank = Bank::open(&ledger, args.accounts, args.initial_balance, Currency::usd()).await?;
    let settings = Settings {
        concurrency: args.concurrency,
        max_amount: args.max_amount,
        deadline: args.deadline_ms.map(Duration::from_millis),
        seed: args.seed,
    };

    let mut controller = SimulationController::new(ledger.clone(), bank, settings);
    let report = controller.run_scenario(&scenario).await?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        info!("Simulation complete");
        info!("Total transfers: {}", report.client.total_transfers);
        info!("Successful: {}", report.client.successful_transfers);
        info!("Failed: {}", report.client.failed_transfers);
        for (code, count) in &report.client.failures_by_code {
            info!("  {}: {}", code, count);
        }
        info!("Retries: {}", report.engine.retries);
        info!("Throughput: {:.1} transfers/s", report.throughput);
        info!(
            "Latency avg/p50/p99: {}µs / {}µs / {}µs",
            report.client.average_latency_us(),
            report.p50_latency_us,
            report.p99_latency_us
        );
    }

    if args.prometheus {
        print!("{}", ledger.metrics().to_prometheus());
    }

    Ok(())
}
