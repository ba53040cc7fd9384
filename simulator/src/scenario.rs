//! Simulation scenarios.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// A simulation scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    /// Scenario name.
    pub name: String,
    /// Description.
    pub description: String,
    /// Steps in the scenario.
    pub steps: Vec<ScenarioStep>,
}

/// A step in a scenario.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScenarioStep {
    /// Random transfers between random account pairs, run concurrently.
    RandomTransfers { count: usize },
    /// Two tasks hammering one account pair in opposite directions.
    PingPong {
        rounds: usize,
        amount: i64,
        timeout_secs: u64,
    },
    /// Make the next `count` commits fail with a transient conflict.
    InjectCommitConflicts { count: u32 },
    /// Try to move more than an account holds; the engine must refuse.
    Overdraw { account: usize },
    /// Pause between steps.
    Wait { millis: u64 },
    /// Check balances against entries and fail the run on any mismatch.
    Reconcile,
}

impl Scenario {
    /// Load a built-in scenario by name.
    pub fn load(name: &str, transfers: usize) -> anyhow::Result<Self> {
        match name {
            "random" => Ok(Self::random(transfers)),
            "ping-pong" => Ok(Self::ping_pong(transfers)),
            "conflict-storm" => Ok(Self::conflict_storm(transfers)),
            "overdraft" => Ok(Self::overdraft()),
            _ => Err(anyhow::anyhow!("Unknown scenario: {}", name)),
        }
    }

    /// Load a scenario from a JSON file.
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading scenario {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parsing scenario {}", path.display()))
    }

    fn random(transfers: usize) -> Self {
        Self {
            name: "random".to_string(),
            description: "Concurrent transfers between random account pairs".to_string(),
            steps: vec![
                ScenarioStep::RandomTransfers { count: transfers },
                ScenarioStep::Reconcile,
            ],
        }
    }

    fn ping_pong(rounds: usize) -> Self {
        Self {
            name: "ping-pong".to_string(),
            description: "Opposite transfers over one pair must never deadlock".to_string(),
            steps: vec![
                ScenarioStep::PingPong {
                    rounds,
                    amount: 1,
                    timeout_secs: 30,
                },
                ScenarioStep::Reconcile,
            ],
        }
    }

    fn conflict_storm(transfers: usize) -> Self {
        Self {
            name: "conflict-storm".to_string(),
            description: "Transfers while commits keep failing transiently".to_string(),
            steps: vec![
                ScenarioStep::InjectCommitConflicts {
                    count: (transfers / 2).max(1) as u32,
                },
                ScenarioStep::RandomTransfers { count: transfers },
                ScenarioStep::Reconcile,
            ],
        }
    }

    fn overdraft() -> Self {
        Self {
            name: "overdraft".to_string(),
            description: "Overdrawing transfers are refused without partial writes".to_string(),
            steps: vec![
                ScenarioStep::Overdraw { account: 0 },
                ScenarioStep::Wait { millis: 10 },
                ScenarioStep::Overdraw { account: 1 },
                ScenarioStep::Reconcile,
            ],
        }
    }
}
