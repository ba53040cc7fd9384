//! Simulation metrics.

use std::collections::{BTreeMap, VecDeque};

use serde::Serialize;

/// Client-side view of a simulation run.
#[derive(Debug, Clone, Serialize)]
pub struct SimulationMetrics {
    /// Transfers submitted.
    pub total_transfers: u64,
    /// Transfers that committed.
    pub successful_transfers: u64,
    /// Transfers that returned an error.
    pub failed_transfers: u64,
    /// Failures keyed by error code.
    pub failures_by_code: BTreeMap<&'static str, u64>,
    /// Latency samples (µs).
    #[serde(skip)]
    latency_samples: VecDeque<u64>,
    #[serde(skip)]
    max_samples: usize,
}

impl SimulationMetrics {
    /// Create new metrics.
    pub fn new() -> Self {
        Self {
            total_transfers: 0,
            successful_transfers: 0,
            failed_transfers: 0,
            failures_by_code: BTreeMap::new(),
            latency_samples: VecDeque::with_capacity(10000),
            max_samples: 10000,
        }
    }

    pub fn record_success(&mut self, latency_us: u64) {
        self.total_transfers += 1;
        self.successful_transfers += 1;

        if self.latency_samples.len() >= self.max_samples {
            self.latency_samples.pop_front();
        }
        self.latency_samples.push_back(latency_us);
    }

    pub fn record_failure(&mut self, code: &'static str) {
        self.total_transfers += 1;
        self.failed_transfers += 1;
        *self.failures_by_code.entry(code).or_default() += 1;
    }

    pub fn failures(&self, code: &str) -> u64 {
        self.failures_by_code.get(code).copied().unwrap_or(0)
    }

    pub fn average_latency_us(&self) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let sum: u64 = self.latency_samples.iter().sum();
        sum / self.latency_samples.len() as u64
    }

    pub fn p50_latency_us(&self) -> u64 {
        self.percentile_latency(50)
    }

    pub fn p99_latency_us(&self) -> u64 {
        self.percentile_latency(99)
    }

    fn percentile_latency(&self, percentile: usize) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let mut sorted: Vec<_> = self.latency_samples.iter().copied().collect();
        sorted.sort_unstable();

        let idx = (sorted.len() * percentile / 100).min(sorted.len() - 1);
        sorted[idx]
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_transfers == 0 {
            return 0.0;
        }

        self.successful_transfers as f64 / self.total_transfers as f64
    }

    /// Transfers per second over `elapsed_secs`.
    pub fn throughput(&self, elapsed_secs: f64) -> f64 {
        if elapsed_secs <= 0.0 {
            return 0.0;
        }

        self.total_transfers as f64 / elapsed_secs
    }
}

impl Default for SimulationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics() {
        let mut metrics = SimulationMetrics::new();

        metrics.record_success(100);
        metrics.record_success(200);
        metrics.record_success(150);
        metrics.record_failure("INSUFFICIENT_FUNDS");

        assert_eq!(metrics.total_transfers, 4);
        assert_eq!(metrics.successful_transfers, 3);
        assert_eq!(metrics.failed_transfers, 1);
        assert_eq!(metrics.failures("INSUFFICIENT_FUNDS"), 1);
        assert_eq!(metrics.failures("TIMEOUT"), 0);
        assert_eq!(metrics.average_latency_us(), 150);
        assert_eq!(metrics.p50_latency_us(), 150);
        assert_eq!(metrics.success_rate(), 0.75);
    }

    #[test]
    fn test_throughput() {
        let mut metrics = SimulationMetrics::new();
        for _ in 0..10 {
            metrics.record_success(1);
        }
        assert_eq!(metrics.throughput(2.0), 5.0);
        assert_eq!(metrics.throughput(0.0), 0.0);
    }
}
