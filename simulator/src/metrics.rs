//! Simulation metrics.

use std::collections::VecDeque;
use std::time::Duration;

use shardledger_coordinator::MetricsSnapshot;

/// Outcome counts and latency samples of the transfers a run submitted.
#[derive(Debug, Clone)]
pub struct SimulationMetrics {
    pub total_transfers: u64,
    pub committed: u64,
    pub aborted: u64,
    /// Transfers the coordinator rejected before voting.
    pub rejected: u64,
    latency_samples: VecDeque<u64>,
    max_samples: usize,
}

impl SimulationMetrics {
    pub fn new() -> Self {
        Self {
            total_transfers: 0,
            committed: 0,
            aborted: 0,
            rejected: 0,
            latency_samples: VecDeque::with_capacity(10_000),
            max_samples: 10_000,
        }
    }

    pub fn record_commit(&mut self, latency: Duration) {
        self.total_transfers += 1;
        self.committed += 1;
        self.sample(latency);
    }

    pub fn record_abort(&mut self, latency: Duration) {
        self.total_transfers += 1;
        self.aborted += 1;
        self.sample(latency);
    }

    pub fn record_rejection(&mut self) {
        self.total_transfers += 1;
        self.rejected += 1;
    }

    fn sample(&mut self, latency: Duration) {
        if self.latency_samples.len() >= self.max_samples {
            self.latency_samples.pop_front();
        }
        self.latency_samples.push_back(latency.as_millis() as u64);
    }

    pub fn average_latency_ms(&self) -> u64 {
        if self.latency_samples.is_empty() {
            return 0;
        }

        let sum: u64 = self.latency_samples.iter().sum();
        sum / self.latency_samples.len() as u64
    }

    pub fn p50_latency_ms(&self) -> u64 {
        self.percentile_latency(50)
    }

    pub fn p99_latency_ms(&self) -> u64 {
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

    pub fn commit_rate(&self) -> f64 {
        if self.total_transfers == 0 {
            return 0.0;
        }

        self.committed as f64 / self.total_transfers as f64
    }

    /// Transfers per second over `elapsed`.
    pub fn throughput(&self, elapsed: Duration) -> f64 {
        let secs = elapsed.as_secs_f64();
        if secs == 0.0 {
            return 0.0;
        }

        self.total_transfers as f64 / secs
    }
}

impl Default for SimulationMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Printable end-of-run report.
pub fn summary(metrics: &SimulationMetrics, coordinator: &MetricsSnapshot, elapsed: Duration) -> String {
    format!(
        "transfers={} committed={} aborted={} rejected={} commit_rate={:.2} \
         avg_ms={} p50_ms={} p99_ms={} tps={:.1} | coordinator: ready_votes={} \
         refused_votes={} unreachable={}",
        metrics.total_transfers,
        metrics.committed,
        metrics.aborted,
        metrics.rejected,
        metrics.commit_rate(),
        metrics.average_latency_ms(),
        metrics.p50_latency_ms(),
        metrics.p99_latency_ms(),
        metrics.throughput(elapsed),
        coordinator.votes_ready,
        coordinator.votes_refused,
        coordinator.participants_unreachable,
    )
}
