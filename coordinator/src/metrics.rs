//! Metrics collection for coordinator monitoring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Coordinator metrics.
pub struct Metrics {
    /// Transfers started.
    pub transfers_total: AtomicU64,
    /// Transfers that reached COMMIT.
    pub transfers_committed: AtomicU64,
    /// Transfers that were aborted.
    pub transfers_aborted: AtomicU64,
    /// Transfers in progress.
    pub transfers_active: AtomicU64,
    pub votes_ready: AtomicU64,
    pub votes_refused: AtomicU64,
    /// Participant calls that failed or timed out.
    pub participants_unreachable: AtomicU64,
    /// Client requests received by the gateway.
    pub requests_received: AtomicU64,
    /// Client requests answered with ERROR.
    pub requests_failed: AtomicU64,
}

impl Metrics {
    /// Create new metrics instance.
    pub fn new() -> Self {
        Self {
            transfers_total: AtomicU64::new(0),
            transfers_committed: AtomicU64::new(0),
            transfers_aborted: AtomicU64::new(0),
            transfers_active: AtomicU64::new(0),
            votes_ready: AtomicU64::new(0),
            votes_refused: AtomicU64::new(0),
            participants_unreachable: AtomicU64::new(0),
            requests_received: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
        }
    }

    pub fn transfer_initiated(&self) {
        self.transfers_total.fetch_add(1, Ordering::Relaxed);
        self.transfers_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn transfer_committed(&self) {
        self.transfers_committed.fetch_add(1, Ordering::Relaxed);
        self.transfers_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn transfer_aborted(&self) {
        self.transfers_aborted.fetch_add(1, Ordering::Relaxed);
        self.transfers_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn vote_ready(&self) {
        self.votes_ready.fetch_add(1, Ordering::Relaxed);
    }

    pub fn vote_refused(&self) {
        self.votes_refused.fetch_add(1, Ordering::Relaxed);
    }

    pub fn participant_unreachable(&self) {
        self.participants_unreachable.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_received(&self) {
        self.requests_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_failed(&self) {
        self.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            transfers_total: self.transfers_total.load(Ordering::Relaxed),
            transfers_committed: self.transfers_committed.load(Ordering::Relaxed),
            transfers_aborted: self.transfers_aborted.load(Ordering::Relaxed),
            transfers_active: self.transfers_active.load(Ordering::Relaxed),
            votes_ready: self.votes_ready.load(Ordering::Relaxed),
            votes_refused: self.votes_refused.load(Ordering::Relaxed),
            participants_unreachable: self.participants_unreachable.load(Ordering::Relaxed),
            requests_received: self.requests_received.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
        }
    }

    /// Export metrics in Prometheus text format.
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let series = [
            ("transfers_total", "counter", "Transfers started", snapshot.transfers_total),
            ("transfers_committed", "counter", "Transfers committed", snapshot.transfers_committed),
            ("transfers_aborted", "counter", "Transfers aborted", snapshot.transfers_aborted),
            ("transfers_active", "gauge", "Transfers in progress", snapshot.transfers_active),
            ("votes_ready", "counter", "READY votes received", snapshot.votes_ready),
            ("votes_refused", "counter", "ERROR votes received", snapshot.votes_refused),
            (
                "participants_unreachable",
                "counter",
                "Participant calls that failed or timed out",
                snapshot.participants_unreachable,
            ),
            ("requests_received", "counter", "Client requests received", snapshot.requests_received),
            ("requests_failed", "counter", "Client requests answered with ERROR", snapshot.requests_failed),
        ];

        let mut out = String::new();
        for (name, kind, help, value) in series {
            out.push_str(&format!(
                "# HELP shardledger_{name} {help}\n# TYPE shardledger_{name} {kind}\nshardledger_{name} {value}\n\n"
            ));
        }
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub transfers_total: u64,
    pub transfers_committed: u64,
    pub transfers_aborted: u64,
    pub transfers_active: u64,
    pub votes_ready: u64,
    pub votes_refused: u64,
    pub participants_unreachable: u64,
    pub requests_received: u64,
    pub requests_failed: u64,
}

/// Shared metrics instance.
pub type SharedMetrics = Arc<Metrics>;
