//! Simulation controller.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use futures::stream::{self, StreamExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use shardledger_common::AccountId;
use shardledger_coordinator::{Cluster, TransferOutcome};
use shardledger_ledger::{LedgerStore, PgLedgerStore};
use shardledger_rpc::MemoryBroker;
use shardledger_worker::IdentityRecord;

use crate::metrics::SimulationMetrics;
use crate::scenario::Scenario;

/// What to start and how hard to drive it.
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    pub partitions: Vec<u32>,
    pub first_account: i64,
    pub accounts: usize,
    pub initial_balance: Decimal,
    pub transfers: usize,
    pub concurrency: usize,
    pub max_amount: u64,
    pub participant_timeout: Duration,
    pub seed: Option<u64>,
    /// One Postgres URL per partition, in partition order. Empty runs in memory.
    pub database_urls: Vec<String>,
}

impl SimulationConfig {
    pub fn account_ids(&self) -> Vec<AccountId> {
        (0..self.accounts as i64)
            .map(|i| AccountId::new(self.first_account + i))
            .collect()
    }
}

/// One planned transfer.
#[derive(Debug, Clone, Copy)]
pub struct PlannedTransfer {
    pub from: AccountId,
    pub to: AccountId,
    pub amount: Decimal,
}

/// Controls the simulation.
pub struct SimulationController {
    config: SimulationConfig,
    rng: StdRng,
    metrics: SimulationMetrics,
}

impl SimulationController {
    pub fn new(config: SimulationConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        Self {
            config,
            rng,
            metrics: SimulationMetrics::new(),
        }
    }

    pub fn metrics(&self) -> &SimulationMetrics {
        &self.metrics
    }

    /// Start the deployment on a fresh in-process broker.
    ///
    /// In memory every account gets the initial balance. With database URLs
    /// the accounts must already exist in the partitions' `cuentas` tables.
    pub async fn start_cluster(&self) -> anyhow::Result<Cluster> {
        let mut builder = Cluster::builder(self.config.partitions.iter().copied())
            .participant_timeout(self.config.participant_timeout);

        for (i, account) in self.config.account_ids().into_iter().enumerate() {
            let dni = format!("{:08}", 40_000_000 + i);
            builder = builder
                .held_account(account.value(), self.config.initial_balance, dni.clone())
                .identity(IdentityRecord::new(dni, "Cliente", "Simulado", format!("{}", i + 1)));
        }

        if !self.config.database_urls.is_empty() {
            if self.config.database_urls.len() != self.config.partitions.len() {
                bail!(
                    "{} database URLs given for {} partitions",
                    self.config.database_urls.len(),
                    self.config.partitions.len()
                );
            }
            let mut partitions = self.config.partitions.clone();
            partitions.sort_unstable();
            for (partition, url) in partitions.into_iter().zip(&self.config.database_urls) {
                let store = PgLedgerStore::connect(url, 5)
                    .await
                    .with_context(|| format!("connecting partition {partition} store"))?;
                builder = builder.store(partition, Arc::new(store) as Arc<dyn LedgerStore>);
            }
        }

        let cluster = builder
            .start(MemoryBroker::new())
            .await
            .context("starting cluster")?;
        info!(
            partitions = ?cluster.partitions(),
            accounts = self.config.accounts,
            "Simulation cluster ready"
        );
        Ok(cluster)
    }

    /// Draw `count` random transfers between distinct accounts.
    pub fn plan_transfers(&mut self, count: usize) -> Vec<PlannedTransfer> {
        let accounts = self.config.account_ids();
        if accounts.len() < 2 {
            return Vec::new();
        }

        (0..count)
            .map(|_| {
                let from = self.rng.gen_range(0..accounts.len());
                let mut to = self.rng.gen_range(0..accounts.len());
                while to == from {
                    to = self.rng.gen_range(0..accounts.len());
                }
                let cents = self.rng.gen_range(100..=self.config.max_amount.max(1) * 100);
                PlannedTransfer {
                    from: accounts[from],
                    to: accounts[to],
                    amount: Decimal::new(cents as i64, 2),
                }
            })
            .collect()
    }

    /// Submit random transfers with bounded concurrency, then check that
    /// no money was created or destroyed.
    pub async fn run_random(&mut self, cluster: &Cluster) -> anyhow::Result<()> {
        let before = cluster.coordinator().total_balance().await?;
        let plan = self.plan_transfers(self.config.transfers);
        info!(transfers = plan.len(), concurrency = self.config.concurrency, "Running random transfers");

        let coordinator = cluster.coordinator().clone();
        let results: Vec<_> = stream::iter(plan)
            .map(|transfer| {
                let coordinator = coordinator.clone();
                async move {
                    let started = Instant::now();
                    let outcome = coordinator
                        .transfer(transfer.from, transfer.to, transfer.amount)
                        .await;
                    (outcome, started.elapsed())
                }
            })
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;

        for (outcome, latency) in results {
            self.record(outcome, latency);
        }

        verify_conservation(cluster, before).await
    }

    /// Run one named scenario.
    pub async fn run_scenario(&mut self, scenario: Scenario, cluster: &mut Cluster) -> anyhow::Result<()> {
        info!(scenario = scenario.name(), "{}", scenario.description());
        let before = cluster.coordinator().total_balance().await?;
        scenario
            .run(cluster, &self.config.account_ids(), &mut self.metrics)
            .await?;
        verify_conservation(cluster, before).await
    }

    fn record(&mut self, outcome: shardledger_common::Result<TransferOutcome>, latency: Duration) {
        match outcome {
            Ok(TransferOutcome::Committed { tx_id }) => {
                debug!(tx_id = %tx_id, "Committed");
                self.metrics.record_commit(latency);
            }
            Ok(TransferOutcome::Aborted { tx_id, reason }) => {
                debug!(tx_id = %tx_id, reason = %reason, "Aborted");
                self.metrics.record_abort(latency);
            }
            Err(e) => {
                warn!(error = %e, "Transfer rejected");
                self.metrics.record_rejection();
            }
        }
    }
}

/// Compare the global sum against `expected`.
///
/// The sum is taken through every partition queue, so decisions published
/// before it are applied by the time it is answered.
pub async fn verify_conservation(cluster: &Cluster, expected: Decimal) -> anyhow::Result<()> {
    let total = cluster.coordinator().total_balance().await?;
    if total != expected {
        bail!("total balance changed: expected {expected}, found {total}");
    }
    info!(total = %total, "Total balance conserved");
    Ok(())
}
