//! Named simulation scenarios.
//!
//! Each scenario drives a few transfers against a running cluster and checks
//! the resulting balances through the coordinator.

use std::time::Instant;

use anyhow::{anyhow, ensure};
use rust_decimal::Decimal;
use tracing::info;

use shardledger_common::AccountId;
use shardledger_coordinator::{Cluster, TransferOutcome};

use crate::metrics::SimulationMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scenario {
    /// A transfer between accounts on different partitions commits on both.
    CrossPartition,
    /// An overdraft is refused and nothing changes anywhere.
    InsufficientFunds,
    /// A transfer touching a stopped partition aborts, and succeeds once the
    /// partition is back.
    PartitionOutage,
}

impl Scenario {
    pub const ALL: [Scenario; 3] = [
        Scenario::CrossPartition,
        Scenario::InsufficientFunds,
        Scenario::PartitionOutage,
    ];

    pub fn load(name: &str) -> anyhow::Result<Self> {
        Self::ALL
            .into_iter()
            .find(|s| s.name() == name)
            .ok_or_else(|| anyhow!("Unknown scenario: {name}"))
    }

    pub fn name(&self) -> &'static str {
        match self {
            Scenario::CrossPartition => "cross-partition",
            Scenario::InsufficientFunds => "insufficient-funds",
            Scenario::PartitionOutage => "partition-outage",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Scenario::CrossPartition => "Transfer between two partitions commits on both",
            Scenario::InsufficientFunds => "Overdraft is refused without side effects",
            Scenario::PartitionOutage => "Unreachable participant aborts the transfer",
        }
    }

    pub async fn run(
        &self,
        cluster: &mut Cluster,
        accounts: &[AccountId],
        metrics: &mut SimulationMetrics,
    ) -> anyhow::Result<()> {
        let (from, to) = cross_partition_pair(cluster, accounts)
            .ok_or_else(|| anyhow!("scenario needs accounts on two different partitions"))?;
        let from_before = balance(cluster, from).await?;
        let to_before = balance(cluster, to).await?;

        match self {
            Scenario::CrossPartition => {
                let amount = (from_before / Decimal::from(10)).round_dp(2);
                ensure!(amount > Decimal::ZERO, "account {from} has nothing to send");

                let outcome = transfer(cluster, from, to, amount, metrics).await?;
                ensure!(outcome.is_committed(), "transfer was not committed: {outcome:?}");
                ensure!(balance(cluster, from).await? == from_before - amount);
                ensure!(balance(cluster, to).await? == to_before + amount);
            }
            Scenario::InsufficientFunds => {
                let amount = from_before + Decimal::ONE;
                let outcome = transfer(cluster, from, to, amount, metrics).await?;
                match &outcome {
                    TransferOutcome::Aborted { reason, .. } => ensure!(
                        reason.to_lowercase().contains("insufficient funds"),
                        "unexpected abort reason: {reason}"
                    ),
                    TransferOutcome::Committed { .. } => {
                        return Err(anyhow!("overdraft of {amount} was committed"))
                    }
                }
                ensure!(balance(cluster, from).await? == from_before);
                ensure!(balance(cluster, to).await? == to_before);
            }
            Scenario::PartitionOutage => {
                let partition = cluster.coordinator().router().owner(to);
                let amount = Decimal::ONE;

                cluster.stop_partition(partition.value()).await?;
                let outcome = transfer(cluster, from, to, amount, metrics).await?;
                ensure!(!outcome.is_committed(), "transfer committed without partition {partition}");
                cluster.start_partition(partition.value()).await?;

                ensure!(balance(cluster, from).await? == from_before);
                ensure!(balance(cluster, to).await? == to_before);

                let retry = transfer(cluster, from, to, amount, metrics).await?;
                ensure!(retry.is_committed(), "retry after recovery was not committed: {retry:?}");
                ensure!(balance(cluster, to).await? == to_before + amount);
            }
        }

        info!(scenario = self.name(), "Scenario passed");
        Ok(())
    }
}

fn cross_partition_pair(cluster: &Cluster, accounts: &[AccountId]) -> Option<(AccountId, AccountId)> {
    let router = cluster.coordinator().router();
    let from = *accounts.first()?;
    let to = accounts
        .iter()
        .copied()
        .find(|a| router.owner(*a) != router.owner(from))?;
    Some((from, to))
}

async fn balance(cluster: &Cluster, account: AccountId) -> anyhow::Result<Decimal> {
    let reply = cluster.coordinator().balance(account).await?;
    reply
        .field::<Decimal>("balance")
        .ok_or_else(|| anyhow!("no balance for account {account}: {}", reply.error_message()))
}

async fn transfer(
    cluster: &Cluster,
    from: AccountId,
    to: AccountId,
    amount: Decimal,
    metrics: &mut SimulationMetrics,
) -> anyhow::Result<TransferOutcome> {
    let started = Instant::now();
    let outcome = cluster.coordinator().transfer(from, to, amount).await?;
    match outcome {
        TransferOutcome::Committed { .. } => metrics.record_commit(started.elapsed()),
        TransferOutcome::Aborted { .. } => metrics.record_abort(started.elapsed()),
    }
    Ok(outcome)
}
