//! Account to partition routing.

use shardledger_common::{AccountId, LedgerError, PartitionId, Result};
use shardledger_protocol::Route;

use crate::config::CoordinatorConfig;

/// Maps an account to the partition that owns it: the partition at
/// `account mod n` in the sorted list of active partitions.
#[derive(Debug, Clone)]
pub struct PartitionRouter {
    partitions: Vec<PartitionId>,
    exchange: String,
    queue_prefix: String,
}

impl PartitionRouter {
    pub fn new(config: &CoordinatorConfig) -> Result<Self> {
        let mut partitions = config.partitions.clone();
        partitions.sort();
        partitions.dedup();
        if partitions.is_empty() {
            return Err(LedgerError::Configuration(
                "no active partitions".to_string(),
            ));
        }

        Ok(Self {
            partitions,
            exchange: config.exchange.clone(),
            queue_prefix: config.queue_prefix.clone(),
        })
    }

    /// Active partitions in routing order.
    pub fn partitions(&self) -> &[PartitionId] {
        &self.partitions
    }

    /// Partition owning `account`.
    pub fn owner(&self, account: AccountId) -> PartitionId {
        let n = self.partitions.len() as i64;
        let index = account.value().rem_euclid(n) as usize;
        self.partitions[index]
    }

    /// Where requests for `partition` are published.
    pub fn route(&self, partition: PartitionId) -> Route {
        Route::new(
            self.exchange.clone(),
            partition.queue_name(&self.queue_prefix),
        )
    }

    /// Distinct partitions involved in a transfer, in routing order.
    pub fn participants(&self, from: AccountId, to: AccountId) -> Vec<PartitionId> {
        let mut involved = vec![self.owner(from), self.owner(to)];
        involved.sort();
        involved.dedup();
        involved
    }
}
