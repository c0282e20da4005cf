//! Coordinator configuration.

use std::time::Duration;

use shardledger_common::time::{constants, env_secs};
use shardledger_common::PartitionId;
use shardledger_protocol::routing::{
    CLIENT_REQUEST_QUEUE, LOOKUP_QUEUE, WORKER_EXCHANGE, WORKER_QUEUE_PREFIX,
};
use shardledger_rpc::RpcConfig;

/// Main coordinator configuration.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    /// Active partitions. Accounts are spread over them in sorted order.
    pub partitions: Vec<PartitionId>,
    /// Budget for each PREPARE, query and sum sent to a partition.
    pub participant_timeout: Duration,
    /// Budget for identity lookups.
    pub lookup_timeout: Duration,
    /// Direct exchange the partition queues are bound to.
    pub exchange: String,
    /// Partition queue prefix.
    pub queue_prefix: String,
    /// Identity lookup queue.
    pub lookup_queue: String,
    /// Queue the client gateway consumes.
    pub gateway_queue: String,
    /// Settings of the coordinator's RPC client.
    pub rpc: RpcConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            partitions: vec![PartitionId::new(1), PartitionId::new(2), PartitionId::new(3)],
            participant_timeout: constants::participant_call_timeout(),
            lookup_timeout: constants::request_timeout(),
            exchange: WORKER_EXCHANGE.to_string(),
            queue_prefix: WORKER_QUEUE_PREFIX.to_string(),
            lookup_queue: LOOKUP_QUEUE.to_string(),
            gateway_queue: CLIENT_REQUEST_QUEUE.to_string(),
            rpc: RpcConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    pub fn with_partitions(partitions: impl IntoIterator<Item = u32>) -> Self {
        Self {
            partitions: partitions.into_iter().map(PartitionId::new).collect(),
            ..Default::default()
        }
    }

    /// Load configuration from environment variables.
    ///
    /// `COORDINATOR_PARTITIONS` is a comma separated list such as `1,2,3`.
    pub fn from_env() -> Self {
        let mut config = Self {
            rpc: RpcConfig::from_env(),
            ..Default::default()
        };

        if let Ok(list) = std::env::var("COORDINATOR_PARTITIONS") {
            let parsed: Vec<PartitionId> = list
                .split(',')
                .filter_map(|p| p.trim().parse::<u32>().ok())
                .map(PartitionId::new)
                .collect();
            if !parsed.is_empty() {
                config.partitions = parsed;
            }
        }

        if let Some(timeout) = env_secs("COORDINATOR_PARTICIPANT_TIMEOUT_SECS") {
            config.participant_timeout = timeout;
        }

        if let Some(timeout) = env_secs("COORDINATOR_LOOKUP_TIMEOUT_SECS") {
            config.lookup_timeout = timeout;
        }

        config
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.partitions.is_empty() {
            return Err("At least one partition is required".to_string());
        }

        if self.participant_timeout.is_zero() || self.lookup_timeout.is_zero() {
            return Err("Call timeouts cannot be zero".to_string());
        }

        if self.exchange.is_empty() || self.queue_prefix.is_empty() {
            return Err("Partition exchange and queue prefix cannot be empty".to_string());
        }

        self.rpc.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = CoordinatorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.participant_timeout, Duration::from_secs(10));
        assert_eq!(config.gateway_queue, "client_requests_queue");
    }

    #[test]
    fn test_invalid_config() {
        let config = CoordinatorConfig::with_partitions([]);
        assert!(config.validate().is_err());

        let mut config = CoordinatorConfig::default();
        config.participant_timeout = Duration::ZERO;
        assert!(config.validate().is_err());
    }
}
