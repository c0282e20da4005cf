//! Worker configuration.

use std::time::Duration;

use shardledger_common::time::{constants, env_secs};
use shardledger_common::PartitionId;
use shardledger_protocol::routing::{WORKER_EXCHANGE, WORKER_QUEUE_PREFIX};
use shardledger_protocol::Route;
use shardledger_rpc::RetryPolicy;

/// How a [`WorkerServer`](crate::WorkerServer) attaches to the broker.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Queue to consume.
    pub queue: String,
    /// Exchange binding for the queue, if it is not addressed directly.
    pub binding: Option<Route>,
    /// Budget for the first connection. Exhausting it is fatal.
    pub retry: RetryPolicy,
    /// Wait between reconnection attempts once running.
    pub reconnect_delay: Duration,
    /// Interval of the housekeeping tick.
    pub sweep_interval: Duration,
}

impl ServerConfig {
    /// Consume `queue` through the default exchange.
    pub fn for_queue(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            binding: None,
            retry: RetryPolicy::default(),
            reconnect_delay: constants::reconnect_delay(),
            sweep_interval: constants::sweep_interval(),
        }
    }

    /// Also bind the queue to `route`.
    pub fn bound_to(mut self, route: Route) -> Self {
        self.binding = Some(route);
        self
    }
}

/// Partition worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Partition served by this worker.
    pub partition_id: PartitionId,
    /// Direct exchange partitions are bound to.
    pub exchange: String,
    /// Queue name prefix; the partition id is appended.
    pub queue_prefix: String,
    /// Connection attempts before startup fails.
    pub connect_attempts: usize,
    /// Delay between startup connection attempts.
    pub connect_retry_delay: Duration,
    /// Delay between reconnection attempts once running.
    pub reconnect_delay: Duration,
    /// Interval of the stale-intent check.
    pub sweep_interval: Duration,
    /// Prepared intents older than this are reported.
    pub pending_warn_after: Duration,
    /// Postgres URL of this partition's account store.
    pub database_url: Option<String>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            partition_id: PartitionId::new(1),
            exchange: WORKER_EXCHANGE.to_string(),
            queue_prefix: WORKER_QUEUE_PREFIX.to_string(),
            connect_attempts: constants::CONNECT_ATTEMPTS,
            connect_retry_delay: constants::connect_retry_delay(),
            reconnect_delay: constants::reconnect_delay(),
            sweep_interval: constants::sweep_interval(),
            pending_warn_after: constants::pending_warn_after(),
            database_url: None,
        }
    }
}

impl WorkerConfig {
    pub fn for_partition(partition_id: PartitionId) -> Self {
        Self {
            partition_id,
            ..Default::default()
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(id) = std::env::var("PARTITION_ID")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
        {
            config.partition_id = PartitionId::new(id);
        }

        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = Some(url);
        }

        if let Some(age) = env_secs("PENDING_WARN_AFTER_SECS") {
            config.pending_warn_after = age;
        }

        if let Some(interval) = env_secs("WORKER_SWEEP_INTERVAL_SECS") {
            config.sweep_interval = interval;
        }

        config
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.exchange.is_empty() {
            return Err("Worker exchange cannot be empty".to_string());
        }

        if self.queue_prefix.is_empty() {
            return Err("Queue prefix cannot be empty".to_string());
        }

        if self.connect_attempts == 0 {
            return Err("At least one connection attempt is required".to_string());
        }

        if self.sweep_interval.is_zero() {
            return Err("Sweep interval cannot be zero".to_string());
        }

        if matches!(self.database_url.as_deref(), Some("")) {
            return Err("Database URL cannot be empty".to_string());
        }

        Ok(())
    }

    /// Name of the queue this partition consumes.
    pub fn queue_name(&self) -> String {
        self.partition_id.queue_name(&self.queue_prefix)
    }

    /// Server settings: consume `queue_name()` bound to the worker exchange.
    pub fn server_config(&self) -> ServerConfig {
        let queue = self.queue_name();
        ServerConfig {
            binding: Some(Route::new(self.exchange.clone(), queue.clone())),
            queue,
            retry: RetryPolicy::new(self.connect_attempts, self.connect_retry_delay),
            reconnect_delay: self.reconnect_delay,
            sweep_interval: self.sweep_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = WorkerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.queue_name(), "worker_queue_1");
    }

    #[test]
    fn test_server_config_binds_partition_queue() {
        let config = WorkerConfig::for_partition(PartitionId::new(2));
        let server = config.server_config();
        assert_eq!(server.queue, "worker_queue_2");
        let binding = server.binding.unwrap();
        assert_eq!(binding.exchange, "worker_exchange");
        assert_eq!(binding.routing_key, "worker_queue_2");
    }

    #[test]
    fn test_invalid_config() {
        let mut config = WorkerConfig::default();
        config.sweep_interval = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = WorkerConfig::default();
        config.database_url = Some(String::new());
        assert!(config.validate().is_err());
    }
}
