//! Queue and exchange naming.

use shardledger_common::PartitionId;

/// Direct exchange the partition queues are bound to.
pub const WORKER_EXCHANGE: &str = "worker_exchange";
/// Prefix of a partition's queue name and routing key.
pub const WORKER_QUEUE_PREFIX: &str = "worker_queue_";
/// Queue consumed by the identity lookup worker.
pub const LOOKUP_QUEUE: &str = "reniec_queue";
/// Queue consumed by the client gateway.
pub const CLIENT_REQUEST_QUEUE: &str = "client_requests_queue";
/// The broker's default exchange routes by queue name.
pub const DEFAULT_EXCHANGE: &str = "";

/// Where a request is published.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    pub exchange: String,
    pub routing_key: String,
}

impl Route {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }

    /// Publish straight to a named queue through the default exchange.
    pub fn queue(name: impl Into<String>) -> Self {
        Self::new(DEFAULT_EXCHANGE, name)
    }

    /// Route to a partition through the worker exchange.
    pub fn partition(partition: PartitionId) -> Self {
        Self::new(WORKER_EXCHANGE, partition.queue_name(WORKER_QUEUE_PREFIX))
    }

    /// Route to the identity lookup worker.
    pub fn lookup() -> Self {
        Self::queue(LOOKUP_QUEUE)
    }

    /// Route to the client gateway.
    pub fn gateway() -> Self {
        Self::queue(CLIENT_REQUEST_QUEUE)
    }
}

impl std::fmt::Display for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.exchange.is_empty() {
            write!(f, "{}", self.routing_key)
        } else {
            write!(f, "{}/{}", self.exchange, self.routing_key)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_route() {
        let route = Route::partition(PartitionId::new(1));
        assert_eq!(route.exchange, "worker_exchange");
        assert_eq!(route.routing_key, "worker_queue_1");
        assert_eq!(route.to_string(), "worker_exchange/worker_queue_1");
    }

    #[test]
    fn test_lookup_route_uses_default_exchange() {
        assert_eq!(Route::lookup(), Route::new("", "reniec_queue"));
    }
}
