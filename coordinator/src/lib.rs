//! ShardLedger Coordinator
//!
//! Routes accounts to partitions, drives transfers through two-phase commit
//! across the partition workers, and serves client requests arriving on the
//! gateway queue. [`Cluster`] assembles a complete deployment in-process.

pub mod cluster;
pub mod config;
pub mod coordinator;
pub mod directory;
pub mod gateway;
pub mod metrics;
pub mod router;
pub mod state;

pub use cluster::{Cluster, ClusterBuilder};
pub use config::CoordinatorConfig;
pub use coordinator::{TransferCoordinator, TransferOutcome};
pub use directory::{AccountDirectory, MemoryAccountDirectory};
pub use gateway::{handle_client_request, GatewayHandle, GatewayServer};
pub use metrics::{Metrics, MetricsSnapshot, SharedMetrics};
pub use router::PartitionRouter;
pub use state::CoordinatorState;
