//! ShardLedger workers
//!
//! A partition worker owns a disjoint slice of accounts and takes part in
//! two-phase commit as a participant. The lookup worker answers identity
//! queries. Both run inside [`WorkerServer`], which owns the broker session,
//! replies through `reply_to` and reconnects when the session drops.

pub mod config;
pub mod lookup;
pub mod partition;
pub mod pending;
pub mod server;
pub mod state;

pub use config::{ServerConfig, WorkerConfig};
pub use lookup::{IdentityRecord, IdentityStore, LookupWorker, MemoryIdentityStore};
pub use partition::PartitionWorker;
pub use pending::{PendingTable, PreparedIntent};
pub use server::{RequestHandler, WorkerHandle, WorkerServer};
pub use state::WorkerState;
