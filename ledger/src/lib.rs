//! ShardLedger Ledger
//!
//! Account balances and the append-only journal of one partition. The
//! partition worker reads balances when voting and applies planned
//! operations atomically when a transaction commits.

pub mod account;
pub mod journal;
pub mod operation;
pub mod postgres;
pub mod store;

pub use account::Account;
pub use journal::{EntryType, LedgerEntry};
pub use operation::PlannedOp;
pub use postgres::PgLedgerStore;
pub use store::{LedgerStore, MemoryLedgerStore};
