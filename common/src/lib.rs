//! ShardLedger Common Types
//!
//! Identifiers, the shared error taxonomy and protocol timing constants used
//! by every ShardLedger crate.

pub mod error;
pub mod identifiers;
pub mod time;

pub use error::*;
pub use identifiers::*;
pub use time::*;
