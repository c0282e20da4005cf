//! ShardLedger Protocol Messages
//!
//! JSON envelopes exchanged between callers, the coordinator and the
//! ledger workers, together with the reply envelope and the queue
//! routing conventions shared by every component.

pub mod messages;
pub mod reply;
pub mod routing;

pub use messages::*;
pub use reply::{Reply, ReplyStatus};
pub use routing::Route;
