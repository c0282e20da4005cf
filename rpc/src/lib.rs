//! ShardLedger RPC
//!
//! Request/reply over a broker that only offers one-way, at-least-once
//! delivery. Each call publishes with a `reply_to` queue and a fresh
//! correlation id; a dedicated pump task routes replies back to the
//! waiting caller through the [`CorrelationRegistry`].

pub mod broker;
pub mod client;
pub mod config;
pub mod connection;
pub mod registry;

pub use broker::{Broker, Channel, Consumer, Delivery, MemoryBroker, Properties};
pub use client::{ClientState, RpcClient};
pub use config::RpcConfig;
pub use connection::{connect_with_retry, RetryPolicy};
pub use registry::{CorrelationRegistry, PendingReply};
