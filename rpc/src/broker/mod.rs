//! Broker abstraction.
//!
//! Models the subset of an AMQP-style broker the ledger relies on: a
//! default exchange that routes by queue name, direct exchanges with
//! bindings, exclusive auto-named queues, and manual acknowledgement with
//! redelivery of unacknowledged messages when a channel goes away.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use shardledger_common::Result;

mod memory;

pub use memory::MemoryBroker;

/// Message properties used for request/reply pairing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Properties {
    /// Queue the responder must publish its reply to.
    pub reply_to: Option<String>,
    /// Token echoed verbatim in the reply.
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
}

impl Properties {
    /// Properties of a request expecting a reply.
    pub fn request(reply_to: impl Into<String>, correlation_id: impl Into<String>) -> Self {
        Self {
            reply_to: Some(reply_to.into()),
            correlation_id: Some(correlation_id.into()),
            content_type: Some("application/json".to_string()),
        }
    }

    /// Properties of a reply to `request`.
    pub fn reply_to(request: &Properties) -> Self {
        Self {
            reply_to: None,
            correlation_id: request.correlation_id.clone(),
            content_type: Some("application/json".to_string()),
        }
    }
}

/// A message handed to a consumer.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Channel-scoped tag used to acknowledge this delivery.
    pub delivery_tag: u64,
    /// Set when the message was delivered before and never acknowledged.
    pub redelivered: bool,
    pub properties: Properties,
    pub body: Vec<u8>,
}

/// Stream of deliveries. Ends when the channel closes or the session is lost.
pub type Consumer = mpsc::UnboundedReceiver<Delivery>;

/// One session with the broker.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Declare a direct exchange. Idempotent.
    async fn declare_exchange(&self, name: &str) -> Result<()>;

    /// Declare a queue and return its name. An empty name asks the broker
    /// for a fresh one. Exclusive queues are deleted with their channel.
    async fn declare_queue(&self, name: &str, exclusive: bool) -> Result<String>;

    /// Route messages published to `exchange` with `routing_key` into `queue`.
    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Publish a message. An empty exchange name is the default exchange.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: Properties,
        body: Vec<u8>,
    ) -> Result<()>;

    /// Start consuming `queue`.
    async fn consume(&self, queue: &str, auto_ack: bool) -> Result<Consumer>;

    /// Acknowledge a delivery received on this channel.
    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    /// Whether the session is still usable.
    fn is_open(&self) -> bool;

    /// Close the session. Unacknowledged deliveries are requeued.
    async fn close(&self) -> Result<()>;
}

/// Factory for broker sessions.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a new session, failing with `Connection` when unreachable.
    async fn open_channel(&self) -> Result<Arc<dyn Channel>>;
}
