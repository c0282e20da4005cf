//! In-process broker.
//!
//! Queues are unbounded channels owned by the broker. A consumer runs a
//! forwarding task that holds the queue's receiver for as long as its
//! channel is open, so a queue re-consumed after a reconnect picks up
//! where the previous session left off, including requeued messages.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Mutex as AsyncMutex};
use tracing::debug;

use shardledger_common::{LedgerError, Result};

use super::{Broker, Channel, Consumer, Delivery, Properties};

#[derive(Debug, Clone)]
struct Message {
    properties: Properties,
    body: Vec<u8>,
    redelivered: bool,
}

struct Queue {
    sender: mpsc::UnboundedSender<Message>,
    receiver: Arc<AsyncMutex<mpsc::UnboundedReceiver<Message>>>,
    /// Channel owning an exclusive queue.
    owner: Option<u64>,
}

impl Queue {
    fn new(owner: Option<u64>) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            sender,
            receiver: Arc::new(AsyncMutex::new(receiver)),
            owner,
        }
    }
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, Queue>,
    /// exchange -> routing key -> bound queues
    exchanges: HashMap<String, HashMap<String, Vec<String>>>,
    channels: HashMap<u64, Arc<ChannelShared>>,
    next_channel: u64,
    next_queue: u64,
}

struct ChannelState {
    open: bool,
    next_tag: u64,
    unacked: BTreeMap<u64, (String, Message)>,
}

struct ChannelShared {
    id: u64,
    state: Mutex<ChannelState>,
    closed: watch::Sender<bool>,
}

struct Inner {
    state: Mutex<BrokerState>,
    available: AtomicBool,
}

impl Inner {
    fn close_channel(&self, shared: &ChannelShared) {
        let unacked = {
            let mut state = shared.state.lock();
            if !state.open {
                return;
            }
            state.open = false;
            std::mem::take(&mut state.unacked)
        };
        shared.closed.send_replace(true);

        let mut broker = self.state.lock();
        broker.channels.remove(&shared.id);
        broker.queues.retain(|_, q| q.owner != Some(shared.id));
        let BrokerState {
            queues, exchanges, ..
        } = &mut *broker;
        for bindings in exchanges.values_mut() {
            for bound in bindings.values_mut() {
                bound.retain(|name| queues.contains_key(name));
            }
        }

        let requeued = unacked.len();
        for (_, (queue, mut message)) in unacked {
            message.redelivered = true;
            if let Some(q) = queues.get(&queue) {
                let _ = q.sender.send(message);
            }
        }
        debug!(channel = shared.id, requeued, "Channel closed");
    }
}

/// Broker living inside the process. Clones share the same queues.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

impl MemoryBroker {
    /// Create an empty, reachable broker.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(BrokerState::default()),
                available: AtomicBool::new(true),
            }),
        }
    }

    /// Refuse or accept new sessions.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    pub fn is_available(&self) -> bool {
        self.inner.available.load(Ordering::SeqCst)
    }

    /// Close every open session as if the connection dropped.
    pub fn sever_connections(&self) {
        let channels: Vec<Arc<ChannelShared>> =
            self.inner.state.lock().channels.values().cloned().collect();
        for channel in channels {
            self.inner.close_channel(&channel);
        }
    }

    /// Whether a queue with this name exists.
    pub fn has_queue(&self, name: &str) -> bool {
        self.inner.state.lock().queues.contains_key(name)
    }

    /// Number of open sessions.
    pub fn open_channels(&self) -> usize {
        self.inner.state.lock().channels.len()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn open_channel(&self) -> Result<Arc<dyn Channel>> {
        if !self.is_available() {
            return Err(LedgerError::Connection("broker unavailable".to_string()));
        }

        let shared = {
            let mut state = self.inner.state.lock();
            state.next_channel += 1;
            let (closed, _) = watch::channel(false);
            let shared = Arc::new(ChannelShared {
                id: state.next_channel,
                state: Mutex::new(ChannelState {
                    open: true,
                    next_tag: 0,
                    unacked: BTreeMap::new(),
                }),
                closed,
            });
            state.channels.insert(shared.id, shared.clone());
            shared
        };

        Ok(Arc::new(MemoryChannel {
            broker: self.inner.clone(),
            shared,
        }))
    }
}

/// Session on a [`MemoryBroker`]. Dropping it closes the session.
pub struct MemoryChannel {
    broker: Arc<Inner>,
    shared: Arc<ChannelShared>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(LedgerError::Connection("channel closed".to_string()))
        }
    }
}

impl Drop for MemoryChannel {
    fn drop(&mut self) {
        self.broker.close_channel(&self.shared);
    }
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn declare_exchange(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        self.broker
            .state
            .lock()
            .exchanges
            .entry(name.to_string())
            .or_default();
        Ok(())
    }

    async fn declare_queue(&self, name: &str, exclusive: bool) -> Result<String> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock();

        let name = if name.is_empty() {
            state.next_queue += 1;
            format!("amq.gen-{}-{}", self.shared.id, state.next_queue)
        } else {
            name.to_string()
        };

        match state.queues.get(&name) {
            Some(queue) if queue.owner.is_some() && queue.owner != Some(self.shared.id) => {
                Err(LedgerError::Connection(format!(
                    "queue '{name}' is exclusive to another session"
                )))
            }
            Some(_) => Ok(name),
            None => {
                let owner = exclusive.then_some(self.shared.id);
                state.queues.insert(name.clone(), Queue::new(owner));
                Ok(name)
            }
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;
        let mut state = self.broker.state.lock();
        if !state.queues.contains_key(queue) {
            return Err(LedgerError::Internal(format!("queue '{queue}' not declared")));
        }
        let bindings = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| LedgerError::Internal(format!("exchange '{exchange}' not declared")))?;
        let bound = bindings.entry(routing_key.to_string()).or_default();
        if !bound.iter().any(|q| q == queue) {
            bound.push(queue.to_string());
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: Properties,
        body: Vec<u8>,
    ) -> Result<()> {
        self.ensure_open()?;
        let state = self.broker.state.lock();

        let targets: Vec<&Queue> = if exchange.is_empty() {
            state.queues.get(routing_key).into_iter().collect()
        } else {
            let bindings = state.exchanges.get(exchange).ok_or_else(|| {
                LedgerError::Internal(format!("exchange '{exchange}' not declared"))
            })?;
            bindings
                .get(routing_key)
                .map(|names| names.iter().filter_map(|n| state.queues.get(n)).collect())
                .unwrap_or_default()
        };

        if targets.is_empty() {
            debug!(exchange, routing_key, "Unroutable message dropped");
        }
        for queue in targets {
            let _ = queue.sender.send(Message {
                properties: properties.clone(),
                body: body.clone(),
                redelivered: false,
            });
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, auto_ack: bool) -> Result<Consumer> {
        self.ensure_open()?;
        let (receiver, requeue) = {
            let state = self.broker.state.lock();
            let q = state
                .queues
                .get(queue)
                .ok_or_else(|| LedgerError::Internal(format!("queue '{queue}' not declared")))?;
            (q.receiver.clone(), q.sender.clone())
        };

        let (out, consumer) = mpsc::unbounded_channel();
        tokio::spawn(forward(
            self.shared.clone(),
            queue.to_string(),
            receiver,
            requeue,
            out,
            auto_ack,
        ));
        Ok(consumer)
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.shared.state.lock().unacked.remove(&delivery_tag);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.shared.state.lock().open
    }

    async fn close(&self) -> Result<()> {
        self.broker.close_channel(&self.shared);
        Ok(())
    }
}

async fn forward(
    shared: Arc<ChannelShared>,
    queue: String,
    receiver: Arc<AsyncMutex<mpsc::UnboundedReceiver<Message>>>,
    requeue: mpsc::UnboundedSender<Message>,
    out: mpsc::UnboundedSender<Delivery>,
    auto_ack: bool,
) {
    let mut closed = shared.closed.subscribe();

    let mut source = tokio::select! {
        guard = receiver.lock() => guard,
        _ = closed.wait_for(|c| *c) => return,
        _ = out.closed() => return,
    };

    loop {
        let message = tokio::select! {
            message = source.recv() => match message {
                Some(message) => message,
                None => return,
            },
            _ = closed.wait_for(|c| *c) => return,
            _ = out.closed() => return,
        };

        let delivery_tag = {
            let mut state = shared.state.lock();
            if !state.open {
                let _ = requeue.send(message);
                return;
            }
            state.next_tag += 1;
            let tag = state.next_tag;
            if !auto_ack {
                state.unacked.insert(tag, (queue.clone(), message.clone()));
            }
            tag
        };

        let delivery = Delivery {
            delivery_tag,
            redelivered: message.redelivered,
            properties: message.properties,
            body: message.body,
        };

        if let Err(mpsc::error::SendError(delivery)) = out.send(delivery) {
            shared.state.lock().unacked.remove(&delivery_tag);
            let _ = requeue.send(Message {
                properties: delivery.properties,
                body: delivery.body,
                redelivered: delivery.redelivered,
            });
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn next(consumer: &mut Consumer) -> Option<Delivery> {
        tokio::time::timeout(Duration::from_secs(1), consumer.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_default_exchange_routes_by_queue_name() {
        let broker = MemoryBroker::new();
        let channel = broker.open_channel().await.unwrap();
        channel.declare_queue("reniec_queue", false).await.unwrap();
        let mut consumer = channel.consume("reniec_queue", true).await.unwrap();

        channel
            .publish("", "reniec_queue", Properties::request("r", "c1"), b"hello".to_vec())
            .await
            .unwrap();

        let delivery = next(&mut consumer).await.unwrap();
        assert_eq!(delivery.body, b"hello");
        assert_eq!(delivery.properties.correlation_id.as_deref(), Some("c1"));
        assert!(!delivery.redelivered);
    }

    #[tokio::test]
    async fn test_direct_exchange_uses_bindings() {
        let broker = MemoryBroker::new();
        let channel = broker.open_channel().await.unwrap();
        channel.declare_exchange("worker_exchange").await.unwrap();
        channel.declare_queue("worker_queue_1", false).await.unwrap();
        channel
            .bind_queue("worker_queue_1", "worker_exchange", "worker_queue_1")
            .await
            .unwrap();
        let mut consumer = channel.consume("worker_queue_1", true).await.unwrap();

        channel
            .publish("worker_exchange", "worker_queue_2", Properties::default(), b"lost".to_vec())
            .await
            .unwrap();
        channel
            .publish("worker_exchange", "worker_queue_1", Properties::default(), b"kept".to_vec())
            .await
            .unwrap();

        assert_eq!(next(&mut consumer).await.unwrap().body, b"kept");
    }

    #[tokio::test]
    async fn test_exclusive_queue_is_deleted_with_channel() {
        let broker = MemoryBroker::new();
        let channel = broker.open_channel().await.unwrap();
        let name = channel.declare_queue("", true).await.unwrap();
        assert!(name.starts_with("amq.gen-"));
        assert!(broker.has_queue(&name));

        let other = broker.open_channel().await.unwrap();
        tokio_test::assert_err!(other.declare_queue(&name, true).await);

        channel.close().await.unwrap();
        assert!(!broker.has_queue(&name));
        assert!(!channel.is_open());
    }

    #[tokio::test]
    async fn test_unacked_delivery_is_redelivered() {
        let broker = MemoryBroker::new();
        let publisher = broker.open_channel().await.unwrap();
        publisher.declare_queue("work", false).await.unwrap();

        let first = broker.open_channel().await.unwrap();
        let mut consumer = first.consume("work", false).await.unwrap();
        publisher
            .publish("", "work", Properties::default(), b"job".to_vec())
            .await
            .unwrap();
        let delivery = next(&mut consumer).await.unwrap();
        assert!(!delivery.redelivered);
        drop(first);

        let second = broker.open_channel().await.unwrap();
        let mut consumer = second.consume("work", false).await.unwrap();
        let delivery = next(&mut consumer).await.unwrap();
        assert_eq!(delivery.body, b"job");
        assert!(delivery.redelivered);

        second.ack(delivery.delivery_tag).await.unwrap();
        second.close().await.unwrap();

        let third = broker.open_channel().await.unwrap();
        let mut consumer = third.consume("work", false).await.unwrap();
        assert!(next(&mut consumer).await.is_none());
    }

    #[tokio::test]
    async fn test_outage_refuses_sessions_and_severs_consumers() {
        let broker = MemoryBroker::new();
        let channel = broker.open_channel().await.unwrap();
        channel.declare_queue("q", false).await.unwrap();
        let mut consumer = channel.consume("q", true).await.unwrap();

        broker.set_available(false);
        broker.sever_connections();

        assert!(consumer.recv().await.is_none());
        assert!(!channel.is_open());
        assert!(channel
            .publish("", "q", Properties::default(), Vec::new())
            .await
            .is_err());
        assert!(matches!(
            broker.open_channel().await,
            Err(LedgerError::Connection(_))
        ));

        broker.set_available(true);
        assert!(broker.open_channel().await.is_ok());
    }
}
