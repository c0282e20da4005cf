//! Request/reply client over a broker session.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use shardledger_common::{LedgerError, Result};
use shardledger_protocol::{Reply, Route};

use crate::broker::{Broker, Channel, Consumer, Properties};
use crate::config::RpcConfig;
use crate::connection::connect_with_retry;
use crate::registry::CorrelationRegistry;

/// Client state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Not connected.
    Disconnected,
    /// Opening a session.
    Connecting,
    /// Connected and operational.
    Connected,
    /// Replacing a stale session.
    Reconnecting,
}

struct Session {
    channel: Arc<dyn Channel>,
    reply_queue: String,
    pump: JoinHandle<()>,
}

/// Publishes requests and waits for the matching replies.
///
/// Safe to share between tasks: each call waits only on its own
/// correlation slot while a background pump drains the reply queue.
pub struct RpcClient {
    config: RpcConfig,
    broker: Arc<dyn Broker>,
    registry: CorrelationRegistry,
    state: Arc<RwLock<ClientState>>,
    session: RwLock<Option<Session>>,
    call_gate: Mutex<()>,
    label: String,
}

impl RpcClient {
    /// Create a disconnected client.
    pub fn new(broker: Arc<dyn Broker>, config: RpcConfig) -> Self {
        Self {
            config,
            broker,
            registry: CorrelationRegistry::new(),
            state: Arc::new(RwLock::new(ClientState::Disconnected)),
            session: RwLock::new(None),
            call_gate: Mutex::new(()),
            label: "rpc-client".to_string(),
        }
    }

    /// Name used in logs.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Open a session, declare the private reply queue and start the pump.
    #[instrument(skip(self), fields(client = %self.label))]
    pub async fn connect(&self) -> Result<()> {
        let mut session = self.session.write().await;
        if session.as_ref().is_some_and(|s| s.channel.is_open()) {
            *self.state.write().await = ClientState::Connected;
            return Ok(());
        }

        {
            let mut state = self.state.write().await;
            if *state != ClientState::Reconnecting {
                *state = ClientState::Connecting;
            }
        }

        let opened = self.open_session().await;
        match opened {
            Ok(new_session) => {
                info!(reply_queue = %new_session.reply_queue, "RPC client connected");
                if let Some(stale) = session.replace(new_session) {
                    stale.pump.abort();
                }
                *self.state.write().await = ClientState::Connected;
                Ok(())
            }
            Err(e) => {
                *self.state.write().await = ClientState::Disconnected;
                Err(e)
            }
        }
    }

    async fn open_session(&self) -> Result<Session> {
        let channel =
            connect_with_retry(self.broker.as_ref(), &self.config.retry_policy(), &self.label)
                .await?;
        let reply_queue = channel.declare_queue("", true).await?;
        let consumer = channel.consume(&reply_queue, true).await?;
        let pump = tokio::spawn(reply_pump(consumer, self.registry.clone()));

        Ok(Session {
            channel,
            reply_queue,
            pump,
        })
    }

    /// Publish `request` to `route` and wait up to `timeout` for its reply.
    ///
    /// Fails with `Connection` when no session is open and with `Timeout`
    /// when the reply does not arrive in time. A reply that cannot be parsed
    /// becomes an `ERROR` reply.
    #[instrument(skip(self, request, route), fields(client = %self.label, route = %route))]
    pub async fn call<M: Serialize + ?Sized>(
        &self,
        request: &M,
        route: &Route,
        timeout: Duration,
    ) -> Result<Reply> {
        let _gate = if self.config.exclusive_calls {
            Some(self.call_gate.lock().await)
        } else {
            None
        };

        let (channel, reply_queue) = self.open_channel().await?;
        let body = serde_json::to_vec(request)?;

        let pending = self.registry.begin();
        let correlation_id = pending.id();
        channel
            .publish(
                &route.exchange,
                &route.routing_key,
                Properties::request(reply_queue, correlation_id.to_string()),
                body,
            )
            .await?;
        debug!(correlation_id = %correlation_id, "Request published");

        let raw = match pending.wait(timeout).await {
            Ok(raw) => raw,
            Err(LedgerError::Timeout { elapsed_ms, .. }) => {
                warn!(correlation_id = %correlation_id, elapsed_ms, "RPC call timed out");
                return Err(LedgerError::Timeout {
                    operation: format!("call to {route}"),
                    elapsed_ms,
                });
            }
            Err(e) => return Err(e),
        };

        Ok(Reply::decode(&raw).unwrap_or_else(|_| {
            Reply::error(format!(
                "Invalid reply from server: {}",
                String::from_utf8_lossy(&raw)
            ))
        }))
    }

    /// [`call`](Self::call) with the configured request timeout.
    pub async fn call_default<M: Serialize + ?Sized>(
        &self,
        request: &M,
        route: &Route,
    ) -> Result<Reply> {
        self.call(request, route, self.config.request_timeout).await
    }

    /// Fire-and-forget publish with no reply address.
    pub async fn publish<M: Serialize + ?Sized>(&self, request: &M, route: &Route) -> Result<()> {
        let (channel, _) = self.open_channel().await?;
        let body = serde_json::to_vec(request)?;
        channel
            .publish(&route.exchange, &route.routing_key, Properties::default(), body)
            .await
    }

    /// Declare a direct exchange on the current session.
    pub async fn declare_exchange(&self, name: &str) -> Result<()> {
        let (channel, _) = self.open_channel().await?;
        channel.declare_exchange(name).await
    }

    /// Whether the session is open.
    pub async fn is_connected(&self) -> bool {
        self.session
            .read()
            .await
            .as_ref()
            .is_some_and(|s| s.channel.is_open())
    }

    /// Tear the session down. Calls still waiting run into their timeout.
    #[instrument(skip(self), fields(client = %self.label))]
    pub async fn close(&self) -> Result<()> {
        if let Some(session) = self.session.write().await.take() {
            session.pump.abort();
            session.channel.close().await?;
            info!("RPC client closed");
        }
        *self.state.write().await = ClientState::Disconnected;
        Ok(())
    }

    /// Replace a stale session with a fresh one.
    pub async fn reconnect(&self) -> Result<()> {
        *self.state.write().await = ClientState::Reconnecting;
        self.close_stale().await;
        self.connect().await
    }

    /// Re-open the session if it was lost. A live session is left alone, so
    /// concurrent callers that all saw it dead open only one replacement.
    pub async fn ensure_connected(&self) -> Result<()> {
        if self.is_connected().await {
            return Ok(());
        }
        warn!(client = %self.label, "RPC session lost, reconnecting");
        *self.state.write().await = ClientState::Reconnecting;
        self.connect().await
    }

    /// Get current client state.
    pub async fn state(&self) -> ClientState {
        *self.state.read().await
    }

    /// Number of calls awaiting a reply.
    pub fn in_flight(&self) -> usize {
        self.registry.in_flight()
    }

    async fn close_stale(&self) {
        if let Some(session) = self.session.write().await.take() {
            session.pump.abort();
            if let Err(e) = session.channel.close().await {
                debug!(error = %e, "Ignoring error while closing stale session");
            }
        }
    }

    async fn open_channel(&self) -> Result<(Arc<dyn Channel>, String)> {
        match self.session.read().await.as_ref() {
            Some(s) if s.channel.is_open() => Ok((s.channel.clone(), s.reply_queue.clone())),
            _ => Err(LedgerError::Connection(
                "Not connected to broker".to_string(),
            )),
        }
    }
}

async fn reply_pump(mut consumer: Consumer, registry: CorrelationRegistry) {
    while let Some(delivery) = consumer.recv().await {
        let correlation_id = delivery.properties.correlation_id.clone();
        if !registry.resolve_raw(correlation_id.as_deref(), delivery.body) {
            debug!(
                correlation_id = correlation_id.as_deref().unwrap_or("-"),
                "Discarded reply with no waiting caller"
            );
        }
    }
    debug!("Reply pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use serde_json::json;
    use shardledger_protocol::ReplyStatus;

    fn create_test_config() -> RpcConfig {
        RpcConfig {
            request_timeout: Duration::from_secs(2),
            connect_attempts: 1,
            connect_retry_delay: Duration::from_millis(1),
            exclusive_calls: false,
        }
    }

    /// Replies to every request on `queue` with its own body wrapped in an OK
    /// reply, after an optional per-message delay taken from `delay_ms`.
    async fn spawn_echo(broker: &MemoryBroker, queue: &str) {
        let channel = broker.open_channel().await.unwrap();
        channel.declare_queue(queue, false).await.unwrap();
        let mut consumer = channel.consume(queue, false).await.unwrap();
        tokio::spawn(async move {
            while let Some(delivery) = consumer.recv().await {
                let request: serde_json::Value = serde_json::from_slice(&delivery.body).unwrap();
                let delay = request["delay_ms"].as_u64().unwrap_or(0);
                let channel = channel.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                    let reply = Reply::ok().with("echo", &request);
                    if let Some(reply_to) = delivery.properties.reply_to.clone() {
                        channel
                            .publish(
                                "",
                                &reply_to,
                                Properties::reply_to(&delivery.properties),
                                reply.encode().unwrap(),
                            )
                            .await
                            .unwrap();
                    }
                    channel.ack(delivery.delivery_tag).await.unwrap();
                });
            }
        });
    }

    #[tokio::test]
    async fn test_client_creation() {
        let client = RpcClient::new(Arc::new(MemoryBroker::new()), create_test_config());
        assert_eq!(client.state().await, ClientState::Disconnected);
        assert!(!client.is_connected().await);
    }

    #[tokio::test]
    async fn test_call_without_session_fails_fast() {
        let client = RpcClient::new(Arc::new(MemoryBroker::new()), create_test_config());
        let err = client
            .call(&json!({"type": "PING"}), &Route::queue("q"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Connection(_)));
    }

    #[tokio::test]
    async fn test_call_round_trip() {
        let broker = MemoryBroker::new();
        spawn_echo(&broker, "echo").await;

        let client = RpcClient::new(Arc::new(broker.clone()), create_test_config());
        client.connect().await.unwrap();
        assert_eq!(client.state().await, ClientState::Connected);

        let reply = client
            .call_default(&json!({"type": "PING", "n": 7}), &Route::queue("echo"))
            .await
            .unwrap();
        assert_eq!(reply.status, ReplyStatus::Ok);
        let echo: serde_json::Value = reply.field("echo").unwrap();
        assert_eq!(echo["n"], 7);
        assert_eq!(client.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_calls_get_their_own_replies() {
        let broker = MemoryBroker::new();
        spawn_echo(&broker, "echo").await;

        let client = Arc::new(RpcClient::new(Arc::new(broker.clone()), create_test_config()));
        client.connect().await.unwrap();

        // The slow call is issued first but answered last.
        let calls = (0..5u64).map(|n| {
            let client = client.clone();
            async move {
                let request = json!({"type": "PING", "n": n, "delay_ms": (5 - n) * 40});
                let reply = client.call_default(&request, &Route::queue("echo")).await.unwrap();
                let echo: serde_json::Value = reply.field("echo").unwrap();
                (n, echo["n"].as_u64().unwrap())
            }
        });

        for (sent, received) in futures::future::join_all(calls).await {
            assert_eq!(sent, received);
        }
    }

    #[tokio::test]
    async fn test_timeout_does_not_affect_other_calls() {
        let broker = MemoryBroker::new();
        spawn_echo(&broker, "echo").await;
        let quiet = broker.open_channel().await.unwrap();
        quiet.declare_queue("black_hole", false).await.unwrap();

        let client = Arc::new(RpcClient::new(Arc::new(broker.clone()), create_test_config()));
        client.connect().await.unwrap();

        let stuck = {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .call(&json!({"type": "PING"}), &Route::queue("black_hole"), Duration::from_millis(100))
                    .await
            })
        };
        let reply = client
            .call(&json!({"type": "PING"}), &Route::queue("echo"), Duration::from_secs(1))
            .await
            .unwrap();
        assert!(reply.is_ok());

        let err = stuck.await.unwrap().unwrap_err();
        assert!(matches!(err, LedgerError::Timeout { .. }));
        assert_eq!(client.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_invalid_reply_becomes_error_reply() {
        let broker = MemoryBroker::new();
        let responder = broker.open_channel().await.unwrap();
        responder.declare_queue("broken", false).await.unwrap();
        let mut consumer = responder.consume("broken", true).await.unwrap();
        tokio::spawn(async move {
            while let Some(delivery) = consumer.recv().await {
                if let Some(reply_to) = delivery.properties.reply_to.clone() {
                    let props = Properties::reply_to(&delivery.properties);
                    let _ = responder.publish("", &reply_to, props, b"<html>".to_vec()).await;
                }
            }
        });

        let client = RpcClient::new(Arc::new(broker), create_test_config());
        client.connect().await.unwrap();
        let reply = client
            .call_default(&json!({"type": "PING"}), &Route::queue("broken"))
            .await
            .unwrap();
        assert!(reply.is_error());
        assert!(reply.error_message().contains("Invalid reply"));
    }

    #[tokio::test]
    async fn test_reconnect_after_severed_session() {
        let broker = MemoryBroker::new();
        let client = RpcClient::new(Arc::new(broker.clone()), create_test_config());
        client.connect().await.unwrap();

        broker.sever_connections();
        assert!(!client.is_connected().await);

        client.reconnect().await.unwrap();
        assert!(client.is_connected().await);
        assert_eq!(client.state().await, ClientState::Connected);

        client.close().await.unwrap();
        assert_eq!(client.state().await, ClientState::Disconnected);
    }

    #[tokio::test]
    async fn test_ensure_connected_opens_one_session_after_sever() {
        let broker = MemoryBroker::new();
        let client = Arc::new(RpcClient::new(Arc::new(broker.clone()), create_test_config()));
        client.connect().await.unwrap();

        broker.sever_connections();
        assert_eq!(broker.open_channels(), 0);
        spawn_echo(&broker, "echo").await;

        let callers = (0..4).map(|_| {
            let client = client.clone();
            async move { client.ensure_connected().await }
        });
        for result in futures::future::join_all(callers).await {
            tokio_test::assert_ok!(result);
        }
        // the echo server plus one client session
        assert_eq!(broker.open_channels(), 2);
        assert_eq!(client.state().await, ClientState::Connected);

        let reply = client
            .call_default(&json!({"type": "PING"}), &Route::queue("echo"))
            .await
            .unwrap();
        assert!(reply.is_ok());
    }

    #[tokio::test]
    async fn test_ensure_connected_leaves_live_session_alone() {
        let broker = MemoryBroker::new();
        let client = RpcClient::new(Arc::new(broker.clone()), create_test_config());
        client.connect().await.unwrap();

        tokio_test::assert_ok!(client.ensure_connected().await);
        assert_eq!(broker.open_channels(), 1);
    }

    #[tokio::test]
    async fn test_exclusive_calls_still_complete() {
        let broker = MemoryBroker::new();
        spawn_echo(&broker, "echo").await;

        let config = RpcConfig {
            exclusive_calls: true,
            ..create_test_config()
        };
        let client = Arc::new(RpcClient::new(Arc::new(broker), config));
        client.connect().await.unwrap();

        let calls = (0..3).map(|n| {
            let client = client.clone();
            async move {
                client
                    .call_default(&json!({"type": "PING", "n": n}), &Route::queue("echo"))
                    .await
            }
        });
        for result in futures::future::join_all(calls).await {
            assert!(result.unwrap().is_ok());
        }
    }
}
