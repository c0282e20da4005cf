//! Client-facing gateway on `client_requests_queue`.
//!
//! Every request is served on its own task so the consumption loop never
//! waits on a partition. Replies go to the request's `reply_to` with its
//! `correlation_id` echoed, exactly as the workers do.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, instrument, warn};

use shardledger_common::time::constants;
use shardledger_common::{LedgerError, Result};
use shardledger_protocol::routing::DEFAULT_EXCHANGE;
use shardledger_protocol::{ClientRequest, Envelope, Reply};
use shardledger_rpc::{connect_with_retry, Broker, Channel, Consumer, Delivery, Properties, RetryPolicy};

use crate::coordinator::{TransferCoordinator, TransferOutcome};
use crate::state::CoordinatorState;

/// Serve one client request body.
pub async fn handle_client_request(coordinator: &TransferCoordinator, body: &[u8]) -> Reply {
    let request = match ClientRequest::decode(body) {
        Ok(request) => request,
        Err(e) => {
            warn!(error = %e, "Rejected client message");
            return Reply::from(&e);
        }
    };

    let result = match request {
        ClientRequest::Login { account, dni } => coordinator.login(account, &dni).await,
        ClientRequest::QueryAccount { account } => coordinator.balance(account).await,
        ClientRequest::QueryHistory { account, limit } => {
            coordinator.history(account, limit).await
        }
        ClientRequest::Transfer {
            from_account,
            to_account,
            amount,
        } => coordinator
            .transfer(from_account, to_account, amount)
            .await
            .map(|outcome| match outcome {
                TransferOutcome::Committed { tx_id } => Reply::ok()
                    .with("message", "transfer completed")
                    .with("tx_id", &tx_id),
                TransferOutcome::Aborted { tx_id, reason } => {
                    Reply::error(reason).with("tx_id", &tx_id)
                }
            }),
        ClientRequest::RequestLoan {} => Ok(Reply::error(
            "loan requests are not served by this deployment",
        )),
        ClientRequest::ValidateIdentity { dni } => coordinator.validate_identity(dni).await,
        ClientRequest::SumTotal {} => coordinator
            .total_balance()
            .await
            .map(|sum| Reply::ok().with("sum", sum)),
    };

    result.unwrap_or_else(|e| Reply::from(&e))
}

/// Consumes client requests and answers them through the coordinator.
pub struct GatewayServer {
    broker: Arc<dyn Broker>,
    coordinator: Arc<TransferCoordinator>,
    queue: String,
    retry: RetryPolicy,
    reconnect_delay: Duration,
    drain_timeout: Duration,
}

enum SessionEnd {
    /// Carries the channel so in-flight replies can still be sent.
    Shutdown(Arc<dyn Channel>),
    Lost,
}

impl GatewayServer {
    pub fn new(
        broker: Arc<dyn Broker>,
        coordinator: Arc<TransferCoordinator>,
        queue: impl Into<String>,
    ) -> Self {
        Self {
            broker,
            coordinator,
            queue: queue.into(),
            retry: RetryPolicy::default(),
            reconnect_delay: constants::reconnect_delay(),
            drain_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy, reconnect_delay: Duration) -> Self {
        self.retry = retry;
        self.reconnect_delay = reconnect_delay;
        self
    }

    /// Serve until `shutdown` turns true. Startup connection failure is
    /// fatal; a session lost later is re-opened.
    #[instrument(skip_all, fields(queue = %self.queue))]
    pub async fn run(
        self,
        mut shutdown: watch::Receiver<bool>,
        state: watch::Sender<CoordinatorState>,
    ) -> Result<()> {
        state.send_replace(CoordinatorState::Starting);
        let mut tasks = JoinSet::new();

        let mut session = match self.open_session(&self.retry).await {
            Ok(session) => session,
            Err(e) => {
                error!(error = %e, "Gateway could not reach the broker");
                state.send_replace(CoordinatorState::Stopped);
                return Err(e);
            }
        };

        loop {
            state.send_replace(CoordinatorState::Running);
            info!("Gateway consuming client requests");

            match self.serve(session, &mut tasks, &mut shutdown).await {
                SessionEnd::Shutdown(channel) => {
                    state.send_replace(CoordinatorState::ShuttingDown);
                    self.drain(&mut tasks).await;
                    let _ = channel.close().await;
                    break;
                }
                SessionEnd::Lost => {
                    warn!("Gateway session lost, reconnecting");
                    state.send_replace(CoordinatorState::Reconnecting);
                }
            }

            session = loop {
                tokio::select! {
                    _ = wait_for_shutdown(&mut shutdown) => {
                        state.send_replace(CoordinatorState::ShuttingDown);
                        self.drain(&mut tasks).await;
                        state.send_replace(CoordinatorState::Stopped);
                        return Ok(());
                    }
                    _ = tokio::time::sleep(self.reconnect_delay) => {}
                }
                match self.open_session(&RetryPolicy::once()).await {
                    Ok(session) => break session,
                    Err(e) => debug!(error = %e, "Gateway reconnect attempt failed"),
                }
            };

            // The coordinator's own session went down with ours.
            if let Err(e) = self.coordinator.client().ensure_connected().await {
                warn!(error = %e, "Coordinator client still disconnected");
            }
        }

        state.send_replace(CoordinatorState::Stopped);
        info!("Gateway stopped");
        Ok(())
    }

    /// Run on a background task.
    pub fn spawn(self) -> GatewayHandle {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (state_tx, state) = watch::channel(CoordinatorState::Starting);
        let task = tokio::spawn(self.run(shutdown_rx, state_tx));
        GatewayHandle {
            shutdown,
            state,
            task,
        }
    }

    async fn open_session(&self, policy: &RetryPolicy) -> Result<(Arc<dyn Channel>, Consumer)> {
        let channel = connect_with_retry(self.broker.as_ref(), policy, "gateway").await?;
        channel.declare_queue(&self.queue, false).await?;
        let consumer = channel.consume(&self.queue, false).await?;
        Ok((channel, consumer))
    }

    async fn serve(
        &self,
        (channel, mut consumer): (Arc<dyn Channel>, Consumer),
        tasks: &mut JoinSet<()>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        loop {
            tokio::select! {
                _ = wait_for_shutdown(shutdown) => return SessionEnd::Shutdown(channel),
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "Request task failed");
                    }
                }
                delivery = consumer.recv() => match delivery {
                    Some(delivery) => {
                        self.coordinator.metrics().request_received();
                        tasks.spawn(serve_request(
                            self.coordinator.clone(),
                            channel.clone(),
                            delivery,
                        ));
                    }
                    None => return SessionEnd::Lost,
                },
            }
        }
    }

    async fn drain(&self, tasks: &mut JoinSet<()>) {
        if tasks.is_empty() {
            return;
        }
        info!(in_flight = tasks.len(), "Waiting for in-flight requests");
        let drained = tokio::time::timeout(self.drain_timeout, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(abandoned = tasks.len(), "Drain timed out");
            tasks.abort_all();
        }
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        debug!("Shutdown sender dropped");
    }
}

async fn serve_request(
    coordinator: Arc<TransferCoordinator>,
    channel: Arc<dyn Channel>,
    delivery: Delivery,
) {
    let reply = handle_client_request(&coordinator, &delivery.body).await;
    if reply.is_error() {
        coordinator.metrics().request_failed();
    }

    if let Some(reply_to) = delivery.properties.reply_to.as_deref().filter(|r| !r.is_empty()) {
        let sent = match reply.encode() {
            Ok(body) => {
                channel
                    .publish(
                        DEFAULT_EXCHANGE,
                        reply_to,
                        Properties::reply_to(&delivery.properties),
                        body,
                    )
                    .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            warn!(error = %e, "Failed to send client reply");
        }
    }

    if let Err(e) = channel.ack(delivery.delivery_tag).await {
        debug!(error = %e, "Ack failed");
    }
}

/// Control handle for a spawned [`GatewayServer`].
pub struct GatewayHandle {
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<CoordinatorState>,
    task: JoinHandle<Result<()>>,
}

impl GatewayHandle {
    pub fn state(&self) -> CoordinatorState {
        *self.state.borrow()
    }

    /// Wait until the gateway is consuming.
    pub async fn wait_running(&self, timeout: Duration) -> Result<()> {
        let mut state = self.state.clone();
        let reached = tokio::time::timeout(
            timeout,
            state.wait_for(|s| matches!(s, CoordinatorState::Running | CoordinatorState::Stopped)),
        )
        .await
        .map_err(|_| LedgerError::Timeout {
            operation: "gateway startup".to_string(),
            elapsed_ms: timeout.as_millis() as u64,
        })?
        .map(|s| *s)
        .map_err(|_| LedgerError::Internal("gateway task ended".to_string()))?;

        if reached.accepts_requests() {
            Ok(())
        } else {
            Err(LedgerError::Connection("gateway stopped during startup".to_string()))
        }
    }

    /// Stop taking requests, let those in flight finish, and stop.
    pub async fn shutdown(self) -> Result<()> {
        self.shutdown.send_replace(true);
        self.task
            .await
            .map_err(|e| LedgerError::Internal(format!("gateway task failed: {e}")))?
    }
}
