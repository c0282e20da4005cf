//! Consumption loop shared by every worker.
//!
//! One loop per worker process. It decodes nothing itself: each delivery is
//! handed to a [`RequestHandler`], whose reply is published to exactly the
//! delivery's `reply_to` through the default exchange with the request's
//! `correlation_id` echoed. Every delivery is acknowledged, whether or not
//! it could be served.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, instrument, warn};

use shardledger_common::{LedgerError, Result};
use shardledger_protocol::routing::DEFAULT_EXCHANGE;
use shardledger_protocol::Reply;
use shardledger_rpc::{connect_with_retry, Broker, Channel, Consumer, Delivery, Properties, RetryPolicy};

use crate::config::ServerConfig;
use crate::state::WorkerState;

/// Serves the requests of one queue.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    /// Name used in logs.
    fn name(&self) -> String;

    /// Serve one request body. The reply is only sent when the request
    /// carried a reply address.
    async fn handle(&mut self, body: &[u8]) -> Reply;

    /// Called on every housekeeping tick.
    async fn on_tick(&mut self) {}
}

enum SessionEnd {
    Shutdown,
    Lost,
}

struct Session {
    channel: Arc<dyn Channel>,
    consumer: Consumer,
}

/// Runs a [`RequestHandler`] against a broker queue.
pub struct WorkerServer<H> {
    broker: Arc<dyn Broker>,
    config: ServerConfig,
    handler: H,
    label: String,
}

impl<H: RequestHandler> WorkerServer<H> {
    pub fn new(broker: Arc<dyn Broker>, config: ServerConfig, handler: H) -> Self {
        let label = handler.name();
        Self {
            broker,
            config,
            handler,
            label,
        }
    }

    /// Serve until `shutdown` turns true or its sender is dropped.
    ///
    /// Failing to reach the broker at startup is fatal. A session lost
    /// afterwards is re-opened every `reconnect_delay` until it succeeds.
    /// Returns the handler so callers can inspect its final state.
    #[instrument(skip_all, fields(worker = %self.label, queue = %self.config.queue))]
    pub async fn run(
        mut self,
        mut shutdown: watch::Receiver<bool>,
        state: watch::Sender<WorkerState>,
    ) -> Result<H> {
        state.send_replace(WorkerState::Starting);

        let mut session = match self.open_session(&self.config.retry).await {
            Ok(session) => session,
            Err(e) => {
                error!(error = %e, "Worker could not reach the broker");
                state.send_replace(WorkerState::Stopped);
                return Err(e);
            }
        };

        loop {
            state.send_replace(WorkerState::Running);
            info!("Worker consuming");

            match self.serve(session, &mut shutdown).await {
                SessionEnd::Shutdown => break,
                SessionEnd::Lost => {
                    warn!("Broker session lost, reconnecting");
                    state.send_replace(WorkerState::Reconnecting);
                }
            }

            session = loop {
                let delay = tokio::time::sleep(self.config.reconnect_delay);
                tokio::select! {
                    _ = wait_for_shutdown(&mut shutdown) => {
                        state.send_replace(WorkerState::Stopped);
                        return Ok(self.handler);
                    }
                    _ = delay => {}
                }

                match self.open_session(&RetryPolicy::once()).await {
                    Ok(session) => break session,
                    Err(e) => debug!(error = %e, "Reconnect attempt failed"),
                }
            };
        }

        info!("Worker stopped");
        state.send_replace(WorkerState::Stopped);
        Ok(self.handler)
    }

    /// Run on a background task.
    pub fn spawn(self) -> WorkerHandle<H> {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (state_tx, state) = watch::channel(WorkerState::Starting);
        let task = tokio::spawn(self.run(shutdown_rx, state_tx));
        WorkerHandle {
            shutdown,
            state,
            task,
        }
    }

    async fn open_session(&self, policy: &RetryPolicy) -> Result<Session> {
        let channel = connect_with_retry(self.broker.as_ref(), policy, &self.label).await?;

        channel.declare_queue(&self.config.queue, false).await?;
        if let Some(route) = &self.config.binding {
            channel.declare_exchange(&route.exchange).await?;
            channel
                .bind_queue(&self.config.queue, &route.exchange, &route.routing_key)
                .await?;
        }
        let consumer = channel.consume(&self.config.queue, false).await?;

        Ok(Session { channel, consumer })
    }

    async fn serve(&mut self, session: Session, shutdown: &mut watch::Receiver<bool>) -> SessionEnd {
        let Session {
            channel,
            mut consumer,
        } = session;

        let mut ticker = tokio::time::interval(self.config.sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            if *shutdown.borrow() {
                let _ = channel.close().await;
                return SessionEnd::Shutdown;
            }

            tokio::select! {
                _ = wait_for_shutdown(shutdown) => {
                    let _ = channel.close().await;
                    return SessionEnd::Shutdown;
                }
                _ = ticker.tick() => self.handler.on_tick().await,
                delivery = consumer.recv() => match delivery {
                    Some(delivery) => {
                        if let Err(e) = self.dispatch(channel.as_ref(), delivery).await {
                            warn!(error = %e, "Failed to complete delivery");
                            if !channel.is_open() {
                                return SessionEnd::Lost;
                            }
                        }
                    }
                    None => return SessionEnd::Lost,
                },
            }
        }
    }

    async fn dispatch(&mut self, channel: &dyn Channel, delivery: Delivery) -> Result<()> {
        if delivery.redelivered {
            debug!(delivery_tag = delivery.delivery_tag, "Serving redelivered message");
        }

        let reply = self.handler.handle(&delivery.body).await;

        match delivery.properties.reply_to.as_deref().filter(|r| !r.is_empty()) {
            Some(reply_to) => {
                channel
                    .publish(
                        DEFAULT_EXCHANGE,
                        reply_to,
                        Properties::reply_to(&delivery.properties),
                        reply.encode()?,
                    )
                    .await?;
            }
            None if reply.is_error() => {
                debug!(error = reply.error_message(), "No reply address, error dropped");
            }
            None => {}
        }

        channel.ack(delivery.delivery_tag).await
    }
}

/// Resolves once shutdown is requested or the requesting side is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        debug!("Shutdown sender dropped");
    }
}

/// Control handle for a spawned [`WorkerServer`].
pub struct WorkerHandle<H> {
    shutdown: watch::Sender<bool>,
    state: watch::Receiver<WorkerState>,
    task: JoinHandle<Result<H>>,
}

impl<H> WorkerHandle<H> {
    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn state_watch(&self) -> watch::Receiver<WorkerState> {
        self.state.clone()
    }

    /// Wait until the worker is consuming its queue.
    pub async fn wait_running(&self, timeout: Duration) -> Result<()> {
        let mut state = self.state.clone();
        let reached = tokio::time::timeout(
            timeout,
            state.wait_for(|s| matches!(s, WorkerState::Running | WorkerState::Stopped)),
        )
        .await
        .map_err(|_| LedgerError::Timeout {
            operation: "worker startup".to_string(),
            elapsed_ms: timeout.as_millis() as u64,
        })?
        .map(|s| *s)
        .map_err(|_| LedgerError::Internal("worker task ended".to_string()))?;

        match reached {
            WorkerState::Running => Ok(()),
            _ => Err(LedgerError::Connection("worker stopped during startup".to_string())),
        }
    }

    /// Stop the loop and return its handler.
    pub async fn shutdown(self) -> Result<H> {
        self.shutdown.send_replace(true);
        self.task
            .await
            .map_err(|e| LedgerError::Internal(format!("worker task failed: {e}")))?
    }
}
