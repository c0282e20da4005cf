//! Opening broker sessions with a bounded retry budget.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use shardledger_common::{time::constants, LedgerError, Result};

use crate::broker::{Broker, Channel};

/// How many times to try, and how long to wait between tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: usize,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: usize, delay: Duration) -> Self {
        Self { attempts, delay }
    }

    /// A single attempt, no waiting.
    pub fn once() -> Self {
        Self::new(1, Duration::ZERO)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(constants::CONNECT_ATTEMPTS, constants::connect_retry_delay())
    }
}

/// Open a session, retrying per `policy`. `label` names the caller in logs.
pub async fn connect_with_retry(
    broker: &dyn Broker,
    policy: &RetryPolicy,
    label: &str,
) -> Result<Arc<dyn Channel>> {
    let attempts = policy.attempts.max(1);
    let mut last_error = None;

    for attempt in 1..=attempts {
        match broker.open_channel().await {
            Ok(channel) => {
                info!(component = label, attempt, "Connected to broker");
                return Ok(channel);
            }
            Err(e) => {
                warn!(
                    component = label,
                    attempt,
                    max_attempts = attempts,
                    error = %e,
                    "Broker connection attempt failed"
                );
                last_error = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(policy.delay).await;
                }
            }
        }
    }

    Err(LedgerError::Connection(format!(
        "{label}: broker unreachable after {attempts} attempts: {}",
        last_error.map(|e| e.to_string()).unwrap_or_default()
    )))
}
