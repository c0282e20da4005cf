//! RPC client configuration.

use std::time::Duration;

use shardledger_common::time::{constants, env_secs};

use crate::connection::RetryPolicy;

/// Configuration for [`RpcClient`](crate::RpcClient).
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Budget used by `call_default`.
    pub request_timeout: Duration,
    /// Connection attempts before `connect` fails.
    pub connect_attempts: usize,
    /// Delay between connection attempts.
    pub connect_retry_delay: Duration,
    /// Serialize calls on the shared session, one logical call at a time.
    pub exclusive_calls: bool,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            request_timeout: constants::request_timeout(),
            connect_attempts: constants::CONNECT_ATTEMPTS,
            connect_retry_delay: constants::connect_retry_delay(),
            exclusive_calls: false,
        }
    }
}

impl RpcConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(timeout) = env_secs("RPC_REQUEST_TIMEOUT_SECS") {
            config.request_timeout = timeout;
        }

        if let Some(attempts) = std::env::var("RPC_CONNECT_ATTEMPTS")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.connect_attempts = attempts;
        }

        if let Some(delay) = env_secs("RPC_CONNECT_RETRY_DELAY_SECS") {
            config.connect_retry_delay = delay;
        }

        if let Ok(flag) = std::env::var("RPC_EXCLUSIVE_CALLS") {
            config.exclusive_calls = matches!(flag.as_str(), "1" | "true" | "yes");
        }

        config
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.request_timeout.is_zero() {
            return Err("Request timeout cannot be zero".to_string());
        }

        if self.connect_attempts == 0 {
            return Err("At least one connection attempt is required".to_string());
        }

        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.connect_attempts, self.connect_retry_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RpcConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.connect_attempts, 5);
        assert_eq!(config.connect_retry_delay, Duration::from_secs(3));
        assert!(!config.exclusive_calls);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let config = RpcConfig {
            connect_attempts: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
