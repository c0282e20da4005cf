//! Time utilities and constants for ShardLedger.

use chrono::{DateTime, Utc};

/// Protocol timing constants.
pub mod constants {
    use std::time::Duration;

    /// Default budget for a caller-facing RPC call (30 seconds).
    pub fn request_timeout() -> Duration {
        Duration::from_secs(30)
    }

    /// Budget for coordinator-to-partition calls (10 seconds).
    pub fn participant_call_timeout() -> Duration {
        Duration::from_secs(10)
    }

    /// Broker connection attempts before giving up.
    pub const CONNECT_ATTEMPTS: usize = 5;

    /// Delay between broker connection attempts (3 seconds).
    pub fn connect_retry_delay() -> Duration {
        Duration::from_secs(3)
    }

    /// Delay before a running worker re-opens a lost session (1 second).
    pub fn reconnect_delay() -> Duration {
        Duration::from_secs(1)
    }

    /// Age after which a prepared intent is reported as stale (60 seconds).
    pub fn pending_warn_after() -> Duration {
        Duration::from_secs(60)
    }

    /// Interval of the worker's housekeeping tick (10 seconds).
    pub fn sweep_interval() -> Duration {
        Duration::from_secs(10)
    }
}

/// A timestamp with timezone (always UTC).
pub type Timestamp = DateTime<Utc>;

/// Get the current timestamp.
pub fn now() -> Timestamp {
    Utc::now()
}

/// Read a whole number of seconds from an environment variable.
pub fn env_secs(key: &str) -> Option<std::time::Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(std::time::Duration::from_secs)
}
