//! Error types for ShardLedger.

use crate::AccountId;
use rust_decimal::Decimal;
use thiserror::Error;

/// Main error type for ShardLedger operations.
#[derive(Error, Debug)]
pub enum LedgerError {
    /// Broker unreachable or session closed.
    #[error("Connection error: {0}")]
    Connection(String),

    /// No reply within the caller's budget. The request may or may not
    /// have been processed.
    #[error("Operation timed out after {elapsed_ms}ms: {operation}")]
    Timeout { operation: String, elapsed_ms: u64 },

    /// PREPARE refused because the source account cannot cover the amount.
    #[error("Insufficient funds in account {account}: required {required}, available {available}")]
    InsufficientFunds {
        account: AccountId,
        required: Decimal,
        available: Decimal,
    },

    /// PREPARE refused for any other business reason.
    #[error("Vote refused: {0}")]
    VoteRefused(String),

    /// Account is not owned by this partition.
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    /// Underlying store failure.
    #[error("Data access error: {0}")]
    DataAccess(String),

    /// Payload could not be decoded.
    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    /// Payload decoded but its `type` is not one this endpoint serves.
    #[error("Unknown message type: {0}")]
    UnknownMessageType(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    /// Transport-level failures the caller may retry after reconnecting.
    pub fn is_retryable(&self) -> bool {
        matches!(self, LedgerError::Connection(_) | LedgerError::Timeout { .. })
    }

    /// Business outcomes of a PREPARE vote. Never retried automatically.
    pub fn is_vote_refusal(&self) -> bool {
        matches!(
            self,
            LedgerError::InsufficientFunds { .. }
                | LedgerError::VoteRefused(_)
                | LedgerError::AccountNotFound(_)
        )
    }

    /// Get error code for logs and replies.
    pub fn error_code(&self) -> &'static str {
        match self {
            LedgerError::Connection(_) => "CONNECTION_ERROR",
            LedgerError::Timeout { .. } => "TIMEOUT",
            LedgerError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            LedgerError::VoteRefused(_) => "VOTE_REFUSED",
            LedgerError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            LedgerError::DataAccess(_) => "DATA_ACCESS_ERROR",
            LedgerError::MalformedMessage(_) => "MALFORMED_MESSAGE",
            LedgerError::UnknownMessageType(_) => "UNKNOWN_MESSAGE_TYPE",
            LedgerError::Configuration(_) => "CONFIGURATION_ERROR",
            LedgerError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        LedgerError::MalformedMessage(err.to_string())
    }
}

/// Result type alias for ShardLedger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;
