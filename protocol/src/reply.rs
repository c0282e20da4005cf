//! Reply envelope shared by every responder.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use shardledger_common::{LedgerError, Result, TxId};

/// Outcome carried in a reply's `status` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReplyStatus {
    /// Request served.
    Ok,
    /// Prepare vote in favour.
    Ready,
    /// Request refused or failed. `error` carries the reason.
    Error,
}

/// `{"status": ..., "error": ..., ...payload}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub status: ReplyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(flatten)]
    pub payload: Map<String, Value>,
}

impl Reply {
    fn with_status(status: ReplyStatus) -> Self {
        Self {
            status,
            error: None,
            payload: Map::new(),
        }
    }

    /// An `OK` reply with no payload.
    pub fn ok() -> Self {
        Self::with_status(ReplyStatus::Ok)
    }

    /// A `READY` vote for `tx_id`.
    pub fn ready(tx_id: &TxId) -> Self {
        Self::with_status(ReplyStatus::Ready).with("tx_id", tx_id)
    }

    /// An `ERROR` reply with a human-readable reason.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Self::with_status(ReplyStatus::Error)
        }
    }

    /// An `ERROR` vote for `tx_id`.
    pub fn vote_error(tx_id: &TxId, message: impl Into<String>) -> Self {
        Self::error(message).with("tx_id", tx_id)
    }

    /// Attach a payload field. Values that fail to serialize are stored as null.
    pub fn with(mut self, key: &str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.payload.insert(key.to_string(), value);
        self
    }

    /// Read a typed payload field.
    pub fn field<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.payload
            .get(key)
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }

    pub fn is_ok(&self) -> bool {
        self.status == ReplyStatus::Ok
    }

    pub fn is_ready(&self) -> bool {
        self.status == ReplyStatus::Ready
    }

    pub fn is_error(&self) -> bool {
        self.status == ReplyStatus::Error
    }

    /// Error reason, or an empty string when none was given.
    pub fn error_message(&self) -> &str {
        self.error.as_deref().unwrap_or("")
    }

    /// Encode to the JSON wire form.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a reply body.
    pub fn decode(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body).map_err(|e| LedgerError::MalformedMessage(e.to_string()))
    }
}

impl From<&LedgerError> for Reply {
    fn from(err: &LedgerError) -> Self {
        Reply::error(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    #[test]
    fn test_ready_reply_shape() {
        let reply = Reply::ready(&TxId::from("t1"));
        let value: Value = serde_json::from_slice(&reply.encode().unwrap()).unwrap();
        assert_eq!(value["status"], "READY");
        assert_eq!(value["tx_id"], "t1");
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_error_reply_carries_reason() {
        let reply = Reply::vote_error(&TxId::from("t1"), "insufficient funds");
        let decoded = Reply::decode(&reply.encode().unwrap()).unwrap();
        assert!(decoded.is_error());
        assert_eq!(decoded.error_message(), "insufficient funds");
        assert_eq!(decoded.field::<String>("tx_id").as_deref(), Some("t1"));
    }

    #[test]
    fn test_payload_fields_are_flat() {
        let reply = Reply::ok().with("balance", dec!(1700.00));
        let decoded = Reply::decode(br#"{"status":"OK","balance":"1700.00","account":1001}"#).unwrap();
        assert_eq!(decoded.field::<Decimal>("balance"), reply.field::<Decimal>("balance"));
        assert_eq!(decoded.field::<i64>("account"), Some(1001));
    }

    #[test]
    fn test_unknown_status_is_malformed() {
        assert!(Reply::decode(br#"{"status":"MAYBE"}"#).is_err());
        assert!(Reply::decode(b"garbage").is_err());
    }
}
