//! Protocol message types.
//!
//! Every request is a JSON object carrying a `type` discriminator. The type
//! is matched case-insensitively; worker envelopes additionally treat any
//! type mentioning `TRANSFER` as a transfer prepare and any other type
//! containing `PREPARE` as a prepare without legs. Decoding happens once
//! at the boundary and yields a closed enum, so handlers never see raw JSON.

use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use shardledger_common::{AccountId, LedgerError, Result, TxId};

/// A message family with a fixed set of `type` discriminators.
pub trait Envelope: Serialize + DeserializeOwned {
    /// Discriminators this family understands, after normalisation.
    const TYPES: &'static [&'static str];

    /// Map an upper-cased `type` onto its canonical discriminator.
    fn normalize_type(upper: String) -> String {
        upper
    }

    /// Decode a raw body into the closed enum.
    ///
    /// Fails with `MalformedMessage` when the body is not a JSON object,
    /// has no string `type`, or lacks a required field, and with
    /// `UnknownMessageType` when the type is not one of [`Self::TYPES`].
    fn decode(body: &[u8]) -> Result<Self> {
        let mut value: Value = serde_json::from_slice(body)?;
        let object = value
            .as_object_mut()
            .ok_or_else(|| LedgerError::MalformedMessage("expected a JSON object".into()))?;

        let raw_type = object
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| LedgerError::MalformedMessage("missing 'type' field".into()))?;
        let message_type = Self::normalize_type(raw_type.trim().to_uppercase());

        if !Self::TYPES.contains(&message_type.as_str()) {
            return Err(LedgerError::UnknownMessageType(raw_type.to_string()));
        }

        object.insert("type".into(), Value::String(message_type));
        Ok(serde_json::from_value(value)?)
    }

    /// Encode to the JSON wire form.
    fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

/// Requests served by a partition worker on `worker_queue_<p>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerRequest {
    /// Phase one of a transfer: vote on the planned debit and credit.
    #[serde(rename = "PREPARE_TRANSFER")]
    PrepareTransfer {
        tx_id: TxId,
        from: AccountId,
        to: AccountId,
        amount: Decimal,
    },
    /// A prepare that carries no transfer legs. Nothing to plan.
    #[serde(rename = "PREPARE")]
    Prepare { tx_id: TxId },
    /// Apply the operations recorded for `tx_id`.
    #[serde(rename = "COMMIT")]
    Commit { tx_id: TxId },
    /// Discard the operations recorded for `tx_id`.
    #[serde(rename = "ABORT")]
    Abort { tx_id: TxId },
    /// Point balance query.
    #[serde(rename = "CONSULTAR_CUENTA")]
    QueryAccount { account: AccountId },
    /// Journal rows touching `account`, newest first.
    #[serde(rename = "CONSULTAR_HISTORIAL")]
    QueryHistory {
        account: AccountId,
        #[serde(default)]
        limit: Option<u32>,
    },
    /// Sum of the balances owned by this partition.
    #[serde(rename = "SUM_PARTITION")]
    SumPartition {},
}

impl WorkerRequest {
    /// Build a transfer prepare.
    pub fn prepare(tx_id: TxId, from: AccountId, to: AccountId, amount: Decimal) -> Self {
        WorkerRequest::PrepareTransfer {
            tx_id,
            from,
            to,
            amount,
        }
    }

    /// Canonical discriminator of this request.
    pub fn kind(&self) -> &'static str {
        match self {
            WorkerRequest::PrepareTransfer { .. } => "PREPARE_TRANSFER",
            WorkerRequest::Prepare { .. } => "PREPARE",
            WorkerRequest::Commit { .. } => "COMMIT",
            WorkerRequest::Abort { .. } => "ABORT",
            WorkerRequest::QueryAccount { .. } => "CONSULTAR_CUENTA",
            WorkerRequest::QueryHistory { .. } => "CONSULTAR_HISTORIAL",
            WorkerRequest::SumPartition {} => "SUM_PARTITION",
        }
    }

    /// Transaction this request belongs to, if any.
    pub fn tx_id(&self) -> Option<&TxId> {
        match self {
            WorkerRequest::PrepareTransfer { tx_id, .. }
            | WorkerRequest::Prepare { tx_id }
            | WorkerRequest::Commit { tx_id }
            | WorkerRequest::Abort { tx_id } => Some(tx_id),
            _ => None,
        }
    }
}

impl Envelope for WorkerRequest {
    const TYPES: &'static [&'static str] = &[
        "PREPARE_TRANSFER",
        "PREPARE",
        "COMMIT",
        "ABORT",
        "CONSULTAR_CUENTA",
        "CONSULTAR_HISTORIAL",
        "SUM_PARTITION",
    ];

    fn normalize_type(upper: String) -> String {
        if upper.contains("TRANSFER") {
            "PREPARE_TRANSFER".to_string()
        } else if upper.contains("PREPARE") {
            "PREPARE".to_string()
        } else {
            upper
        }
    }
}

/// Requests served by the identity lookup worker on `reniec_queue`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LookupRequest {
    /// Look up a national identity number.
    #[serde(rename = "VALIDAR_DNI")]
    ValidateIdentity {
        #[serde(default)]
        dni: Option<String>,
    },
}

impl Envelope for LookupRequest {
    const TYPES: &'static [&'static str] = &["VALIDAR_DNI"];
}

/// Requests accepted by the client gateway on `client_requests_queue`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientRequest {
    /// Authenticate an account holder by account number and DNI.
    #[serde(rename = "LOGIN")]
    Login { account: AccountId, dni: String },
    /// Balance query, forwarded to the owning partition.
    #[serde(rename = "CONSULTAR_CUENTA")]
    QueryAccount { account: AccountId },
    /// Recent movements of an account, forwarded to the owning partition.
    #[serde(rename = "CONSULTAR_HISTORIAL")]
    QueryHistory {
        account: AccountId,
        #[serde(default)]
        limit: Option<u32>,
    },
    /// Transfer between two accounts, driven through two-phase commit.
    #[serde(rename = "TRANSFERIR_CUENTA")]
    Transfer {
        from_account: AccountId,
        to_account: AccountId,
        amount: Decimal,
    },
    /// Loan request. Not served by this deployment.
    #[serde(rename = "SOLICITAR_PRESTAMO")]
    RequestLoan {},
    /// Identity lookup, forwarded to the lookup worker.
    #[serde(rename = "VALIDAR_DNI")]
    ValidateIdentity {
        #[serde(default)]
        dni: Option<String>,
    },
    /// Sum of every partition's balances.
    #[serde(rename = "SUM_TOTAL")]
    SumTotal {},
}

impl Envelope for ClientRequest {
    const TYPES: &'static [&'static str] = &[
        "LOGIN",
        "CONSULTAR_CUENTA",
        "CONSULTAR_HISTORIAL",
        "TRANSFERIR_CUENTA",
        "SOLICITAR_PRESTAMO",
        "VALIDAR_DNI",
        "SUM_TOTAL",
    ];
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_prepare_type_is_normalized() {
        let body = br#"{"type":"prepare_transfer","tx_id":"t1","from":1001,"to":2002,"amount":500.00}"#;
        let request = WorkerRequest::decode(body).unwrap();
        assert_eq!(
            request,
            WorkerRequest::prepare(
                TxId::from("t1"),
                AccountId::new(1001),
                AccountId::new(2002),
                dec!(500)
            )
        );

        let body = br#"{"type":"Transfer-Prepare","tx_id":"t2","from":1,"to":2,"amount":"1.50"}"#;
        assert_eq!(WorkerRequest::decode(body).unwrap().kind(), "PREPARE_TRANSFER");

        let body = br#"{"type":"transfer","tx_id":"t3","from":1,"to":2,"amount":1}"#;
        assert_eq!(WorkerRequest::decode(body).unwrap().kind(), "PREPARE_TRANSFER");

        let body = br#"{"type":"PREPARE","tx_id":"t3"}"#;
        assert_eq!(WorkerRequest::decode(body).unwrap().kind(), "PREPARE");
    }

    #[test]
    fn test_commit_and_abort_decode() {
        let commit = WorkerRequest::decode(br#"{"type":"commit","tx_id":"t1"}"#).unwrap();
        assert_eq!(commit, WorkerRequest::Commit { tx_id: TxId::from("t1") });
        let abort = WorkerRequest::decode(br#"{"type":"ABORT","tx_id":"t1"}"#).unwrap();
        assert_eq!(abort.tx_id(), Some(&TxId::from("t1")));
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let err = WorkerRequest::decode(br#"{"type":"DROP_TABLE"}"#).unwrap_err();
        assert!(matches!(err, LedgerError::UnknownMessageType(t) if t == "DROP_TABLE"));
    }

    #[test]
    fn test_malformed_payloads_are_rejected() {
        for body in [
            &b"not json"[..],
            &b"[1,2,3]"[..],
            &br#"{"tx_id":"t1"}"#[..],
            &br#"{"type":"COMMIT"}"#[..],
        ] {
            let err = WorkerRequest::decode(body).unwrap_err();
            assert!(matches!(err, LedgerError::MalformedMessage(_)), "{err}");
        }
    }

    #[test]
    fn test_prepare_rule_does_not_leak_into_client_envelope() {
        let err = ClientRequest::decode(br#"{"type":"PREPARE_TRANSFER","tx_id":"t"}"#).unwrap_err();
        assert!(matches!(err, LedgerError::UnknownMessageType(_)));
    }

    #[test]
    fn test_client_requests_decode() {
        let transfer = ClientRequest::decode(
            br#"{"type":"transferir_cuenta","from_account":1001,"to_account":2002,"amount":"25.10"}"#,
        )
        .unwrap();
        assert_eq!(
            transfer,
            ClientRequest::Transfer {
                from_account: AccountId::new(1001),
                to_account: AccountId::new(2002),
                amount: dec!(25.10),
            }
        );

        let lookup = LookupRequest::decode(br#"{"type":"VALIDAR_DNI"}"#).unwrap();
        assert_eq!(lookup, LookupRequest::ValidateIdentity { dni: None });

        let loan = ClientRequest::decode(br#"{"type":"SOLICITAR_PRESTAMO","monto":100}"#).unwrap();
        assert_eq!(loan, ClientRequest::RequestLoan {});
    }

    #[test]
    fn test_history_query_decodes_with_optional_limit() {
        let request =
            WorkerRequest::decode(br#"{"type":"consultar_historial","account":1001,"limit":5}"#)
                .unwrap();
        assert_eq!(
            request,
            WorkerRequest::QueryHistory {
                account: AccountId::new(1001),
                limit: Some(5),
            }
        );
        assert_eq!(request.kind(), "CONSULTAR_HISTORIAL");
        assert_eq!(request.tx_id(), None);

        let request = ClientRequest::decode(br#"{"type":"CONSULTAR_HISTORIAL","account":1001}"#)
            .unwrap();
        assert_eq!(
            request,
            ClientRequest::QueryHistory {
                account: AccountId::new(1001),
                limit: None,
            }
        );

        let err = ClientRequest::decode(br#"{"type":"CONSULTAR_HISTORIAL"}"#).unwrap_err();
        assert!(matches!(err, LedgerError::MalformedMessage(_)));
    }

    #[test]
    fn test_encoded_request_carries_type() {
        let body = WorkerRequest::SumPartition {}.encode().unwrap();
        let value: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(value["type"], "SUM_PARTITION");
    }
}
