//! Identity lookup worker.
//!
//! Answers `VALIDAR_DNI` against a registry of people keyed by national
//! identity number.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use shardledger_common::Result;
use shardledger_protocol::{Envelope, LookupRequest, Reply};

use crate::server::RequestHandler;

/// A person as held by the identity registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub dni: String,
    pub nombres: String,
    pub apellido_paterno: String,
    pub apellido_materno: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fecha_nacimiento: Option<NaiveDate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sexo: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direccion: Option<String>,
}

impl IdentityRecord {
    pub fn new(
        dni: impl Into<String>,
        nombres: impl Into<String>,
        apellido_paterno: impl Into<String>,
        apellido_materno: impl Into<String>,
    ) -> Self {
        Self {
            dni: dni.into(),
            nombres: nombres.into(),
            apellido_paterno: apellido_paterno.into(),
            apellido_materno: apellido_materno.into(),
            fecha_nacimiento: None,
            sexo: None,
            direccion: None,
        }
    }

    /// Given names followed by both surnames.
    pub fn full_name(&self) -> String {
        format!(
            "{} {} {}",
            self.nombres, self.apellido_paterno, self.apellido_materno
        )
    }
}

/// Source of identity records.
#[async_trait]
pub trait IdentityStore: Send + Sync + 'static {
    async fn find(&self, dni: &str) -> Result<Option<IdentityRecord>>;
}

/// In-memory registry. Clones share the same records.
#[derive(Debug, Clone, Default)]
pub struct MemoryIdentityStore {
    records: Arc<DashMap<String, IdentityRecord>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_records(records: impl IntoIterator<Item = IdentityRecord>) -> Self {
        let store = Self::new();
        for record in records {
            store.insert(record);
        }
        store
    }

    pub fn insert(&self, record: IdentityRecord) {
        self.records.insert(record.dni.clone(), record);
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl IdentityStore for MemoryIdentityStore {
    async fn find(&self, dni: &str) -> Result<Option<IdentityRecord>> {
        Ok(self.records.get(dni).map(|r| r.value().clone()))
    }
}

/// Serves identity lookups on the lookup queue.
pub struct LookupWorker {
    store: Arc<dyn IdentityStore>,
}

impl LookupWorker {
    pub fn new(store: Arc<dyn IdentityStore>) -> Self {
        Self { store }
    }

    pub async fn validate(&self, dni: Option<&str>) -> Reply {
        let Some(dni) = dni.map(str::trim).filter(|d| !d.is_empty()) else {
            return Reply::error("dni not provided");
        };

        match self.store.find(dni).await {
            Ok(Some(record)) => {
                debug!(dni, "Identity found");
                Reply::ok().with("data", &record)
            }
            Ok(None) => Reply::error("dni not found"),
            Err(e) => Reply::from(&e),
        }
    }
}

#[async_trait]
impl RequestHandler for LookupWorker {
    fn name(&self) -> String {
        "identity-lookup".to_string()
    }

    async fn handle(&mut self, body: &[u8]) -> Reply {
        match LookupRequest::decode(body) {
            Ok(LookupRequest::ValidateIdentity { dni }) => self.validate(dni.as_deref()).await,
            Err(e) => {
                warn!(error = %e, "Rejected lookup message");
                Reply::from(&e)
            }
        }
    }
}
