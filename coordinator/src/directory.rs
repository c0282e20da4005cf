//! Account holder directory used to authenticate logins.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use shardledger_common::{AccountId, Result};

/// Knows which identity number holds each account.
#[async_trait]
pub trait AccountDirectory: Send + Sync + 'static {
    /// DNI of the holder of `account`, or `None` for unknown accounts.
    async fn holder(&self, account: AccountId) -> Result<Option<String>>;
}

/// In-memory directory. Clones share the same entries.
#[derive(Debug, Clone, Default)]
pub struct MemoryAccountDirectory {
    holders: Arc<DashMap<AccountId, String>>,
}

impl MemoryAccountDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, account: AccountId, dni: impl Into<String>) {
        self.holders.insert(account, dni.into());
    }

    pub fn len(&self) -> usize {
        self.holders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.holders.is_empty()
    }
}

#[async_trait]
impl AccountDirectory for MemoryAccountDirectory {
    async fn holder(&self, account: AccountId) -> Result<Option<String>> {
        Ok(self.holders.get(&account).map(|h| h.value().clone()))
    }
}
