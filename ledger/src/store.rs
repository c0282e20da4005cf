//! Storage seam between the partition worker and its accounts.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tracing::debug;

use shardledger_common::{AccountId, LedgerError, Result, TxId};

use crate::account::Account;
use crate::journal::LedgerEntry;
use crate::operation::PlannedOp;

/// Point reads and atomic batch updates over the accounts of one partition.
///
/// A partition owns exactly the accounts its store has a row for.
#[async_trait]
pub trait LedgerStore: Send + Sync + 'static {
    /// Balance of `account`, or `None` when this partition does not own it.
    async fn balance(&self, account: AccountId) -> Result<Option<Decimal>>;

    /// Whether this partition owns `account`.
    async fn contains(&self, account: AccountId) -> Result<bool> {
        Ok(self.balance(account).await?.is_some())
    }

    /// Apply every operation and append one journal row per operation,
    /// all or nothing. Rows are timestamped at apply time.
    async fn apply(&self, tx_id: &TxId, ops: &[PlannedOp]) -> Result<Vec<LedgerEntry>>;

    /// Sum of the balances owned by this partition.
    async fn total_balance(&self) -> Result<Decimal>;

    /// Journal rows for `account`, oldest first.
    async fn entries(&self, account: AccountId) -> Result<Vec<LedgerEntry>>;

    /// Newest first, at most `limit` rows.
    async fn history(&self, account: AccountId, limit: usize) -> Result<Vec<LedgerEntry>> {
        let mut rows = self.entries(account).await?;
        rows.reverse();
        rows.truncate(limit);
        Ok(rows)
    }
}

#[derive(Debug, Default)]
struct MemoryState {
    accounts: BTreeMap<AccountId, Account>,
    journal: Vec<LedgerEntry>,
}

/// In-memory store. Clones share the same accounts.
#[derive(Debug, Clone, Default)]
pub struct MemoryLedgerStore {
    state: Arc<RwLock<MemoryState>>,
    unavailable: Arc<AtomicBool>,
}

impl MemoryLedgerStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store seeded with `(account, balance)` pairs.
    pub fn with_accounts(accounts: impl IntoIterator<Item = (AccountId, Decimal)>) -> Self {
        let store = Self::new();
        for (id, balance) in accounts {
            store.open_account(id, balance);
        }
        store
    }

    /// Insert or replace an account row.
    pub fn open_account(&self, id: AccountId, balance: Decimal) {
        self.state.write().accounts.insert(id, Account::new(id, balance));
    }

    /// Make every subsequent call fail with `DataAccess` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of journal rows across all accounts.
    pub fn journal_len(&self) -> usize {
        self.state.read().journal.len()
    }

    /// Snapshot of every account.
    pub fn accounts(&self) -> Vec<Account> {
        self.state.read().accounts.values().cloned().collect()
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LedgerError::DataAccess("ledger store unavailable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn balance(&self, account: AccountId) -> Result<Option<Decimal>> {
        self.check_available()?;
        Ok(self.state.read().accounts.get(&account).map(|a| a.balance))
    }

    async fn apply(&self, tx_id: &TxId, ops: &[PlannedOp]) -> Result<Vec<LedgerEntry>> {
        self.check_available()?;
        let mut state = self.state.write();

        if let Some(missing) = ops.iter().find(|op| !state.accounts.contains_key(&op.account)) {
            return Err(LedgerError::AccountNotFound(missing.account));
        }

        let now = Utc::now();
        let mut written = Vec::with_capacity(ops.len());
        for op in ops {
            if let Some(account) = state.accounts.get_mut(&op.account) {
                account.adjust(op.signed_amount(), now);
            }
            written.push(LedgerEntry::new(
                op.account,
                op.kind,
                op.amount,
                Some(tx_id.clone()),
                now,
            ));
        }
        state.journal.extend(written.iter().cloned());

        debug!(tx_id = %tx_id, entries = written.len(), "Applied operations");
        Ok(written)
    }

    async fn total_balance(&self) -> Result<Decimal> {
        self.check_available()?;
        Ok(self.state.read().accounts.values().map(|a| a.balance).sum())
    }

    async fn entries(&self, account: AccountId) -> Result<Vec<LedgerEntry>> {
        self.check_available()?;
        Ok(self
            .state
            .read()
            .journal
            .iter()
            .filter(|e| e.account == account)
            .cloned()
            .collect())
    }
}
