//! Prepared-but-undecided transactions of one partition.
//!
//! Owned by the worker's consumption loop, so it needs no locking. An entry
//! exists between a READY vote and the COMMIT or ABORT that resolves it.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::{Duration, Instant};

use rust_decimal::Decimal;

use shardledger_common::{AccountId, TxId};
use shardledger_ledger::PlannedOp;

/// Operations a partition voted READY on.
#[derive(Debug, Clone)]
pub struct PreparedIntent {
    pub ops: Vec<PlannedOp>,
    pub prepared_at: Instant,
}

impl PreparedIntent {
    pub fn new(ops: Vec<PlannedOp>) -> Self {
        Self {
            ops,
            prepared_at: Instant::now(),
        }
    }

    pub fn age(&self) -> Duration {
        self.prepared_at.elapsed()
    }
}

#[derive(Debug, Default)]
pub struct PendingTable {
    entries: HashMap<TxId, PreparedIntent>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the intent for `tx_id`. An intent already staged under that
    /// id is kept as it is and `false` is returned.
    pub fn stage(&mut self, tx_id: TxId, ops: Vec<PlannedOp>) -> bool {
        match self.entries.entry(tx_id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(PreparedIntent::new(ops));
                true
            }
        }
    }

    pub fn get(&self, tx_id: &TxId) -> Option<&PreparedIntent> {
        self.entries.get(tx_id)
    }

    pub fn remove(&mut self, tx_id: &TxId) -> Option<PreparedIntent> {
        self.entries.remove(tx_id)
    }

    pub fn contains(&self, tx_id: &TxId) -> bool {
        self.entries.contains_key(tx_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sum of debits against `account` promised by other prepared
    /// transactions. The balance they consume is not yet written.
    pub fn reserved_debits(&self, account: AccountId, excluding: &TxId) -> Decimal {
        self.entries
            .iter()
            .filter(|(tx_id, _)| *tx_id != excluding)
            .flat_map(|(_, intent)| intent.ops.iter())
            .filter(|op| op.is_debit() && op.account == account)
            .map(|op| op.amount)
            .sum()
    }

    /// Intents older than `older_than`, oldest first.
    pub fn stale(&self, older_than: Duration) -> Vec<(TxId, Duration)> {
        let mut stale: Vec<(TxId, Duration)> = self
            .entries
            .iter()
            .map(|(tx_id, intent)| (tx_id.clone(), intent.age()))
            .filter(|(_, age)| *age >= older_than)
            .collect();
        stale.sort_by(|a, b| b.1.cmp(&a.1));
        stale
    }
}
