//! Operations planned at vote time and applied at commit time.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use shardledger_common::AccountId;

use crate::journal::EntryType;

/// One leg of a transaction, local to a partition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedOp {
    pub kind: EntryType,
    pub account: AccountId,
    /// Unsigned amount.
    pub amount: Decimal,
}

impl PlannedOp {
    pub fn debit(account: AccountId, amount: Decimal) -> Self {
        Self {
            kind: EntryType::Debit,
            account,
            amount,
        }
    }

    pub fn credit(account: AccountId, amount: Decimal) -> Self {
        Self {
            kind: EntryType::Credit,
            account,
            amount,
        }
    }

    /// Amount to add to the account balance.
    pub fn signed_amount(&self) -> Decimal {
        self.kind.sign(self.amount)
    }

    pub fn is_debit(&self) -> bool {
        self.kind == EntryType::Debit
    }
}
