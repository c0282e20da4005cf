//! Journal entries written when a transaction commits.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use shardledger_common::{AccountId, TxId};

/// Type of journal entry, stored under its ledger name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryType {
    /// Money leaving the account. Signed amount is negative.
    #[serde(rename = "DEBITO")]
    Debit,
    /// Money entering the account. Signed amount is positive.
    #[serde(rename = "CREDITO")]
    Credit,
}

impl EntryType {
    /// Name stored in the `tipo_transaccion` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryType::Debit => "DEBITO",
            EntryType::Credit => "CREDITO",
        }
    }

    /// Sign applied to an amount of this kind.
    pub fn sign(&self, amount: Decimal) -> Decimal {
        match self {
            EntryType::Debit => -amount,
            EntryType::Credit => amount,
        }
    }
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntryType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "DEBITO" => Ok(EntryType::Debit),
            "CREDITO" => Ok(EntryType::Credit),
            other => Err(format!("unknown entry type: {other}")),
        }
    }
}

/// A single persisted journal row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Account affected.
    pub account: AccountId,
    /// Debit or credit.
    pub entry_type: EntryType,
    /// Signed amount: negative for debits, positive for credits.
    pub amount: Decimal,
    /// Transaction that produced this row, when known.
    pub tx_id: Option<TxId>,
    /// Commit time.
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Build the row for an unsigned `amount` of the given kind.
    pub fn new(
        account: AccountId,
        entry_type: EntryType,
        amount: Decimal,
        tx_id: Option<TxId>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            account,
            entry_type,
            amount: entry_type.sign(amount),
            tx_id,
            created_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_debit_entry_is_negative() {
        let entry = LedgerEntry::new(
            AccountId::new(1001),
            EntryType::Debit,
            dec!(500.00),
            Some(TxId::from("t1")),
            Utc::now(),
        );
        assert_eq!(entry.amount, dec!(-500.00));
        assert_eq!(entry.entry_type.to_string(), "DEBITO");
    }

    #[test]
    fn test_entry_type_round_trips_through_column_name() {
        assert_eq!("credito".parse::<EntryType>().unwrap(), EntryType::Credit);
        assert_eq!(EntryType::Debit.as_str().parse::<EntryType>().unwrap(), EntryType::Debit);
        assert!("TRANSFER".parse::<EntryType>().is_err());
    }
}
