//! Account definitions for ledger.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use shardledger_common::AccountId;

/// A ledger account owned by this partition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Account number.
    pub id: AccountId,
    /// Current balance.
    pub balance: Decimal,
    /// When the balance last changed.
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Open an account with an initial balance.
    pub fn new(id: AccountId, balance: Decimal) -> Self {
        Self {
            id,
            balance,
            updated_at: Utc::now(),
        }
    }

    /// Whether the balance covers `amount`.
    pub fn can_cover(&self, amount: Decimal) -> bool {
        self.balance >= amount
    }

    /// Add a signed amount to the balance.
    pub fn adjust(&mut self, signed_amount: Decimal, at: DateTime<Utc>) {
        self.balance += signed_amount;
        self.updated_at = at;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_can_cover_is_inclusive() {
        let account = Account::new(AccountId::new(1001), dec!(500.00));
        assert!(account.can_cover(dec!(500.00)));
        assert!(!account.can_cover(dec!(500.01)));
    }

    #[test]
    fn test_adjust_applies_signed_amount() {
        let mut account = Account::new(AccountId::new(1001), dec!(2200.00));
        account.adjust(dec!(-500.00), Utc::now());
        assert_eq!(account.balance, dec!(1700.00));
    }
}
