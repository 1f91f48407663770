//! Account definitions.

use chrono::{DateTime, Utc};
use paycore_common::{AccountId, Currency};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Account status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    /// Account is active and can transact.
    Active,
    /// Account is frozen (no transactions allowed).
    Frozen,
    /// Account is closed.
    Closed,
}

impl std::fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AccountStatus::Active => "active",
            AccountStatus::Frozen => "frozen",
            AccountStatus::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// A balance-bearing account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    /// Unique account identifier.
    pub id: AccountId,
    /// Account currency.
    pub currency: Currency,
    /// Account status.
    pub status: AccountStatus,
    /// When the account was created.
    pub created_at: DateTime<Utc>,
    /// When the account was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Create a new active account.
    pub fn new(id: AccountId, currency: Currency) -> Self {
        let now = Utc::now();
        Self {
            id,
            currency,
            status: AccountStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check if the account can transact.
    pub fn can_transact(&self) -> bool {
        self.status == AccountStatus::Active
    }

    /// Freeze the account.
    pub fn freeze(&mut self) {
        self.status = AccountStatus::Frozen;
        self.updated_at = Utc::now();
    }

    /// Close the account.
    pub fn close(&mut self) {
        self.status = AccountStatus::Closed;
        self.updated_at = Utc::now();
    }
}

/// Account balance at a point in time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountBalance {
    /// Account identifier.
    pub account_id: AccountId,
    /// Currency.
    pub currency: Currency,
    /// Settled balance.
    pub available: Decimal,
    /// Sum of in-flight reservations against this account.
    pub reserved: Decimal,
    /// When this balance was last updated.
    pub updated_at: DateTime<Utc>,
}

impl AccountBalance {
    /// Balance usable by a new transaction: settled funds minus what other
    /// in-flight transactions have reserved.
    pub fn spendable(&self) -> Decimal {
        self.available - self.reserved
    }

    /// Check if the spendable balance covers `amount`.
    pub fn covers(&self, amount: Decimal) -> bool {
        self.spendable() >= amount
    }
}
