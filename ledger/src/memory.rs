//! In-process account store.
//!
//! Balances, reservations, and the applied-transfer set live behind a single
//! mutex so `apply_transfer` really is one atomic operation. This stands in
//! for the ACID relational store the production deployment points at.

use std::collections::{HashMap, HashSet};

use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tracing::{debug, info};

use async_trait::async_trait;
use paycore_common::{AccountId, CoreError, Money, Result, TransactionId};

use crate::account::{Account, AccountBalance};
use crate::store::AccountStore;

#[derive(Default)]
struct LedgerState {
    accounts: HashMap<AccountId, Account>,
    balances: HashMap<AccountId, Decimal>,
    /// Per-account reservations keyed by the holding transaction.
    reservations: HashMap<AccountId, HashMap<TransactionId, Decimal>>,
    /// Transfers already applied, for idempotent re-application.
    applied: HashSet<TransactionId>,
}

impl LedgerState {
    fn reserved_total(&self, account_id: &AccountId) -> Decimal {
        self.reservations
            .get(account_id)
            .map(|r| r.values().copied().sum())
            .unwrap_or(Decimal::ZERO)
    }

    fn active_account(&self, account_id: &AccountId) -> Result<&Account> {
        let account = self
            .accounts
            .get(account_id)
            .ok_or_else(|| CoreError::AccountNotFound(account_id.clone()))?;
        if !account.can_transact() {
            return Err(CoreError::AccountInactive {
                account_id: account_id.clone(),
                status: account.status.to_string(),
            });
        }
        Ok(account)
    }
}

/// In-memory account store.
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryLedger {
    /// Create an empty ledger.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LedgerState::default()),
        }
    }

    /// Open an account with an initial balance.
    pub fn open_account(&self, account: Account, initial_balance: Decimal) {
        let mut state = self.state.lock();
        info!(account_id = %account.id, balance = %initial_balance, "Account opened");
        state.balances.insert(account.id.clone(), initial_balance);
        state.accounts.insert(account.id.clone(), account);
    }

    /// Sum of all balances, used by conservation checks.
    pub fn total_funds(&self) -> Decimal {
        self.state.lock().balances.values().copied().sum()
    }

    /// Check whether a transfer has been applied.
    pub fn is_applied(&self, transaction_id: TransactionId) -> bool {
        self.state.lock().applied.contains(&transaction_id)
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AccountStore for InMemoryLedger {
    async fn get_account(&self, account_id: &AccountId) -> Result<Account> {
        let state = self.state.lock();
        state
            .accounts
            .get(account_id)
            .cloned()
            .ok_or_else(|| CoreError::AccountNotFound(account_id.clone()))
    }

    async fn get_balance(&self, account_id: &AccountId) -> Result<AccountBalance> {
        let state = self.state.lock();
        let account = state
            .accounts
            .get(account_id)
            .ok_or_else(|| CoreError::AccountNotFound(account_id.clone()))?;
        let available = state
            .balances
            .get(account_id)
            .copied()
            .unwrap_or(Decimal::ZERO);

        Ok(AccountBalance {
            account_id: account_id.clone(),
            currency: account.currency.clone(),
            available,
            reserved: state.reserved_total(account_id),
            updated_at: Utc::now(),
        })
    }

    async fn reserve(
        &self,
        account_id: &AccountId,
        transaction_id: TransactionId,
        amount: &Money,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.active_account(account_id)?;
        state
            .reservations
            .entry(account_id.clone())
            .or_default()
            .insert(transaction_id, amount.value);
        debug!(account_id = %account_id, transaction_id = %transaction_id, "Funds reserved");
        Ok(())
    }

    async fn release_reservation(
        &self,
        account_id: &AccountId,
        transaction_id: TransactionId,
    ) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(held) = state.reservations.get_mut(account_id) {
            held.remove(&transaction_id);
        }
        Ok(())
    }

    async fn reserved_for(
        &self,
        account_id: &AccountId,
        transaction_id: TransactionId,
    ) -> Result<Decimal> {
        let state = self.state.lock();
        Ok(state
            .reservations
            .get(account_id)
            .and_then(|held| held.get(&transaction_id))
            .copied()
            .unwrap_or(Decimal::ZERO))
    }

    async fn apply_transfer(
        &self,
        transaction_id: TransactionId,
        fencing_token: u64,
        from: Option<&AccountId>,
        to: Option<&AccountId>,
        amount: &Money,
    ) -> Result<()> {
        let mut state = self.state.lock();

        if state.applied.contains(&transaction_id) {
            debug!(transaction_id = %transaction_id, "Transfer already applied, skipping");
            return Ok(());
        }

        // Verify both endpoints before touching either balance.
        if let Some(from_id) = from {
            let account = state.active_account(from_id)?;
            if account.currency != amount.currency {
                return Err(CoreError::ExecutionError(format!(
                    "currency mismatch on {}: account holds {}, transfer in {}",
                    from_id, account.currency, amount.currency
                )));
            }
            let available = state
                .balances
                .get(from_id)
                .copied()
                .unwrap_or(Decimal::ZERO);
            if available < amount.value {
                return Err(CoreError::InsufficientFunds {
                    account_id: from_id.clone(),
                    required: amount.value.to_string(),
                    available: available.to_string(),
                });
            }
        }
        if let Some(to_id) = to {
            let account = state.active_account(to_id)?;
            if account.currency != amount.currency {
                return Err(CoreError::ExecutionError(format!(
                    "currency mismatch on {}: account holds {}, transfer in {}",
                    to_id, account.currency, amount.currency
                )));
            }
        }

        if let Some(from_id) = from {
            *state.balances.entry(from_id.clone()).or_insert(Decimal::ZERO) -= amount.value;
        }
        if let Some(to_id) = to {
            *state.balances.entry(to_id.clone()).or_insert(Decimal::ZERO) += amount.value;
        }
        state.applied.insert(transaction_id);

        info!(
            transaction_id = %transaction_id,
            fencing_token,
            amount = %amount,
            "Transfer applied"
        );
        Ok(())
    }

    async fn transfer_applied(&self, transaction_id: TransactionId) -> Result<bool> {
        Ok(self.state.lock().applied.contains(&transaction_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paycore_common::Currency;

    fn usd(value: i64) -> Money {
        Money::new(Decimal::from(value), Currency::usd())
    }

    fn ledger_with(accounts: &[(&str, i64)]) -> InMemoryLedger {
        let ledger = InMemoryLedger::new();
        for (id, balance) in accounts {
            ledger.open_account(
                Account::new(AccountId::new(*id), Currency::usd()),
                Decimal::from(*balance),
            );
        }
        ledger
    }

    #[tokio::test]
    async fn test_transfer_moves_funds_atomically() {
        let ledger = ledger_with(&[("ACC_A", 100), ("ACC_B", 10)]);
        let tx = TransactionId::new();

        ledger
            .apply_transfer(
                tx,
                1,
                Some(&AccountId::new("ACC_A")),
                Some(&AccountId::new("ACC_B")),
                &usd(50),
            )
            .await
            .unwrap();

        let a = ledger.get_balance(&AccountId::new("ACC_A")).await.unwrap();
        let b = ledger.get_balance(&AccountId::new("ACC_B")).await.unwrap();
        assert_eq!(a.available, Decimal::from(50));
        assert_eq!(b.available, Decimal::from(60));
        assert_eq!(ledger.total_funds(), Decimal::from(110));
        assert!(ledger.is_applied(tx));
    }

    #[tokio::test]
    async fn test_transfer_is_idempotent_per_transaction() {
        let ledger = ledger_with(&[("ACC_A", 100), ("ACC_B", 0)]);
        let tx = TransactionId::new();
        let from = AccountId::new("ACC_A");
        let to = AccountId::new("ACC_B");

        for _ in 0..3 {
            ledger
                .apply_transfer(tx, 1, Some(&from), Some(&to), &usd(25))
                .await
                .unwrap();
        }

        let a = ledger.get_balance(&from).await.unwrap();
        assert_eq!(a.available, Decimal::from(75));
    }

    #[tokio::test]
    async fn test_insufficient_funds_leaves_balances_untouched() {
        let ledger = ledger_with(&[("ACC_A", 10), ("ACC_B", 5)]);

        let err = ledger
            .apply_transfer(
                TransactionId::new(),
                1,
                Some(&AccountId::new("ACC_A")),
                Some(&AccountId::new("ACC_B")),
                &usd(50),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::InsufficientFunds { .. }));
        assert_eq!(ledger.total_funds(), Decimal::from(15));
        let a = ledger.get_balance(&AccountId::new("ACC_A")).await.unwrap();
        assert_eq!(a.available, Decimal::from(10));
    }

    #[tokio::test]
    async fn test_frozen_account_rejects_transfer() {
        let ledger = InMemoryLedger::new();
        let mut frozen = Account::new(AccountId::new("ACC_A"), Currency::usd());
        frozen.freeze();
        ledger.open_account(frozen, Decimal::from(100));
        ledger.open_account(
            Account::new(AccountId::new("ACC_B"), Currency::usd()),
            Decimal::ZERO,
        );

        let err = ledger
            .apply_transfer(
                TransactionId::new(),
                1,
                Some(&AccountId::new("ACC_A")),
                Some(&AccountId::new("ACC_B")),
                &usd(10),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::AccountInactive { .. }));
    }

    #[tokio::test]
    async fn test_deposit_credits_without_source() {
        let ledger = ledger_with(&[("ACC_A", 0)]);

        ledger
            .apply_transfer(
                TransactionId::new(),
                1,
                None,
                Some(&AccountId::new("ACC_A")),
                &usd(40),
            )
            .await
            .unwrap();

        let a = ledger.get_balance(&AccountId::new("ACC_A")).await.unwrap();
        assert_eq!(a.available, Decimal::from(40));
    }

    #[tokio::test]
    async fn test_reservations_visible_in_balance() {
        let ledger = ledger_with(&[("ACC_A", 100)]);
        let acc = AccountId::new("ACC_A");
        let tx = TransactionId::new();

        ledger.reserve(&acc, tx, &usd(30)).await.unwrap();
        let balance = ledger.get_balance(&acc).await.unwrap();
        assert_eq!(balance.reserved, Decimal::from(30));
        assert_eq!(balance.spendable(), Decimal::from(70));

        ledger.release_reservation(&acc, tx).await.unwrap();
        let balance = ledger.get_balance(&acc).await.unwrap();
        assert_eq!(balance.reserved, Decimal::ZERO);
    }
}
