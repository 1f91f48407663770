//! Node-local transaction validation.
//!
//! A validator reports a vote and never mutates balances. The coordinator
//! treats a validator that misses its deadline as an implicit reject.

use std::sync::Arc;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tracing::debug;

use paycore_common::{AccountId, NodeId, Transaction, ValidationVote};
use paycore_ledger::AccountStore;

/// Validation duty as seen by the coordinator.
#[async_trait]
pub trait TransactionValidator: Send + Sync {
    /// The node this validator votes as.
    fn node_id(&self) -> &NodeId;

    /// Produce a vote for the transaction. Must not mutate account state.
    async fn validate(&self, transaction: &Transaction) -> ValidationVote;
}

/// Pluggable fraud/compliance screen.
///
/// Returns `Some(reason)` to reject, `None` to approve.
pub trait FraudCheck: Send + Sync {
    fn screen(&self, transaction: &Transaction) -> Option<String>;
}

/// Screen that approves everything.
pub struct NoopFraudCheck;

impl FraudCheck for NoopFraudCheck {
    fn screen(&self, _transaction: &Transaction) -> Option<String> {
        None
    }
}

/// Screen that rejects amounts above a fixed ceiling.
pub struct AmountCeilingCheck {
    pub ceiling: Decimal,
}

impl FraudCheck for AmountCeilingCheck {
    fn screen(&self, transaction: &Transaction) -> Option<String> {
        if transaction.amount.value > self.ceiling {
            Some(format!(
                "amount {} exceeds ceiling {}",
                transaction.amount.value, self.ceiling
            ))
        } else {
            None
        }
    }
}

/// Validator backed by the account store, voting on behalf of one node.
pub struct NodeValidator {
    node_id: NodeId,
    accounts: Arc<dyn AccountStore>,
    fraud: Arc<dyn FraudCheck>,
}

impl NodeValidator {
    /// Create a validator for a node.
    pub fn new(node_id: NodeId, accounts: Arc<dyn AccountStore>, fraud: Arc<dyn FraudCheck>) -> Self {
        Self {
            node_id,
            accounts,
            fraud,
        }
    }

    async fn check_source(
        &self,
        account_id: &AccountId,
        transaction: &Transaction,
    ) -> Option<String> {
        let account = match self.accounts.get_account(account_id).await {
            Ok(account) => account,
            Err(_) => return Some(format!("account {} not found", account_id)),
        };
        if !account.can_transact() {
            return Some(format!("account {} is {}", account_id, account.status));
        }
        if account.currency != transaction.amount.currency {
            return Some(format!(
                "currency mismatch: account {} holds {}, transaction in {}",
                account_id, account.currency, transaction.amount.currency
            ));
        }

        let balance = match self.accounts.get_balance(account_id).await {
            Ok(balance) => balance,
            Err(e) => return Some(format!("balance unavailable: {e}")),
        };
        let own_reservation = self
            .accounts
            .reserved_for(account_id, transaction.id)
            .await
            .unwrap_or(Decimal::ZERO);
        // Spendable = balance minus what OTHER in-flight transactions hold.
        let others = balance.reserved - own_reservation;
        if balance.available - others < transaction.amount.value {
            return Some(format!(
                "insufficient funds: required {}, available {}",
                transaction.amount.value,
                balance.available - others
            ));
        }
        None
    }

    async fn check_destination(
        &self,
        account_id: &AccountId,
        transaction: &Transaction,
    ) -> Option<String> {
        let account = match self.accounts.get_account(account_id).await {
            Ok(account) => account,
            Err(_) => return Some(format!("account {} not found", account_id)),
        };
        if !account.can_transact() {
            return Some(format!("account {} is {}", account_id, account.status));
        }
        if account.currency != transaction.amount.currency {
            return Some(format!(
                "currency mismatch: account {} holds {}, transaction in {}",
                account_id, account.currency, transaction.amount.currency
            ));
        }
        None
    }

    async fn run_checks(&self, transaction: &Transaction) -> Option<String> {
        if let Some(from) = &transaction.from_account_id {
            if let Some(reason) = self.check_source(from, transaction).await {
                return Some(reason);
            }
        }
        if let Some(to) = &transaction.to_account_id {
            if let Some(reason) = self.check_destination(to, transaction).await {
                return Some(reason);
            }
        }
        self.fraud.screen(transaction)
    }
}

#[async_trait]
impl TransactionValidator for NodeValidator {
    fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    async fn validate(&self, transaction: &Transaction) -> ValidationVote {
        match self.run_checks(transaction).await {
            None => {
                debug!(
                    node_id = %self.node_id,
                    transaction_id = %transaction.id,
                    "Vote: approve"
                );
                ValidationVote::approve(self.node_id.clone(), transaction.id)
            }
            Some(reason) => {
                debug!(
                    node_id = %self.node_id,
                    transaction_id = %transaction.id,
                    reason = %reason,
                    "Vote: reject"
                );
                ValidationVote::reject(self.node_id.clone(), transaction.id, reason)
            }
        }
    }
}

/// Test double that votes a fixed way after an optional delay.
/// Used by coordinator tests to exercise rejection and timeout paths.
#[cfg(test)]
pub struct ScriptedValidator {
    node_id: NodeId,
    reject_with: Option<String>,
    delay: std::time::Duration,
}

#[cfg(test)]
impl ScriptedValidator {
    /// Always approves.
    pub fn approving(node_id: NodeId) -> Self {
        Self {
            node_id,
            reject_with: None,
            delay: std::time::Duration::ZERO,
        }
    }

    /// Always rejects with the given reason.
    pub fn rejecting(node_id: NodeId, reason: impl Into<String>) -> Self {
        Self {
            node_id,
            reject_with: Some(reason.into()),
            delay: std::time::Duration::ZERO,
        }
    }

    /// Approves after a delay, for timeout tests.
    pub fn slow(node_id: NodeId, delay: std::time::Duration) -> Self {
        Self {
            node_id,
            reject_with: None,
            delay,
        }
    }
}

#[cfg(test)]
#[async_trait]
impl TransactionValidator for ScriptedValidator {
    fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    async fn validate(&self, transaction: &Transaction) -> ValidationVote {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match &self.reject_with {
            None => ValidationVote::approve(self.node_id.clone(), transaction.id),
            Some(reason) => {
                ValidationVote::reject(self.node_id.clone(), transaction.id, reason.clone())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paycore_common::{Currency, Money, ReferenceId, TransactionId, TransactionType};
    use paycore_ledger::{Account, InMemoryLedger};

    fn usd(value: i64) -> Money {
        Money::new(Decimal::from(value), Currency::usd())
    }

    fn ledger_with(accounts: &[(&str, i64)]) -> Arc<InMemoryLedger> {
        let ledger = InMemoryLedger::new();
        for (id, balance) in accounts {
            ledger.open_account(
                Account::new(AccountId::new(*id), Currency::usd()),
                Decimal::from(*balance),
            );
        }
        Arc::new(ledger)
    }

    fn validator(ledger: Arc<InMemoryLedger>) -> NodeValidator {
        NodeValidator::new(NodeId::new("node1"), ledger, Arc::new(NoopFraudCheck))
    }

    fn transfer(from: &str, to: &str, amount: i64) -> Transaction {
        Transaction::new(
            TransactionType::Transfer,
            Some(AccountId::new(from)),
            Some(AccountId::new(to)),
            usd(amount),
            ReferenceId::generate(),
        )
    }

    #[tokio::test]
    async fn test_approves_funded_transfer() {
        let ledger = ledger_with(&[("ACC_A", 100), ("ACC_B", 10)]);
        let vote = validator(ledger)
            .validate(&transfer("ACC_A", "ACC_B", 50))
            .await;
        assert!(vote.is_approve());
        assert!(vote.reason.is_none());
    }

    #[tokio::test]
    async fn test_rejects_insufficient_funds() {
        let ledger = ledger_with(&[("ACC_A", 10), ("ACC_B", 10)]);
        let vote = validator(ledger)
            .validate(&transfer("ACC_A", "ACC_B", 50))
            .await;
        assert!(!vote.is_approve());
        assert!(vote.reason.unwrap().contains("insufficient funds"));
    }

    #[tokio::test]
    async fn test_rejects_missing_account() {
        let ledger = ledger_with(&[("ACC_A", 100)]);
        let vote = validator(ledger)
            .validate(&transfer("ACC_A", "ACC_MISSING", 50))
            .await;
        assert!(!vote.is_approve());
        assert!(vote.reason.unwrap().contains("not found"));
    }

    #[tokio::test]
    async fn test_rejects_frozen_account() {
        let ledger = InMemoryLedger::new();
        let mut frozen = Account::new(AccountId::new("ACC_A"), Currency::usd());
        frozen.freeze();
        ledger.open_account(frozen, Decimal::from(100));
        ledger.open_account(
            Account::new(AccountId::new("ACC_B"), Currency::usd()),
            Decimal::from(10),
        );

        let vote = validator(Arc::new(ledger))
            .validate(&transfer("ACC_A", "ACC_B", 50))
            .await;
        assert!(!vote.is_approve());
        assert!(vote.reason.unwrap().contains("frozen"));
    }

    #[tokio::test]
    async fn test_rejects_currency_mismatch() {
        let ledger = InMemoryLedger::new();
        ledger.open_account(
            Account::new(AccountId::new("ACC_A"), Currency::eur()),
            Decimal::from(100),
        );
        ledger.open_account(
            Account::new(AccountId::new("ACC_B"), Currency::usd()),
            Decimal::from(10),
        );

        let vote = validator(Arc::new(ledger))
            .validate(&transfer("ACC_A", "ACC_B", 50))
            .await;
        assert!(!vote.is_approve());
        assert!(vote.reason.unwrap().contains("currency mismatch"));
    }

    #[tokio::test]
    async fn test_other_reservations_reduce_spendable() {
        let ledger = ledger_with(&[("ACC_A", 100), ("ACC_B", 10)]);
        let acc = AccountId::new("ACC_A");

        // Another in-flight transaction reserves 80.
        ledger
            .reserve(&acc, TransactionId::new(), &usd(80))
            .await
            .unwrap();

        let vote = validator(ledger.clone())
            .validate(&transfer("ACC_A", "ACC_B", 50))
            .await;
        assert!(!vote.is_approve());
    }

    #[tokio::test]
    async fn test_own_reservation_does_not_block() {
        let ledger = ledger_with(&[("ACC_A", 100), ("ACC_B", 10)]);
        let acc = AccountId::new("ACC_A");
        let tx = transfer("ACC_A", "ACC_B", 50);

        // The coordinator reserved for this very transaction already.
        ledger.reserve(&acc, tx.id, &usd(50)).await.unwrap();

        let vote = validator(ledger.clone()).validate(&tx).await;
        assert!(vote.is_approve());
    }

    #[tokio::test]
    async fn test_fraud_check_rejects() {
        let ledger = ledger_with(&[("ACC_A", 1000), ("ACC_B", 10)]);
        let validator = NodeValidator::new(
            NodeId::new("node1"),
            ledger,
            Arc::new(AmountCeilingCheck {
                ceiling: Decimal::from(100),
            }),
        );

        let vote = validator.validate(&transfer("ACC_A", "ACC_B", 500)).await;
        assert!(!vote.is_approve());
        assert!(vote.reason.unwrap().contains("ceiling"));
    }
}
