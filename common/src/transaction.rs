//! Transaction record and state machine.

use crate::{AccountId, Money, NodeId, ReferenceId, TransactionId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Transaction status representing the lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    /// Request accepted, record created.
    Pending,
    /// Acquiring account locks.
    Locking,
    /// Collecting validation votes from assigned nodes.
    Validating,
    /// Applying the atomic balance mutation.
    Executing,
    /// Releasing locks after rejection or execution failure.
    RollingBack,
    /// Balance mutation applied, transaction final.
    Completed,
    /// Transaction final without any balance change.
    Failed,
}

impl TransactionStatus {
    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionStatus::Completed | TransactionStatus::Failed)
    }

    /// Check if the transaction is in progress.
    pub fn is_in_progress(&self) -> bool {
        !self.is_terminal()
    }

    /// Get valid next states from the current state.
    pub fn valid_transitions(&self) -> &[TransactionStatus] {
        match self {
            TransactionStatus::Pending => &[TransactionStatus::Locking],
            // Locking -> Failed covers lock conflicts before any vote is cast.
            TransactionStatus::Locking => {
                &[TransactionStatus::Validating, TransactionStatus::Failed]
            }
            TransactionStatus::Validating => {
                &[TransactionStatus::Executing, TransactionStatus::RollingBack]
            }
            TransactionStatus::Executing => {
                &[TransactionStatus::Completed, TransactionStatus::RollingBack]
            }
            TransactionStatus::RollingBack => &[TransactionStatus::Failed],
            TransactionStatus::Completed => &[],
            TransactionStatus::Failed => &[],
        }
    }

    /// Check if transition to the given state is valid.
    pub fn can_transition_to(&self, next: TransactionStatus) -> bool {
        self.valid_transitions().contains(&next)
    }
}

/// Type of funds movement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Transfer,
    Payment,
    Deposit,
    Withdrawal,
}

/// Structured reason recorded on a failed transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// Account lock could not be acquired within the retry budget.
    LockConflict,
    /// A validating node rejected the transaction.
    ValidationRejected,
    /// The atomic balance mutation failed at the storage layer.
    ExecutionError,
    /// A validator or phase deadline elapsed.
    Timeout,
}

impl FailureReason {
    /// Stable string form used in events and audit records.
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::LockConflict => "lock_conflict",
            FailureReason::ValidationRejected => "validation_rejected",
            FailureReason::ExecutionError => "execution_error",
            FailureReason::Timeout => "timeout",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One node's opinion on a transaction. Immutable once cast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationVote {
    /// Voting node.
    pub node_id: NodeId,
    /// Transaction voted on.
    pub transaction_id: TransactionId,
    /// The decision.
    pub decision: VoteDecision,
    /// Rejection reason; None when approved.
    pub reason: Option<String>,
    /// When the vote was cast.
    pub cast_at: DateTime<Utc>,
}

impl ValidationVote {
    /// Cast an approving vote.
    pub fn approve(node_id: NodeId, transaction_id: TransactionId) -> Self {
        Self {
            node_id,
            transaction_id,
            decision: VoteDecision::Approve,
            reason: None,
            cast_at: Utc::now(),
        }
    }

    /// Cast a rejecting vote with a reason.
    pub fn reject(
        node_id: NodeId,
        transaction_id: TransactionId,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            node_id,
            transaction_id,
            decision: VoteDecision::Reject,
            reason: Some(reason.into()),
            cast_at: Utc::now(),
        }
    }

    /// Check if this is an approval.
    pub fn is_approve(&self) -> bool {
        self.decision == VoteDecision::Approve
    }
}

/// Vote decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoteDecision {
    Approve,
    Reject,
}

/// A single funds movement between two accounts.
///
/// Records are never deleted; terminal transactions are kept for audit and
/// idempotency lookup by `reference_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    /// Unique, immutable identifier.
    pub id: TransactionId,
    /// Source account. None for deposits (funds enter from outside).
    pub from_account_id: Option<AccountId>,
    /// Destination account. None for withdrawals (funds leave the system).
    pub to_account_id: Option<AccountId>,
    /// Amount moved; always positive.
    pub amount: Money,
    /// Transaction type.
    pub kind: TransactionType,
    /// Current lifecycle status.
    pub status: TransactionStatus,
    /// Idempotency token, unique per transaction.
    pub reference_id: ReferenceId,
    /// Free-form caller description.
    pub description: Option<String>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// Last mutation timestamp.
    pub updated_at: DateTime<Utc>,
    /// Set when the balance mutation committed.
    pub completed_at: Option<DateTime<Utc>>,
    /// Set on terminal failure.
    pub failure_reason: Option<FailureReason>,
    /// Human-readable detail accompanying `failure_reason`.
    pub failure_detail: Option<String>,
    /// Nodes chosen by the ring for validation duty, in ring order.
    pub assigned_node_ids: Vec<NodeId>,
    /// Votes collected during validation.
    pub votes: Vec<ValidationVote>,
    /// Opaque caller metadata.
    pub metadata: HashMap<String, String>,
}

impl Transaction {
    /// Create a new pending transaction.
    pub fn new(
        kind: TransactionType,
        from_account_id: Option<AccountId>,
        to_account_id: Option<AccountId>,
        amount: Money,
        reference_id: ReferenceId,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: TransactionId::new(),
            from_account_id,
            to_account_id,
            amount,
            kind,
            status: TransactionStatus::Pending,
            reference_id,
            description: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
            failure_reason: None,
            failure_detail: None,
            assigned_node_ids: Vec::new(),
            votes: Vec::new(),
            metadata: HashMap::new(),
        }
    }

    /// Transition to a new status.
    pub fn transition_to(
        &mut self,
        new_status: TransactionStatus,
    ) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(new_status) {
            return Err(InvalidTransition {
                from: self.status,
                to: new_status,
            });
        }

        self.status = new_status;
        self.updated_at = Utc::now();
        if new_status == TransactionStatus::Completed {
            self.completed_at = Some(self.updated_at);
        }
        Ok(())
    }

    /// Mark the transaction as failed with a structured reason.
    ///
    /// Walks through `rolling_back` when the current state requires it, so
    /// callers can fail from any non-terminal state.
    pub fn fail(
        &mut self,
        reason: FailureReason,
        detail: impl Into<String>,
    ) -> Result<(), InvalidTransition> {
        if self.status.is_terminal() {
            return Err(InvalidTransition {
                from: self.status,
                to: TransactionStatus::Failed,
            });
        }

        if matches!(
            self.status,
            TransactionStatus::Validating | TransactionStatus::Executing
        ) {
            self.transition_to(TransactionStatus::RollingBack)?;
        }
        if self.status == TransactionStatus::Pending {
            self.transition_to(TransactionStatus::Locking)?;
        }

        self.failure_reason = Some(reason);
        self.failure_detail = Some(detail.into());
        self.transition_to(TransactionStatus::Failed)
    }

    /// Record a vote. Ignores a second vote from the same node.
    pub fn record_vote(&mut self, vote: ValidationVote) {
        if self.votes.iter().any(|v| v.node_id == vote.node_id) {
            return;
        }
        self.votes.push(vote);
        self.updated_at = Utc::now();
    }

    /// All account ids touched by this transaction, ascending.
    ///
    /// Locks are always acquired in this order regardless of transfer
    /// direction, preventing circular wait between opposite transfers.
    pub fn lock_set(&self) -> Vec<AccountId> {
        let mut accounts: Vec<AccountId> = self
            .from_account_id
            .iter()
            .chain(self.to_account_id.iter())
            .cloned()
            .collect();
        accounts.sort();
        accounts.dedup();
        accounts
    }

    /// Structural validity per the data-model invariants.
    pub fn validate_shape(&self) -> Result<(), String> {
        if !self.amount.is_positive() {
            return Err("amount must be positive".to_string());
        }
        match self.kind {
            TransactionType::Transfer | TransactionType::Payment => {
                let (from, to) = match (&self.from_account_id, &self.to_account_id) {
                    (Some(f), Some(t)) => (f, t),
                    _ => return Err("transfer requires both account ids".to_string()),
                };
                if from == to {
                    return Err("source and destination must differ".to_string());
                }
            }
            TransactionType::Deposit => {
                if self.to_account_id.is_none() {
                    return Err("deposit requires a destination account".to_string());
                }
            }
            TransactionType::Withdrawal => {
                if self.from_account_id.is_none() {
                    return Err("withdrawal requires a source account".to_string());
                }
            }
        }
        Ok(())
    }
}

/// Error when attempting an invalid state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: TransactionStatus,
    pub to: TransactionStatus,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Invalid state transition from {:?} to {:?}",
            self.from, self.to
        )
    }
}

impl std::error::Error for InvalidTransition {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Currency;
    use rust_decimal::Decimal;

    fn transfer(from: &str, to: &str) -> Transaction {
        Transaction::new(
            TransactionType::Transfer,
            Some(AccountId::new(from)),
            Some(AccountId::new(to)),
            Money::new(Decimal::from(100), Currency::usd()),
            ReferenceId::generate(),
        )
    }

    #[test]
    fn test_success_path_transitions() {
        let mut tx = transfer("ACC_A", "ACC_B");

        assert!(tx.transition_to(TransactionStatus::Locking).is_ok());
        assert!(tx.transition_to(TransactionStatus::Validating).is_ok());
        assert!(tx.transition_to(TransactionStatus::Executing).is_ok());
        assert!(tx.transition_to(TransactionStatus::Completed).is_ok());
        assert!(tx.completed_at.is_some());
        assert!(tx.status.is_terminal());
    }

    #[test]
    fn test_invalid_transitions() {
        let mut tx = transfer("ACC_A", "ACC_B");

        // Cannot skip locking.
        assert!(tx.transition_to(TransactionStatus::Validating).is_err());
        assert!(tx.transition_to(TransactionStatus::Completed).is_err());
    }

    #[test]
    fn test_lock_failure_goes_directly_to_failed() {
        let mut tx = transfer("ACC_A", "ACC_B");
        tx.transition_to(TransactionStatus::Locking).unwrap();

        tx.fail(FailureReason::LockConflict, "held by another transaction")
            .unwrap();
        assert_eq!(tx.status, TransactionStatus::Failed);
        assert_eq!(tx.failure_reason, Some(FailureReason::LockConflict));
    }

    #[test]
    fn test_fail_from_validating_walks_rollback() {
        let mut tx = transfer("ACC_A", "ACC_B");
        tx.transition_to(TransactionStatus::Locking).unwrap();
        tx.transition_to(TransactionStatus::Validating).unwrap();

        tx.fail(FailureReason::ValidationRejected, "insufficient funds")
            .unwrap();
        assert_eq!(tx.status, TransactionStatus::Failed);
    }

    #[test]
    fn test_fail_uses_permitted_transitions_from_every_state() {
        // fail() routes its final hop through the transition table, so a
        // state it cannot legally leave surfaces as an error instead of
        // being overwritten.
        let paths: [&[TransactionStatus]; 5] = [
            &[],
            &[TransactionStatus::Locking],
            &[TransactionStatus::Locking, TransactionStatus::Validating],
            &[
                TransactionStatus::Locking,
                TransactionStatus::Validating,
                TransactionStatus::Executing,
            ],
            &[
                TransactionStatus::Locking,
                TransactionStatus::Validating,
                TransactionStatus::RollingBack,
            ],
        ];

        for path in paths {
            let mut tx = transfer("ACC_A", "ACC_B");
            for status in path {
                tx.transition_to(*status).unwrap();
            }
            tx.fail(FailureReason::ExecutionError, "aborted").unwrap();
            assert_eq!(tx.status, TransactionStatus::Failed);
        }
    }

    #[test]
    fn test_terminal_states_immutable() {
        let mut tx = transfer("ACC_A", "ACC_B");
        tx.transition_to(TransactionStatus::Locking).unwrap();
        tx.fail(FailureReason::LockConflict, "conflict").unwrap();

        assert!(tx.transition_to(TransactionStatus::Locking).is_err());
        assert!(tx.fail(FailureReason::Timeout, "again").is_err());
    }

    #[test]
    fn test_lock_set_ordering_direction_independent() {
        let forward = transfer("ACC_A", "ACC_B");
        let reverse = transfer("ACC_B", "ACC_A");
        assert_eq!(forward.lock_set(), reverse.lock_set());
    }

    #[test]
    fn test_duplicate_vote_ignored() {
        let mut tx = transfer("ACC_A", "ACC_B");
        let node = NodeId::new("node1");
        tx.record_vote(ValidationVote::approve(node.clone(), tx.id));
        tx.record_vote(ValidationVote::reject(node, tx.id, "changed my mind"));

        assert_eq!(tx.votes.len(), 1);
        assert!(tx.votes[0].is_approve());
    }

    #[test]
    fn test_shape_validation() {
        let mut tx = transfer("ACC_A", "ACC_A");
        assert!(tx.validate_shape().is_err());

        tx = transfer("ACC_A", "ACC_B");
        tx.amount = Money::new(Decimal::ZERO, Currency::usd());
        assert!(tx.validate_shape().is_err());

        let deposit = Transaction::new(
            TransactionType::Deposit,
            None,
            Some(AccountId::new("ACC_A")),
            Money::new(Decimal::from(10), Currency::usd()),
            ReferenceId::generate(),
        );
        assert!(deposit.validate_shape().is_ok());
    }
}
