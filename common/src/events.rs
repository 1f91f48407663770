//! Domain events published after a transaction reaches a terminal state.
//!
//! Events are a best-effort side channel; delivery is never on the
//! correctness path.

use crate::{Money, ReferenceId, Transaction, TransactionId, TransactionStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Topic for successful transactions.
pub const TOPIC_TRANSACTION_COMPLETED: &str = "transaction.completed";
/// Topic for failed transactions.
pub const TOPIC_TRANSACTION_FAILED: &str = "transaction.failed";

/// Event payload for a terminal transaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionEvent {
    /// Event type discriminator.
    pub event_type: String,
    /// Transaction identifier.
    pub transaction_id: TransactionId,
    /// Idempotency reference.
    pub reference_id: ReferenceId,
    /// Terminal status.
    pub status: TransactionStatus,
    /// Source account, if any.
    pub from_account_id: Option<String>,
    /// Destination account, if any.
    pub to_account_id: Option<String>,
    /// Amount moved (or that would have moved).
    pub amount: Money,
    /// Failure reason for failed transactions.
    pub reason: Option<String>,
    /// When the event was emitted.
    pub occurred_at: DateTime<Utc>,
}

impl TransactionEvent {
    /// Build a completion event from a terminal transaction.
    pub fn completed(tx: &Transaction) -> Self {
        Self::from_transaction(tx, "transaction_completed")
    }

    /// Build a failure event from a terminal transaction.
    pub fn failed(tx: &Transaction) -> Self {
        Self::from_transaction(tx, "transaction_failed")
    }

    fn from_transaction(tx: &Transaction, event_type: &str) -> Self {
        Self {
            event_type: event_type.to_string(),
            transaction_id: tx.id,
            reference_id: tx.reference_id.clone(),
            status: tx.status,
            from_account_id: tx.from_account_id.as_ref().map(|a| a.to_string()),
            to_account_id: tx.to_account_id.as_ref().map(|a| a.to_string()),
            amount: tx.amount.clone(),
            reason: tx.failure_reason.map(|r| r.as_str().to_string()),
            occurred_at: Utc::now(),
        }
    }

    /// Topic this event belongs on.
    pub fn topic(&self) -> &'static str {
        match self.status {
            TransactionStatus::Completed => TOPIC_TRANSACTION_COMPLETED,
            _ => TOPIC_TRANSACTION_FAILED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AccountId, Currency, FailureReason, TransactionType};
    use rust_decimal::Decimal;

    #[test]
    fn test_event_from_failed_transaction() {
        let mut tx = Transaction::new(
            TransactionType::Transfer,
            Some(AccountId::new("ACC_A")),
            Some(AccountId::new("ACC_B")),
            Money::new(Decimal::from(50), Currency::usd()),
            ReferenceId::generate(),
        );
        tx.transition_to(TransactionStatus::Locking).unwrap();
        tx.fail(FailureReason::LockConflict, "held").unwrap();

        let event = TransactionEvent::failed(&tx);
        assert_eq!(event.topic(), TOPIC_TRANSACTION_FAILED);
        assert_eq!(event.reason.as_deref(), Some("lock_conflict"));

        // Round-trips as JSON for the bus.
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("transaction_failed"));
    }
}
