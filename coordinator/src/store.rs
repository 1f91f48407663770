//! Transaction record storage and terminal-event publication.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::debug;

use paycore_common::{
    CoreError, ReferenceId, Result, Transaction, TransactionEvent, TransactionId,
    TransactionStatus,
};

/// Durable home for transaction records.
///
/// Records are written before any lock is taken and updated at every
/// status change, so a crashed coordinator leaves behind enough state
/// for the reconciler to finish the job.
#[async_trait]
pub trait TransactionStore: Send + Sync {
    /// Insert a new record. Fails on a duplicate reference id unless the
    /// record bound to it is terminal-failed, in which case the reference
    /// is re-bound to the new record and a fresh attempt may run. The
    /// failed record stays retrievable by its transaction id.
    async fn insert(&self, transaction: Transaction) -> Result<()>;

    /// Overwrite the stored record.
    async fn update(&self, transaction: Transaction) -> Result<()>;

    /// Fetch by transaction id.
    async fn get(&self, id: TransactionId) -> Result<Transaction>;

    /// Fetch by idempotency reference.
    async fn get_by_reference(&self, reference_id: &ReferenceId) -> Result<Option<Transaction>>;

    /// Non-terminal records that have not been touched for `horizon`.
    async fn list_stale(&self, horizon: Duration) -> Result<Vec<Transaction>>;
}

/// Sink for terminal transaction events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: TransactionEvent) -> Result<()>;
}

/// In-memory transaction store with a secondary reference-id index.
pub struct InMemoryTransactionStore {
    by_id: DashMap<TransactionId, Transaction>,
    by_reference: DashMap<ReferenceId, TransactionId>,
}

impl InMemoryTransactionStore {
    pub fn new() -> Self {
        Self {
            by_id: DashMap::new(),
            by_reference: DashMap::new(),
        }
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl Default for InMemoryTransactionStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransactionStore for InMemoryTransactionStore {
    async fn insert(&self, transaction: Transaction) -> Result<()> {
        // Claim the reference first; the winner of a concurrent race with
        // the same reference gets to insert, the loser sees the duplicate.
        // A reference whose bound record is terminal-failed is re-claimable,
        // so a retry after a failed attempt runs under the same reference.
        use dashmap::mapref::entry::Entry;
        match self.by_reference.entry(transaction.reference_id.clone()) {
            Entry::Occupied(mut existing) => {
                let bound_id = *existing.get();
                // A binding whose record is not visible yet belongs to a
                // concurrent insert; treat it as live.
                let prior_failed = self
                    .by_id
                    .get(&bound_id)
                    .map(|r| r.status == TransactionStatus::Failed)
                    .unwrap_or(false);
                if !prior_failed {
                    return Err(CoreError::DuplicateReference {
                        reference_id: transaction.reference_id.clone(),
                        transaction_id: bound_id,
                    });
                }
                existing.insert(transaction.id);
            }
            Entry::Vacant(slot) => {
                slot.insert(transaction.id);
            }
        }
        debug!(transaction_id = %transaction.id, reference_id = %transaction.reference_id, "Transaction recorded");
        self.by_id.insert(transaction.id, transaction);
        Ok(())
    }

    async fn update(&self, transaction: Transaction) -> Result<()> {
        if !self.by_id.contains_key(&transaction.id) {
            return Err(CoreError::TransactionNotFound(transaction.id));
        }
        self.by_id.insert(transaction.id, transaction);
        Ok(())
    }

    async fn get(&self, id: TransactionId) -> Result<Transaction> {
        self.by_id
            .get(&id)
            .map(|r| r.clone())
            .ok_or(CoreError::TransactionNotFound(id))
    }

    async fn get_by_reference(&self, reference_id: &ReferenceId) -> Result<Option<Transaction>> {
        let Some(id) = self.by_reference.get(reference_id).map(|r| *r) else {
            return Ok(None);
        };
        Ok(self.by_id.get(&id).map(|r| r.clone()))
    }

    async fn list_stale(&self, horizon: Duration) -> Result<Vec<Transaction>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(horizon)
                .map_err(|e| CoreError::InternalError(e.to_string()))?;
        Ok(self
            .by_id
            .iter()
            .filter(|r| r.status.is_in_progress() && r.updated_at < cutoff)
            .map(|r| r.clone())
            .collect())
    }
}

/// Publisher that retains events in memory, for tests and the demo binary.
pub struct InMemoryEventPublisher {
    events: Mutex<Vec<TransactionEvent>>,
}

impl InMemoryEventPublisher {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    /// Snapshot of everything published so far.
    pub fn published(&self) -> Vec<TransactionEvent> {
        self.events.lock().clone()
    }
}

impl Default for InMemoryEventPublisher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventPublisher for InMemoryEventPublisher {
    async fn publish(&self, event: TransactionEvent) -> Result<()> {
        debug!(topic = %event.topic(), transaction_id = %event.transaction_id, "Event published");
        self.events.lock().push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paycore_common::{
        AccountId, Currency, FailureReason, Money, TransactionStatus, TransactionType,
    };
    use rust_decimal::Decimal;

    fn sample(reference: ReferenceId) -> Transaction {
        Transaction::new(
            TransactionType::Transfer,
            Some(AccountId::new("ACC_A")),
            Some(AccountId::new("ACC_B")),
            Money::new(Decimal::from(25), Currency::usd()),
            reference,
        )
    }

    #[tokio::test]
    async fn test_insert_and_lookup() {
        let store = InMemoryTransactionStore::new();
        let tx = sample(ReferenceId::generate());
        let id = tx.id;
        let reference = tx.reference_id.clone();

        store.insert(tx).await.unwrap();
        assert_eq!(store.get(id).await.unwrap().id, id);
        let by_ref = store.get_by_reference(&reference).await.unwrap().unwrap();
        assert_eq!(by_ref.id, id);
    }

    #[tokio::test]
    async fn test_duplicate_reference_rejected() {
        let store = InMemoryTransactionStore::new();
        let reference = ReferenceId::generate();
        let first = sample(reference.clone());
        let first_id = first.id;
        store.insert(first).await.unwrap();

        let err = store.insert(sample(reference)).await.unwrap_err();
        match err {
            CoreError::DuplicateReference { transaction_id, .. } => {
                assert_eq!(transaction_id, first_id);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_record_frees_its_reference() {
        let store = InMemoryTransactionStore::new();
        let reference = ReferenceId::generate();

        let mut first = sample(reference.clone());
        first
            .fail(FailureReason::ValidationRejected, "insufficient funds")
            .unwrap();
        let first_id = first.id;
        store.insert(first).await.unwrap();

        // The terminal-failed binding yields; the reference follows the
        // new record while the failed one stays fetchable by id.
        let second = sample(reference.clone());
        let second_id = second.id;
        store.insert(second).await.unwrap();

        let bound = store.get_by_reference(&reference).await.unwrap().unwrap();
        assert_eq!(bound.id, second_id);
        assert_eq!(
            store.get(first_id).await.unwrap().status,
            TransactionStatus::Failed
        );

        // The new in-flight binding holds against a third claim.
        let err = store.insert(sample(reference)).await.unwrap_err();
        assert!(matches!(
            err,
            CoreError::DuplicateReference { transaction_id, .. } if transaction_id == second_id
        ));
    }

    #[tokio::test]
    async fn test_update_requires_existing_record() {
        let store = InMemoryTransactionStore::new();
        let tx = sample(ReferenceId::generate());
        assert!(store.update(tx).await.is_err());
    }

    #[tokio::test]
    async fn test_list_stale_skips_terminal_and_fresh() {
        let store = InMemoryTransactionStore::new();

        let mut old_pending = sample(ReferenceId::generate());
        old_pending.updated_at = Utc::now() - chrono::Duration::seconds(600);
        let stale_id = old_pending.id;
        store.insert(old_pending).await.unwrap();

        let mut old_failed = sample(ReferenceId::generate());
        old_failed
            .fail(FailureReason::LockConflict, "conflict")
            .unwrap();
        old_failed.updated_at = Utc::now() - chrono::Duration::seconds(600);
        store.insert(old_failed).await.unwrap();

        store.insert(sample(ReferenceId::generate())).await.unwrap();

        let stale = store.list_stale(Duration::from_secs(120)).await.unwrap();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].id, stale_id);
        assert_eq!(stale[0].status, TransactionStatus::Pending);
    }

    #[tokio::test]
    async fn test_publisher_retains_events() {
        let publisher = InMemoryEventPublisher::new();
        let mut tx = sample(ReferenceId::generate());
        tx.transition_to(TransactionStatus::Locking).unwrap();
        tx.transition_to(TransactionStatus::Validating).unwrap();
        tx.transition_to(TransactionStatus::Executing).unwrap();
        tx.transition_to(TransactionStatus::Completed).unwrap();

        publisher
            .publish(TransactionEvent::completed(&tx))
            .await
            .unwrap();
        let events = publisher.published();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].topic(), paycore_common::TOPIC_TRANSACTION_COMPLETED);
    }
}
