//! Core coordinator implementation.
//!
//! Drives each submitted transaction through the multi-phase protocol:
//! lock the touched accounts, collect a unanimous vote from the assigned
//! validation nodes, apply the balance mutation atomically, then release.
//! Any phase failure rolls the transaction into `failed` with every lock
//! and reservation released.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use rand::Rng;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{error, info, instrument, warn};

use paycore_common::{
    AccountId, CoreError, FailureReason, Money, NodeId, ReferenceId, Result, Transaction,
    TransactionEvent, TransactionId, TransactionStatus, TransactionType, ValidationVote,
};
use paycore_ledger::AccountStore;

use crate::config::CoordinatorConfig;
use crate::lock_manager::{AccountLock, LockManager};
use crate::metrics::{Metrics, SharedMetrics};
use crate::ring::{ConsistentHashRing, RingNode};
use crate::state::CoordinatorState;
use crate::store::{EventPublisher, TransactionStore};
use crate::validator::TransactionValidator;

/// A funds-movement request as received from a caller.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    /// Movement type.
    pub kind: TransactionType,
    /// Source account; None for deposits.
    pub from_account_id: Option<AccountId>,
    /// Destination account; None for withdrawals.
    pub to_account_id: Option<AccountId>,
    /// Amount to move.
    pub amount: Money,
    /// Caller-supplied idempotency token; generated when absent.
    pub reference_id: Option<ReferenceId>,
    /// Free-form description.
    pub description: Option<String>,
    /// Opaque caller metadata.
    pub metadata: HashMap<String, String>,
}

impl TransferRequest {
    /// Internal transfer between two accounts.
    pub fn transfer(from: AccountId, to: AccountId, amount: Money) -> Self {
        Self {
            kind: TransactionType::Transfer,
            from_account_id: Some(from),
            to_account_id: Some(to),
            amount,
            reference_id: None,
            description: None,
            metadata: HashMap::new(),
        }
    }

    /// Payment from one account to another.
    pub fn payment(from: AccountId, to: AccountId, amount: Money) -> Self {
        Self {
            kind: TransactionType::Payment,
            ..Self::transfer(from, to, amount)
        }
    }

    /// Deposit from outside the system.
    pub fn deposit(to: AccountId, amount: Money) -> Self {
        Self {
            kind: TransactionType::Deposit,
            from_account_id: None,
            to_account_id: Some(to),
            amount,
            reference_id: None,
            description: None,
            metadata: HashMap::new(),
        }
    }

    /// Withdrawal out of the system.
    pub fn withdrawal(from: AccountId, amount: Money) -> Self {
        Self {
            kind: TransactionType::Withdrawal,
            from_account_id: Some(from),
            to_account_id: None,
            amount,
            reference_id: None,
            description: None,
            metadata: HashMap::new(),
        }
    }

    /// Attach a caller-supplied idempotency reference.
    pub fn with_reference(mut self, reference_id: ReferenceId) -> Self {
        self.reference_id = Some(reference_id);
        self
    }

    /// Attach a description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Outcome of a submission.
#[derive(Debug, Clone)]
pub enum SubmitOutcome {
    /// The transaction ran to completion; funds moved.
    Completed(Transaction),
    /// The transaction reached `failed`; no funds moved.
    Failed(Transaction),
    /// The reference matched a still-in-flight transaction; no new attempt
    /// was started.
    Accepted(TransactionId),
}

impl SubmitOutcome {
    /// Identifier of the transaction this outcome refers to.
    pub fn transaction_id(&self) -> TransactionId {
        match self {
            SubmitOutcome::Completed(tx) | SubmitOutcome::Failed(tx) => tx.id,
            SubmitOutcome::Accepted(id) => *id,
        }
    }

    /// Check if this outcome is a completion.
    pub fn is_completed(&self) -> bool {
        matches!(self, SubmitOutcome::Completed(_))
    }
}

enum VoteOutcome {
    Cast(ValidationVote),
    Missed(NodeId),
}

/// Background worker that resolves records stranded by a dead coordinator.
struct Reconciler {
    config: crate::config::ReconcilerConfig,
    accounts: Arc<dyn AccountStore>,
    transactions: Arc<dyn TransactionStore>,
    events: Arc<dyn EventPublisher>,
    metrics: SharedMetrics,
}

impl Reconciler {
    async fn run_loop(&self) {
        loop {
            tokio::time::sleep(self.config.sweep_interval).await;
            match self.reconcile_once().await {
                Ok(0) => {}
                Ok(resolved) => info!(resolved, "Reconciliation sweep resolved stale records"),
                Err(e) => error!(error = %e, "Reconciliation sweep failed"),
            }
        }
    }

    /// One sweep. Completes stale records whose transfer is already in the
    /// ledger, fails the rest with a timeout.
    async fn reconcile_once(&self) -> Result<usize> {
        let stale = self
            .transactions
            .list_stale(self.config.stale_horizon)
            .await?;

        let mut resolved = 0;
        for mut tx in stale {
            let applied = self
                .accounts
                .transfer_applied(tx.id)
                .await
                .unwrap_or(false);

            if applied {
                advance_to_completed(&mut tx);
                warn!(transaction_id = %tx.id, "Stale record completed from applied transfer");
            } else if tx
                .fail(FailureReason::Timeout, "abandoned by a stalled coordinator")
                .is_err()
            {
                continue;
            } else {
                warn!(transaction_id = %tx.id, "Stale record failed");
            }

            if let Some(from) = &tx.from_account_id {
                let _ = self.accounts.release_reservation(from, tx.id).await;
            }
            self.transactions.update(tx.clone()).await?;
            let event = if tx.status == TransactionStatus::Completed {
                TransactionEvent::completed(&tx)
            } else {
                TransactionEvent::failed(&tx)
            };
            if let Err(e) = self.events.publish(event).await {
                warn!(transaction_id = %tx.id, error = %e, "Event publication failed");
            }
            self.metrics.record_reconciled();
            resolved += 1;
        }
        Ok(resolved)
    }
}

fn advance_to_completed(tx: &mut Transaction) {
    use TransactionStatus::*;
    for next in [Locking, Validating, Executing, Completed] {
        if tx.status == Completed {
            break;
        }
        if tx.status.can_transition_to(next) {
            let _ = tx.transition_to(next);
        }
    }
}

/// The main coordinator that orchestrates transactions.
pub struct Coordinator {
    /// Configuration.
    config: CoordinatorConfig,
    /// Node ID for this coordinator instance.
    node_id: String,
    /// Current coordinator state.
    state: RwLock<CoordinatorState>,
    /// Hash ring assigning validation duty.
    ring: RwLock<ConsistentHashRing>,
    /// Registered validators by node id.
    validators: DashMap<NodeId, Arc<dyn TransactionValidator>>,
    /// Lock manager for account leases.
    lock_manager: Arc<LockManager>,
    /// Account balance store.
    accounts: Arc<dyn AccountStore>,
    /// Transaction record store.
    transactions: Arc<dyn TransactionStore>,
    /// Terminal event sink.
    events: Arc<dyn EventPublisher>,
    /// Stale-record reconciler.
    reconciler: Arc<Reconciler>,
    /// Metrics.
    metrics: SharedMetrics,
}

impl Coordinator {
    /// Create a new coordinator instance.
    pub fn new(
        config: CoordinatorConfig,
        accounts: Arc<dyn AccountStore>,
        transactions: Arc<dyn TransactionStore>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        let node_id = config
            .node_id
            .clone()
            .unwrap_or_else(|| format!("coordinator-{}", uuid::Uuid::new_v4().simple()));
        let lock_manager = Arc::new(LockManager::new(config.lock.clone()));
        let metrics: SharedMetrics = Arc::new(Metrics::new());
        let reconciler = Arc::new(Reconciler {
            config: config.reconciler.clone(),
            accounts: accounts.clone(),
            transactions: transactions.clone(),
            events: events.clone(),
            metrics: metrics.clone(),
        });

        Self {
            config,
            node_id,
            state: RwLock::new(CoordinatorState::Starting),
            ring: RwLock::new(ConsistentHashRing::new()),
            validators: DashMap::new(),
            lock_manager,
            accounts,
            transactions,
            events,
            reconciler,
            metrics,
        }
    }

    /// Start the coordinator and its background tasks.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        info!(node_id = %self.node_id, "Starting coordinator");

        self.config
            .validate()
            .map_err(CoreError::ConfigurationError)?;
        *self.state.write() = CoordinatorState::Running;

        let lock_manager = self.lock_manager.clone();
        tokio::spawn(async move {
            lock_manager.run_cleanup_loop().await;
        });

        let reconciler = self.reconciler.clone();
        tokio::spawn(async move {
            reconciler.run_loop().await;
        });

        info!(node_id = %self.node_id, "Coordinator started");
        Ok(())
    }

    /// Stop the coordinator gracefully, draining in-flight transactions.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<()> {
        info!(node_id = %self.node_id, "Stopping coordinator");

        *self.state.write() = CoordinatorState::ShuttingDown;
        self.drain_in_flight().await;
        *self.state.write() = CoordinatorState::Stopped;

        info!(node_id = %self.node_id, "Coordinator stopped");
        Ok(())
    }

    /// Register a validation node and hash it into the ring.
    pub fn register_node(&self, node: RingNode, validator: Arc<dyn TransactionValidator>) {
        info!(node_id = %node.node_id, weight = node.weight, "Validation node registered");
        self.validators.insert(node.node_id.clone(), validator);
        self.ring.write().add_node(node);
    }

    /// Mark a node healthy or unhealthy without removing it.
    pub fn set_node_health(&self, node_id: &NodeId, healthy: bool) {
        info!(node_id = %node_id, healthy, "Node health changed");
        self.ring.write().set_healthy(node_id, healthy);
    }

    /// Remove a node from the ring and the validator registry.
    pub fn remove_node(&self, node_id: &NodeId) {
        info!(node_id = %node_id, "Validation node removed");
        self.ring.write().remove_node(node_id);
        self.validators.remove(node_id);
    }

    /// Number of healthy ring members.
    pub fn healthy_node_count(&self) -> usize {
        self.ring.read().healthy_count()
    }

    /// Get the current coordinator state.
    pub fn state(&self) -> CoordinatorState {
        *self.state.read()
    }

    /// Shared metrics handle.
    pub fn metrics(&self) -> SharedMetrics {
        self.metrics.clone()
    }

    /// Fetch a transaction record.
    pub async fn get_transaction(&self, id: TransactionId) -> Result<Transaction> {
        self.transactions.get(id).await
    }

    /// Fetch a transaction record by its idempotency reference.
    pub async fn get_by_reference(&self, reference_id: &ReferenceId) -> Result<Option<Transaction>> {
        self.transactions.get_by_reference(reference_id).await
    }

    /// Submit a funds movement and drive it to a terminal state.
    ///
    /// Resubmitting a reference that already has a completed or in-flight
    /// record returns that record's outcome without starting a new attempt.
    /// A reference whose prior attempt is terminal-failed runs fresh.
    #[instrument(skip(self, request), fields(node_id = %self.node_id))]
    pub async fn submit(&self, request: TransferRequest) -> Result<SubmitOutcome> {
        if !self.state.read().accepts_requests() {
            return Err(CoreError::CoordinatorBusy {
                retry_after_ms: 1000,
            });
        }

        let reference_id = request
            .reference_id
            .clone()
            .unwrap_or_else(ReferenceId::generate);
        let mut tx = Transaction::new(
            request.kind,
            request.from_account_id,
            request.to_account_id,
            request.amount,
            reference_id,
        );
        tx.description = request.description;
        tx.metadata = request.metadata;

        tx.validate_shape().map_err(|message| CoreError::InvalidRequest {
            message,
            field: None,
        })?;
        for account_id in tx.lock_set() {
            if !account_id.is_valid() {
                return Err(CoreError::InvalidRequest {
                    message: format!("malformed account id: {account_id}"),
                    field: Some("account_id".to_string()),
                });
            }
        }

        match self.transactions.insert(tx.clone()).await {
            Ok(()) => {}
            Err(CoreError::DuplicateReference { transaction_id, .. }) => {
                self.metrics.transaction_deduplicated();
                let existing = self.transactions.get(transaction_id).await?;
                info!(
                    transaction_id = %existing.id,
                    reference_id = %existing.reference_id,
                    status = ?existing.status,
                    "Duplicate reference, returning existing record"
                );
                return Ok(match existing.status {
                    TransactionStatus::Completed => SubmitOutcome::Completed(existing),
                    TransactionStatus::Failed => SubmitOutcome::Failed(existing),
                    _ => SubmitOutcome::Accepted(transaction_id),
                });
            }
            Err(e) => return Err(e),
        }

        self.metrics.transaction_submitted();
        info!(
            transaction_id = %tx.id,
            reference_id = %tx.reference_id,
            amount = %tx.amount,
            "Transaction accepted"
        );

        match self.run_protocol(&mut tx).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                // Unexpected internal failure; make sure the record does not
                // linger in flight. Once it is marked failed the caller gets
                // the terminal record, not the internal error.
                error!(transaction_id = %tx.id, error = %e, "Protocol aborted");
                if tx.status == TransactionStatus::Failed {
                    self.metrics.transaction_failed();
                    return Ok(SubmitOutcome::Failed(tx));
                }
                if tx.fail(FailureReason::ExecutionError, e.to_string()).is_err()
                    || self.transactions.update(tx.clone()).await.is_err()
                {
                    return Err(e);
                }
                self.metrics.transaction_failed();
                Ok(SubmitOutcome::Failed(tx))
            }
        }
    }

    /// Run one reconciliation sweep immediately.
    pub async fn reconcile_once(&self) -> Result<usize> {
        self.reconciler.reconcile_once().await
    }

    // --- Protocol phases ---

    async fn run_protocol(&self, tx: &mut Transaction) -> Result<SubmitOutcome> {
        // Phase 1: lock every touched account, ascending.
        tx.transition_to(TransactionStatus::Locking)?;
        self.transactions.update(tx.clone()).await?;

        let locks = match self.acquire_locks(tx).await {
            Ok(locks) => locks,
            Err(e) => return self.fail_transaction(tx, Vec::new(), e).await,
        };

        // Reserve the outgoing amount so validators of other transactions
        // see these funds as spoken for.
        if let Some(from) = &tx.from_account_id {
            if let Err(e) = self.accounts.reserve(from, tx.id, &tx.amount).await {
                return self.fail_transaction(tx, locks, e).await;
            }
        }

        // Phase 2: unanimous validation by the ring-assigned nodes.
        tx.transition_to(TransactionStatus::Validating)?;
        let assigned = self
            .ring
            .read()
            .nodes_for(tx.id.as_bytes(), self.config.consensus.replication);
        tx.assigned_node_ids = assigned.clone();
        self.transactions.update(tx.clone()).await?;

        if assigned.is_empty() {
            let err = CoreError::ValidationRejected {
                node_id: NodeId::new(self.node_id.clone()),
                reason: "no healthy validation nodes".to_string(),
            };
            return self.fail_transaction(tx, locks, err).await;
        }

        let mut explicit_reject: Option<ValidationVote> = None;
        let mut timed_out: Option<NodeId> = None;
        for outcome in self.collect_votes(tx, &assigned).await {
            match outcome {
                VoteOutcome::Cast(vote) => {
                    self.metrics.vote(vote.is_approve());
                    if !vote.is_approve() && explicit_reject.is_none() {
                        explicit_reject = Some(vote.clone());
                    }
                    tx.record_vote(vote);
                }
                VoteOutcome::Missed(node_id) => {
                    self.metrics.validator_timeout();
                    warn!(transaction_id = %tx.id, node_id = %node_id, "Validator missed deadline");
                    if timed_out.is_none() {
                        timed_out = Some(node_id.clone());
                    }
                    tx.record_vote(ValidationVote::reject(
                        node_id,
                        tx.id,
                        "validation deadline missed",
                    ));
                }
            }
        }

        let approvals = tx.votes.iter().filter(|v| v.is_approve()).count();
        if approvals < assigned.len() {
            let err = if let Some(vote) = explicit_reject {
                CoreError::ValidationRejected {
                    node_id: vote.node_id,
                    reason: vote.reason.unwrap_or_default(),
                }
            } else if let Some(node_id) = timed_out {
                CoreError::ValidatorTimeout { node_id }
            } else {
                CoreError::InternalError("validation votes missing".to_string())
            };
            return self.fail_transaction(tx, locks, err).await;
        }

        // Phase 3: apply the atomic mutation under the held fencing token.
        tx.transition_to(TransactionStatus::Executing)?;
        self.transactions.update(tx.clone()).await?;

        let fencing_token = locks.iter().map(|l| l.fencing_token).max().unwrap_or(0);
        if let Err(e) = self
            .accounts
            .apply_transfer(
                tx.id,
                fencing_token,
                tx.from_account_id.as_ref(),
                tx.to_account_id.as_ref(),
                &tx.amount,
            )
            .await
        {
            return self.fail_transaction(tx, locks, e).await;
        }

        tx.transition_to(TransactionStatus::Completed)?;
        self.release_holdings(tx, locks).await;
        self.transactions.update(tx.clone()).await?;
        self.publish_terminal(tx).await;
        self.metrics.transaction_completed();
        info!(
            transaction_id = %tx.id,
            amount = %tx.amount,
            "Transaction completed"
        );
        Ok(SubmitOutcome::Completed(tx.clone()))
    }

    async fn acquire_locks(&self, tx: &Transaction) -> Result<Vec<AccountLock>> {
        let accounts = tx.lock_set();
        let lease = self.config.lock.lease_duration;
        let retries = self.config.lock.acquire_retries;

        let mut attempt: u32 = 0;
        loop {
            match self.lock_manager.acquire_all(&accounts, tx.id, lease) {
                Ok(locks) => {
                    for _ in &locks {
                        self.metrics.lock_acquired();
                    }
                    return Ok(locks);
                }
                Err(e) if e.is_retryable() && attempt < retries => {
                    self.metrics.lock_conflict();
                    attempt += 1;
                    let base = self.config.lock.retry_backoff;
                    let jitter_ms =
                        rand::thread_rng().gen_range(0..=(base.as_millis() as u64 / 2).max(1));
                    tokio::time::sleep(
                        base * attempt + std::time::Duration::from_millis(jitter_ms),
                    )
                    .await;
                }
                Err(e) => {
                    self.metrics.lock_conflict();
                    return Err(e);
                }
            }
        }
    }

    async fn collect_votes(&self, tx: &Transaction, assigned: &[NodeId]) -> Vec<VoteOutcome> {
        let deadline = self.config.consensus.validation_timeout;
        let mut results = Vec::with_capacity(assigned.len());
        let mut set: JoinSet<VoteOutcome> = JoinSet::new();

        for node_id in assigned.iter().cloned() {
            match self.validators.get(&node_id).map(|v| Arc::clone(v.value())) {
                Some(validator) => {
                    let tx = tx.clone();
                    set.spawn(async move {
                        match timeout(deadline, validator.validate(&tx)).await {
                            Ok(vote) => VoteOutcome::Cast(vote),
                            Err(_) => VoteOutcome::Missed(node_id),
                        }
                    });
                }
                // A ring member with no registered validator cannot vote.
                None => results.push(VoteOutcome::Missed(node_id)),
            }
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => results.push(outcome),
                Err(e) => error!(transaction_id = %tx.id, error = %e, "Validator task panicked"),
            }
        }
        results
    }

    async fn fail_transaction(
        &self,
        tx: &mut Transaction,
        locks: Vec<AccountLock>,
        err: CoreError,
    ) -> Result<SubmitOutcome> {
        let reason = err.failure_reason().unwrap_or(FailureReason::ExecutionError);
        warn!(
            transaction_id = %tx.id,
            reason = %reason,
            error = %err,
            "Transaction failed"
        );

        self.release_holdings(tx, locks).await;
        tx.fail(reason, err.to_string())?;
        self.transactions.update(tx.clone()).await?;
        self.publish_terminal(tx).await;
        self.metrics.transaction_failed();
        Ok(SubmitOutcome::Failed(tx.clone()))
    }

    async fn release_holdings(&self, tx: &Transaction, locks: Vec<AccountLock>) {
        if let Some(from) = &tx.from_account_id {
            let _ = self.accounts.release_reservation(from, tx.id).await;
        }
        for lock in locks {
            // A stale release means the lease already lapsed; nothing to do.
            let _ = self.lock_manager.release(&lock.account_id, lock.fencing_token);
        }
    }

    async fn publish_terminal(&self, tx: &Transaction) {
        let event = if tx.status == TransactionStatus::Completed {
            TransactionEvent::completed(tx)
        } else {
            TransactionEvent::failed(tx)
        };
        if let Err(e) = self.events.publish(event).await {
            // Best effort; events are not on the correctness path.
            warn!(transaction_id = %tx.id, error = %e, "Event publication failed");
        }
    }

    async fn drain_in_flight(&self) {
        use std::time::Duration;
        let drain_timeout = Duration::from_secs(30);

        let _ = timeout(drain_timeout, async {
            loop {
                let in_flight = self.metrics.snapshot().transactions_active;
                if in_flight == 0 {
                    break;
                }
                info!(in_flight, "Waiting for in-flight transactions");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await;
    }
}
