//! Metrics collection for coordinator monitoring.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Coordinator metrics.
pub struct Metrics {
    /// Total transactions submitted.
    pub transactions_submitted: AtomicU64,
    /// Transactions that reached `completed`.
    pub transactions_completed: AtomicU64,
    /// Transactions that reached `failed`.
    pub transactions_failed: AtomicU64,
    /// Submissions answered from an existing record by reference id.
    pub transactions_deduplicated: AtomicU64,
    /// Transactions currently in flight.
    pub transactions_active: AtomicU64,
    /// Total account locks granted.
    pub locks_acquired: AtomicU64,
    /// Lock acquisitions denied due to a live holder.
    pub lock_conflicts: AtomicU64,
    /// Approving votes received.
    pub votes_approved: AtomicU64,
    /// Rejecting votes received.
    pub votes_rejected: AtomicU64,
    /// Validators that missed their deadline.
    pub validator_timeouts: AtomicU64,
    /// Stale records resolved by the reconciler.
    pub reconciled: AtomicU64,
}

impl Metrics {
    /// Create new metrics instance.
    pub fn new() -> Self {
        Self {
            transactions_submitted: AtomicU64::new(0),
            transactions_completed: AtomicU64::new(0),
            transactions_failed: AtomicU64::new(0),
            transactions_deduplicated: AtomicU64::new(0),
            transactions_active: AtomicU64::new(0),
            locks_acquired: AtomicU64::new(0),
            lock_conflicts: AtomicU64::new(0),
            votes_approved: AtomicU64::new(0),
            votes_rejected: AtomicU64::new(0),
            validator_timeouts: AtomicU64::new(0),
            reconciled: AtomicU64::new(0),
        }
    }

    /// Record a new submission entering the pipeline.
    pub fn transaction_submitted(&self) {
        self.transactions_submitted.fetch_add(1, Ordering::Relaxed);
        self.transactions_active.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a completed transaction.
    pub fn transaction_completed(&self) {
        self.transactions_completed.fetch_add(1, Ordering::Relaxed);
        self.transactions_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a failed transaction.
    pub fn transaction_failed(&self) {
        self.transactions_failed.fetch_add(1, Ordering::Relaxed);
        self.transactions_active.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record a submission deduplicated by reference id.
    pub fn transaction_deduplicated(&self) {
        self.transactions_deduplicated
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Record a granted lock.
    pub fn lock_acquired(&self) {
        self.locks_acquired.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a denied lock acquisition.
    pub fn lock_conflict(&self) {
        self.lock_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a validation vote.
    pub fn vote(&self, approved: bool) {
        if approved {
            self.votes_approved.fetch_add(1, Ordering::Relaxed);
        } else {
            self.votes_rejected.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record a validator deadline miss.
    pub fn validator_timeout(&self) {
        self.validator_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a stale record resolved by the reconciler.
    pub fn record_reconciled(&self) {
        self.reconciled.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            transactions_submitted: self.transactions_submitted.load(Ordering::Relaxed),
            transactions_completed: self.transactions_completed.load(Ordering::Relaxed),
            transactions_failed: self.transactions_failed.load(Ordering::Relaxed),
            transactions_deduplicated: self.transactions_deduplicated.load(Ordering::Relaxed),
            transactions_active: self.transactions_active.load(Ordering::Relaxed),
            locks_acquired: self.locks_acquired.load(Ordering::Relaxed),
            lock_conflicts: self.lock_conflicts.load(Ordering::Relaxed),
            votes_approved: self.votes_approved.load(Ordering::Relaxed),
            votes_rejected: self.votes_rejected.load(Ordering::Relaxed),
            validator_timeouts: self.validator_timeouts.load(Ordering::Relaxed),
            reconciled: self.reconciled.load(Ordering::Relaxed),
        }
    }

    /// Export metrics in Prometheus format.
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        format!(
            r#"# HELP paycore_transactions_submitted Total transactions submitted
# TYPE paycore_transactions_submitted counter
paycore_transactions_submitted {}

# HELP paycore_transactions_completed Total completed transactions
# TYPE paycore_transactions_completed counter
paycore_transactions_completed {}

# HELP paycore_transactions_failed Total failed transactions
# TYPE paycore_transactions_failed counter
paycore_transactions_failed {}

# HELP paycore_transactions_deduplicated Submissions answered from an existing record
# TYPE paycore_transactions_deduplicated counter
paycore_transactions_deduplicated {}

# HELP paycore_transactions_active Current in-flight transactions
# TYPE paycore_transactions_active gauge
paycore_transactions_active {}

# HELP paycore_locks_acquired Total account locks granted
# TYPE paycore_locks_acquired counter
paycore_locks_acquired {}

# HELP paycore_lock_conflicts Total denied lock acquisitions
# TYPE paycore_lock_conflicts counter
paycore_lock_conflicts {}

# HELP paycore_votes_approved Total approving validation votes
# TYPE paycore_votes_approved counter
paycore_votes_approved {}

# HELP paycore_votes_rejected Total rejecting validation votes
# TYPE paycore_votes_rejected counter
paycore_votes_rejected {}

# HELP paycore_validator_timeouts Total validator deadline misses
# TYPE paycore_validator_timeouts counter
paycore_validator_timeouts {}

# HELP paycore_reconciled Total stale records resolved by the reconciler
# TYPE paycore_reconciled counter
paycore_reconciled {}
"#,
            snapshot.transactions_submitted,
            snapshot.transactions_completed,
            snapshot.transactions_failed,
            snapshot.transactions_deduplicated,
            snapshot.transactions_active,
            snapshot.locks_acquired,
            snapshot.lock_conflicts,
            snapshot.votes_approved,
            snapshot.votes_rejected,
            snapshot.validator_timeouts,
            snapshot.reconciled,
        )
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone)]
pub struct MetricsSnapshot {
    pub transactions_submitted: u64,
    pub transactions_completed: u64,
    pub transactions_failed: u64,
    pub transactions_deduplicated: u64,
    pub transactions_active: u64,
    pub locks_acquired: u64,
    pub lock_conflicts: u64,
    pub votes_approved: u64,
    pub votes_rejected: u64,
    pub validator_timeouts: u64,
    pub reconciled: u64,
}

/// Shared metrics instance.
pub type SharedMetrics = Arc<Metrics>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_increment() {
        let metrics = Metrics::new();

        metrics.transaction_submitted();
        metrics.transaction_submitted();
        metrics.transaction_completed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.transactions_submitted, 2);
        assert_eq!(snapshot.transactions_completed, 1);
        assert_eq!(snapshot.transactions_active, 1);
    }

    #[test]
    fn test_vote_tally() {
        let metrics = Metrics::new();
        metrics.vote(true);
        metrics.vote(true);
        metrics.vote(false);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.votes_approved, 2);
        assert_eq!(snapshot.votes_rejected, 1);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = Metrics::new();
        metrics.transaction_submitted();

        let output = metrics.to_prometheus();
        assert!(output.contains("paycore_transactions_submitted 1"));
    }
}
