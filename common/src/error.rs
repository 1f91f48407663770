//! Error taxonomy for the coordination core.

use crate::{AccountId, FailureReason, NodeId, ReferenceId, TransactionId, TransactionStatus};
use thiserror::Error;

/// Main error type for paycore operations.
#[derive(Error, Debug)]
pub enum CoreError {
    /// A valid lock on the account is held by another transaction.
    /// Recoverable; callers may retry after backoff.
    #[error("Lock on account {account_id} held by transaction {held_by}")]
    LockConflict {
        account_id: AccountId,
        held_by: TransactionId,
    },

    /// The caller's lease expired and the lock was reassigned. The caller
    /// must abort this attempt without mutating state.
    #[error("Stale lock on account {account_id}: fencing token {presented} no longer current")]
    StaleLock {
        account_id: AccountId,
        presented: u64,
    },

    /// A validating node rejected the transaction.
    #[error("Validation rejected by node {node_id}: {reason}")]
    ValidationRejected { node_id: NodeId, reason: String },

    /// A validator missed its deadline; treated as rejection (fail-closed).
    #[error("Validator {node_id} timed out")]
    ValidatorTimeout { node_id: NodeId },

    /// Storage-layer failure during the atomic mutation. Balances are
    /// guaranteed untouched.
    #[error("Execution error: {0}")]
    ExecutionError(String),

    /// Insufficient available funds.
    #[error("Insufficient funds on account {account_id}: required {required}, available {available}")]
    InsufficientFunds {
        account_id: AccountId,
        required: String,
        available: String,
    },

    /// Account does not exist.
    #[error("Account not found: {0}")]
    AccountNotFound(AccountId),

    /// Account exists but cannot transact.
    #[error("Account {account_id} is not active: {status}")]
    AccountInactive {
        account_id: AccountId,
        status: String,
    },

    /// Transaction record not found.
    #[error("Transaction not found: {0}")]
    TransactionNotFound(TransactionId),

    /// Reference already bound to another in-flight or terminal record.
    /// Not a failure: the prior result is returned to the caller.
    #[error("Duplicate reference {reference_id}, bound to transaction {transaction_id}")]
    DuplicateReference {
        reference_id: ReferenceId,
        transaction_id: TransactionId,
    },

    /// Invalid state transition attempted.
    #[error("Invalid transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: TransactionStatus,
        to: TransactionStatus,
    },

    /// Structurally invalid request.
    #[error("Invalid request: {message}")]
    InvalidRequest {
        message: String,
        field: Option<String>,
    },

    /// Coordinator is not accepting requests.
    #[error("Coordinator busy, retry after {retry_after_ms}ms")]
    CoordinatorBusy { retry_after_ms: u64 },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// Internal coordinator error.
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl CoreError {
    /// Check if this error is retryable by the caller.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::LockConflict { .. } | CoreError::CoordinatorBusy { .. }
        )
    }

    /// Map this error to the failure reason recorded on the transaction,
    /// if it terminates an attempt.
    pub fn failure_reason(&self) -> Option<FailureReason> {
        match self {
            CoreError::LockConflict { .. } => Some(FailureReason::LockConflict),
            CoreError::ValidationRejected { .. } => Some(FailureReason::ValidationRejected),
            CoreError::InsufficientFunds { .. } => Some(FailureReason::ValidationRejected),
            CoreError::ValidatorTimeout { .. } => Some(FailureReason::Timeout),
            CoreError::ExecutionError(_) => Some(FailureReason::ExecutionError),
            _ => None,
        }
    }

    /// Stable error code for events and audit records.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::LockConflict { .. } => "LOCK_CONFLICT",
            CoreError::StaleLock { .. } => "STALE_LOCK",
            CoreError::ValidationRejected { .. } => "VALIDATION_REJECTED",
            CoreError::ValidatorTimeout { .. } => "VALIDATOR_TIMEOUT",
            CoreError::ExecutionError(_) => "EXECUTION_ERROR",
            CoreError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            CoreError::AccountNotFound(_) => "ACCOUNT_NOT_FOUND",
            CoreError::AccountInactive { .. } => "ACCOUNT_INACTIVE",
            CoreError::TransactionNotFound(_) => "TRANSACTION_NOT_FOUND",
            CoreError::DuplicateReference { .. } => "DUPLICATE_REFERENCE",
            CoreError::InvalidTransition { .. } => "INVALID_TRANSITION",
            CoreError::InvalidRequest { .. } => "INVALID_REQUEST",
            CoreError::CoordinatorBusy { .. } => "COORDINATOR_BUSY",
            CoreError::ConfigurationError(_) => "CONFIGURATION_ERROR",
            CoreError::InternalError(_) => "INTERNAL_ERROR",
        }
    }
}

impl From<crate::transaction::InvalidTransition> for CoreError {
    fn from(e: crate::transaction::InvalidTransition) -> Self {
        CoreError::InvalidTransition {
            from: e.from,
            to: e.to,
        }
    }
}

/// Result type alias for paycore operations.
pub type Result<T> = std::result::Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let conflict = CoreError::LockConflict {
            account_id: AccountId::new("ACC_A"),
            held_by: TransactionId::new(),
        };
        assert!(conflict.is_retryable());

        let stale = CoreError::StaleLock {
            account_id: AccountId::new("ACC_A"),
            presented: 3,
        };
        assert!(!stale.is_retryable());
    }

    #[test]
    fn test_failure_reason_mapping() {
        let timeout = CoreError::ValidatorTimeout {
            node_id: NodeId::new("node1"),
        };
        assert_eq!(timeout.failure_reason(), Some(FailureReason::Timeout));

        let exec = CoreError::ExecutionError("storage conflict".to_string());
        assert_eq!(exec.failure_reason(), Some(FailureReason::ExecutionError));

        let dup = CoreError::DuplicateReference {
            reference_id: ReferenceId::generate(),
            transaction_id: TransactionId::new(),
        };
        assert_eq!(dup.failure_reason(), None);
    }
}
