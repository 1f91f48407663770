//! Paycore Coordinator
//!
//! The coordination core for transfers between accounts: consistent-hash
//! node selection, lease-based account locks with fencing tokens, parallel
//! validation with a unanimous-approval rule, and atomic execution through
//! the ledger's transaction boundary.

pub mod coordinator;
pub mod config;
pub mod ring;
pub mod lock_manager;
pub mod validator;
pub mod store;
pub mod state;
pub mod metrics;

pub use coordinator::{Coordinator, SubmitOutcome, TransferRequest};
pub use config::CoordinatorConfig;
pub use ring::{ConsistentHashRing, RingNode};
pub use lock_manager::{AccountLock, LockManager};
pub use store::{EventPublisher, InMemoryEventPublisher, InMemoryTransactionStore, TransactionStore};
pub use validator::{FraudCheck, NodeValidator, NoopFraudCheck, TransactionValidator};
