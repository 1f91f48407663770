//! Paycore Ledger
//!
//! Account read/write interface consumed by the coordination core, plus an
//! in-process implementation with a single atomic transaction boundary.

pub mod account;
pub mod store;
pub mod memory;

pub use account::{Account, AccountBalance, AccountStatus};
pub use store::AccountStore;
pub use memory::InMemoryLedger;
