//! Paycore Common Types
//!
//! This crate contains shared types used across the paycore transaction
//! coordination core, including identifiers, monetary types, the transaction
//! record and its state machine, and the error taxonomy.

pub mod identifiers;
pub mod money;
pub mod transaction;
pub mod error;
pub mod events;

pub use identifiers::*;
pub use money::*;
pub use transaction::*;
pub use error::*;
pub use events::*;
