//! Vaultline Common Types
//!
//! Shared types used across the Vaultline ledger: identifiers, money,
//! the error taxonomy, the injectable clock, and the transaction and
//! payment entities with their reconciliation state machine.

pub mod identifiers;
pub mod monetary;
pub mod transaction;
pub mod error;
pub mod time;

pub use identifiers::*;
pub use monetary::*;
pub use transaction::*;
pub use error::*;
pub use time::*;
