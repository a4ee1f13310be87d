//! Vaultline Protocol Messages
//!
//! Wire types shared between the back-office core and the HTTP collaborator
//! that fronts it: request bodies, the idempotency key header, and the
//! structured [`OperationResponse`] every operation returns.

pub mod messages;

pub use messages::*;
