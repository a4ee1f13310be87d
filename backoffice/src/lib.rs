//! Vaultline Back Office
//!
//! The service layer in front of the ledger: idempotent handling of keyed
//! financial requests, reconciliation of provider-funded deposits, and the
//! lifecycle and metrics of the running service.

pub mod config;
pub mod coordinator;
pub mod idempotency;
pub mod metrics;
pub mod service;
pub mod state;

pub use config::{BackOfficeConfig, IdempotencyConfig};
pub use coordinator::{ReconciliationCoordinator, ReconciliationOutcome};
pub use idempotency::{fingerprint, Admission, IdempotencyGuard, Ticket};
pub use metrics::{Metrics, MetricsSnapshot, SharedMetrics};
pub use service::BackOffice;
pub use state::ServiceState;
