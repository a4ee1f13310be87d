//! Vaultline Ledger Engine
//!
//! Accounts, balance-moving transactions and the audit trail that gates every
//! mutation of them. All writes go through a [`store::UnitOfWork`] so that an
//! audit record and the change it describes commit or roll back together.

pub mod account;
pub mod audit;
pub mod config;
pub mod directory;
pub mod engine;
pub mod locks;
pub mod numbering;
pub mod query;
pub mod store;

pub use account::{Account, AccountStatus, AccountType, NewAccount};
pub use audit::{AuditAction, AuditLog, AuditSnapshot, AuditTrail, Auditable, EntityKind};
pub use config::LedgerConfig;
pub use directory::{CustomerDirectory, StaticDirectory};
pub use engine::{
    DepositCommand, OpenAccountCommand, OperationContext, TransactionLedger, TransferCommand,
    TransferReceipt, WithdrawalCommand,
};
pub use locks::AccountLocks;
pub use numbering::{validate_account_number, AccountIdentifierGenerator};
pub use query::{Period, TransactionFilter};
pub use store::{LedgerStore, MemoryStore, PgStore, UnitOfWork};
