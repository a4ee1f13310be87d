//! Transactional storage port.
//!
//! A [`UnitOfWork`] is one atomic read/write boundary: everything staged on
//! it becomes visible on [`UnitOfWork::commit`], and dropping it without a
//! commit discards all of it. Audit records and the mutations they guard are
//! always staged on the same unit of work.

use async_trait::async_trait;
use rust_decimal::Decimal;

use vaultline_common::{
    AccountId, AccountNumber, LedgerNumber, Payment, PaymentReference, Result, Timestamp,
    Transaction, TransactionId, TransactionType, UserId,
};

use crate::account::Account;
use crate::audit::{AuditLog, EntityKind};
use crate::query::TransactionFilter;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Opens units of work.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>>;
}

/// One atomic read/write boundary.
#[async_trait]
pub trait UnitOfWork: Send {
    /// Account by number, locked for update where the backend supports it.
    async fn account_by_number(&mut self, number: &AccountNumber) -> Result<Option<Account>>;

    async fn account_by_id(&mut self, id: &AccountId) -> Result<Option<Account>>;

    async fn accounts_by_owner(&mut self, owner: &UserId) -> Result<Vec<Account>>;

    async fn ledger_number_exists(&mut self, number: &LedgerNumber) -> Result<bool>;

    /// Number of ledger numbers starting with `prefix`.
    async fn count_ledger_numbers_with_prefix(&mut self, prefix: &str) -> Result<u64>;

    async fn account_number_exists(&mut self, number: &AccountNumber) -> Result<bool>;

    /// Insert a new account. Duplicate numbers are a `Conflict`.
    async fn insert_account(&mut self, account: &Account) -> Result<()>;

    async fn update_account(&mut self, account: &Account) -> Result<()>;

    async fn transaction_by_id(&mut self, id: &TransactionId) -> Result<Option<Transaction>>;

    /// All transactions carrying `reference`, oldest first.
    async fn transactions_by_reference(
        &mut self,
        reference: &PaymentReference,
    ) -> Result<Vec<Transaction>>;

    async fn insert_transaction(&mut self, tx: &Transaction) -> Result<()>;

    async fn update_transaction(&mut self, tx: &Transaction) -> Result<()>;

    /// Sum of live, non-rejected transactions of `kind` booked on `account`
    /// since `since`.
    async fn booked_total_since(
        &mut self,
        account: &AccountNumber,
        kind: TransactionType,
        since: Timestamp,
    ) -> Result<Decimal>;

    /// Transactions matching `filter`, oldest first.
    async fn query_transactions(&mut self, filter: &TransactionFilter) -> Result<Vec<Transaction>>;

    async fn count_transactions(&mut self, filter: &TransactionFilter) -> Result<u64>;

    async fn payment_by_reference(&mut self, reference: &PaymentReference)
        -> Result<Option<Payment>>;

    async fn insert_payment(&mut self, payment: &Payment) -> Result<()>;

    async fn update_payment(&mut self, payment: &Payment) -> Result<()>;

    /// Append audit records. All or none.
    async fn append_audit(&mut self, entries: &[AuditLog]) -> Result<()>;

    /// Audit records for one entity, oldest first.
    async fn audit_for(&mut self, kind: EntityKind, entity_id: uuid::Uuid) -> Result<Vec<AuditLog>>;

    /// Make every staged write durable.
    async fn commit(self: Box<Self>) -> Result<()>;
}
