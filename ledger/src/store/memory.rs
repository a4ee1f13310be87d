//! In-memory store used by tests and the simulator.
//!
//! Units of work are serialised: each holds the store's state lock from
//! `begin` until commit or drop, and stages writes in an overlay that is
//! folded into the state on commit.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use tokio::sync::{Mutex, OwnedMutexGuard};

use vaultline_common::{
    AccountId, AccountNumber, CoreError, LedgerNumber, Payment, PaymentReference,
    ReconciliationStatus, Result, Timestamp, Transaction, TransactionId, TransactionType, UserId,
};

use super::{LedgerStore, UnitOfWork};
use crate::account::Account;
use crate::audit::{AuditLog, EntityKind};
use crate::query::TransactionFilter;

#[derive(Debug, Default)]
struct State {
    accounts: HashMap<AccountId, Account>,
    by_number: HashMap<AccountNumber, AccountId>,
    transactions: HashMap<TransactionId, Transaction>,
    payments: HashMap<PaymentReference, Payment>,
    audit: Vec<AuditLog>,
}

/// Switches that make the store misbehave on purpose.
#[derive(Debug, Default)]
struct Faults {
    fail_audit: AtomicBool,
    fail_account_writes: AtomicBool,
    commit_delay_ms: AtomicU64,
}

/// Shared in-memory ledger state.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    faults: Arc<Faults>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every audit append fail.
    pub fn fail_audit_writes(&self, fail: bool) {
        self.faults.fail_audit.store(fail, Ordering::SeqCst);
    }

    /// Make every account insert/update fail with an internal error.
    pub fn fail_account_writes(&self, fail: bool) {
        self.faults.fail_account_writes.store(fail, Ordering::SeqCst);
    }

    /// Sleep inside every commit before applying it.
    pub fn delay_commits(&self, delay: Duration) {
        self.faults
            .commit_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    /// Insert an account directly, bypassing numbering and audit.
    pub async fn seed_account(&self, account: Account) {
        let mut state = self.state.lock().await;
        state
            .by_number
            .insert(account.account_number.clone(), account.id);
        state.accounts.insert(account.id, account);
    }

    pub async fn account(&self, number: &AccountNumber) -> Option<Account> {
        let state = self.state.lock().await;
        let id = state.by_number.get(number)?;
        state.accounts.get(id).cloned()
    }

    pub async fn accounts(&self) -> Vec<Account> {
        let state = self.state.lock().await;
        state.accounts.values().cloned().collect()
    }

    pub async fn transaction(&self, id: &TransactionId) -> Option<Transaction> {
        self.state.lock().await.transactions.get(id).cloned()
    }

    pub async fn transactions(&self) -> Vec<Transaction> {
        let state = self.state.lock().await;
        let mut all: Vec<_> = state.transactions.values().cloned().collect();
        all.sort_by_key(|t| (t.created_at, t.id));
        all
    }

    pub async fn payment(&self, reference: &PaymentReference) -> Option<Payment> {
        self.state.lock().await.payments.get(reference).cloned()
    }

    pub async fn audit_entries(&self) -> Vec<AuditLog> {
        self.state.lock().await.audit.clone()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>> {
        let base = self.state.clone().lock_owned().await;
        Ok(Box::new(MemoryUnitOfWork {
            base,
            staged: Staged::default(),
            faults: self.faults.clone(),
        }))
    }
}

#[derive(Default)]
struct Staged {
    accounts: HashMap<AccountId, Account>,
    transactions: HashMap<TransactionId, Transaction>,
    payments: HashMap<PaymentReference, Payment>,
    audit: Vec<AuditLog>,
}

struct MemoryUnitOfWork {
    base: OwnedMutexGuard<State>,
    staged: Staged,
    faults: Arc<Faults>,
}

impl MemoryUnitOfWork {
    fn accounts(&self) -> impl Iterator<Item = &Account> {
        self.staged.accounts.values().chain(
            self.base
                .accounts
                .values()
                .filter(|a| !self.staged.accounts.contains_key(&a.id)),
        )
    }

    fn account(&self, id: &AccountId) -> Option<&Account> {
        self.staged
            .accounts
            .get(id)
            .or_else(|| self.base.accounts.get(id))
    }

    fn transactions(&self) -> Vec<&Transaction> {
        let mut merged: BTreeMap<TransactionId, &Transaction> = self
            .base
            .transactions
            .iter()
            .map(|(id, tx)| (*id, tx))
            .collect();
        for (id, tx) in &self.staged.transactions {
            merged.insert(*id, tx);
        }
        let mut all: Vec<_> = merged.into_values().collect();
        all.sort_by_key(|t| (t.created_at, t.id));
        all
    }

    fn check_account_writes(&self) -> Result<()> {
        if self.faults.fail_account_writes.load(Ordering::SeqCst) {
            return Err(CoreError::Internal("account write failed".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn account_by_number(&mut self, number: &AccountNumber) -> Result<Option<Account>> {
        if let Some(account) = self
            .staged
            .accounts
            .values()
            .find(|a| &a.account_number == number)
        {
            return Ok(Some(account.clone()));
        }
        Ok(self
            .base
            .by_number
            .get(number)
            .and_then(|id| self.account(id))
            .cloned())
    }

    async fn account_by_id(&mut self, id: &AccountId) -> Result<Option<Account>> {
        Ok(self.account(id).cloned())
    }

    async fn accounts_by_owner(&mut self, owner: &UserId) -> Result<Vec<Account>> {
        let mut owned: Vec<Account> = self
            .accounts()
            .filter(|a| &a.owner == owner)
            .cloned()
            .collect();
        owned.sort_by_key(|a| (a.created_at, a.id));
        Ok(owned)
    }

    async fn ledger_number_exists(&mut self, number: &LedgerNumber) -> Result<bool> {
        Ok(self.accounts().any(|a| &a.ledger_number == number))
    }

    async fn count_ledger_numbers_with_prefix(&mut self, prefix: &str) -> Result<u64> {
        Ok(self
            .accounts()
            .filter(|a| a.ledger_number.as_str().starts_with(prefix))
            .count() as u64)
    }

    async fn account_number_exists(&mut self, number: &AccountNumber) -> Result<bool> {
        Ok(self.accounts().any(|a| &a.account_number == number))
    }

    async fn insert_account(&mut self, account: &Account) -> Result<()> {
        self.check_account_writes()?;
        if let Some(existing) = self.accounts().find(|a| {
            a.id == account.id
                || a.ledger_number == account.ledger_number
                || a.account_number == account.account_number
        }) {
            return Err(CoreError::Conflict(format!(
                "account {} / {} collides with {}",
                account.ledger_number, account.account_number, existing.account_number
            )));
        }
        self.staged.accounts.insert(account.id, account.clone());
        Ok(())
    }

    async fn update_account(&mut self, account: &Account) -> Result<()> {
        self.check_account_writes()?;
        if self.account(&account.id).is_none() {
            return Err(CoreError::not_found("Account", &account.account_number));
        }
        self.staged.accounts.insert(account.id, account.clone());
        Ok(())
    }

    async fn transaction_by_id(&mut self, id: &TransactionId) -> Result<Option<Transaction>> {
        Ok(self
            .staged
            .transactions
            .get(id)
            .or_else(|| self.base.transactions.get(id))
            .cloned())
    }

    async fn transactions_by_reference(
        &mut self,
        reference: &PaymentReference,
    ) -> Result<Vec<Transaction>> {
        Ok(self
            .transactions()
            .into_iter()
            .filter(|t| &t.payment_reference == reference)
            .cloned()
            .collect())
    }

    async fn insert_transaction(&mut self, tx: &Transaction) -> Result<()> {
        if self.staged.transactions.contains_key(&tx.id)
            || self.base.transactions.contains_key(&tx.id)
        {
            return Err(CoreError::Conflict(format!("transaction {} exists", tx.id)));
        }
        self.staged.transactions.insert(tx.id, tx.clone());
        Ok(())
    }

    async fn update_transaction(&mut self, tx: &Transaction) -> Result<()> {
        if !self.staged.transactions.contains_key(&tx.id)
            && !self.base.transactions.contains_key(&tx.id)
        {
            return Err(CoreError::not_found("Transaction", tx.id));
        }
        self.staged.transactions.insert(tx.id, tx.clone());
        Ok(())
    }

    async fn booked_total_since(
        &mut self,
        account: &AccountNumber,
        kind: TransactionType,
        since: Timestamp,
    ) -> Result<Decimal> {
        Ok(self
            .transactions()
            .into_iter()
            .filter(|t| {
                !t.is_deleted
                    && t.status != ReconciliationStatus::Rejected
                    && t.transaction_type == kind
                    && t.created_at >= since
                    && t.booked_account() == Some(account)
            })
            .map(|t| t.amount.value)
            .sum())
    }

    async fn query_transactions(&mut self, filter: &TransactionFilter) -> Result<Vec<Transaction>> {
        Ok(self
            .transactions()
            .into_iter()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect())
    }

    async fn count_transactions(&mut self, filter: &TransactionFilter) -> Result<u64> {
        Ok(self
            .transactions()
            .into_iter()
            .filter(|t| filter.matches(t))
            .count() as u64)
    }

    async fn payment_by_reference(
        &mut self,
        reference: &PaymentReference,
    ) -> Result<Option<Payment>> {
        Ok(self
            .staged
            .payments
            .get(reference)
            .or_else(|| self.base.payments.get(reference))
            .cloned())
    }

    async fn insert_payment(&mut self, payment: &Payment) -> Result<()> {
        let reference = &payment.payment_reference;
        if self.staged.payments.contains_key(reference) || self.base.payments.contains_key(reference)
        {
            return Err(CoreError::Conflict(format!(
                "payment reference {reference} already used"
            )));
        }
        self.staged
            .payments
            .insert(reference.clone(), payment.clone());
        Ok(())
    }

    async fn update_payment(&mut self, payment: &Payment) -> Result<()> {
        let reference = &payment.payment_reference;
        if !self.staged.payments.contains_key(reference) && !self.base.payments.contains_key(reference)
        {
            return Err(CoreError::not_found("Payment", reference));
        }
        self.staged
            .payments
            .insert(reference.clone(), payment.clone());
        Ok(())
    }

    async fn append_audit(&mut self, entries: &[AuditLog]) -> Result<()> {
        if self.faults.fail_audit.load(Ordering::SeqCst) {
            return Err(CoreError::AuditLogFailed(
                "audit store rejected the write".to_string(),
            ));
        }
        self.staged.audit.extend_from_slice(entries);
        Ok(())
    }

    async fn audit_for(&mut self, kind: EntityKind, entity_id: uuid::Uuid) -> Result<Vec<AuditLog>> {
        Ok(self
            .base
            .audit
            .iter()
            .chain(self.staged.audit.iter())
            .filter(|e| e.entity_kind == kind && e.entity_id == entity_id)
            .cloned()
            .collect())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let delay = self.faults.commit_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        let MemoryUnitOfWork {
            mut base, staged, ..
        } = *self;
        base.audit.extend(staged.audit);
        for (id, account) in staged.accounts {
            base.by_number.insert(account.account_number.clone(), id);
            base.accounts.insert(id, account);
        }
        base.transactions.extend(staged.transactions);
        base.payments.extend(staged.payments);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::account::tests::create_test_account;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use vaultline_common::{Currency, Money};

    #[tokio::test]
    async fn test_dropped_unit_of_work_discards_writes() {
        let store = MemoryStore::new();
        let account = create_test_account("0000001236", UserId::new());

        {
            let mut uow = store.begin().await.unwrap();
            uow.insert_account(&account).await.unwrap();
            assert!(uow
                .account_by_number(&account.account_number)
                .await
                .unwrap()
                .is_some());
        }

        assert!(store.account(&account.account_number).await.is_none());
    }

    #[tokio::test]
    async fn test_commit_publishes_staged_writes() {
        let store = MemoryStore::new();
        let account = create_test_account("0000001236", UserId::new());
        let tx = Transaction::deposit(
            account.account_number.clone(),
            Money::new(dec!(10), Currency::ngn()),
            PaymentReference::generate(),
            Utc::now(),
        );

        let mut uow = store.begin().await.unwrap();
        uow.insert_account(&account).await.unwrap();
        uow.insert_transaction(&tx).await.unwrap();
        uow.commit().await.unwrap();

        assert!(store.account(&account.account_number).await.is_some());
        assert_eq!(store.transaction(&tx.id).await, Some(tx));
    }

    #[tokio::test]
    async fn test_duplicate_account_number_conflicts() {
        let store = MemoryStore::new();
        let first = create_test_account("0000001236", UserId::new());
        let mut second = create_test_account("0000001236", UserId::new());
        second.ledger_number = LedgerNumber::new("other");
        store.seed_account(first).await;

        let mut uow = store.begin().await.unwrap();
        let err = uow.insert_account(&second).await.unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn test_prefix_count_sees_staged_accounts() {
        let store = MemoryStore::new();
        let owner = UserId::new();
        let mut a = create_test_account("0000001236", owner);
        a.ledger_number = LedgerNumber::new("001000123100");
        let mut b = create_test_account("0000002239", owner);
        b.ledger_number = LedgerNumber::new("001000123101");
        store.seed_account(a).await;

        let mut uow = store.begin().await.unwrap();
        uow.insert_account(&b).await.unwrap();
        assert_eq!(uow.count_ledger_numbers_with_prefix("00100012310").await.unwrap(), 2);
        assert_eq!(uow.accounts_by_owner(&owner).await.unwrap().len(), 2);
    }
}
