//! Per-account write locks.
//!
//! Every balance-mutating operation holds the lock of each account it
//! touches for the whole unit of work. Multi-account operations acquire in
//! ascending account-number order.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use vaultline_common::AccountNumber;

/// Guard for one account; released on drop.
pub type AccountGuard = OwnedMutexGuard<()>;

/// Lock table keyed by account number.
#[derive(Debug, Default)]
pub struct AccountLocks {
    locks: DashMap<AccountNumber, Arc<Mutex<()>>>,
}

impl AccountLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, account: &AccountNumber) -> Arc<Mutex<()>> {
        self.locks.entry(account.clone()).or_default().clone()
    }

    /// Wait for exclusive access to one account.
    pub async fn acquire(&self, account: &AccountNumber) -> AccountGuard {
        self.slot(account).lock_owned().await
    }

    /// Wait for exclusive access to several accounts, in sorted order.
    pub async fn acquire_many(&self, accounts: &[&AccountNumber]) -> Vec<AccountGuard> {
        let mut ordered: Vec<&AccountNumber> = accounts.to_vec();
        ordered.sort();
        ordered.dedup();

        let mut guards = Vec::with_capacity(ordered.len());
        for account in ordered {
            guards.push(self.acquire(account).await);
        }
        guards
    }

    /// Drop entries nobody holds or waits on.
    pub fn prune(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        let removed = before.saturating_sub(self.locks.len());
        if removed > 0 {
            debug!(removed, "Pruned idle account locks");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
