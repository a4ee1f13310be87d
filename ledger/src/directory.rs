//! Customer directory port.
//!
//! The identity collaborator owns users; the ledger only needs the positive
//! internal serial that seeds account and ledger numbers.

use async_trait::async_trait;
use dashmap::DashMap;

use vaultline_common::{Result, UserId};

#[async_trait]
pub trait CustomerDirectory: Send + Sync {
    /// Internal serial of `user`, `None` if the user is unknown.
    async fn customer_serial(&self, user: &UserId) -> Result<Option<i64>>;
}

/// Directory held in memory.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    serials: DashMap<UserId, i64>,
}

impl StaticDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, user: UserId, serial: i64) {
        self.serials.insert(user, serial);
    }
}

#[async_trait]
impl CustomerDirectory for StaticDirectory {
    async fn customer_serial(&self, user: &UserId) -> Result<Option<i64>> {
        Ok(self.serials.get(user).map(|s| *s))
    }
}
