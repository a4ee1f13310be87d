//! Audit trail: snapshot-before-mutate records for ledger entities.
//!
//! Every mutating or deleting operation stages an [`AuditLog`] carrying
//! the entity as it was *before* the change, in the same unit of work as
//! the change itself. If the audit write fails the operation fails with
//! [`CoreError::AuditLogFailed`] and nothing is committed.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::error;
use uuid::Uuid;

use vaultline_common::{
    AuditId, CoreError, Payment, Result, SharedClock, Timestamp, Transaction, UserId,
};

use crate::account::Account;
use crate::store::UnitOfWork;

/// Kind of entity an audit record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    Account,
    Transaction,
    Payment,
    User,
    Upload,
    Bank,
    Branch,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Account => "Account",
            EntityKind::Transaction => "Transaction",
            EntityKind::Payment => "Payment",
            EntityKind::User => "User",
            EntityKind::Upload => "Upload",
            EntityKind::Bank => "Bank",
            EntityKind::Branch => "Branch",
        }
    }
}

impl FromStr for EntityKind {
    type Err = CoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "Account" => Ok(Self::Account),
            "Transaction" => Ok(Self::Transaction),
            "Payment" => Ok(Self::Payment),
            "User" => Ok(Self::User),
            "Upload" => Ok(Self::Upload),
            "Bank" => Ok(Self::Bank),
            "Branch" => Ok(Self::Branch),
            other => Err(CoreError::validation(format!("unknown entity kind: {other}"))),
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the audited operation did to the entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Update,
    Delete,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Update => "update",
            AuditAction::Delete => "delete",
        }
    }
}

impl FromStr for AuditAction {
    type Err = CoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            other => Err(CoreError::validation(format!("unknown audit action: {other}"))),
        }
    }
}

/// An append-only audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditLog {
    pub id: AuditId,
    pub entity_kind: EntityKind,
    /// Public id of the snapshotted entity.
    pub entity_id: Uuid,
    pub action: AuditAction,
    /// Pre-mutation snapshot.
    pub payload: Value,
    pub actor: UserId,
    pub created_at: Timestamp,
}

impl AuditLog {
    /// Decode the payload according to the entity kind.
    pub fn snapshot(&self) -> Result<AuditSnapshot> {
        AuditSnapshot::decode(self.entity_kind, &self.payload)
    }
}

/// A decoded audit payload.
#[derive(Debug, Clone, PartialEq)]
pub enum AuditSnapshot {
    Account(Box<Account>),
    Transaction(Box<Transaction>),
    Payment(Box<Payment>),
    /// Entities owned by collaborators; kept as their JSON object.
    External { kind: EntityKind, payload: Value },
}

impl AuditSnapshot {
    pub fn decode(kind: EntityKind, payload: &Value) -> Result<Self> {
        let bad = |e: serde_json::Error| {
            CoreError::validation(format!("malformed {kind} audit payload: {e}"))
        };
        match kind {
            EntityKind::Account => Ok(Self::Account(Box::new(
                serde_json::from_value(payload.clone()).map_err(bad)?,
            ))),
            EntityKind::Transaction => Ok(Self::Transaction(Box::new(
                serde_json::from_value(payload.clone()).map_err(bad)?,
            ))),
            EntityKind::Payment => Ok(Self::Payment(Box::new(
                serde_json::from_value(payload.clone()).map_err(bad)?,
            ))),
            EntityKind::User | EntityKind::Upload | EntityKind::Bank | EntityKind::Branch => {
                if !payload.is_object() {
                    return Err(CoreError::validation(format!(
                        "{kind} audit payload must be an object"
                    )));
                }
                Ok(Self::External {
                    kind,
                    payload: payload.clone(),
                })
            }
        }
    }
}

/// An entity that goes through the audited-mutation pipeline.
#[async_trait]
pub trait Auditable: Serialize + Send + Sync {
    const KIND: EntityKind;

    fn entity_id(&self) -> Uuid;

    /// Stage the (mutated) entity in the unit of work.
    async fn persist(&self, uow: &mut dyn UnitOfWork) -> Result<()>;
}

#[async_trait]
impl Auditable for Account {
    const KIND: EntityKind = EntityKind::Account;

    fn entity_id(&self) -> Uuid {
        *self.id.as_uuid()
    }

    async fn persist(&self, uow: &mut dyn UnitOfWork) -> Result<()> {
        uow.update_account(self).await
    }
}

#[async_trait]
impl Auditable for Transaction {
    const KIND: EntityKind = EntityKind::Transaction;

    fn entity_id(&self) -> Uuid {
        *self.id.as_uuid()
    }

    async fn persist(&self, uow: &mut dyn UnitOfWork) -> Result<()> {
        uow.update_transaction(self).await
    }
}

#[async_trait]
impl Auditable for Payment {
    const KIND: EntityKind = EntityKind::Payment;

    fn entity_id(&self) -> Uuid {
        *self.id.as_uuid()
    }

    async fn persist(&self, uow: &mut dyn UnitOfWork) -> Result<()> {
        uow.update_payment(self).await
    }
}

/// Writes audit records and runs audited mutations.
#[derive(Clone)]
pub struct AuditTrail {
    clock: SharedClock,
}

impl AuditTrail {
    pub fn new(clock: SharedClock) -> Self {
        Self { clock }
    }

    /// Build the record for `entity` as it is now.
    pub fn snapshot<E: Auditable>(
        &self,
        entity: &E,
        action: AuditAction,
        actor: UserId,
    ) -> Result<AuditLog> {
        let payload = serde_json::to_value(entity).map_err(|e| {
            CoreError::AuditLogFailed(format!("cannot snapshot {}: {e}", E::KIND))
        })?;
        Ok(AuditLog {
            id: AuditId::new(),
            entity_kind: E::KIND,
            entity_id: entity.entity_id(),
            action,
            payload,
            actor,
            created_at: self.clock.now(),
        })
    }

    /// Record a single pre-mutation snapshot.
    pub async fn capture<E: Auditable>(
        &self,
        uow: &mut dyn UnitOfWork,
        entity: &E,
        action: AuditAction,
        actor: UserId,
    ) -> Result<AuditLog> {
        let entry = self.snapshot(entity, action, actor)?;
        self.capture_many(uow, std::slice::from_ref(&entry)).await?;
        Ok(entry)
    }

    /// Record several snapshots; all of them or none.
    pub async fn capture_many(&self, uow: &mut dyn UnitOfWork, entries: &[AuditLog]) -> Result<()> {
        uow.append_audit(entries).await.map_err(|e| {
            error!(
                entries = entries.len(),
                error = %e,
                "Audit write failed, aborting mutation"
            );
            match e {
                CoreError::AuditLogFailed(_) => e,
                other => CoreError::AuditLogFailed(other.to_string()),
            }
        })
    }

    /// Audit `entity`, apply `mutate`, then stage the result.
    ///
    /// The three steps share `uow`; the caller commits it.
    pub async fn apply<E, F>(
        &self,
        uow: &mut dyn UnitOfWork,
        actor: UserId,
        action: AuditAction,
        entity: &mut E,
        mutate: F,
    ) -> Result<()>
    where
        E: Auditable,
        F: FnOnce(&mut E, Timestamp) -> Result<()> + Send,
    {
        self.capture(uow, &*entity, action, actor).await?;
        mutate(entity, self.clock.now())?;
        entity.persist(uow).await
    }
}
