//! Identifier types for ledger entities.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::CoreError;

macro_rules! public_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Create a new time-ordered identifier.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Create from an existing UUID.
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Parse from string.
            pub fn parse(s: &str) -> Result<Self, uuid::Error> {
                Ok(Self(Uuid::parse_str(s)?))
            }

            /// Get the underlying UUID.
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

public_id!(
    /// External-facing, immutable identifier of an account.
    AccountId
);
public_id!(
    /// Public identifier of a transaction.
    TransactionId
);
public_id!(
    /// Public identifier of an external payment.
    PaymentId
);
public_id!(
    /// Public identifier of an audit record.
    AuditId
);

/// Reference to a user owned by the identity collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(Uuid);

impl UserId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The identity used for provider-driven and scheduled work.
    pub fn system() -> Self {
        Self(Uuid::nil())
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Externally usable 10-digit account number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AccountNumber(String);

impl AccountNumber {
    /// Number of digits in an account number.
    pub const LEN: usize = 10;

    /// Parse and validate the shape (length and digits, not the check digit).
    pub fn parse(s: impl Into<String>) -> Result<Self, CoreError> {
        let s = s.into();
        if s.len() != Self::LEN || !s.bytes().all(|b| b.is_ascii_digit()) {
            return Err(CoreError::invalid_field(
                "accountNumber",
                format!("account number must be {} digits", Self::LEN),
            ));
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for AccountNumber {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

impl From<AccountNumber> for String {
    fn from(n: AccountNumber) -> Self {
        n.0
    }
}

impl fmt::Display for AccountNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Internal classification number: branch, owner and product type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LedgerNumber(String);

impl LedgerNumber {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LedgerNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Reference correlating a transaction with an external payment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PaymentReference(String);

impl PaymentReference {
    const MAX_LEN: usize = 100;

    /// Generate a fresh reference for a provider checkout.
    pub fn generate() -> Self {
        Self(format!("VLT-{}", Uuid::now_v7().simple()).to_uppercase())
    }

    /// Validate a reference received from a caller or provider.
    pub fn parse(s: impl Into<String>) -> Result<Self, CoreError> {
        let s = s.into();
        let s = s.trim().to_string();
        let valid = !s.is_empty()
            && s.len() <= Self::MAX_LEN
            && s
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(CoreError::invalid_field(
                "reference",
                "payment reference must be 1-100 characters of [A-Za-z0-9-_.]",
            ));
        }
        Ok(Self(s))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for PaymentReference {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

impl From<PaymentReference> for String {
    fn from(r: PaymentReference) -> Self {
        r.0
    }
}

impl fmt::Display for PaymentReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role of the caller as asserted by the authorization collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Customer,
    Staff,
    Admin,
    /// Provider webhooks and background jobs.
    System,
}

/// The authenticated caller of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user: UserId,
    pub role: Role,
}

impl Actor {
    pub fn new(user: UserId, role: Role) -> Self {
        Self { user, role }
    }

    pub fn customer(user: UserId) -> Self {
        Self::new(user, Role::Customer)
    }

    pub fn staff(user: UserId) -> Self {
        Self::new(user, Role::Staff)
    }

    pub fn admin(user: UserId) -> Self {
        Self::new(user, Role::Admin)
    }

    pub fn system() -> Self {
        Self::new(UserId::system(), Role::System)
    }

    /// Staff, admins and the system act on any account.
    pub fn is_privileged(&self) -> bool {
        !matches!(self.role, Role::Customer)
    }

    /// Check the caller may operate on an account owned by `owner`.
    pub fn may_act_for(&self, owner: &UserId) -> bool {
        self.is_privileged() || &self.user == owner
    }
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:?}", self.user, self.role)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_id_creation() {
        let id1 = TransactionId::new();
        let id2 = TransactionId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_account_id_parse() {
        let uuid_str = "019456ab-1234-7def-8901-234567890abc";
        let id = AccountId::parse(uuid_str).unwrap();
        assert_eq!(id.to_string(), uuid_str);
    }

    #[test]
    fn test_account_number_shape() {
        assert!(AccountNumber::parse("0123456789").is_ok());
        assert!(AccountNumber::parse("012345678").is_err());
        assert!(AccountNumber::parse("01234567a9").is_err());
    }

    #[test]
    fn test_account_number_serde_rejects_bad_shape() {
        let ok: AccountNumber = serde_json::from_str("\"0000000001\"").unwrap();
        assert_eq!(ok.as_str(), "0000000001");
        assert!(serde_json::from_str::<AccountNumber>("\"12\"").is_err());
    }

    #[test]
    fn test_payment_reference_validation() {
        assert!(PaymentReference::parse("T1234_ab-9.x").is_ok());
        assert!(PaymentReference::parse("  ").is_err());
        assert!(PaymentReference::parse("bad ref").is_err());
        assert!(PaymentReference::generate().as_str().starts_with("VLT-"));
    }

    #[test]
    fn test_actor_ownership() {
        let owner = UserId::new();
        assert!(Actor::customer(owner).may_act_for(&owner));
        assert!(!Actor::customer(UserId::new()).may_act_for(&owner));
        assert!(Actor::staff(UserId::new()).may_act_for(&owner));
    }
}
