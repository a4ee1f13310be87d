//! Transaction and payment entities and the reconciliation state machine.

use crate::{
    AccountNumber, CoreError, Money, PaymentId, PaymentReference, Timestamp, TransactionId,
    UserId,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Reconciliation state of a transaction.
///
/// Only `Initiated`, `Reconciled` and `Rejected` are persisted.
/// `VerificationRequested` lives in the coordinator while a provider
/// lookup is outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReconciliationStatus {
    /// Created, external payment not yet confirmed.
    Initiated,
    /// A provider lookup is in progress.
    VerificationRequested,
    /// Provider confirmed success and the balance effect was applied.
    Reconciled,
    /// Provider reported a non-success status. No balance change.
    Rejected,
}

impl ReconciliationStatus {
    /// Check if this is a final state.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            ReconciliationStatus::Reconciled | ReconciliationStatus::Rejected
        )
    }

    /// Get valid next states from current state.
    pub fn valid_transitions(&self) -> &[ReconciliationStatus] {
        match self {
            ReconciliationStatus::Initiated => &[
                ReconciliationStatus::VerificationRequested,
                ReconciliationStatus::Reconciled,
                ReconciliationStatus::Rejected,
            ],
            // Back to Initiated when the provider could not be reached.
            ReconciliationStatus::VerificationRequested => &[
                ReconciliationStatus::Reconciled,
                ReconciliationStatus::Rejected,
                ReconciliationStatus::Initiated,
            ],
            ReconciliationStatus::Reconciled => &[],
            ReconciliationStatus::Rejected => &[],
        }
    }

    /// Check if transition to given state is valid.
    pub fn can_transition_to(&self, next: ReconciliationStatus) -> bool {
        self.valid_transitions().contains(&next)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReconciliationStatus::Initiated => "INITIATED",
            ReconciliationStatus::VerificationRequested => "VERIFICATION_REQUESTED",
            ReconciliationStatus::Reconciled => "RECONCILED",
            ReconciliationStatus::Rejected => "REJECTED",
        }
    }
}

impl FromStr for ReconciliationStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "INITIATED" => Ok(Self::Initiated),
            "VERIFICATION_REQUESTED" => Ok(Self::VerificationRequested),
            "RECONCILED" => Ok(Self::Reconciled),
            "REJECTED" => Ok(Self::Rejected),
            other => Err(CoreError::validation(format!(
                "unknown reconciliation status: {other}"
            ))),
        }
    }
}

/// Direction of a transaction relative to the account it is booked on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Credit,
    Debit,
}

impl TransactionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionType::Credit => "credit",
            TransactionType::Debit => "debit",
        }
    }
}

impl FromStr for TransactionType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "credit" => Ok(Self::Credit),
            "debit" => Ok(Self::Debit),
            other => Err(CoreError::validation(format!(
                "unknown transaction type: {other}"
            ))),
        }
    }
}

/// A monetary transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    /// Public identifier.
    pub id: TransactionId,
    /// Positive amount.
    pub amount: Money,
    #[serde(rename = "type")]
    pub transaction_type: TransactionType,
    /// Debited account (absent for externally funded deposits).
    pub sender_account_number: Option<AccountNumber>,
    /// Credited account (absent for withdrawals to the outside).
    pub recipient_account_number: Option<AccountNumber>,
    /// Correlates the transaction with an external payment.
    pub payment_reference: PaymentReference,
    pub status: ReconciliationStatus,
    pub is_reconciled: bool,
    /// Fraud/AML marker.
    pub is_flagged: bool,
    pub notes: Option<String>,
    pub is_deleted: bool,
    pub deleted_by: Option<UserId>,
    pub deleted_at: Option<Timestamp>,
    pub reconciled_at: Option<Timestamp>,
    pub reconciled_by: Option<UserId>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Transaction {
    fn new(
        amount: Money,
        transaction_type: TransactionType,
        sender_account_number: Option<AccountNumber>,
        recipient_account_number: Option<AccountNumber>,
        payment_reference: PaymentReference,
        now: Timestamp,
    ) -> Self {
        Self {
            id: TransactionId::new(),
            amount,
            transaction_type,
            sender_account_number,
            recipient_account_number,
            payment_reference,
            status: ReconciliationStatus::Initiated,
            is_reconciled: false,
            is_flagged: false,
            notes: None,
            is_deleted: false,
            deleted_by: None,
            deleted_at: None,
            reconciled_at: None,
            reconciled_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// An unreconciled credit awaiting external payment.
    pub fn deposit(
        recipient: AccountNumber,
        amount: Money,
        reference: PaymentReference,
        now: Timestamp,
    ) -> Self {
        Self::new(
            amount,
            TransactionType::Credit,
            None,
            Some(recipient),
            reference,
            now,
        )
    }

    /// A debit, reconciled at creation.
    pub fn withdrawal(
        sender: AccountNumber,
        amount: Money,
        reference: PaymentReference,
        actor: UserId,
        now: Timestamp,
    ) -> Self {
        let mut tx = Self::new(
            amount,
            TransactionType::Debit,
            Some(sender),
            None,
            reference,
            now,
        );
        tx.mark_reconciled(actor, now);
        tx
    }

    /// One leg of an internal transfer, reconciled at creation.
    pub fn transfer_leg(
        transaction_type: TransactionType,
        sender: AccountNumber,
        recipient: AccountNumber,
        amount: Money,
        reference: PaymentReference,
        actor: UserId,
        now: Timestamp,
    ) -> Self {
        let mut tx = Self::new(
            amount,
            transaction_type,
            Some(sender),
            Some(recipient),
            reference,
            now,
        );
        tx.mark_reconciled(actor, now);
        tx
    }

    /// The account whose balance this transaction moves.
    pub fn booked_account(&self) -> Option<&AccountNumber> {
        match self.transaction_type {
            TransactionType::Credit => self.recipient_account_number.as_ref(),
            TransactionType::Debit => self.sender_account_number.as_ref(),
        }
    }

    /// Transition to a new status.
    pub fn transition_to(
        &mut self,
        next: ReconciliationStatus,
        now: Timestamp,
    ) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.updated_at = now;
        Ok(())
    }

    /// Move to `Reconciled` and record who confirmed it.
    pub fn reconcile(&mut self, by: UserId, now: Timestamp) -> Result<(), InvalidTransition> {
        self.transition_to(ReconciliationStatus::Reconciled, now)?;
        self.mark_reconciled(by, now);
        Ok(())
    }

    /// Move to `Rejected`. The transaction stays unreconciled.
    pub fn reject(&mut self, reason: &str, now: Timestamp) -> Result<(), InvalidTransition> {
        self.transition_to(ReconciliationStatus::Rejected, now)?;
        self.append_note(reason);
        Ok(())
    }

    fn mark_reconciled(&mut self, by: UserId, now: Timestamp) {
        self.status = ReconciliationStatus::Reconciled;
        self.is_reconciled = true;
        self.reconciled_at = Some(now);
        self.reconciled_by = Some(by);
        self.updated_at = now;
    }

    pub fn flag(&mut self, now: Timestamp) {
        self.is_flagged = true;
        self.updated_at = now;
    }

    pub fn soft_delete(&mut self, by: UserId, now: Timestamp) {
        self.is_deleted = true;
        self.deleted_by = Some(by);
        self.deleted_at = Some(now);
        self.updated_at = now;
    }

    pub fn append_note(&mut self, note: &str) {
        match &mut self.notes {
            Some(existing) => {
                existing.push_str("; ");
                existing.push_str(note);
            }
            None => self.notes = Some(note.to_string()),
        }
    }
}

/// How the customer funds a deposit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentChannel {
    Card,
    BankTransfer,
    Ussd,
}

impl PaymentChannel {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentChannel::Card => "card",
            PaymentChannel::BankTransfer => "bank_transfer",
            PaymentChannel::Ussd => "ussd",
        }
    }
}

impl FromStr for PaymentChannel {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "card" => Ok(Self::Card),
            "bank_transfer" => Ok(Self::BankTransfer),
            "ussd" => Ok(Self::Ussd),
            other => Err(CoreError::invalid_field(
                "channel",
                format!("unsupported payment channel: {other}"),
            )),
        }
    }
}

/// An external payment initiated through the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub id: PaymentId,
    pub payment_reference: PaymentReference,
    pub amount: Money,
    pub channel: PaymentChannel,
    pub checkout_url: Option<String>,
    pub is_confirmed: bool,
    pub confirmed_at: Option<Timestamp>,
    pub created_at: Timestamp,
}

impl Payment {
    pub fn new(
        payment_reference: PaymentReference,
        amount: Money,
        channel: PaymentChannel,
        checkout_url: Option<String>,
        now: Timestamp,
    ) -> Self {
        Self {
            id: PaymentId::new(),
            payment_reference,
            amount,
            channel,
            checkout_url,
            is_confirmed: false,
            confirmed_at: None,
            created_at: now,
        }
    }

    /// Mark confirmed. Fails if it already was.
    pub fn confirm(&mut self, now: Timestamp) -> Result<(), CoreError> {
        if self.is_confirmed {
            return Err(CoreError::Conflict(format!(
                "payment {} already confirmed",
                self.payment_reference
            )));
        }
        self.is_confirmed = true;
        self.confirmed_at = Some(now);
        Ok(())
    }
}

/// Error when attempting invalid state transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidTransition {
    pub from: ReconciliationStatus,
    pub to: ReconciliationStatus,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Invalid state transition from {:?} to {:?}",
            self.from, self.to
        )
    }
}

impl std::error::Error for InvalidTransition {}

impl From<InvalidTransition> for CoreError {
    fn from(e: InvalidTransition) -> Self {
        CoreError::Conflict(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Currency;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn create_test_deposit() -> Transaction {
        Transaction::deposit(
            AccountNumber::parse("0000001236").unwrap(),
            Money::new(dec!(5000.00), Currency::ngn()),
            PaymentReference::parse("REF-1").unwrap(),
            Utc::now(),
        )
    }

    #[test]
    fn test_deposit_starts_unreconciled() {
        let tx = create_test_deposit();
        assert_eq!(tx.status, ReconciliationStatus::Initiated);
        assert!(!tx.is_reconciled);
        assert_eq!(tx.booked_account().map(|a| a.as_str()), Some("0000001236"));
    }

    #[test]
    fn test_withdrawal_is_reconciled_at_creation() {
        let actor = UserId::new();
        let tx = Transaction::withdrawal(
            AccountNumber::parse("0000001236").unwrap(),
            Money::new(dec!(10), Currency::ngn()),
            PaymentReference::generate(),
            actor,
            Utc::now(),
        );
        assert!(tx.is_reconciled);
        assert_eq!(tx.reconciled_by, Some(actor));
        assert_eq!(tx.transaction_type, TransactionType::Debit);
    }

    #[test]
    fn test_reconcile_twice_is_rejected() {
        let mut tx = create_test_deposit();
        let by = UserId::system();
        assert!(tx.reconcile(by, Utc::now()).is_ok());
        let err = tx.reconcile(by, Utc::now()).unwrap_err();
        assert_eq!(err.from, ReconciliationStatus::Reconciled);
        assert!(matches!(CoreError::from(err), CoreError::Conflict(_)));
    }

    #[test]
    fn test_verification_can_fall_back_to_initiated() {
        let mut tx = create_test_deposit();
        let now = Utc::now();
        tx.transition_to(ReconciliationStatus::VerificationRequested, now)
            .unwrap();
        tx.transition_to(ReconciliationStatus::Initiated, now).unwrap();
        assert!(tx.reject("declined", now).is_ok());
        assert!(!tx.is_reconciled);
        assert_eq!(tx.notes.as_deref(), Some("declined"));
    }

    #[test]
    fn test_final_states() {
        assert!(ReconciliationStatus::Reconciled.is_final());
        assert!(ReconciliationStatus::Rejected.is_final());
        assert!(!ReconciliationStatus::Initiated.is_final());
        assert!(!ReconciliationStatus::Rejected.can_transition_to(ReconciliationStatus::Reconciled));
    }

    #[test]
    fn test_status_round_trips_through_text() {
        for status in [
            ReconciliationStatus::Initiated,
            ReconciliationStatus::Reconciled,
            ReconciliationStatus::Rejected,
        ] {
            assert_eq!(status.as_str().parse::<ReconciliationStatus>().unwrap(), status);
        }
        assert!("SETTLED".parse::<ReconciliationStatus>().is_err());
    }

    #[test]
    fn test_payment_confirms_once() {
        let mut payment = Payment::new(
            PaymentReference::parse("REF-1").unwrap(),
            Money::new(dec!(5000.00), Currency::ngn()),
            PaymentChannel::Card,
            None,
            Utc::now(),
        );
        assert!(payment.confirm(Utc::now()).is_ok());
        assert!(payment.confirm(Utc::now()).is_err());
    }
}
