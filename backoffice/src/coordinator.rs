//! Reconciliation of provider-funded deposits.
//!
//! A deposit starts `Initiated`. A verify call or a webhook delivery moves it
//! into verification, tracked here as an in-flight claim on its reference.
//! From there it ends `Reconciled` (credit applied once) or `Rejected` (no
//! balance change). Deliveries for a deposit that already reached a final
//! state short-circuit without touching the ledger.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use vaultline_common::{
    Actor, CoreError, PaymentReference, ReconciliationStatus, Result, Timestamp, Transaction,
};
use vaultline_ledger::{OperationContext, TransactionLedger};
use vaultline_payments::{PaymentProvider, Verification, WebhookEvent};

use crate::metrics::SharedMetrics;

/// How a reconciliation attempt ended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "transaction", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReconciliationOutcome {
    /// Provider confirmed; the recipient was credited by this call.
    Reconciled(Transaction),
    /// The deposit was already reconciled; nothing applied.
    AlreadyConfirmed(Transaction),
    /// Provider reported a non-success status; the deposit is now rejected.
    Rejected(Transaction),
    /// The deposit was already rejected; nothing applied.
    AlreadyRejected(Transaction),
}

impl ReconciliationOutcome {
    pub fn transaction(&self) -> &Transaction {
        match self {
            ReconciliationOutcome::Reconciled(tx)
            | ReconciliationOutcome::AlreadyConfirmed(tx)
            | ReconciliationOutcome::Rejected(tx)
            | ReconciliationOutcome::AlreadyRejected(tx) => tx,
        }
    }

    /// Whether this call changed ledger state.
    pub fn applied(&self) -> bool {
        matches!(
            self,
            ReconciliationOutcome::Reconciled(_) | ReconciliationOutcome::Rejected(_)
        )
    }

    pub fn remark(&self) -> &'static str {
        match self {
            ReconciliationOutcome::Reconciled(_) => "Payment confirmed",
            ReconciliationOutcome::AlreadyConfirmed(_) => "Payment already confirmed",
            ReconciliationOutcome::Rejected(_) => "Payment rejected by provider",
            ReconciliationOutcome::AlreadyRejected(_) => "Payment already rejected",
        }
    }
}

/// Claim on a reference for the duration of one verification.
struct VerificationClaim<'a> {
    registry: &'a DashMap<PaymentReference, Timestamp>,
    reference: PaymentReference,
    metrics: &'a SharedMetrics,
}

impl Drop for VerificationClaim<'_> {
    fn drop(&mut self) {
        self.registry.remove(&self.reference);
        self.metrics.verification_finished();
    }
}

/// Drives deposits from initiated to a final state based on provider reports.
pub struct ReconciliationCoordinator {
    ledger: Arc<TransactionLedger>,
    provider: Arc<dyn PaymentProvider>,
    in_flight: DashMap<PaymentReference, Timestamp>,
    metrics: SharedMetrics,
}

impl ReconciliationCoordinator {
    pub fn new(
        ledger: Arc<TransactionLedger>,
        provider: Arc<dyn PaymentProvider>,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            ledger,
            provider,
            in_flight: DashMap::new(),
            metrics,
        }
    }

    /// Number of verifications currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn claim(&self, reference: &PaymentReference) -> Result<VerificationClaim<'_>> {
        match self.in_flight.entry(reference.clone()) {
            Entry::Occupied(_) => Err(CoreError::Conflict(format!(
                "verification of {reference} already in progress"
            ))),
            Entry::Vacant(vacant) => {
                vacant.insert(self.ledger.clock().now());
                self.metrics.verification_started();
                Ok(VerificationClaim {
                    registry: &self.in_flight,
                    reference: reference.clone(),
                    metrics: &self.metrics,
                })
            }
        }
    }

    /// Final outcome if the deposit already left `Initiated`.
    async fn settled_outcome(
        &self,
        reference: &PaymentReference,
    ) -> Result<std::result::Result<ReconciliationOutcome, Transaction>> {
        let (tx, status) = self.ledger.reconciliation_status(reference).await?;
        Ok(match status {
            ReconciliationStatus::Reconciled => {
                self.metrics.duplicate_confirmation();
                info!(reference = %reference, "Deposit already reconciled, skipping");
                Ok(ReconciliationOutcome::AlreadyConfirmed(tx))
            }
            ReconciliationStatus::Rejected => {
                self.metrics.duplicate_confirmation();
                Ok(ReconciliationOutcome::AlreadyRejected(tx))
            }
            _ => Err(tx),
        })
    }

    /// Ask the provider about `reference` and apply its answer.
    #[instrument(skip(self, ctx), fields(actor = %ctx.actor, reference = %reference))]
    pub async fn verify(
        &self,
        ctx: &OperationContext,
        reference: &PaymentReference,
    ) -> Result<ReconciliationOutcome> {
        let _claim = self.claim(reference)?;
        let tx = match self.settled_outcome(reference).await? {
            Ok(outcome) => return Ok(outcome),
            Err(tx) => tx,
        };

        let verification = tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => return Err(CoreError::Cancelled),
            result = self.provider.verify(reference) => result,
        };
        let verification = verification.map_err(|e| {
            self.metrics.provider_failure();
            warn!(
                provider = self.provider.name(),
                error = %e,
                "Provider verification failed, nothing applied"
            );
            CoreError::from(e)
        })?;

        self.apply(ctx, &tx, verification).await
    }

    /// Apply a webhook delivery from the provider.
    #[instrument(skip(self, body), fields(bytes = body.len()))]
    pub async fn handle_webhook(&self, body: &[u8]) -> Result<ReconciliationOutcome> {
        let default_currency = &self.ledger.config().supported_currency;
        let event = WebhookEvent::parse(body, default_currency).map_err(|e| {
            self.metrics.provider_failure();
            CoreError::from(e)
        })?;
        let reference = event.reference().clone();
        info!(reference = %reference, event = %event.event, "Webhook received");

        let _claim = self.claim(&reference)?;
        let tx = match self.settled_outcome(&reference).await? {
            Ok(outcome) => return Ok(outcome),
            Err(tx) => tx,
        };

        self.apply(&OperationContext::system(), &tx, event.verification)
            .await
    }

    async fn apply(
        &self,
        ctx: &OperationContext,
        tx: &Transaction,
        verification: Verification,
    ) -> Result<ReconciliationOutcome> {
        let reference = &tx.payment_reference;
        if &verification.reference != reference {
            return Err(CoreError::UpstreamUnavailable(format!(
                "provider answered for {} instead of {reference}",
                verification.reference
            )));
        }

        let system = OperationContext::with_cancel(Actor::system(), ctx.cancel.clone());
        if !verification.is_success() {
            let reason = format!("provider reported status '{}'", verification.status);
            let rejected = self
                .ledger
                .reject_transaction(&system, reference, &reason)
                .await?;
            self.metrics.rejected();
            return Ok(ReconciliationOutcome::Rejected(rejected));
        }

        if verification.currency != tx.amount.currency {
            return Err(CoreError::UpstreamUnavailable(format!(
                "provider reported {} for a {} deposit",
                verification.currency, tx.amount.currency
            )));
        }

        let amount = verification.amount();
        match self
            .ledger
            .confirm_transaction(ctx, reference, amount.value)
            .await
        {
            Ok(confirmed) => {
                self.metrics.reconciled();
                info!(
                    reference = %reference,
                    amount = %amount,
                    flagged = confirmed.is_flagged,
                    "Deposit reconciled"
                );
                Ok(ReconciliationOutcome::Reconciled(confirmed))
            }
            // Lost a race with a direct confirmation.
            Err(CoreError::Conflict(_)) => match self.settled_outcome(reference).await? {
                Ok(outcome) => Ok(outcome),
                Err(tx) => Err(CoreError::Conflict(format!(
                    "transaction {} could not be confirmed",
                    tx.id
                ))),
            },
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::metrics::Metrics;
    use chrono::{Duration, Utc};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use vaultline_common::{AccountNumber, Currency, ManualClock, PaymentChannel, UserId};
    use vaultline_ledger::{
        AccountType, DepositCommand, LedgerConfig, MemoryStore, OpenAccountCommand,
        StaticDirectory,
    };
    use vaultline_payments::MockPaymentProvider;

    struct Fixture {
        store: MemoryStore,
        directory: Arc<StaticDirectory>,
        ledger: Arc<TransactionLedger>,
        provider: Arc<MockPaymentProvider>,
        coordinator: Arc<ReconciliationCoordinator>,
        metrics: SharedMetrics,
    }

    fn create_test_coordinator() -> Fixture {
        let store = MemoryStore::new();
        let directory = Arc::new(StaticDirectory::new());
        let clock = Arc::new(ManualClock::stepping(Utc::now(), Duration::milliseconds(1)));
        let ledger = Arc::new(TransactionLedger::new(
            Arc::new(store.clone()),
            directory.clone(),
            clock,
            LedgerConfig::default(),
        ));
        let provider = Arc::new(MockPaymentProvider::new());
        let metrics = Arc::new(Metrics::new());
        let coordinator = Arc::new(ReconciliationCoordinator::new(
            ledger.clone(),
            provider.clone(),
            metrics.clone(),
        ));
        Fixture {
            store,
            directory,
            ledger,
            provider,
            coordinator,
            metrics,
        }
    }

    async fn initiated_deposit(f: &Fixture, amount: Decimal) -> (AccountNumber, PaymentReference) {
        let owner = UserId::new();
        f.directory.register(owner, 500);
        let ctx = OperationContext::new(Actor::customer(owner));
        let account = f
            .ledger
            .open_account(
                &ctx,
                OpenAccountCommand {
                    owner,
                    account_type: AccountType::Savings,
                    branch_code: None,
                },
            )
            .await
            .unwrap();

        let reference = PaymentReference::generate();
        f.ledger
            .create_deposit(
                &ctx,
                DepositCommand {
                    account_number: Some(account.account_number.clone()),
                    amount,
                    currency: Currency::ngn(),
                    reference: reference.clone(),
                    channel: PaymentChannel::BankTransfer,
                    checkout_url: None,
                },
            )
            .await
            .unwrap();
        (account.account_number, reference)
    }

    fn webhook(reference: &PaymentReference, status: &str, minor: i64) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "event": "charge.success",
            "data": {
                "reference": reference.as_str(),
                "status": status,
                "amount": minor,
                "currency": "NGN"
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_webhook_delivered_twice_credits_once() {
        let f = create_test_coordinator();
        let (account, reference) = initiated_deposit(&f, dec!(5000.00)).await;
        let body = webhook(&reference, "success", 500_000);

        let first = f.coordinator.handle_webhook(&body).await.unwrap();
        assert!(matches!(first, ReconciliationOutcome::Reconciled(_)));
        let second = f.coordinator.handle_webhook(&body).await.unwrap();
        assert!(matches!(second, ReconciliationOutcome::AlreadyConfirmed(_)));

        let balance = f.store.account(&account).await.unwrap().balance;
        assert_eq!(balance, dec!(5000.00));
        assert_eq!(f.metrics.snapshot().duplicate_confirmations, 1);
        assert_eq!(f.coordinator.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_failed_status_rejects_without_credit() {
        let f = create_test_coordinator();
        let (account, reference) = initiated_deposit(&f, dec!(10)).await;

        let outcome = f
            .coordinator
            .handle_webhook(&webhook(&reference, "failed", 1_000))
            .await
            .unwrap();
        assert!(matches!(outcome, ReconciliationOutcome::Rejected(_)));
        assert_eq!(
            outcome.transaction().status,
            ReconciliationStatus::Rejected
        );

        let again = f
            .coordinator
            .handle_webhook(&webhook(&reference, "success", 1_000))
            .await
            .unwrap();
        assert!(matches!(again, ReconciliationOutcome::AlreadyRejected(_)));
        assert_eq!(f.store.account(&account).await.unwrap().balance, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_verify_uses_provider_amount_in_minor_units() {
        let f = create_test_coordinator();
        let (account, reference) = initiated_deposit(&f, dec!(250.00)).await;
        f.provider
            .set_outcome(&reference, "Success", 25_000, Currency::ngn());

        let ctx = OperationContext::new(Actor::staff(UserId::new()));
        let outcome = f.coordinator.verify(&ctx, &reference).await.unwrap();
        assert!(outcome.applied());
        assert!(!outcome.transaction().is_flagged);
        assert_eq!(f.store.account(&account).await.unwrap().balance, dec!(250.00));
    }

    #[tokio::test]
    async fn test_provider_failure_applies_nothing() {
        let f = create_test_coordinator();
        let (account, reference) = initiated_deposit(&f, dec!(40)).await;
        f.provider.set_unreachable(true);
        let audit_before = f.store.audit_entries().await.len();

        let err = f
            .coordinator
            .verify(&OperationContext::system(), &reference)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::UpstreamUnavailable(_)));
        assert_eq!(f.store.audit_entries().await.len(), audit_before);
        assert_eq!(f.store.account(&account).await.unwrap().balance, Decimal::ZERO);

        // The caller retries once the provider is back.
        f.provider.set_unreachable(false);
        f.provider.set_outcome(&reference, "success", 4_000, Currency::ngn());
        let outcome = f
            .coordinator
            .verify(&OperationContext::system(), &reference)
            .await
            .unwrap();
        assert!(matches!(outcome, ReconciliationOutcome::Reconciled(_)));
    }

    #[tokio::test]
    async fn test_concurrent_verification_is_refused() {
        let f = create_test_coordinator();
        let (_, reference) = initiated_deposit(&f, dec!(40)).await;
        f.provider.set_outcome(&reference, "success", 4_000, Currency::ngn());
        f.provider
            .set_latency(Some(std::time::Duration::from_millis(100)));

        let first = {
            let coordinator = f.coordinator.clone();
            let reference = reference.clone();
            tokio::spawn(async move {
                coordinator
                    .verify(&OperationContext::system(), &reference)
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;

        let err = f
            .coordinator
            .verify(&OperationContext::system(), &reference)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));
        assert!(first.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_amount_mismatch_flags() {
        let f = create_test_coordinator();
        let (account, reference) = initiated_deposit(&f, dec!(100)).await;

        let outcome = f
            .coordinator
            .handle_webhook(&webhook(&reference, "success", 9_000))
            .await
            .unwrap();
        assert!(outcome.transaction().is_flagged);
        assert_eq!(f.store.account(&account).await.unwrap().balance, dec!(90));
    }

    #[tokio::test]
    async fn test_malformed_webhook_is_upstream_error() {
        let f = create_test_coordinator();
        let err = f.coordinator.handle_webhook(b"{}").await.unwrap_err();
        assert!(matches!(err, CoreError::UpstreamUnavailable(_)));
    }
}
