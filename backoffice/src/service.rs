//! Back-office service facade.
//!
//! `BackOffice` is what the HTTP collaborator binds routes to. It owns the
//! ledger, the idempotency guard and the reconciliation coordinator, and
//! turns every outcome into an [`OperationResponse`].

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use vaultline_common::{
    AccountNumber, CoreError, Currency, PaymentReference, Result, SharedClock, TransactionId,
};
use vaultline_ledger::{
    CustomerDirectory, DepositCommand, LedgerStore, OpenAccountCommand, OperationContext,
    TransactionFilter, TransactionLedger, TransferCommand, WithdrawalCommand,
};
use vaultline_payments::{CheckoutRequest, PaymentProvider};
use vaultline_protocol::{
    DepositReceipt, DepositRequest, FlagRequest, IdempotencyKey, OpenAccountRequest,
    OperationResponse, Route, TransferRequest, WithdrawRequest,
};

use crate::config::BackOfficeConfig;
use crate::coordinator::ReconciliationCoordinator;
use crate::idempotency::{fingerprint, Admission, IdempotencyGuard};
use crate::metrics::{Metrics, SharedMetrics};
use crate::state::ServiceState;

/// The back-office service.
pub struct BackOffice {
    config: BackOfficeConfig,
    state: RwLock<ServiceState>,
    ledger: Arc<TransactionLedger>,
    provider: Arc<dyn PaymentProvider>,
    coordinator: Arc<ReconciliationCoordinator>,
    idempotency: IdempotencyGuard,
    metrics: SharedMetrics,
    shutdown: CancellationToken,
}

impl BackOffice {
    pub fn new(
        config: BackOfficeConfig,
        store: Arc<dyn LedgerStore>,
        directory: Arc<dyn CustomerDirectory>,
        provider: Arc<dyn PaymentProvider>,
        clock: SharedClock,
    ) -> Self {
        let metrics: SharedMetrics = Arc::new(Metrics::new());
        let ledger = Arc::new(TransactionLedger::new(
            store,
            directory,
            clock.clone(),
            config.ledger.clone(),
        ));
        let coordinator = Arc::new(ReconciliationCoordinator::new(
            ledger.clone(),
            provider.clone(),
            metrics.clone(),
        ));
        let idempotency = IdempotencyGuard::new(clock, config.idempotency.ttl);

        Self {
            config,
            state: RwLock::new(ServiceState::Starting),
            ledger,
            provider,
            coordinator,
            idempotency,
            metrics,
            shutdown: CancellationToken::new(),
        }
    }

    /// Start background maintenance and accept requests.
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        info!(provider = self.provider.name(), "Starting back office");

        *self.state.write() = ServiceState::Running;

        let idempotency = self.idempotency.clone();
        let interval = self.config.idempotency.cleanup_interval;
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            idempotency.run_cleanup_loop(interval, shutdown).await;
        });

        let ledger = self.ledger.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        ledger.prune_locks();
                    }
                }
            }
        });

        info!("Back office started");
        Ok(())
    }

    /// Stop accepting requests and wait for running verifications.
    #[instrument(skip(self))]
    pub async fn stop(&self) -> Result<()> {
        info!("Stopping back office");

        *self.state.write() = ServiceState::ShuttingDown;
        self.shutdown.cancel();
        self.drain_verifications().await;
        *self.state.write() = ServiceState::Stopped;

        info!("Back office stopped");
        Ok(())
    }

    async fn drain_verifications(&self) {
        let drained = tokio::time::timeout(self.config.drain_timeout, async {
            loop {
                let pending = self.coordinator.in_flight();
                if pending == 0 {
                    break;
                }
                info!(pending, "Waiting for verifications to complete");
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                pending = self.coordinator.in_flight(),
                "Drain timeout reached, abandoning verifications"
            );
        }
    }

    pub fn state(&self) -> ServiceState {
        *self.state.read()
    }

    pub fn is_accepting_requests(&self) -> bool {
        self.state().accepts_requests()
    }

    pub fn config(&self) -> &BackOfficeConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Arc<TransactionLedger> {
        &self.ledger
    }

    pub fn coordinator(&self) -> &Arc<ReconciliationCoordinator> {
        &self.coordinator
    }

    pub fn idempotency(&self) -> &IdempotencyGuard {
        &self.idempotency
    }

    pub fn metrics(&self) -> &SharedMetrics {
        &self.metrics
    }

    // --- Keyed financial operations ---

    /// `POST /account`
    pub async fn open_account(
        &self,
        ctx: &OperationContext,
        key: Option<&str>,
        request: OpenAccountRequest,
    ) -> OperationResponse {
        self.keyed(Route::OpenAccount, ctx, key, &request, 201, "Account created", || async {
            let account_type = request.account_type.parse()?;
            self.ledger
                .open_account(
                    ctx,
                    OpenAccountCommand {
                        owner: ctx.actor.user,
                        account_type,
                        branch_code: request.branch_code.clone(),
                    },
                )
                .await
        })
        .await
    }

    /// `POST /deposit`: check the deposit, open a provider checkout, then
    /// record it.
    pub async fn deposit(
        &self,
        ctx: &OperationContext,
        key: Option<&str>,
        request: DepositRequest,
    ) -> OperationResponse {
        self.keyed(Route::Deposit, ctx, key, &request, 201, "Deposit initiated", || async {
            let currency = Currency::new(request.currency.as_str());
            let (account, amount) = self
                .ledger
                .prepare_deposit(ctx, request.account_number.as_ref(), request.amount, &currency)
                .await?;
            let reference = PaymentReference::generate();

            let checkout = self
                .provider
                .initialize(&CheckoutRequest {
                    reference: reference.clone(),
                    amount,
                    channel: request.channel,
                    customer: ctx.actor.user,
                })
                .await
                .map_err(|e| {
                    self.metrics.provider_failure();
                    warn!(error = %e, "Checkout initialization failed");
                    CoreError::from(e)
                })?;

            let tx = self
                .ledger
                .create_deposit(
                    ctx,
                    DepositCommand {
                        account_number: Some(account.account_number),
                        amount: request.amount,
                        currency,
                        reference: reference.clone(),
                        channel: request.channel,
                        checkout_url: Some(checkout.checkout_url.clone()),
                    },
                )
                .await?;

            let transaction = serde_json::to_value(&tx)
                .map_err(|e| CoreError::Internal(format!("cannot serialize transaction: {e}")))?;
            Ok(DepositReceipt {
                transaction,
                payment_reference: reference,
                checkout_url: Some(checkout.checkout_url),
            })
        })
        .await
    }

    /// `POST /withdraw`
    pub async fn withdraw(
        &self,
        ctx: &OperationContext,
        key: Option<&str>,
        request: WithdrawRequest,
    ) -> OperationResponse {
        self.keyed(Route::Withdraw, ctx, key, &request, 201, "Withdrawal successful", || async {
            self.ledger
                .create_withdrawal(
                    ctx,
                    WithdrawalCommand {
                        account_number: request.account_number.clone(),
                        amount: request.amount,
                        currency: Currency::new(request.currency.as_str()),
                        notes: request.notes.clone(),
                    },
                )
                .await
        })
        .await
    }

    /// `POST /transfer`
    pub async fn transfer(
        &self,
        ctx: &OperationContext,
        key: Option<&str>,
        request: TransferRequest,
    ) -> OperationResponse {
        self.keyed(Route::Transfer, ctx, key, &request, 201, "Transfer successful", || async {
            self.ledger
                .transfer(
                    ctx,
                    TransferCommand {
                        sender: request.sender_account_number.clone(),
                        recipient: request.recipient_account_number.clone(),
                        amount: request.amount,
                        currency: Currency::new(request.currency.as_str()),
                        notes: request.notes.clone(),
                    },
                )
                .await
        })
        .await
    }

    // --- Unkeyed operations ---

    /// `PUT /flag`
    pub async fn flag(&self, ctx: &OperationContext, request: FlagRequest) -> OperationResponse {
        let result = match self.ensure_accepting() {
            Ok(()) => self.ledger.flag_transaction(ctx, &request.transaction_id).await,
            Err(e) => Err(e),
        };
        self.respond(Route::Flag, result, 200, "Transaction flagged")
    }

    /// `DELETE /transaction/{id}`
    pub async fn delete_transaction(
        &self,
        ctx: &OperationContext,
        id: &TransactionId,
    ) -> OperationResponse {
        let result = match self.ensure_accepting() {
            Ok(()) => self.ledger.delete_transaction(ctx, id).await,
            Err(e) => Err(e),
        };
        let response = match result {
            Ok(()) => OperationResponse::empty(200, "Transaction deleted"),
            Err(e) => self.failure(Route::DeleteTransaction, &e),
        };
        self.metrics
            .operation(response.is_success(), response.error_code.as_deref());
        response
    }

    /// `GET /verify/{id}`
    pub async fn verify(&self, ctx: &OperationContext, reference: &str) -> OperationResponse {
        let outcome = async {
            self.ensure_accepting()?;
            let reference = PaymentReference::parse(reference)?;
            self.coordinator.verify(ctx, &reference).await
        }
        .await;
        match outcome {
            Ok(outcome) => {
                let remark = outcome.remark();
                self.respond(Route::Verify, Ok(outcome.transaction().clone()), 200, remark)
            }
            Err(e) => self.respond::<()>(Route::Verify, Err(e), 200, ""),
        }
    }

    /// Provider webhook delivery.
    pub async fn webhook(&self, body: &[u8]) -> OperationResponse {
        let outcome = match self.ensure_accepting() {
            Ok(()) => self.coordinator.handle_webhook(body).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(outcome) => {
                let remark = outcome.remark();
                self.respond(Route::Webhook, Ok(outcome.transaction().clone()), 200, remark)
            }
            Err(e) => self.respond::<()>(Route::Webhook, Err(e), 200, ""),
        }
    }

    // --- Reads ---

    pub async fn account(&self, ctx: &OperationContext, number: &AccountNumber) -> OperationResponse {
        self.ledger.account(ctx, number).await.into()
    }

    pub async fn transaction(&self, ctx: &OperationContext, id: &TransactionId) -> OperationResponse {
        self.ledger.transaction(ctx, id).await.into()
    }

    pub async fn transactions(
        &self,
        ctx: &OperationContext,
        filter: &TransactionFilter,
    ) -> OperationResponse {
        self.ledger.transactions(ctx, filter).await.into()
    }

    // --- Private methods ---

    fn ensure_accepting(&self) -> Result<()> {
        let state = self.state();
        if state.accepts_requests() {
            Ok(())
        } else {
            Err(CoreError::Internal(format!(
                "back office is {state}, not accepting requests"
            )))
        }
    }

    /// Run `operation` at most once per idempotency key and caller.
    #[allow(clippy::too_many_arguments)]
    async fn keyed<B, T, F, Fut>(
        &self,
        route: Route,
        ctx: &OperationContext,
        key: Option<&str>,
        body: &B,
        status_code: u16,
        remark: &'static str,
        operation: F,
    ) -> OperationResponse
    where
        B: Serialize,
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Err(e) = self.ensure_accepting() {
            return self.respond::<()>(route, Err(e), status_code, remark);
        }
        let key = match IdempotencyKey::from_header(key) {
            Ok(key) => key,
            Err(e) => return self.respond::<()>(route, Err(e), status_code, remark),
        };

        let scope = format!("{}:{}", route.scope(), ctx.actor.user);
        let ticket = match self.idempotency.admit(&scope, &key, fingerprint(body)).await {
            Admission::Replay(response) => {
                self.metrics.replay();
                info!(route = route.scope(), key = %key, "Replaying recorded response");
                return response;
            }
            Admission::Proceed(ticket) => ticket,
        };

        let response = self.respond(route, operation().await, status_code, remark);
        ticket.record(&response);
        response
    }

    fn respond<T: Serialize>(
        &self,
        route: Route,
        result: Result<T>,
        status_code: u16,
        remark: &str,
    ) -> OperationResponse {
        let response = match result {
            Ok(data) => OperationResponse::success(status_code, remark, &data),
            Err(e) => self.failure(route, &e),
        };
        self.metrics
            .operation(response.is_success(), response.error_code.as_deref());
        response
    }

    fn failure(&self, route: Route, e: &CoreError) -> OperationResponse {
        match e {
            CoreError::AuditLogFailed(_) | CoreError::Internal(_) => {
                error!(route = route.scope(), error = %e, "Operation failed")
            }
            _ => warn!(
                route = route.scope(),
                code = e.error_code(),
                error = %e,
                "Operation refused"
            ),
        }
        OperationResponse::from_error(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use tokio_test::assert_ok;
    use vaultline_common::{Actor, ManualClock, PaymentChannel, Transaction, UserId};
    use vaultline_ledger::{Account, EntityKind, MemoryStore, StaticDirectory};
    use vaultline_payments::MockPaymentProvider;

    struct TestBackOffice {
        service: BackOffice,
        store: MemoryStore,
        directory: Arc<StaticDirectory>,
        provider: Arc<MockPaymentProvider>,
    }

    async fn create_test_backoffice() -> TestBackOffice {
        let store = MemoryStore::new();
        let directory = Arc::new(StaticDirectory::new());
        let provider = Arc::new(MockPaymentProvider::new());
        let clock = Arc::new(ManualClock::stepping(
            Utc::now(),
            chrono::Duration::milliseconds(1),
        ));
        let service = BackOffice::new(
            BackOfficeConfig::default(),
            Arc::new(store.clone()),
            directory.clone(),
            provider.clone(),
            clock,
        );
        assert_ok!(service.start().await);
        TestBackOffice {
            service,
            store,
            directory,
            provider,
        }
    }

    fn customer(t: &TestBackOffice, serial: i64) -> OperationContext {
        let user = UserId::new();
        t.directory.register(user, serial);
        OperationContext::new(Actor::customer(user))
    }

    fn savings() -> OpenAccountRequest {
        OpenAccountRequest {
            account_type: "savings".to_string(),
            branch_code: None,
        }
    }

    async fn open(t: &TestBackOffice, ctx: &OperationContext, key: &str) -> Account {
        let response = t.service.open_account(ctx, Some(key), savings()).await;
        assert_eq!(response.status_code, 201, "{}", response.remark);
        response.data_as().unwrap()
    }

    fn deposit_request(account: &Account, amount: Decimal) -> DepositRequest {
        DepositRequest {
            account_number: Some(account.account_number.clone()),
            amount,
            currency: "NGN".to_string(),
            channel: PaymentChannel::Card,
        }
    }

    #[tokio::test]
    async fn test_same_key_replays_and_creates_once() {
        let t = create_test_backoffice().await;
        let ctx = customer(&t, 123);

        let first = t.service.open_account(&ctx, Some("key-1"), savings()).await;
        let second = t.service.open_account(&ctx, Some("key-1"), savings()).await;

        assert_eq!(first.status_code, 201);
        assert_eq!(first, second);
        assert_eq!(t.store.accounts().await.len(), 1);
        assert_eq!(t.service.metrics().snapshot().idempotent_replays, 1);

        // A different key is a new request.
        let third = t.service.open_account(&ctx, Some("key-2"), savings()).await;
        assert_eq!(third.status_code, 201);
        assert_eq!(t.store.accounts().await.len(), 2);
    }

    #[tokio::test]
    async fn test_missing_idempotency_key_is_rejected() {
        let t = create_test_backoffice().await;
        let ctx = customer(&t, 1);

        let response = t.service.open_account(&ctx, None, savings()).await;
        assert_eq!(response.status_code, 400);
        assert_eq!(response.error_code.as_deref(), Some("VALIDATION_FAILED"));
        assert!(t.store.accounts().await.is_empty());
    }

    #[tokio::test]
    async fn test_keys_are_scoped_per_caller() {
        let t = create_test_backoffice().await;
        let alice = customer(&t, 1);
        let bob = customer(&t, 2);

        open(&t, &alice, "shared").await;
        open(&t, &bob, "shared").await;
        assert_eq!(t.store.accounts().await.len(), 2);
    }

    #[tokio::test]
    async fn test_deposit_confirmed_end_to_end() {
        let t = create_test_backoffice().await;
        let ctx = customer(&t, 42);
        let account = open(&t, &ctx, "open").await;

        let response = t
            .service
            .deposit(&ctx, Some("dep-1"), deposit_request(&account, dec!(5000.00)))
            .await;
        assert_eq!(response.status_code, 201, "{}", response.remark);
        let receipt: DepositReceipt = response.data_as().unwrap();
        assert!(receipt.checkout_url.is_some());
        assert_eq!(
            t.store.account(&account.account_number).await.unwrap().balance,
            Decimal::ZERO
        );

        let audit_before = t.store.audit_entries().await.len();
        let verified = t
            .service
            .verify(&ctx, receipt.payment_reference.as_str())
            .await;
        assert!(verified.is_success(), "{}", verified.remark);
        let tx: Transaction = verified.data_as().unwrap();
        assert!(tx.is_reconciled);

        assert_eq!(
            t.store.account(&account.account_number).await.unwrap().balance,
            dec!(5000.00)
        );
        let entries = t.store.audit_entries().await;
        let new_entries = &entries[audit_before..];
        let count = |kind: EntityKind| new_entries.iter().filter(|e| e.entity_kind == kind).count();
        assert_eq!(count(EntityKind::Account), 1);
        assert_eq!(count(EntityKind::Transaction), 1);
    }

    #[tokio::test]
    async fn test_duplicate_webhook_conserves_balance() {
        let t = create_test_backoffice().await;
        let ctx = customer(&t, 7);
        let account = open(&t, &ctx, "open").await;
        let receipt: DepositReceipt = t
            .service
            .deposit(&ctx, Some("dep"), deposit_request(&account, dec!(120.50)))
            .await
            .data_as()
            .unwrap();

        let body = serde_json::to_vec(&serde_json::json!({
            "event": "charge.success",
            "data": {
                "reference": receipt.payment_reference.as_str(),
                "status": "SUCCESS",
                "amount": 12_050,
                "currency": "NGN"
            }
        }))
        .unwrap();

        let first = t.service.webhook(&body).await;
        let second = t.service.webhook(&body).await;
        assert_eq!(first.remark, "Payment confirmed");
        assert_eq!(second.remark, "Payment already confirmed");
        assert_eq!(
            t.store.account(&account.account_number).await.unwrap().balance,
            dec!(120.50)
        );
    }

    #[tokio::test]
    async fn test_unsupported_currency_touches_nothing() {
        let t = create_test_backoffice().await;
        let ctx = customer(&t, 9);
        let account = open(&t, &ctx, "open").await;
        let audit_before = t.store.audit_entries().await.len();

        let mut request = deposit_request(&account, dec!(10));
        request.currency = "USD".to_string();
        let response = t.service.deposit(&ctx, Some("usd"), request).await;

        assert_eq!(response.status_code, 400);
        assert_eq!(t.provider.checkout_count(), 0);
        assert_eq!(t.store.audit_entries().await.len(), audit_before);
        assert!(t.store.transactions().await.is_empty());
    }

    #[tokio::test]
    async fn test_refused_deposit_opens_no_checkout() {
        let t = create_test_backoffice().await;
        let owner = customer(&t, 18);
        let intruder = customer(&t, 19);
        let account = open(&t, &owner, "open").await;

        let response = t
            .service
            .deposit(&intruder, Some("dep"), deposit_request(&account, dec!(10)))
            .await;
        assert_eq!(response.status_code, 403);

        let over_limit = t
            .service
            .deposit(&owner, Some("big"), deposit_request(&account, dec!(5000000.01)))
            .await;
        assert_eq!(over_limit.status_code, 400);
        assert_eq!(over_limit.error_code.as_deref(), Some("VALIDATION_FAILED"));

        assert_eq!(t.provider.checkout_count(), 0);
        assert!(t.store.transactions().await.is_empty());
    }

    #[tokio::test]
    async fn test_cancelled_request_can_be_retried_with_same_key() {
        let t = create_test_backoffice().await;
        let ctx = customer(&t, 12);

        let cancelled = OperationContext::with_cancel(ctx.actor, CancellationToken::new());
        cancelled.cancel.cancel();
        let first = t.service.open_account(&cancelled, Some("k"), savings()).await;
        assert_eq!(first.error_code.as_deref(), Some("CANCELLED"));
        assert!(t.store.accounts().await.is_empty());

        let retried = t.service.open_account(&ctx, Some("k"), savings()).await;
        assert_eq!(retried.status_code, 201, "{}", retried.remark);
        assert_eq!(t.store.accounts().await.len(), 1);
    }

    #[tokio::test]
    async fn test_provider_outage_is_not_cached() {
        let t = create_test_backoffice().await;
        let ctx = customer(&t, 11);
        let account = open(&t, &ctx, "open").await;

        t.provider.set_unreachable(true);
        let failed = t
            .service
            .deposit(&ctx, Some("retry-me"), deposit_request(&account, dec!(10)))
            .await;
        assert_eq!(failed.status_code, 502);

        t.provider.set_unreachable(false);
        let retried = t
            .service
            .deposit(&ctx, Some("retry-me"), deposit_request(&account, dec!(10)))
            .await;
        assert_eq!(retried.status_code, 201);
    }

    #[tokio::test]
    async fn test_withdraw_and_flag() {
        let t = create_test_backoffice().await;
        let ctx = customer(&t, 5);
        let account = open(&t, &ctx, "open").await;
        let receipt: DepositReceipt = t
            .service
            .deposit(&ctx, Some("dep"), deposit_request(&account, dec!(300)))
            .await
            .data_as()
            .unwrap();
        t.service
            .verify(&ctx, receipt.payment_reference.as_str())
            .await;

        let response = t
            .service
            .withdraw(
                &ctx,
                Some("wd"),
                WithdrawRequest {
                    account_number: account.account_number.clone(),
                    amount: dec!(100),
                    currency: "NGN".to_string(),
                    notes: None,
                },
            )
            .await;
        assert_eq!(response.status_code, 201, "{}", response.remark);
        let withdrawal: Transaction = response.data_as().unwrap();

        // Customers may not flag.
        let refused = t
            .service
            .flag(&ctx, FlagRequest { transaction_id: withdrawal.id })
            .await;
        assert_eq!(refused.status_code, 403);

        let staff = OperationContext::new(Actor::staff(UserId::new()));
        let flagged = t
            .service
            .flag(&staff, FlagRequest { transaction_id: withdrawal.id })
            .await;
        assert!(flagged.data_as::<Transaction>().unwrap().is_flagged);
        assert_eq!(
            t.store.account(&account.account_number).await.unwrap().balance,
            dec!(200)
        );
    }

    #[tokio::test]
    async fn test_stopped_service_refuses_requests() {
        let t = create_test_backoffice().await;
        let ctx = customer(&t, 3);
        assert_ok!(t.service.stop().await);

        assert_eq!(t.service.state(), ServiceState::Stopped);
        let response = t.service.open_account(&ctx, Some("k"), savings()).await;
        assert_eq!(response.status_code, 500);
        assert!(t.store.accounts().await.is_empty());
    }
}
