//! Simulation controller.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{self, StreamExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::{info, warn};

use vaultline_backoffice::{BackOffice, BackOfficeConfig, MetricsSnapshot};
use vaultline_common::{AccountNumber, Actor, PaymentChannel, PaymentReference, SystemClock, UserId};
use vaultline_ledger::{Account, LedgerStore, MemoryStore, OperationContext, StaticDirectory};
use vaultline_protocol::{
    DepositReceipt, DepositRequest, OpenAccountRequest, OperationResponse, TransferRequest,
    WithdrawRequest,
};

use crate::gateway::SimulatedGateway;
use crate::metrics::SimulationMetrics;
use crate::scenario::{AssertCondition, FaultType, Scenario, ScenarioStep};

#[derive(Debug, Clone)]
struct Customer {
    ctx: OperationContext,
    accounts: Vec<AccountNumber>,
    deposits: Vec<PaymentReference>,
}

impl Customer {
    fn account(&self, name: &str) -> anyhow::Result<AccountNumber> {
        self.accounts
            .last()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("{} has no account", name))
    }

    fn deposit(&self, name: &str) -> anyhow::Result<PaymentReference> {
        self.deposits
            .last()
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("{} has no deposit", name))
    }
}

/// Result of a load run.
#[derive(Debug, Clone)]
pub struct LoadReport {
    /// Deposits credited minus withdrawals debited.
    pub expected_total: Decimal,
    /// Sum of all balances afterwards.
    pub actual_total: Decimal,
}

impl LoadReport {
    pub fn conserved(&self) -> bool {
        self.expected_total == self.actual_total
    }
}

/// Drives scenarios and load against one back-office instance.
pub struct SimulationController {
    service: Arc<BackOffice>,
    gateway: Arc<SimulatedGateway>,
    directory: Arc<StaticDirectory>,
    /// Set when running on the in-memory store; enables fault and audit checks.
    memory: Option<MemoryStore>,
    customers: RwLock<HashMap<String, Customer>>,
    metrics: Arc<RwLock<SimulationMetrics>>,
    last: RwLock<Option<OperationResponse>>,
    audit_baseline: RwLock<usize>,
    currency: String,
    rng: Arc<RwLock<StdRng>>,
}

impl SimulationController {
    pub fn new(
        config: BackOfficeConfig,
        store: Arc<dyn LedgerStore>,
        memory: Option<MemoryStore>,
        seed: Option<u64>,
    ) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        let gateway = Arc::new(SimulatedGateway::new(seed));
        let directory = Arc::new(StaticDirectory::new());
        let currency = config.ledger.supported_currency.code().to_string();
        let service = Arc::new(BackOffice::new(
            config,
            store,
            directory.clone(),
            gateway.clone(),
            Arc::new(SystemClock),
        ));

        Self {
            service,
            gateway,
            directory,
            memory,
            customers: RwLock::new(HashMap::new()),
            metrics: Arc::new(RwLock::new(SimulationMetrics::new())),
            last: RwLock::new(None),
            audit_baseline: RwLock::new(0),
            currency,
            rng: Arc::new(RwLock::new(rng)),
        }
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        self.service.start().await?;
        Ok(())
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        self.service.stop().await?;
        Ok(())
    }

    pub fn set_decline_rate(&self, rate: f64) {
        self.gateway.set_decline_rate(rate);
    }

    pub async fn get_metrics(&self) -> SimulationMetrics {
        self.metrics.read().await.clone()
    }

    pub fn service_metrics(&self) -> MetricsSnapshot {
        self.service.metrics().snapshot()
    }

    pub fn prometheus(&self) -> String {
        self.service.metrics().to_prometheus()
    }

    async fn register(&self, name: &str, serial: i64) {
        let user = UserId::new();
        self.directory.register(user, serial);
        self.customers.write().await.insert(
            name.to_string(),
            Customer {
                ctx: OperationContext::new(Actor::customer(user)),
                accounts: Vec::new(),
                deposits: Vec::new(),
            },
        );
    }

    async fn customer(&self, name: &str) -> anyhow::Result<Customer> {
        self.customers
            .read()
            .await
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Unknown customer: {}", name))
    }

    async fn audit_count(&self) -> anyhow::Result<usize> {
        match &self.memory {
            Some(store) => Ok(store.audit_entries().await.len()),
            None => Err(anyhow::anyhow!("audit checks need the in-memory store")),
        }
    }

    async fn track(&self, response: OperationResponse, started: Instant) -> OperationResponse {
        let latency = started.elapsed().as_micros() as u64;
        self.metrics
            .write()
            .await
            .record(response.error_code.as_deref(), latency);
        *self.last.write().await = Some(response.clone());
        response
    }

    fn key() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    // --- Operations ---

    async fn open_account(&self, name: &str, account_type: &str) -> anyhow::Result<OperationResponse> {
        let customer = self.customer(name).await?;
        let started = Instant::now();
        let response = self
            .service
            .open_account(&customer.ctx, Some(&Self::key()), Self::open_request(account_type))
            .await;
        self.remember_account(name, &response).await;
        Ok(self.track(response, started).await)
    }

    fn open_request(account_type: &str) -> OpenAccountRequest {
        OpenAccountRequest {
            account_type: account_type.to_string(),
            branch_code: None,
        }
    }

    async fn remember_account(&self, name: &str, response: &OperationResponse) {
        if let Some(account) = response.data_as::<Account>() {
            if let Some(c) = self.customers.write().await.get_mut(name) {
                c.accounts.push(account.account_number);
            }
        }
    }

    async fn deposit(&self, name: &str, amount: Decimal, currency: &str) -> anyhow::Result<OperationResponse> {
        let customer = self.customer(name).await?;
        let request = DepositRequest {
            account_number: Some(customer.account(name)?),
            amount,
            currency: currency.to_string(),
            channel: PaymentChannel::Card,
        };
        let started = Instant::now();
        let response = self
            .service
            .deposit(&customer.ctx, Some(&Self::key()), request)
            .await;
        if let Some(receipt) = response.data_as::<DepositReceipt>() {
            if let Some(c) = self.customers.write().await.get_mut(name) {
                c.deposits.push(receipt.payment_reference);
            }
        }
        Ok(self.track(response, started).await)
    }

    async fn deliver_webhook(&self, name: &str, status: &str) -> anyhow::Result<OperationResponse> {
        let reference = self.customer(name).await?.deposit(name)?;
        self.deliver_webhook_for(&reference, status).await
    }

    async fn deliver_webhook_for(
        &self,
        reference: &PaymentReference,
        status: &str,
    ) -> anyhow::Result<OperationResponse> {
        let body = self
            .gateway
            .webhook_body(reference, status)
            .await
            .ok_or_else(|| anyhow::anyhow!("gateway has no checkout {}", reference))?;
        let started = Instant::now();
        let response = self.service.webhook(&body).await;
        Ok(self.track(response, started).await)
    }

    async fn verify(&self, name: &str) -> anyhow::Result<OperationResponse> {
        let customer = self.customer(name).await?;
        let reference = customer.deposit(name)?;
        let started = Instant::now();
        let response = self.service.verify(&customer.ctx, reference.as_str()).await;
        Ok(self.track(response, started).await)
    }

    async fn withdraw(&self, name: &str, amount: Decimal, currency: &str) -> anyhow::Result<OperationResponse> {
        let customer = self.customer(name).await?;
        let request = WithdrawRequest {
            account_number: customer.account(name)?,
            amount,
            currency: currency.to_string(),
            notes: Some("simulated withdrawal".to_string()),
        };
        let started = Instant::now();
        let response = self
            .service
            .withdraw(&customer.ctx, Some(&Self::key()), request)
            .await;
        Ok(self.track(response, started).await)
    }

    async fn transfer(&self, from: &str, to: &str, amount: Decimal) -> anyhow::Result<OperationResponse> {
        let sender = self.customer(from).await?;
        let recipient = self.customer(to).await?;
        let request = TransferRequest {
            sender_account_number: sender.account(from)?,
            recipient_account_number: recipient.account(to)?,
            amount,
            currency: self.currency.clone(),
            notes: None,
        };
        let started = Instant::now();
        let response = self
            .service
            .transfer(&sender.ctx, Some(&Self::key()), request)
            .await;
        Ok(self.track(response, started).await)
    }

    async fn balance(&self, name: &str) -> anyhow::Result<Decimal> {
        let number = self.customer(name).await?.account(name)?;
        let response = self
            .service
            .account(&OperationContext::system(), &number)
            .await;
        response
            .data_as::<Account>()
            .map(|a| a.balance)
            .ok_or_else(|| anyhow::anyhow!("cannot read account {}: {}", number, response.remark))
    }

    async fn accounts_of(&self, name: &str) -> anyhow::Result<Vec<Account>> {
        let customer = self.customer(name).await?;
        let mut accounts = self
            .service
            .ledger()
            .accounts_of(&customer.ctx, &customer.ctx.actor.user)
            .await?;
        accounts.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.ledger_number.as_str().cmp(b.ledger_number.as_str()))
        });
        Ok(accounts)
    }

    // --- Scenarios ---

    /// Run a scenario. A failed assertion stops the run with an error.
    pub async fn run_scenario(&self, scenario: Scenario) -> anyhow::Result<()> {
        info!("Running scenario: {} - {}", scenario.name, scenario.description);

        for spec in &scenario.customers {
            self.register(&spec.name, spec.serial).await;
        }
        if self.memory.is_some() {
            *self.audit_baseline.write().await = self.audit_count().await?;
        }

        for (i, step) in scenario.steps.iter().enumerate() {
            self.execute_step(step)
                .await
                .map_err(|e| anyhow::anyhow!("step {} ({:?}) failed: {}", i + 1, step, e))?;
        }

        info!("Scenario {} passed", scenario.name);
        Ok(())
    }

    async fn execute_step(&self, step: &ScenarioStep) -> anyhow::Result<()> {
        match step {
            ScenarioStep::OpenAccount {
                customer,
                account_type,
            } => {
                let response = self.open_account(customer, account_type).await?;
                info!(customer = %customer, status = response.status_code, "{}", response.remark);
            }
            ScenarioStep::RepeatOpenAccount {
                customer,
                account_type,
                times,
            } => {
                let ctx = self.customer(customer).await?.ctx;
                let key = Self::key();
                let started = Instant::now();
                let responses = futures::future::join_all((0..*times).map(|_| {
                    self.service
                        .open_account(&ctx, Some(&key), Self::open_request(account_type))
                }))
                .await;
                if responses.windows(2).any(|pair| pair[0] != pair[1]) {
                    anyhow::bail!("responses for one idempotency key differ");
                }
                if let Some(first) = responses.into_iter().next() {
                    self.remember_account(customer, &first).await;
                    self.track(first, started).await;
                }
            }
            ScenarioStep::Deposit {
                customer,
                amount,
                currency,
            } => {
                let response = self.deposit(customer, parse_amount(amount)?, currency).await?;
                info!(customer = %customer, status = response.status_code, "{}", response.remark);
            }
            ScenarioStep::DeliverWebhook {
                customer,
                status,
                times,
            } => {
                for _ in 0..*times {
                    let response = self.deliver_webhook(customer, status).await?;
                    info!(customer = %customer, status = response.status_code, "{}", response.remark);
                }
            }
            ScenarioStep::Verify { customer } => {
                let response = self.verify(customer).await?;
                info!(customer = %customer, status = response.status_code, "{}", response.remark);
            }
            ScenarioStep::Withdraw {
                customer,
                amount,
                currency,
            } => {
                let response = self.withdraw(customer, parse_amount(amount)?, currency).await?;
                info!(customer = %customer, status = response.status_code, "{}", response.remark);
            }
            ScenarioStep::Transfer { from, to, amount } => {
                let response = self.transfer(from, to, parse_amount(amount)?).await?;
                info!(from = %from, to = %to, status = response.status_code, "{}", response.remark);
            }
            ScenarioStep::InjectFault { fault } => {
                info!("Injecting fault {:?}", fault);
                self.inject(fault)?;
            }
            ScenarioStep::ClearFaults => {
                info!("Clearing faults");
                self.gateway.reset().await;
                if let Some(store) = &self.memory {
                    store.fail_audit_writes(false);
                }
            }
            ScenarioStep::Assert { condition } => {
                self.check(condition).await?;
                info!("Assertion held: {:?}", condition);
            }
        }

        Ok(())
    }

    fn inject(&self, fault: &FaultType) -> anyhow::Result<()> {
        match fault {
            FaultType::GatewayOffline => self.gateway.set_offline(true),
            FaultType::GatewayLatency { delay_ms } => {
                self.gateway.set_latency(Duration::from_millis(*delay_ms))
            }
            FaultType::GatewayDeclines { rate } => self.gateway.set_decline_rate(*rate),
            FaultType::AuditStoreDown => match &self.memory {
                Some(store) => store.fail_audit_writes(true),
                None => anyhow::bail!("audit faults need the in-memory store"),
            },
        }
        Ok(())
    }

    async fn check(&self, condition: &AssertCondition) -> anyhow::Result<()> {
        match condition {
            AssertCondition::BalanceEquals { customer, amount } => {
                let expected = parse_amount(amount)?;
                let actual = self.balance(customer).await?;
                if actual != expected {
                    anyhow::bail!("{} balance is {}, expected {}", customer, actual, expected);
                }
            }
            AssertCondition::AccountCount { customer, count } => {
                let actual = self.accounts_of(customer).await?.len();
                if actual != *count {
                    anyhow::bail!("{} has {} accounts, expected {}", customer, actual, count);
                }
            }
            AssertCondition::LedgerNumbers { customer, expected } => {
                let actual: Vec<String> = self
                    .accounts_of(customer)
                    .await?
                    .iter()
                    .map(|a| a.ledger_number.to_string())
                    .collect();
                if &actual != expected {
                    anyhow::bail!("ledger numbers {:?}, expected {:?}", actual, expected);
                }
            }
            AssertCondition::LastStatus { code } => {
                let last = self.last_response().await?;
                if last.status_code != *code {
                    anyhow::bail!(
                        "last status {} ({}), expected {}",
                        last.status_code,
                        last.remark,
                        code
                    );
                }
            }
            AssertCondition::LastRemark { remark } => {
                let last = self.last_response().await?;
                if &last.remark != remark {
                    anyhow::bail!("last remark '{}', expected '{}'", last.remark, remark);
                }
            }
            AssertCondition::AuditRecords { count } => {
                let written = self.audit_count().await? - *self.audit_baseline.read().await;
                if written != *count {
                    anyhow::bail!("{} audit records written, expected {}", written, count);
                }
            }
        }
        Ok(())
    }

    async fn last_response(&self) -> anyhow::Result<OperationResponse> {
        self.last
            .read()
            .await
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no operation has run yet"))
    }

    // --- Load ---

    /// Fund `customers` accounts, then run `operations` random operations
    /// with at most `concurrency` in flight, and check that funds were
    /// conserved.
    pub async fn run_load(
        &self,
        customers: usize,
        operations: usize,
        concurrency: usize,
    ) -> anyhow::Result<LoadReport> {
        info!(customers, operations, concurrency, "Preparing load run");

        let initial = Decimal::from(100_000);
        let mut names = Vec::with_capacity(customers);
        for i in 0..customers {
            let name = format!("CUST_{}", i + 1);
            self.register(&name, 1000 + i as i64).await;
            self.open_account(&name, "savings").await?;
            self.deposit(&name, initial, &self.currency).await?;
            self.deliver_webhook(&name, "success").await?;
            names.push(name);
        }
        if names.len() < 2 {
            anyhow::bail!("load runs need at least two customers");
        }

        let external = Arc::new(RwLock::new(initial * Decimal::from(customers)));
        let names = &names;
        stream::iter(0..operations)
            .for_each_concurrent(concurrency.max(1), |_| {
                let external = external.clone();
                async move {
                    if let Err(e) = self.random_operation(names, &external).await {
                        warn!(error = %e, "Load operation errored");
                    }
                }
            })
            .await;

        let mut actual_total = Decimal::ZERO;
        for name in names {
            actual_total += self.balance(name).await?;
        }
        let expected_total = *external.read().await;

        let report = LoadReport {
            expected_total,
            actual_total,
        };
        if report.conserved() {
            info!(total = %actual_total, "Funds conserved");
        } else {
            warn!(
                expected = %expected_total,
                actual = %actual_total,
                "Funds not conserved"
            );
        }
        Ok(report)
    }

    async fn random_operation(
        &self,
        names: &[String],
        external: &RwLock<Decimal>,
    ) -> anyhow::Result<()> {
        let (kind, from, to, amount, redeliver) = {
            let mut rng = self.rng.write().await;
            let from = rng.gen_range(0..names.len());
            let mut to = rng.gen_range(0..names.len());
            while to == from {
                to = rng.gen_range(0..names.len());
            }
            (
                rng.gen_range(0..3u8),
                from,
                to,
                Decimal::new(rng.gen_range(100..500_000), 2),
                rng.gen_bool(0.3),
            )
        };
        let (from, to) = (&names[from], &names[to]);

        match kind {
            0 => {
                let response = self.deposit(from, amount, &self.currency).await?;
                let Some(receipt) = response.data_as::<DepositReceipt>() else {
                    return Ok(());
                };
                let reference = &receipt.payment_reference;
                let ctx = self.customer(from).await?.ctx;
                let started = Instant::now();
                let verified = self.service.verify(&ctx, reference.as_str()).await;
                let mut outcomes = vec![self.track(verified, started).await];
                // The gateway's webhook may arrive after the verify call settled it.
                if redeliver {
                    outcomes.push(self.deliver_webhook_for(reference, "success").await?);
                }
                for response in outcomes {
                    if response.remark == "Payment confirmed" {
                        *external.write().await += amount;
                    }
                }
            }
            1 => {
                let response = self.withdraw(from, amount, &self.currency).await?;
                if response.is_success() {
                    *external.write().await -= amount;
                }
            }
            _ => {
                self.transfer(from, to, amount).await?;
            }
        }
        Ok(())
    }
}

fn parse_amount(amount: &str) -> anyhow::Result<Decimal> {
    Decimal::from_str_exact(amount).map_err(|e| anyhow::anyhow!("bad amount {}: {}", amount, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_controller() -> SimulationController {
        let store = MemoryStore::new();
        SimulationController::new(
            BackOfficeConfig::default(),
            Arc::new(store.clone()),
            Some(store),
            Some(7),
        )
    }

    #[tokio::test]
    async fn test_named_scenarios_pass() {
        for name in Scenario::NAMES {
            let controller = create_test_controller();
            controller.start().await.unwrap();
            controller
                .run_scenario(Scenario::load(name).unwrap())
                .await
                .unwrap_or_else(|e| panic!("{name}: {e}"));
        }
    }

    #[tokio::test]
    async fn test_load_conserves_funds() {
        let controller = create_test_controller();
        controller.start().await.unwrap();

        let report = controller.run_load(4, 60, 8).await.unwrap();
        assert!(report.conserved(), "{report:?}");
        assert!(controller.get_metrics().await.total_operations >= 60);
    }
}
