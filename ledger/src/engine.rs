//! Core ledger engine implementation.
//!
//! Each operation runs as one unit of work: account locks first, then
//! `begin`, reads, audit snapshots, mutations, `commit`. The whole body races
//! the caller's cancellation token; losing the race drops the unit of work
//! and with it every staged audit record and balance change.

use std::future::Future;
use std::sync::Arc;

use rust_decimal::Decimal;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

use vaultline_common::{
    constants, start_of_day, AccountNumber, Actor, CoreError, Currency, Money, Payment,
    PaymentChannel, PaymentReference, ReconciliationStatus, Result, Role, SharedClock,
    Transaction, TransactionId, TransactionType, UserId,
};

use crate::account::{Account, AccountStatus, AccountType, NewAccount};
use crate::audit::{AuditAction, AuditLog, AuditTrail, EntityKind};
use crate::config::LedgerConfig;
use crate::directory::CustomerDirectory;
use crate::locks::AccountLocks;
use crate::numbering::{require_customer_serial, AccountIdentifierGenerator};
use crate::query::{Period, TransactionFilter};
use crate::store::{LedgerStore, UnitOfWork};

/// Caller identity and cancellation signal for one operation.
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub actor: Actor,
    pub cancel: CancellationToken,
}

impl OperationContext {
    pub fn new(actor: Actor) -> Self {
        Self {
            actor,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancel(actor: Actor, cancel: CancellationToken) -> Self {
        Self { actor, cancel }
    }

    pub fn system() -> Self {
        Self::new(Actor::system())
    }

    fn require_role(&self, allowed: &[Role], action: &str) -> Result<()> {
        if allowed.contains(&self.actor.role) {
            Ok(())
        } else {
            Err(CoreError::Unauthorized(format!(
                "{:?} may not {action}",
                self.actor.role
            )))
        }
    }

    fn require_owner(&self, account: &Account) -> Result<()> {
        if self.actor.may_act_for(&account.owner) {
            Ok(())
        } else {
            Err(CoreError::Unauthorized(format!(
                "account {} belongs to another customer",
                account.account_number
            )))
        }
    }
}

/// Open a new account.
#[derive(Debug, Clone)]
pub struct OpenAccountCommand {
    pub owner: UserId,
    pub account_type: AccountType,
    /// Defaults to the configured branch.
    pub branch_code: Option<String>,
}

/// Record an externally funded deposit.
#[derive(Debug, Clone)]
pub struct DepositCommand {
    /// Defaults to the caller's first active account.
    pub account_number: Option<AccountNumber>,
    pub amount: Decimal,
    pub currency: Currency,
    pub reference: PaymentReference,
    pub channel: PaymentChannel,
    pub checkout_url: Option<String>,
}

/// Withdraw from an account.
#[derive(Debug, Clone)]
pub struct WithdrawalCommand {
    pub account_number: AccountNumber,
    pub amount: Decimal,
    pub currency: Currency,
    pub notes: Option<String>,
}

/// Move funds between two accounts.
#[derive(Debug, Clone)]
pub struct TransferCommand {
    pub sender: AccountNumber,
    pub recipient: AccountNumber,
    pub amount: Decimal,
    pub currency: Currency,
    pub notes: Option<String>,
}

/// Both legs of a transfer.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TransferReceipt {
    pub debit: Transaction,
    pub credit: Transaction,
}

/// The ledger engine: account opening, balance-moving transactions,
/// reconciliation, administrative edits and read queries.
pub struct TransactionLedger {
    store: Arc<dyn LedgerStore>,
    directory: Arc<dyn CustomerDirectory>,
    clock: SharedClock,
    config: LedgerConfig,
    audit: AuditTrail,
    numbers: AccountIdentifierGenerator,
    locks: AccountLocks,
}

impl TransactionLedger {
    /// Create a new ledger engine.
    pub fn new(
        store: Arc<dyn LedgerStore>,
        directory: Arc<dyn CustomerDirectory>,
        clock: SharedClock,
        config: LedgerConfig,
    ) -> Self {
        let numbers =
            AccountIdentifierGenerator::new(config.bank_code.clone(), config.max_generation_attempts);
        Self {
            store,
            directory,
            audit: AuditTrail::new(clock.clone()),
            clock,
            config,
            numbers,
            locks: AccountLocks::new(),
        }
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    pub fn clock(&self) -> &SharedClock {
        &self.clock
    }

    /// Release lock-table entries for idle accounts.
    pub fn prune_locks(&self) -> usize {
        self.locks.prune()
    }

    async fn run<T, F>(&self, ctx: &OperationContext, operation: &'static str, body: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = ctx.cancel.cancelled() => {
                warn!(operation, actor = %ctx.actor, "Operation cancelled, unit of work discarded");
                Err(CoreError::Cancelled)
            }
            result = body => result,
        }
    }

    fn ensure_supported_currency(&self, currency: &Currency) -> Result<()> {
        if currency != &self.config.supported_currency {
            return Err(CoreError::invalid_field(
                "currency",
                format!(
                    "unsupported currency {currency}, only {} is accepted",
                    self.config.supported_currency
                ),
            ));
        }
        Ok(())
    }

    /// Validate an amount in the supported currency before any state is touched.
    pub fn payable(&self, amount: Decimal, currency: &Currency) -> Result<Money> {
        self.ensure_supported_currency(currency)?;
        let money = Money::new(amount, currency.clone());
        money.ensure_payable()?;
        Ok(money)
    }

    async fn live_account(
        uow: &mut dyn UnitOfWork,
        number: &AccountNumber,
    ) -> Result<Account> {
        match uow.account_by_number(number).await? {
            Some(account) if !account.is_deleted => Ok(account),
            _ => Err(CoreError::not_found("Account", number)),
        }
    }

    async fn live_transaction(uow: &mut dyn UnitOfWork, id: &TransactionId) -> Result<Transaction> {
        match uow.transaction_by_id(id).await? {
            Some(tx) if !tx.is_deleted => Ok(tx),
            _ => Err(CoreError::not_found("Transaction", id)),
        }
    }

    /// The externally funded credit carrying `reference`.
    async fn deposit_by_reference(
        uow: &mut dyn UnitOfWork,
        reference: &PaymentReference,
    ) -> Result<Transaction> {
        uow.transactions_by_reference(reference)
            .await?
            .into_iter()
            .find(|t| {
                !t.is_deleted
                    && t.transaction_type == TransactionType::Credit
                    && t.sender_account_number.is_none()
            })
            .ok_or_else(|| CoreError::not_found("Transaction", reference))
    }

    async fn ensure_within_daily_limit(
        &self,
        uow: &mut dyn UnitOfWork,
        account: &Account,
        kind: TransactionType,
        amount: Decimal,
    ) -> Result<()> {
        let since = start_of_day(self.clock.now(), self.config.business_offset());
        let booked = uow
            .booked_total_since(&account.account_number, kind, since)
            .await?;
        let (limit, label) = match kind {
            TransactionType::Debit => (account.maximum_daily_withdrawal_limit, "withdrawal"),
            TransactionType::Credit => (account.maximum_daily_deposit_limit, "deposit"),
        };
        if booked + amount > limit {
            warn!(
                account = %account.account_number,
                booked = %booked,
                amount = %amount,
                limit = %limit,
                "Daily {label} limit exceeded"
            );
            return Err(CoreError::invalid_field(
                "amount",
                format!("daily {label} limit of {limit} exceeded"),
            ));
        }
        Ok(())
    }

    // ----------------------------------------------------------------------
    // Accounts
    // ----------------------------------------------------------------------

    /// Open an account, generating its ledger and account numbers.
    #[instrument(skip(self, ctx, cmd), fields(actor = %ctx.actor, owner = %cmd.owner))]
    pub async fn open_account(
        &self,
        ctx: &OperationContext,
        cmd: OpenAccountCommand,
    ) -> Result<Account> {
        self.run(ctx, "open_account", async {
            if !ctx.actor.may_act_for(&cmd.owner) {
                return Err(CoreError::Unauthorized(
                    "customers may only open their own accounts".to_string(),
                ));
            }
            let branch = cmd
                .branch_code
                .clone()
                .unwrap_or_else(|| self.config.default_branch_code.clone());
            if branch.len() != 3 || !branch.bytes().all(|b| b.is_ascii_digit()) {
                return Err(CoreError::invalid_field("branchCode", "branch code must be 3 digits"));
            }

            let serial = self.directory.customer_serial(&cmd.owner).await?;
            let serial = require_customer_serial(serial, cmd.owner)?;

            let mut attempt = 0;
            loop {
                attempt += 1;
                match self.try_open(&cmd, &branch, serial).await {
                    Err(CoreError::Conflict(reason))
                        if attempt < constants::MAX_OPEN_ACCOUNT_RETRIES =>
                    {
                        warn!(attempt, reason = %reason, "Account numbers taken concurrently, retrying");
                    }
                    other => return other,
                }
            }
        })
        .await
    }

    async fn try_open(
        &self,
        cmd: &OpenAccountCommand,
        branch: &str,
        serial: i64,
    ) -> Result<Account> {
        let mut uow = self.store.begin().await?;
        let ledger_number = self
            .numbers
            .generate_ledger_number(uow.as_mut(), branch, serial, cmd.account_type)
            .await?;
        let account_number = self
            .numbers
            .generate_unique_account_number(uow.as_mut(), serial)
            .await?;

        let account = Account::new(
            NewAccount {
                owner: cmd.owner,
                account_type: cmd.account_type,
                currency: self.config.supported_currency.clone(),
                branch_code: branch.to_string(),
                ledger_number,
                account_number,
                maximum_daily_withdrawal_limit: self.config.default_daily_withdrawal_limit,
                maximum_daily_deposit_limit: self.config.default_daily_deposit_limit,
            },
            self.clock.now(),
        );
        uow.insert_account(&account).await?;
        uow.commit().await?;

        info!(
            account = %account.account_number,
            ledger_number = %account.ledger_number,
            account_type = account.account_type.as_str(),
            "Account opened"
        );
        Ok(account)
    }

    /// Change daily limits. Staff and admins only.
    #[instrument(skip(self, ctx), fields(actor = %ctx.actor))]
    pub async fn update_account_limits(
        &self,
        ctx: &OperationContext,
        number: &AccountNumber,
        withdrawal_limit: Option<Decimal>,
        deposit_limit: Option<Decimal>,
    ) -> Result<Account> {
        self.run(ctx, "update_account_limits", async {
            ctx.require_role(&[Role::Staff, Role::Admin], "change account limits")?;
            for (field, limit) in [
                ("maximumDailyWithdrawalLimit", withdrawal_limit),
                ("maximumDailyDepositLimit", deposit_limit),
            ] {
                if limit.is_some_and(|l| l <= Decimal::ZERO) {
                    return Err(CoreError::invalid_field(field, "limit must be positive"));
                }
            }

            let _guard = self.locks.acquire(number).await;
            let mut uow = self.store.begin().await?;
            let mut account = Self::live_account(uow.as_mut(), number).await?;
            self.audit
                .apply(
                    uow.as_mut(),
                    ctx.actor.user,
                    AuditAction::Update,
                    &mut account,
                    |a, now| {
                        a.set_limits(withdrawal_limit, deposit_limit, now);
                        Ok(())
                    },
                )
                .await?;
            uow.commit().await?;

            info!(account = %number, "Account limits updated");
            Ok(account)
        })
        .await
    }

    /// Change account status. Staff and admins only.
    #[instrument(skip(self, ctx), fields(actor = %ctx.actor))]
    pub async fn set_account_status(
        &self,
        ctx: &OperationContext,
        number: &AccountNumber,
        status: AccountStatus,
    ) -> Result<Account> {
        self.run(ctx, "set_account_status", async {
            ctx.require_role(&[Role::Staff, Role::Admin], "change account status")?;

            let _guard = self.locks.acquire(number).await;
            let mut uow = self.store.begin().await?;
            let mut account = Self::live_account(uow.as_mut(), number).await?;
            let previous = account.status;
            self.audit
                .apply(
                    uow.as_mut(),
                    ctx.actor.user,
                    AuditAction::Update,
                    &mut account,
                    |a, now| {
                        a.set_status(status, now);
                        Ok(())
                    },
                )
                .await?;
            uow.commit().await?;

            info!(account = %number, from = %previous, to = %status, "Account status changed");
            Ok(account)
        })
        .await
    }

    /// Soft-delete an account. Admins only; the balance must be zero.
    #[instrument(skip(self, ctx), fields(actor = %ctx.actor))]
    pub async fn delete_account(&self, ctx: &OperationContext, number: &AccountNumber) -> Result<()> {
        self.run(ctx, "delete_account", async {
            ctx.require_role(&[Role::Admin], "delete accounts")?;

            let _guard = self.locks.acquire(number).await;
            let mut uow = self.store.begin().await?;
            let mut account = Self::live_account(uow.as_mut(), number).await?;
            if !account.balance.is_zero() {
                return Err(CoreError::validation(format!(
                    "account {number} still holds {}",
                    account.balance_money()
                )));
            }
            let by = ctx.actor.user;
            self.audit
                .apply(uow.as_mut(), by, AuditAction::Delete, &mut account, |a, now| {
                    a.soft_delete(by, now);
                    Ok(())
                })
                .await?;
            uow.commit().await?;

            info!(account = %number, "Account deleted");
            Ok(())
        })
        .await
    }

    // ----------------------------------------------------------------------
    // Transactions
    // ----------------------------------------------------------------------

    /// Record an unreconciled deposit. No balance changes until the payment
    /// is confirmed.
    #[instrument(skip(self, ctx, cmd), fields(actor = %ctx.actor, reference = %cmd.reference))]
    pub async fn create_deposit(
        &self,
        ctx: &OperationContext,
        cmd: DepositCommand,
    ) -> Result<Transaction> {
        self.run(ctx, "create_deposit", async {
            let money = self.payable(cmd.amount, &cmd.currency)?;

            let mut uow = self.store.begin().await?;
            let account = self
                .deposit_target(uow.as_mut(), ctx, cmd.account_number.as_ref(), &money)
                .await?;

            if !uow.transactions_by_reference(&cmd.reference).await?.is_empty() {
                return Err(CoreError::Conflict(format!(
                    "payment reference {} already used",
                    cmd.reference
                )));
            }

            let now = self.clock.now();
            let tx = Transaction::deposit(
                account.account_number.clone(),
                money.clone(),
                cmd.reference.clone(),
                now,
            );
            let payment = Payment::new(cmd.reference, money, cmd.channel, cmd.checkout_url, now);
            uow.insert_transaction(&tx).await?;
            uow.insert_payment(&payment).await?;
            uow.commit().await?;

            info!(
                transaction = %tx.id,
                account = %account.account_number,
                amount = %tx.amount,
                "Deposit initiated"
            );
            Ok(tx)
        })
        .await
    }

    /// Run every check a deposit must pass without writing anything, so a
    /// provider checkout is only opened for a deposit the ledger will accept.
    #[instrument(skip(self, ctx), fields(actor = %ctx.actor))]
    pub async fn prepare_deposit(
        &self,
        ctx: &OperationContext,
        account_number: Option<&AccountNumber>,
        amount: Decimal,
        currency: &Currency,
    ) -> Result<(Account, Money)> {
        self.run(ctx, "prepare_deposit", async {
            let money = self.payable(amount, currency)?;
            // Read-only; dropping the unit of work discards it.
            let mut uow = self.store.begin().await?;
            let account = self
                .deposit_target(uow.as_mut(), ctx, account_number, &money)
                .await?;
            Ok((account, money))
        })
        .await
    }

    async fn deposit_target(
        &self,
        uow: &mut dyn UnitOfWork,
        ctx: &OperationContext,
        account_number: Option<&AccountNumber>,
        money: &Money,
    ) -> Result<Account> {
        let account = match account_number {
            Some(number) => Self::live_account(uow, number).await?,
            None => self.primary_account(uow, &ctx.actor.user).await?,
        };
        ctx.require_owner(&account)?;
        account.ensure_can_transact()?;
        self.ensure_within_daily_limit(uow, &account, TransactionType::Credit, money.value)
            .await?;
        Ok(account)
    }

    async fn primary_account(&self, uow: &mut dyn UnitOfWork, owner: &UserId) -> Result<Account> {
        uow.accounts_by_owner(owner)
            .await?
            .into_iter()
            .find(|a| a.can_transact() && a.currency == self.config.supported_currency)
            .ok_or_else(|| CoreError::not_found("Account", format!("owner {owner}")))
    }

    /// Debit an account immediately; the transaction is reconciled at creation.
    #[instrument(skip(self, ctx, cmd), fields(actor = %ctx.actor, account = %cmd.account_number))]
    pub async fn create_withdrawal(
        &self,
        ctx: &OperationContext,
        cmd: WithdrawalCommand,
    ) -> Result<Transaction> {
        self.run(ctx, "create_withdrawal", async {
            let money = self.payable(cmd.amount, &cmd.currency)?;

            let _guard = self.locks.acquire(&cmd.account_number).await;
            let mut uow = self.store.begin().await?;
            let mut account = Self::live_account(uow.as_mut(), &cmd.account_number).await?;
            ctx.require_owner(&account)?;
            account.ensure_can_transact()?;
            self.ensure_within_daily_limit(
                uow.as_mut(),
                &account,
                TransactionType::Debit,
                money.value,
            )
            .await?;

            let amount = money.value;
            self.audit
                .apply(
                    uow.as_mut(),
                    ctx.actor.user,
                    AuditAction::Update,
                    &mut account,
                    |a, now| a.debit(amount, now),
                )
                .await?;

            let mut tx = Transaction::withdrawal(
                account.account_number.clone(),
                money,
                PaymentReference::generate(),
                ctx.actor.user,
                self.clock.now(),
            );
            tx.notes = cmd.notes;
            uow.insert_transaction(&tx).await?;
            uow.commit().await?;

            info!(
                transaction = %tx.id,
                amount = %tx.amount,
                balance = %account.balance,
                "Withdrawal applied"
            );
            Ok(tx)
        })
        .await
    }

    /// Debit one account and credit another in one unit of work.
    #[instrument(skip(self, ctx, cmd), fields(actor = %ctx.actor, sender = %cmd.sender, recipient = %cmd.recipient))]
    pub async fn transfer(
        &self,
        ctx: &OperationContext,
        cmd: TransferCommand,
    ) -> Result<TransferReceipt> {
        self.run(ctx, "transfer", async {
            let money = self.payable(cmd.amount, &cmd.currency)?;
            if cmd.sender == cmd.recipient {
                return Err(CoreError::invalid_field(
                    "recipientAccountNumber",
                    "cannot transfer to the same account",
                ));
            }

            let _guards = self.locks.acquire_many(&[&cmd.sender, &cmd.recipient]).await;
            let mut uow = self.store.begin().await?;
            let mut sender = Self::live_account(uow.as_mut(), &cmd.sender).await?;
            let mut recipient = Self::live_account(uow.as_mut(), &cmd.recipient).await?;
            ctx.require_owner(&sender)?;
            sender.ensure_can_transact()?;
            recipient.ensure_can_transact()?;
            self.ensure_within_daily_limit(
                uow.as_mut(),
                &sender,
                TransactionType::Debit,
                money.value,
            )
            .await?;

            let actor = ctx.actor.user;
            let entries = [
                self.audit.snapshot(&sender, AuditAction::Update, actor)?,
                self.audit.snapshot(&recipient, AuditAction::Update, actor)?,
            ];
            self.audit.capture_many(uow.as_mut(), &entries).await?;

            let now = self.clock.now();
            sender.debit(money.value, now)?;
            recipient.credit(money.value, now);

            let reference = PaymentReference::generate();
            let mut debit = Transaction::transfer_leg(
                TransactionType::Debit,
                sender.account_number.clone(),
                recipient.account_number.clone(),
                money.clone(),
                reference.clone(),
                actor,
                now,
            );
            let mut credit = Transaction::transfer_leg(
                TransactionType::Credit,
                sender.account_number.clone(),
                recipient.account_number.clone(),
                money,
                reference,
                actor,
                now,
            );
            debit.notes = cmd.notes.clone();
            credit.notes = cmd.notes;

            uow.update_account(&sender).await?;
            uow.update_account(&recipient).await?;
            uow.insert_transaction(&debit).await?;
            uow.insert_transaction(&credit).await?;
            uow.commit().await?;

            info!(
                reference = %debit.payment_reference,
                amount = %debit.amount,
                "Transfer applied"
            );
            Ok(TransferReceipt { debit, credit })
        })
        .await
    }

    /// Apply a confirmed external payment: reconcile the deposit and credit
    /// its recipient, exactly once.
    ///
    /// A second confirmation of the same reference is a `Conflict`. If the
    /// confirmed amount differs from the recorded one, the confirmed amount
    /// is credited and the transaction is flagged for review.
    #[instrument(skip(self, ctx), fields(actor = %ctx.actor, reference = %reference))]
    pub async fn confirm_transaction(
        &self,
        ctx: &OperationContext,
        reference: &PaymentReference,
        confirmed_amount: Decimal,
    ) -> Result<Transaction> {
        self.run(ctx, "confirm_transaction", async {
            if confirmed_amount <= Decimal::ZERO {
                return Err(CoreError::invalid_field(
                    "amount",
                    "confirmed amount must be positive",
                ));
            }

            // Find the recipient first so its lock is taken before the real unit of work.
            let recipient = {
                let mut peek = self.store.begin().await?;
                let tx = Self::deposit_by_reference(peek.as_mut(), reference).await?;
                tx.recipient_account_number.ok_or_else(|| {
                    CoreError::Internal(format!("deposit {reference} has no recipient"))
                })?
            };

            let _guard = self.locks.acquire(&recipient).await;
            let mut uow = self.store.begin().await?;
            let mut tx = Self::deposit_by_reference(uow.as_mut(), reference).await?;
            if tx.status.is_final() {
                return Err(CoreError::Conflict(format!(
                    "transaction {} is already {}",
                    tx.id,
                    tx.status.as_str()
                )));
            }
            let mut account = Self::live_account(uow.as_mut(), &recipient).await?;
            let mut payment = uow.payment_by_reference(reference).await?;

            let actor = ctx.actor.user;
            let mut entries: Vec<AuditLog> = vec![
                self.audit.snapshot(&tx, AuditAction::Update, actor)?,
                self.audit.snapshot(&account, AuditAction::Update, actor)?,
            ];
            if let Some(payment) = &payment {
                entries.push(self.audit.snapshot(payment, AuditAction::Update, actor)?);
            }
            self.audit.capture_many(uow.as_mut(), &entries).await?;

            let now = self.clock.now();
            tx.reconcile(actor, now)?;
            if confirmed_amount != tx.amount.value {
                warn!(
                    transaction = %tx.id,
                    recorded = %tx.amount.value,
                    confirmed = %confirmed_amount,
                    "Confirmed amount differs from recorded amount, flagging"
                );
                tx.append_note(&format!(
                    "provider confirmed {confirmed_amount}, recorded {}",
                    tx.amount.value
                ));
                tx.flag(now);
            }
            account.credit(confirmed_amount, now);
            if let Some(payment) = payment.as_mut() {
                payment.confirm(now)?;
            }

            uow.update_transaction(&tx).await?;
            uow.update_account(&account).await?;
            if let Some(payment) = &payment {
                uow.update_payment(payment).await?;
            }
            uow.commit().await?;

            info!(
                transaction = %tx.id,
                account = %recipient,
                amount = %confirmed_amount,
                balance = %account.balance,
                "Transaction reconciled"
            );
            Ok(tx)
        })
        .await
    }

    /// Mark a deposit as rejected by the provider. No balance change.
    #[instrument(skip(self, ctx), fields(actor = %ctx.actor, reference = %reference))]
    pub async fn reject_transaction(
        &self,
        ctx: &OperationContext,
        reference: &PaymentReference,
        reason: &str,
    ) -> Result<Transaction> {
        self.run(ctx, "reject_transaction", async {
            ctx.require_role(&[Role::System, Role::Staff, Role::Admin], "reject transactions")?;

            let mut uow = self.store.begin().await?;
            let mut tx = Self::deposit_by_reference(uow.as_mut(), reference).await?;
            if tx.status.is_final() {
                return Err(CoreError::Conflict(format!(
                    "transaction {} is already {}",
                    tx.id,
                    tx.status.as_str()
                )));
            }
            self.audit
                .apply(
                    uow.as_mut(),
                    ctx.actor.user,
                    AuditAction::Update,
                    &mut tx,
                    |t, now| t.reject(reason, now).map_err(CoreError::from),
                )
                .await?;
            uow.commit().await?;

            warn!(transaction = %tx.id, reason, "Transaction rejected");
            Ok(tx)
        })
        .await
    }

    /// Mark a transaction as suspicious. Staff and admins only.
    #[instrument(skip(self, ctx), fields(actor = %ctx.actor))]
    pub async fn flag_transaction(
        &self,
        ctx: &OperationContext,
        id: &TransactionId,
    ) -> Result<Transaction> {
        self.run(ctx, "flag_transaction", async {
            ctx.require_role(&[Role::Staff, Role::Admin], "flag transactions")?;

            let mut uow = self.store.begin().await?;
            let mut tx = Self::live_transaction(uow.as_mut(), id).await?;
            if tx.is_flagged {
                return Ok(tx);
            }
            self.audit
                .apply(
                    uow.as_mut(),
                    ctx.actor.user,
                    AuditAction::Update,
                    &mut tx,
                    |t, now| {
                        t.flag(now);
                        Ok(())
                    },
                )
                .await?;
            uow.commit().await?;

            warn!(transaction = %id, "Transaction flagged");
            Ok(tx)
        })
        .await
    }

    /// Soft-delete a transaction. Admins only; balances are untouched.
    #[instrument(skip(self, ctx), fields(actor = %ctx.actor))]
    pub async fn delete_transaction(&self, ctx: &OperationContext, id: &TransactionId) -> Result<()> {
        self.run(ctx, "delete_transaction", async {
            ctx.require_role(&[Role::Admin], "delete transactions")?;

            let mut uow = self.store.begin().await?;
            let mut tx = Self::live_transaction(uow.as_mut(), id).await?;
            let by = ctx.actor.user;
            self.audit
                .apply(uow.as_mut(), by, AuditAction::Delete, &mut tx, |t, now| {
                    t.soft_delete(by, now);
                    Ok(())
                })
                .await?;
            uow.commit().await?;

            info!(transaction = %id, "Transaction deleted");
            Ok(())
        })
        .await
    }

    // ----------------------------------------------------------------------
    // Reads
    // ----------------------------------------------------------------------

    pub async fn account(&self, ctx: &OperationContext, number: &AccountNumber) -> Result<Account> {
        self.run(ctx, "account", async {
            let mut uow = self.store.begin().await?;
            let account = Self::live_account(uow.as_mut(), number).await?;
            ctx.require_owner(&account)?;
            Ok(account)
        })
        .await
    }

    pub async fn accounts_of(&self, ctx: &OperationContext, owner: &UserId) -> Result<Vec<Account>> {
        self.run(ctx, "accounts_of", async {
            if !ctx.actor.may_act_for(owner) {
                return Err(CoreError::Unauthorized(
                    "customers may only list their own accounts".to_string(),
                ));
            }
            let mut uow = self.store.begin().await?;
            let accounts = uow.accounts_by_owner(owner).await?;
            Ok(accounts.into_iter().filter(|a| !a.is_deleted).collect())
        })
        .await
    }

    pub async fn transaction(&self, ctx: &OperationContext, id: &TransactionId) -> Result<Transaction> {
        self.run(ctx, "transaction", async {
            let mut uow = self.store.begin().await?;
            let tx = Self::live_transaction(uow.as_mut(), id).await?;
            self.require_party(ctx, uow.as_mut(), &tx).await?;
            Ok(tx)
        })
        .await
    }

    pub async fn transaction_by_reference(
        &self,
        ctx: &OperationContext,
        reference: &PaymentReference,
    ) -> Result<Transaction> {
        self.run(ctx, "transaction_by_reference", async {
            let mut uow = self.store.begin().await?;
            let tx = uow
                .transactions_by_reference(reference)
                .await?
                .into_iter()
                .find(|t| !t.is_deleted)
                .ok_or_else(|| CoreError::not_found("Transaction", reference))?;
            self.require_party(ctx, uow.as_mut(), &tx).await?;
            Ok(tx)
        })
        .await
    }

    /// Status of the deposit behind `reference`, for the reconciliation
    /// coordinator.
    pub async fn reconciliation_status(
        &self,
        reference: &PaymentReference,
    ) -> Result<(Transaction, ReconciliationStatus)> {
        let mut uow = self.store.begin().await?;
        let tx = Self::deposit_by_reference(uow.as_mut(), reference).await?;
        let status = tx.status;
        Ok((tx, status))
    }

    async fn require_party(
        &self,
        ctx: &OperationContext,
        uow: &mut dyn UnitOfWork,
        tx: &Transaction,
    ) -> Result<()> {
        if ctx.actor.is_privileged() {
            return Ok(());
        }
        for number in [&tx.sender_account_number, &tx.recipient_account_number]
            .into_iter()
            .flatten()
        {
            if let Some(account) = uow.account_by_number(number).await? {
                if account.owner == ctx.actor.user {
                    return Ok(());
                }
            }
        }
        Err(CoreError::Unauthorized(
            "transaction belongs to another customer".to_string(),
        ))
    }

    async fn authorize_filter(
        &self,
        ctx: &OperationContext,
        uow: &mut dyn UnitOfWork,
        filter: &TransactionFilter,
    ) -> Result<()> {
        if ctx.actor.is_privileged() {
            return Ok(());
        }
        let Some(number) = &filter.account else {
            return Err(CoreError::Unauthorized(
                "customers must query a single own account".to_string(),
            ));
        };
        let account = Self::live_account(uow, number).await?;
        ctx.require_owner(&account)
    }

    pub async fn transactions(
        &self,
        ctx: &OperationContext,
        filter: &TransactionFilter,
    ) -> Result<Vec<Transaction>> {
        self.run(ctx, "transactions", async {
            let mut uow = self.store.begin().await?;
            self.authorize_filter(ctx, uow.as_mut(), filter).await?;
            uow.query_transactions(filter).await
        })
        .await
    }

    pub async fn count_transactions(
        &self,
        ctx: &OperationContext,
        filter: &TransactionFilter,
    ) -> Result<u64> {
        self.run(ctx, "count_transactions", async {
            let mut uow = self.store.begin().await?;
            self.authorize_filter(ctx, uow.as_mut(), filter).await?;
            uow.count_transactions(filter).await
        })
        .await
    }

    /// Count transactions in the current day, week, month or year.
    pub async fn count_in_period(
        &self,
        ctx: &OperationContext,
        account: Option<AccountNumber>,
        period: Period,
    ) -> Result<u64> {
        let filter = TransactionFilter {
            account,
            ..TransactionFilter::default()
        }
        .within(period, self.clock.now(), self.config.business_offset());
        self.count_transactions(ctx, &filter).await
    }

    /// Audit history of one entity. Staff and admins only.
    pub async fn audit_history(
        &self,
        ctx: &OperationContext,
        kind: EntityKind,
        entity_id: uuid::Uuid,
    ) -> Result<Vec<AuditLog>> {
        self.run(ctx, "audit_history", async {
            ctx.require_role(&[Role::Staff, Role::Admin], "read the audit trail")?;
            let mut uow = self.store.begin().await?;
            uow.audit_for(kind, entity_id).await
        })
        .await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::directory::StaticDirectory;
    use crate::store::MemoryStore;
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;
    use vaultline_common::ManualClock;

    pub(crate) struct Harness {
        pub store: MemoryStore,
        pub directory: Arc<StaticDirectory>,
        pub ledger: Arc<TransactionLedger>,
    }

    pub(crate) fn create_test_ledger() -> Harness {
        let store = MemoryStore::new();
        let directory = Arc::new(StaticDirectory::new());
        let clock = Arc::new(ManualClock::stepping(
            Utc::now(),
            Duration::milliseconds(1),
        ));
        let ledger = Arc::new(TransactionLedger::new(
            Arc::new(store.clone()),
            directory.clone(),
            clock,
            LedgerConfig::default(),
        ));
        Harness {
            store,
            directory,
            ledger,
        }
    }

    pub(crate) async fn open_funded_account(h: &Harness, serial: i64, balance: Decimal) -> (UserId, Account) {
        let owner = UserId::new();
        h.directory.register(owner, serial);
        let account = h
            .ledger
            .open_account(
                &OperationContext::new(Actor::customer(owner)),
                OpenAccountCommand {
                    owner,
                    account_type: AccountType::Savings,
                    branch_code: None,
                },
            )
            .await
            .unwrap();
        if balance > Decimal::ZERO {
            let reference = PaymentReference::generate();
            h.ledger
                .create_deposit(
                    &OperationContext::new(Actor::customer(owner)),
                    deposit_cmd(Some(account.account_number.clone()), balance, reference.clone()),
                )
                .await
                .unwrap();
            h.ledger
                .confirm_transaction(&OperationContext::system(), &reference, balance)
                .await
                .unwrap();
        }
        let account = h.store.account(&account.account_number).await.unwrap();
        (owner, account)
    }

    pub(crate) fn deposit_cmd(
        account_number: Option<AccountNumber>,
        amount: Decimal,
        reference: PaymentReference,
    ) -> DepositCommand {
        DepositCommand {
            account_number,
            amount,
            currency: Currency::ngn(),
            reference,
            channel: PaymentChannel::Card,
            checkout_url: None,
        }
    }

    fn withdrawal_cmd(account_number: &AccountNumber, amount: Decimal) -> WithdrawalCommand {
        WithdrawalCommand {
            account_number: account_number.clone(),
            amount,
            currency: Currency::ngn(),
            notes: None,
        }
    }

    #[tokio::test]
    async fn test_ledger_numbers_for_repeat_account_type() {
        let h = create_test_ledger();
        let owner = UserId::new();
        h.directory.register(owner, 123);
        let ctx = OperationContext::new(Actor::customer(owner));
        let cmd = OpenAccountCommand {
            owner,
            account_type: AccountType::Savings,
            branch_code: Some("001".to_string()),
        };

        let first = h.ledger.open_account(&ctx, cmd.clone()).await.unwrap();
        let second = h.ledger.open_account(&ctx, cmd).await.unwrap();

        assert_eq!(first.ledger_number.as_str(), "001000123100");
        assert_eq!(second.ledger_number.as_str(), "001000123101");
        assert_ne!(first.account_number, second.account_number);
        assert!(h.store.audit_entries().await.is_empty());
    }

    #[tokio::test]
    async fn test_open_account_requires_known_positive_customer() {
        let h = create_test_ledger();
        let owner = UserId::new();
        let ctx = OperationContext::new(Actor::customer(owner));
        let cmd = OpenAccountCommand {
            owner,
            account_type: AccountType::Current,
            branch_code: None,
        };

        let err = h.ledger.open_account(&ctx, cmd.clone()).await.unwrap_err();
        assert!(matches!(err, CoreError::NotFound { .. }));

        h.directory.register(owner, -4);
        let err = h.ledger.open_account(&ctx, cmd).await.unwrap_err();
        assert!(matches!(err, CoreError::ValidationFailed { .. }));
        assert!(h.store.accounts().await.is_empty());
    }

    #[tokio::test]
    async fn test_deposit_then_confirm_credits_exactly_once() {
        let h = create_test_ledger();
        let (owner, account) = open_funded_account(&h, 123, Decimal::ZERO).await;
        let reference = PaymentReference::parse("REF-B-1").unwrap();

        let tx = h
            .ledger
            .create_deposit(
                &OperationContext::new(Actor::customer(owner)),
                deposit_cmd(None, dec!(5000.00), reference.clone()),
            )
            .await
            .unwrap();
        assert!(!tx.is_reconciled);
        let before = h.store.account(&account.account_number).await.unwrap();
        assert_eq!(before.balance, Decimal::ZERO);

        let confirmed = h
            .ledger
            .confirm_transaction(&OperationContext::system(), &reference, dec!(5000.00))
            .await
            .unwrap();
        assert!(confirmed.is_reconciled);
        assert!(!confirmed.is_flagged);

        let err = h
            .ledger
            .confirm_transaction(&OperationContext::system(), &reference, dec!(5000.00))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Conflict(_)));

        let after = h.store.account(&account.account_number).await.unwrap();
        assert_eq!(after.balance, dec!(5000.00));

        let audit = h.store.audit_entries().await;
        let count = |kind| audit.iter().filter(|e| e.entity_kind == kind).count();
        assert_eq!(count(EntityKind::Account), 1);
        assert_eq!(count(EntityKind::Transaction), 1);
        assert!(h.store.payment(&reference).await.unwrap().is_confirmed);
    }

    #[tokio::test]
    async fn test_confirm_with_different_amount_flags() {
        let h = create_test_ledger();
        let (owner, account) = open_funded_account(&h, 7, Decimal::ZERO).await;
        let reference = PaymentReference::generate();
        h.ledger
            .create_deposit(
                &OperationContext::new(Actor::customer(owner)),
                deposit_cmd(None, dec!(100), reference.clone()),
            )
            .await
            .unwrap();

        let tx = h
            .ledger
            .confirm_transaction(&OperationContext::system(), &reference, dec!(90))
            .await
            .unwrap();
        assert!(tx.is_flagged);
        let after = h.store.account(&account.account_number).await.unwrap();
        assert_eq!(after.balance, dec!(90));
    }

    #[tokio::test]
    async fn test_withdrawal_with_unsupported_currency_touches_nothing() {
        let h = create_test_ledger();
        let (owner, account) = open_funded_account(&h, 11, dec!(1000)).await;
        let audit_before = h.store.audit_entries().await.len();

        let mut cmd = withdrawal_cmd(&account.account_number, dec!(10));
        cmd.currency = Currency::usd();
        let err = h
            .ledger
            .create_withdrawal(&OperationContext::new(Actor::customer(owner)), cmd)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CoreError::ValidationFailed { field: Some(ref f), .. } if f == "currency"
        ));
        assert_eq!(h.store.audit_entries().await.len(), audit_before);
        let after = h.store.account(&account.account_number).await.unwrap();
        assert_eq!(after.balance, dec!(1000));
    }

    #[tokio::test]
    async fn test_withdrawal_audits_before_debit() {
        let h = create_test_ledger();
        let (owner, account) = open_funded_account(&h, 12, dec!(1000)).await;

        let tx = h
            .ledger
            .create_withdrawal(
                &OperationContext::new(Actor::customer(owner)),
                withdrawal_cmd(&account.account_number, dec!(250)),
            )
            .await
            .unwrap();
        assert!(tx.is_reconciled);

        let after = h.store.account(&account.account_number).await.unwrap();
        assert_eq!(after.balance, dec!(750));

        let audit = h.store.audit_entries().await;
        let last = audit
            .iter()
            .filter(|e| e.entity_kind == EntityKind::Account)
            .last()
            .unwrap();
        assert_eq!(last.payload["balance"], serde_json::json!("1000"));
        assert!(last.created_at < after.updated_at);
    }

    #[tokio::test]
    async fn test_withdrawal_audit_failure_leaves_balance() {
        let h = create_test_ledger();
        let (owner, account) = open_funded_account(&h, 13, dec!(1000)).await;
        let audit_before = h.store.audit_entries().await.len();
        h.store.fail_audit_writes(true);

        let err = h
            .ledger
            .create_withdrawal(
                &OperationContext::new(Actor::customer(owner)),
                withdrawal_cmd(&account.account_number, dec!(250)),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::AuditLogFailed(_)));
        let after = h.store.account(&account.account_number).await.unwrap();
        assert_eq!(after.balance, dec!(1000));
        assert_eq!(h.store.audit_entries().await.len(), audit_before);
        assert_eq!(h.store.transactions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_withdrawal_balance_write_failure_rolls_back_audit() {
        let h = create_test_ledger();
        let (owner, account) = open_funded_account(&h, 15, dec!(1000)).await;
        let audit_before = h.store.audit_entries().await.len();
        h.store.fail_account_writes(true);

        let err = h
            .ledger
            .create_withdrawal(
                &OperationContext::new(Actor::customer(owner)),
                withdrawal_cmd(&account.account_number, dec!(250)),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, CoreError::Internal(_)));
        h.store.fail_account_writes(false);
        let after = h.store.account(&account.account_number).await.unwrap();
        assert_eq!(after.balance, dec!(1000));
        assert_eq!(h.store.audit_entries().await.len(), audit_before);
        assert_eq!(h.store.transactions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_confirm_audit_failure_credits_nothing() {
        let h = create_test_ledger();
        let (owner, account) = open_funded_account(&h, 16, Decimal::ZERO).await;
        let reference = PaymentReference::generate();
        let tx = h
            .ledger
            .create_deposit(
                &OperationContext::new(Actor::customer(owner)),
                deposit_cmd(None, dec!(400), reference.clone()),
            )
            .await
            .unwrap();
        let audit_before = h.store.audit_entries().await.len();
        h.store.fail_audit_writes(true);

        let err = h
            .ledger
            .confirm_transaction(&OperationContext::system(), &reference, dec!(400))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::AuditLogFailed(_)));

        let after = h.store.account(&account.account_number).await.unwrap();
        assert_eq!(after.balance, Decimal::ZERO);
        assert!(!h.store.payment(&reference).await.unwrap().is_confirmed);
        let stored = h.store.transaction(&tx.id).await.unwrap();
        assert_eq!(stored.status, ReconciliationStatus::Initiated);
        assert!(!stored.is_reconciled);
        assert_eq!(h.store.audit_entries().await.len(), audit_before);

        // Once the audit store is back the same confirmation goes through.
        h.store.fail_audit_writes(false);
        h.ledger
            .confirm_transaction(&OperationContext::system(), &reference, dec!(400))
            .await
            .unwrap();
        let after = h.store.account(&account.account_number).await.unwrap();
        assert_eq!(after.balance, dec!(400));
    }

    #[tokio::test]
    async fn test_suspended_account_cannot_transact() {
        let h = create_test_ledger();
        let (owner, account) = open_funded_account(&h, 17, dec!(500)).await;
        let customer = OperationContext::new(Actor::customer(owner));

        let err = h
            .ledger
            .set_account_status(&customer, &account.account_number, AccountStatus::Suspended)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Unauthorized(_)));

        let audit_before = h.store.audit_entries().await.len();
        let staff = OperationContext::new(Actor::staff(UserId::new()));
        let suspended = h
            .ledger
            .set_account_status(&staff, &account.account_number, AccountStatus::Suspended)
            .await
            .unwrap();
        assert_eq!(suspended.status, AccountStatus::Suspended);

        let audit = h.store.audit_entries().await;
        assert_eq!(audit.len(), audit_before + 1);
        let entry = audit.last().unwrap();
        assert_eq!(entry.entity_kind, EntityKind::Account);
        assert_eq!(entry.entity_id, *account.id.as_uuid());
        assert_eq!(entry.action, AuditAction::Update);

        let err = h
            .ledger
            .create_withdrawal(&customer, withdrawal_cmd(&account.account_number, dec!(10)))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ValidationFailed { .. }));
        let after = h.store.account(&account.account_number).await.unwrap();
        assert_eq!(after.balance, dec!(500));
    }

    #[tokio::test]
    async fn test_withdrawal_rejects_overdraft_and_daily_limit() {
        let h = create_test_ledger();
        let (owner, account) = open_funded_account(&h, 14, dec!(100)).await;
        let ctx = OperationContext::new(Actor::customer(owner));

        let err = h
            .ledger
            .create_withdrawal(&ctx, withdrawal_cmd(&account.account_number, dec!(100.01)))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InsufficientFunds { .. }));

        let staff = OperationContext::new(Actor::staff(UserId::new()));
        h.ledger
            .update_account_limits(&staff, &account.account_number, Some(dec!(60)), None)
            .await
            .unwrap();
        h.ledger
            .create_withdrawal(&ctx, withdrawal_cmd(&account.account_number, dec!(50)))
            .await
            .unwrap();
        let err = h
            .ledger
            .create_withdrawal(&ctx, withdrawal_cmd(&account.account_number, dec!(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ValidationFailed { .. }));
        let after = h.store.account(&account.account_number).await.unwrap();
        assert_eq!(after.balance, dec!(50));
    }

    #[tokio::test]
    async fn test_customer_cannot_touch_foreign_account() {
        let h = create_test_ledger();
        let (_, account) = open_funded_account(&h, 15, dec!(100)).await;
        let stranger = OperationContext::new(Actor::customer(UserId::new()));

        let err = h
            .ledger
            .create_withdrawal(&stranger, withdrawal_cmd(&account.account_number, dec!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_transfer_conserves_total() {
        let h = create_test_ledger();
        let (alice, a) = open_funded_account(&h, 21, dec!(1000)).await;
        let (_, b) = open_funded_account(&h, 22, dec!(300)).await;

        let receipt = h
            .ledger
            .transfer(
                &OperationContext::new(Actor::customer(alice)),
                TransferCommand {
                    sender: a.account_number.clone(),
                    recipient: b.account_number.clone(),
                    amount: dec!(400),
                    currency: Currency::ngn(),
                    notes: Some("rent".to_string()),
                },
            )
            .await
            .unwrap();
        assert_eq!(receipt.debit.payment_reference, receipt.credit.payment_reference);

        let a_after = h.store.account(&a.account_number).await.unwrap();
        let b_after = h.store.account(&b.account_number).await.unwrap();
        assert_eq!(a_after.balance, dec!(600));
        assert_eq!(b_after.balance, dec!(700));
        assert_eq!(a_after.balance + b_after.balance, dec!(1300));
    }

    #[tokio::test]
    async fn test_flag_and_delete_require_roles() {
        let h = create_test_ledger();
        let (owner, account) = open_funded_account(&h, 31, dec!(100)).await;
        let tx = h
            .ledger
            .create_withdrawal(
                &OperationContext::new(Actor::customer(owner)),
                withdrawal_cmd(&account.account_number, dec!(10)),
            )
            .await
            .unwrap();

        let customer = OperationContext::new(Actor::customer(owner));
        assert!(matches!(
            h.ledger.flag_transaction(&customer, &tx.id).await,
            Err(CoreError::Unauthorized(_))
        ));

        let staff = OperationContext::new(Actor::staff(UserId::new()));
        let flagged = h.ledger.flag_transaction(&staff, &tx.id).await.unwrap();
        assert!(flagged.is_flagged);
        assert!(matches!(
            h.ledger.delete_transaction(&staff, &tx.id).await,
            Err(CoreError::Unauthorized(_))
        ));

        let admin = OperationContext::new(Actor::admin(UserId::new()));
        h.ledger.delete_transaction(&admin, &tx.id).await.unwrap();
        assert!(matches!(
            h.ledger.transaction(&admin, &tx.id).await,
            Err(CoreError::NotFound { .. })
        ));

        let history = h
            .ledger
            .audit_history(&admin, EntityKind::Transaction, *tx.id.as_uuid())
            .await
            .unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].action, AuditAction::Delete);

        // Balance is not restored by deleting the record.
        let after = h.store.account(&account.account_number).await.unwrap();
        assert_eq!(after.balance, dec!(90));
    }

    #[tokio::test]
    async fn test_delete_account_requires_zero_balance() {
        let h = create_test_ledger();
        let (_, account) = open_funded_account(&h, 41, dec!(5)).await;
        let admin = OperationContext::new(Actor::admin(UserId::new()));

        let err = h
            .ledger
            .delete_account(&admin, &account.account_number)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::ValidationFailed { .. }));

        let (_, empty) = open_funded_account(&h, 42, Decimal::ZERO).await;
        h.ledger
            .delete_account(&admin, &empty.account_number)
            .await
            .unwrap();
        assert!(matches!(
            h.ledger.account(&admin, &empty.account_number).await,
            Err(CoreError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_cancellation_before_commit_discards_everything() {
        let h = create_test_ledger();
        let (owner, account) = open_funded_account(&h, 51, dec!(1000)).await;
        let audit_before = h.store.audit_entries().await.len();
        h.store.delay_commits(std::time::Duration::from_millis(200));

        let token = CancellationToken::new();
        let ctx = OperationContext::with_cancel(Actor::customer(owner), token.clone());
        let ledger = h.ledger.clone();
        let number = account.account_number.clone();
        let task = tokio::spawn(async move {
            ledger
                .create_withdrawal(&ctx, withdrawal_cmd(&number, dec!(300)))
                .await
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        token.cancel();
        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err, CoreError::Cancelled);

        h.store.delay_commits(std::time::Duration::ZERO);
        let after = h.store.account(&account.account_number).await.unwrap();
        assert_eq!(after.balance, dec!(1000));
        assert_eq!(h.store.audit_entries().await.len(), audit_before);
    }

    #[tokio::test]
    async fn test_concurrent_withdrawals_never_overdraw() {
        let h = create_test_ledger();
        let (owner, account) = open_funded_account(&h, 61, dec!(1000)).await;

        let mut handles = Vec::new();
        for _ in 0..20 {
            let ledger = h.ledger.clone();
            let number = account.account_number.clone();
            handles.push(tokio::spawn(async move {
                ledger
                    .create_withdrawal(
                        &OperationContext::new(Actor::customer(owner)),
                        withdrawal_cmd(&number, dec!(75)),
                    )
                    .await
            }));
        }

        let mut succeeded = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                succeeded += 1;
            }
        }

        let after = h.store.account(&account.account_number).await.unwrap();
        assert_eq!(succeeded, 13);
        assert_eq!(after.balance, dec!(1000) - dec!(75) * Decimal::from(succeeded));
        assert!(after.balance >= Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_reject_leaves_balance_and_blocks_confirm() {
        let h = create_test_ledger();
        let (owner, account) = open_funded_account(&h, 71, Decimal::ZERO).await;
        let reference = PaymentReference::generate();
        h.ledger
            .create_deposit(
                &OperationContext::new(Actor::customer(owner)),
                deposit_cmd(None, dec!(20), reference.clone()),
            )
            .await
            .unwrap();

        let tx = h
            .ledger
            .reject_transaction(&OperationContext::system(), &reference, "declined")
            .await
            .unwrap();
        assert_eq!(tx.status, ReconciliationStatus::Rejected);
        assert!(matches!(
            h.ledger
                .confirm_transaction(&OperationContext::system(), &reference, dec!(20))
                .await,
            Err(CoreError::Conflict(_))
        ));
        let after = h.store.account(&account.account_number).await.unwrap();
        assert_eq!(after.balance, Decimal::ZERO);
    }

    #[tokio::test]
    async fn test_period_counts() {
        let h = create_test_ledger();
        let (owner, account) = open_funded_account(&h, 81, dec!(100)).await;
        let ctx = OperationContext::new(Actor::customer(owner));
        h.ledger
            .create_withdrawal(&ctx, withdrawal_cmd(&account.account_number, dec!(1)))
            .await
            .unwrap();

        let today = h
            .ledger
            .count_in_period(&ctx, Some(account.account_number.clone()), Period::Day)
            .await
            .unwrap();
        assert_eq!(today, 2);

        let err = h
            .ledger
            .count_in_period(&ctx, None, Period::Year)
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Unauthorized(_)));
    }
}
