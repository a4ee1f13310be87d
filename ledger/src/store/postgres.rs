//! PostgreSQL store.
//!
//! Each unit of work is one database transaction. Accounts are read with
//! `FOR UPDATE` so a balance has a single writer until commit.

use async_trait::async_trait;
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::{Executor, Postgres, QueryBuilder, Row};
use tracing::info;
use uuid::Uuid;

use vaultline_common::{
    AccountId, AccountNumber, AuditId, CoreError, Currency, LedgerNumber, Money, Payment,
    PaymentId, PaymentReference, Result, Timestamp, Transaction, TransactionId, TransactionType,
    UserId,
};

use super::{LedgerStore, UnitOfWork};
use crate::account::Account;
use crate::audit::{AuditLog, EntityKind};
use crate::query::TransactionFilter;

/// Schema for the ledger tables.
pub const MIGRATION: &str = r#"
CREATE TABLE IF NOT EXISTS accounts (
    id UUID PRIMARY KEY,
    ledger_number TEXT NOT NULL UNIQUE,
    account_number TEXT NOT NULL UNIQUE,
    account_type TEXT NOT NULL,
    currency TEXT NOT NULL,
    branch_code TEXT NOT NULL,
    balance NUMERIC(20, 4) NOT NULL CHECK (balance >= 0),
    maximum_daily_withdrawal_limit NUMERIC(20, 4) NOT NULL,
    maximum_daily_deposit_limit NUMERIC(20, 4) NOT NULL,
    status TEXT NOT NULL,
    owner UUID NOT NULL,
    is_deleted BOOLEAN NOT NULL DEFAULT FALSE,
    deleted_by UUID,
    deleted_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS accounts_owner_idx ON accounts (owner);

CREATE TABLE IF NOT EXISTS transactions (
    id UUID PRIMARY KEY,
    amount NUMERIC(20, 4) NOT NULL CHECK (amount > 0),
    currency TEXT NOT NULL,
    transaction_type TEXT NOT NULL,
    sender_account_number TEXT,
    recipient_account_number TEXT,
    payment_reference TEXT NOT NULL,
    status TEXT NOT NULL,
    is_reconciled BOOLEAN NOT NULL,
    is_flagged BOOLEAN NOT NULL,
    notes TEXT,
    is_deleted BOOLEAN NOT NULL DEFAULT FALSE,
    deleted_by UUID,
    deleted_at TIMESTAMPTZ,
    reconciled_at TIMESTAMPTZ,
    reconciled_by UUID,
    created_at TIMESTAMPTZ NOT NULL,
    updated_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS transactions_reference_idx ON transactions (payment_reference);
CREATE INDEX IF NOT EXISTS transactions_sender_idx ON transactions (sender_account_number, created_at);
CREATE INDEX IF NOT EXISTS transactions_recipient_idx ON transactions (recipient_account_number, created_at);

CREATE TABLE IF NOT EXISTS payments (
    id UUID PRIMARY KEY,
    payment_reference TEXT NOT NULL UNIQUE,
    amount NUMERIC(20, 4) NOT NULL,
    currency TEXT NOT NULL,
    channel TEXT NOT NULL,
    checkout_url TEXT,
    is_confirmed BOOLEAN NOT NULL,
    confirmed_at TIMESTAMPTZ,
    created_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS audit_logs (
    id UUID PRIMARY KEY,
    entity_kind TEXT NOT NULL,
    entity_id UUID NOT NULL,
    action TEXT NOT NULL,
    payload JSONB NOT NULL,
    actor UUID NOT NULL,
    created_at TIMESTAMPTZ NOT NULL
);
CREATE INDEX IF NOT EXISTS audit_logs_entity_idx ON audit_logs (entity_kind, entity_id, created_at);
CREATE OR REPLACE RULE audit_logs_no_update AS ON UPDATE TO audit_logs DO INSTEAD NOTHING;
CREATE OR REPLACE RULE audit_logs_no_delete AS ON DELETE TO audit_logs DO INSTEAD NOTHING;
"#;

const ACCOUNT_COLUMNS: &str = "id, ledger_number, account_number, account_type, currency, \
    branch_code, balance, maximum_daily_withdrawal_limit, maximum_daily_deposit_limit, status, \
    owner, is_deleted, deleted_by, deleted_at, created_at, updated_at";

const TRANSACTION_COLUMNS: &str = "id, amount, currency, transaction_type, \
    sender_account_number, recipient_account_number, payment_reference, status, is_reconciled, \
    is_flagged, notes, is_deleted, deleted_by, deleted_at, reconciled_at, reconciled_by, \
    created_at, updated_at";

const PAYMENT_COLUMNS: &str = "id, payment_reference, amount, currency, channel, checkout_url, \
    is_confirmed, confirmed_at, created_at";

/// Map a driver error. Unique violations become `Conflict`.
fn db_err(e: sqlx::Error) -> CoreError {
    if let Some(db) = e.as_database_error() {
        if db.is_unique_violation() {
            return CoreError::Conflict(db.message().to_string());
        }
    }
    CoreError::Internal(format!("database: {e}"))
}

fn col<'r, T>(row: &'r PgRow, name: &str) -> Result<T>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(name).map_err(db_err)
}

fn account_from_row(row: &PgRow) -> Result<Account> {
    let status: String = col(row, "status")?;
    let account_type: String = col(row, "account_type")?;
    let currency: String = col(row, "currency")?;
    let account_number: String = col(row, "account_number")?;
    let ledger_number: String = col(row, "ledger_number")?;
    Ok(Account {
        id: AccountId::from_uuid(col(row, "id")?),
        ledger_number: LedgerNumber::new(ledger_number),
        account_number: AccountNumber::parse(account_number)?,
        account_type: account_type.parse()?,
        currency: Currency::new(currency),
        branch_code: col(row, "branch_code")?,
        balance: col(row, "balance")?,
        maximum_daily_withdrawal_limit: col(row, "maximum_daily_withdrawal_limit")?,
        maximum_daily_deposit_limit: col(row, "maximum_daily_deposit_limit")?,
        status: status.parse()?,
        owner: UserId::from_uuid(col(row, "owner")?),
        is_deleted: col(row, "is_deleted")?,
        deleted_by: col::<Option<Uuid>>(row, "deleted_by")?.map(UserId::from_uuid),
        deleted_at: col(row, "deleted_at")?,
        created_at: col(row, "created_at")?,
        updated_at: col(row, "updated_at")?,
    })
}

fn optional_account_number(value: Option<String>) -> Result<Option<AccountNumber>> {
    value.map(AccountNumber::parse).transpose()
}

fn transaction_from_row(row: &PgRow) -> Result<Transaction> {
    let currency: String = col(row, "currency")?;
    let kind: String = col(row, "transaction_type")?;
    let status: String = col(row, "status")?;
    let reference: String = col(row, "payment_reference")?;
    Ok(Transaction {
        id: TransactionId::from_uuid(col(row, "id")?),
        amount: Money::new(col(row, "amount")?, Currency::new(currency)),
        transaction_type: kind.parse()?,
        sender_account_number: optional_account_number(col(row, "sender_account_number")?)?,
        recipient_account_number: optional_account_number(col(row, "recipient_account_number")?)?,
        payment_reference: PaymentReference::parse(reference)?,
        status: status.parse()?,
        is_reconciled: col(row, "is_reconciled")?,
        is_flagged: col(row, "is_flagged")?,
        notes: col(row, "notes")?,
        is_deleted: col(row, "is_deleted")?,
        deleted_by: col::<Option<Uuid>>(row, "deleted_by")?.map(UserId::from_uuid),
        deleted_at: col(row, "deleted_at")?,
        reconciled_at: col(row, "reconciled_at")?,
        reconciled_by: col::<Option<Uuid>>(row, "reconciled_by")?.map(UserId::from_uuid),
        created_at: col(row, "created_at")?,
        updated_at: col(row, "updated_at")?,
    })
}

fn payment_from_row(row: &PgRow) -> Result<Payment> {
    let currency: String = col(row, "currency")?;
    let channel: String = col(row, "channel")?;
    let reference: String = col(row, "payment_reference")?;
    Ok(Payment {
        id: PaymentId::from_uuid(col(row, "id")?),
        payment_reference: PaymentReference::parse(reference)?,
        amount: Money::new(col(row, "amount")?, Currency::new(currency)),
        channel: channel.parse()?,
        checkout_url: col(row, "checkout_url")?,
        is_confirmed: col(row, "is_confirmed")?,
        confirmed_at: col(row, "confirmed_at")?,
        created_at: col(row, "created_at")?,
    })
}

fn audit_from_row(row: &PgRow) -> Result<AuditLog> {
    let kind: String = col(row, "entity_kind")?;
    let action: String = col(row, "action")?;
    Ok(AuditLog {
        id: AuditId::from_uuid(col(row, "id")?),
        entity_kind: kind.parse()?,
        entity_id: col(row, "entity_id")?,
        action: action.parse()?,
        payload: col(row, "payload")?,
        actor: UserId::from_uuid(col(row, "actor")?),
        created_at: col(row, "created_at")?,
    })
}

/// PostgreSQL-backed ledger store.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect and make sure the schema exists.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(db_err)?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<()> {
        self.pool.execute(MIGRATION).await.map_err(db_err)?;
        info!("Ledger schema ready");
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>> {
        let tx = self.pool.begin().await.map_err(db_err)?;
        Ok(Box::new(PgUnitOfWork { tx }))
    }
}

struct PgUnitOfWork {
    tx: sqlx::Transaction<'static, Postgres>,
}

impl PgUnitOfWork {
    async fn write_account(&mut self, sql: &str, account: &Account) -> Result<u64> {
        let result = sqlx::query(sql)
            .bind(account.id.as_uuid())
            .bind(account.ledger_number.as_str())
            .bind(account.account_number.as_str())
            .bind(account.account_type.as_str())
            .bind(account.currency.code())
            .bind(&account.branch_code)
            .bind(account.balance)
            .bind(account.maximum_daily_withdrawal_limit)
            .bind(account.maximum_daily_deposit_limit)
            .bind(account.status.as_str())
            .bind(account.owner.as_uuid())
            .bind(account.is_deleted)
            .bind(account.deleted_by.map(|u| *u.as_uuid()))
            .bind(account.deleted_at)
            .bind(account.created_at)
            .bind(account.updated_at)
            .execute(&mut *self.tx)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn write_transaction(&mut self, sql: &str, tx: &Transaction) -> Result<u64> {
        let result = sqlx::query(sql)
            .bind(tx.id.as_uuid())
            .bind(tx.amount.value)
            .bind(tx.amount.currency.code())
            .bind(tx.transaction_type.as_str())
            .bind(tx.sender_account_number.as_ref().map(|n| n.as_str()))
            .bind(tx.recipient_account_number.as_ref().map(|n| n.as_str()))
            .bind(tx.payment_reference.as_str())
            .bind(tx.status.as_str())
            .bind(tx.is_reconciled)
            .bind(tx.is_flagged)
            .bind(tx.notes.as_deref())
            .bind(tx.is_deleted)
            .bind(tx.deleted_by.map(|u| *u.as_uuid()))
            .bind(tx.deleted_at)
            .bind(tx.reconciled_at)
            .bind(tx.reconciled_by.map(|u| *u.as_uuid()))
            .bind(tx.created_at)
            .bind(tx.updated_at)
            .execute(&mut *self.tx)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }

    async fn write_payment(&mut self, sql: &str, payment: &Payment) -> Result<u64> {
        let result = sqlx::query(sql)
            .bind(payment.id.as_uuid())
            .bind(payment.payment_reference.as_str())
            .bind(payment.amount.value)
            .bind(payment.amount.currency.code())
            .bind(payment.channel.as_str())
            .bind(payment.checkout_url.as_deref())
            .bind(payment.is_confirmed)
            .bind(payment.confirmed_at)
            .bind(payment.created_at)
            .execute(&mut *self.tx)
            .await
            .map_err(db_err)?;
        Ok(result.rows_affected())
    }
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &TransactionFilter) {
    if !filter.include_deleted {
        qb.push(" AND NOT is_deleted");
    }
    if let Some(account) = &filter.account {
        qb.push(" AND (sender_account_number = ")
            .push_bind(account.as_str().to_string())
            .push(" OR recipient_account_number = ")
            .push_bind(account.as_str().to_string())
            .push(")");
    }
    if let Some(kind) = filter.transaction_type {
        qb.push(" AND transaction_type = ").push_bind(kind.as_str());
    }
    if let Some(min) = filter.min_amount {
        qb.push(" AND amount >= ").push_bind(min);
    }
    if let Some(max) = filter.max_amount {
        qb.push(" AND amount <= ").push_bind(max);
    }
    if let Some(from) = filter.from {
        qb.push(" AND created_at >= ").push_bind(from);
    }
    if let Some(to) = filter.to {
        qb.push(" AND created_at <= ").push_bind(to);
    }
    if let Some(flagged) = filter.flagged {
        qb.push(" AND is_flagged = ").push_bind(flagged);
    }
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn account_by_number(&mut self, number: &AccountNumber) -> Result<Option<Account>> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE account_number = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(number.as_str())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_err)?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn account_by_id(&mut self, id: &AccountId) -> Result<Option<Account>> {
        let sql = format!("SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_err)?;
        row.as_ref().map(account_from_row).transpose()
    }

    async fn accounts_by_owner(&mut self, owner: &UserId) -> Result<Vec<Account>> {
        let sql = format!(
            "SELECT {ACCOUNT_COLUMNS} FROM accounts WHERE owner = $1 ORDER BY created_at, id"
        );
        let rows = sqlx::query(&sql)
            .bind(owner.as_uuid())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(db_err)?;
        rows.iter().map(account_from_row).collect()
    }

    async fn ledger_number_exists(&mut self, number: &LedgerNumber) -> Result<bool> {
        let row = sqlx::query("SELECT EXISTS(SELECT 1 FROM accounts WHERE ledger_number = $1) AS found")
            .bind(number.as_str())
            .fetch_one(&mut *self.tx)
            .await
            .map_err(db_err)?;
        col(&row, "found")
    }

    async fn count_ledger_numbers_with_prefix(&mut self, prefix: &str) -> Result<u64> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total FROM accounts WHERE starts_with(ledger_number, $1)",
        )
        .bind(prefix)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_err)?;
        let total: i64 = col(&row, "total")?;
        Ok(total.max(0) as u64)
    }

    async fn account_number_exists(&mut self, number: &AccountNumber) -> Result<bool> {
        let row =
            sqlx::query("SELECT EXISTS(SELECT 1 FROM accounts WHERE account_number = $1) AS found")
                .bind(number.as_str())
                .fetch_one(&mut *self.tx)
                .await
                .map_err(db_err)?;
        col(&row, "found")
    }

    async fn insert_account(&mut self, account: &Account) -> Result<()> {
        let sql = format!(
            "INSERT INTO accounts ({ACCOUNT_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)"
        );
        self.write_account(&sql, account).await?;
        Ok(())
    }

    async fn update_account(&mut self, account: &Account) -> Result<()> {
        let sql = "UPDATE accounts SET ledger_number = $2, account_number = $3, \
             account_type = $4, currency = $5, branch_code = $6, balance = $7, \
             maximum_daily_withdrawal_limit = $8, maximum_daily_deposit_limit = $9, status = $10, \
             owner = $11, is_deleted = $12, deleted_by = $13, deleted_at = $14, created_at = $15, \
             updated_at = $16 WHERE id = $1";
        if self.write_account(sql, account).await? == 0 {
            return Err(CoreError::not_found("Account", &account.account_number));
        }
        Ok(())
    }

    async fn transaction_by_id(&mut self, id: &TransactionId) -> Result<Option<Transaction>> {
        let sql = format!("SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_err)?;
        row.as_ref().map(transaction_from_row).transpose()
    }

    async fn transactions_by_reference(
        &mut self,
        reference: &PaymentReference,
    ) -> Result<Vec<Transaction>> {
        let sql = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE payment_reference = $1 \
             ORDER BY created_at, id FOR UPDATE"
        );
        let rows = sqlx::query(&sql)
            .bind(reference.as_str())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(db_err)?;
        rows.iter().map(transaction_from_row).collect()
    }

    async fn insert_transaction(&mut self, tx: &Transaction) -> Result<()> {
        let sql = format!(
            "INSERT INTO transactions ({TRANSACTION_COLUMNS}) VALUES \
             ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)"
        );
        self.write_transaction(&sql, tx).await?;
        Ok(())
    }

    async fn update_transaction(&mut self, tx: &Transaction) -> Result<()> {
        let sql = "UPDATE transactions SET amount = $2, currency = $3, transaction_type = $4, \
             sender_account_number = $5, recipient_account_number = $6, payment_reference = $7, \
             status = $8, is_reconciled = $9, is_flagged = $10, notes = $11, is_deleted = $12, \
             deleted_by = $13, deleted_at = $14, reconciled_at = $15, reconciled_by = $16, \
             created_at = $17, updated_at = $18 WHERE id = $1";
        if self.write_transaction(sql, tx).await? == 0 {
            return Err(CoreError::not_found("Transaction", tx.id));
        }
        Ok(())
    }

    async fn booked_total_since(
        &mut self,
        account: &AccountNumber,
        kind: TransactionType,
        since: Timestamp,
    ) -> Result<Decimal> {
        let column = match kind {
            TransactionType::Credit => "recipient_account_number",
            TransactionType::Debit => "sender_account_number",
        };
        let sql = format!(
            "SELECT COALESCE(SUM(amount), 0) AS total FROM transactions \
             WHERE {column} = $1 AND transaction_type = $2 AND created_at >= $3 \
             AND NOT is_deleted AND status <> 'REJECTED'"
        );
        let row = sqlx::query(&sql)
            .bind(account.as_str())
            .bind(kind.as_str())
            .bind(since)
            .fetch_one(&mut *self.tx)
            .await
            .map_err(db_err)?;
        col(&row, "total")
    }

    async fn query_transactions(&mut self, filter: &TransactionFilter) -> Result<Vec<Transaction>> {
        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {TRANSACTION_COLUMNS} FROM transactions WHERE TRUE"
        ));
        push_filter(&mut qb, filter);
        qb.push(" ORDER BY created_at, id");
        let rows = qb
            .build()
            .fetch_all(&mut *self.tx)
            .await
            .map_err(db_err)?;
        rows.iter().map(transaction_from_row).collect()
    }

    async fn count_transactions(&mut self, filter: &TransactionFilter) -> Result<u64> {
        let mut qb =
            QueryBuilder::<Postgres>::new("SELECT COUNT(*) AS total FROM transactions WHERE TRUE");
        push_filter(&mut qb, filter);
        let row = qb
            .build()
            .fetch_one(&mut *self.tx)
            .await
            .map_err(db_err)?;
        let total: i64 = col(&row, "total")?;
        Ok(total.max(0) as u64)
    }

    async fn payment_by_reference(
        &mut self,
        reference: &PaymentReference,
    ) -> Result<Option<Payment>> {
        let sql = format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE payment_reference = $1 FOR UPDATE"
        );
        let row = sqlx::query(&sql)
            .bind(reference.as_str())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(db_err)?;
        row.as_ref().map(payment_from_row).transpose()
    }

    async fn insert_payment(&mut self, payment: &Payment) -> Result<()> {
        let sql = format!(
            "INSERT INTO payments ({PAYMENT_COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
        );
        self.write_payment(&sql, payment).await?;
        Ok(())
    }

    async fn update_payment(&mut self, payment: &Payment) -> Result<()> {
        let sql = "UPDATE payments SET payment_reference = $2, amount = $3, currency = $4, \
             channel = $5, checkout_url = $6, is_confirmed = $7, confirmed_at = $8, \
             created_at = $9 WHERE id = $1";
        if self.write_payment(sql, payment).await? == 0 {
            return Err(CoreError::not_found("Payment", &payment.payment_reference));
        }
        Ok(())
    }

    async fn append_audit(&mut self, entries: &[AuditLog]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut qb = QueryBuilder::<Postgres>::new(
            "INSERT INTO audit_logs (id, entity_kind, entity_id, action, payload, actor, created_at) ",
        );
        qb.push_values(entries, |mut b, entry| {
            b.push_bind(*entry.id.as_uuid())
                .push_bind(entry.entity_kind.as_str())
                .push_bind(entry.entity_id)
                .push_bind(entry.action.as_str())
                .push_bind(entry.payload.clone())
                .push_bind(*entry.actor.as_uuid())
                .push_bind(entry.created_at);
        });
        qb.build()
            .execute(&mut *self.tx)
            .await
            .map_err(|e| CoreError::AuditLogFailed(format!("database: {e}")))?;
        Ok(())
    }

    async fn audit_for(&mut self, kind: EntityKind, entity_id: Uuid) -> Result<Vec<AuditLog>> {
        let rows = sqlx::query(
            "SELECT id, entity_kind, entity_id, action, payload, actor, created_at FROM audit_logs \
             WHERE entity_kind = $1 AND entity_id = $2 ORDER BY created_at, id",
        )
        .bind(kind.as_str())
        .bind(entity_id)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(db_err)?;
        rows.iter().map(audit_from_row).collect()
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(db_err)
    }
}
