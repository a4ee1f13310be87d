//! Account definitions for ledger.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use vaultline_common::{
    AccountId, AccountNumber, CoreError, Currency, LedgerNumber, Money, Timestamp, UserId,
};

/// Product type of an account. Each carries the two-digit code that goes
/// into ledger numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountType {
    Savings,
    Current,
    Domiciliary,
    FixedDeposit,
}

impl AccountType {
    pub fn code(&self) -> &'static str {
        match self {
            AccountType::Savings => "10",
            AccountType::Current => "20",
            AccountType::Domiciliary => "30",
            AccountType::FixedDeposit => "40",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Savings => "savings",
            AccountType::Current => "current",
            AccountType::Domiciliary => "domiciliary",
            AccountType::FixedDeposit => "fixed_deposit",
        }
    }
}

impl FromStr for AccountType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "savings" => Ok(Self::Savings),
            "current" => Ok(Self::Current),
            "domiciliary" => Ok(Self::Domiciliary),
            "fixed_deposit" => Ok(Self::FixedDeposit),
            other => Err(CoreError::invalid_field(
                "accountType",
                format!("unknown account type: {other}"),
            )),
        }
    }
}

/// Account status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    /// Active with tier-1 (basic KYC) privileges.
    ActiveTier1,
    /// Active with tier-2 (full KYC) privileges.
    ActiveTier2,
    /// No transactions allowed.
    Suspended,
    /// Account is closed.
    Closed,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountStatus::ActiveTier1 => "active_tier1",
            AccountStatus::ActiveTier2 => "active_tier2",
            AccountStatus::Suspended => "suspended",
            AccountStatus::Closed => "closed",
        }
    }
}

impl FromStr for AccountStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active_tier1" => Ok(Self::ActiveTier1),
            "active_tier2" => Ok(Self::ActiveTier2),
            "suspended" => Ok(Self::Suspended),
            "closed" => Ok(Self::Closed),
            other => Err(CoreError::invalid_field(
                "status",
                format!("unknown account status: {other}"),
            )),
        }
    }
}

impl fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A ledger account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    /// External-facing identifier, immutable.
    pub id: AccountId,
    /// Internal classification number, unique.
    pub ledger_number: LedgerNumber,
    /// Externally usable 10-digit number, unique.
    pub account_number: AccountNumber,
    pub account_type: AccountType,
    pub currency: Currency,
    pub branch_code: String,
    /// Current balance. Never negative.
    pub balance: Decimal,
    pub maximum_daily_withdrawal_limit: Decimal,
    pub maximum_daily_deposit_limit: Decimal,
    pub status: AccountStatus,
    pub owner: UserId,
    pub is_deleted: bool,
    pub deleted_by: Option<UserId>,
    pub deleted_at: Option<Timestamp>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

/// Fields needed to open an account.
#[derive(Debug, Clone)]
pub struct NewAccount {
    pub owner: UserId,
    pub account_type: AccountType,
    pub currency: Currency,
    pub branch_code: String,
    pub ledger_number: LedgerNumber,
    pub account_number: AccountNumber,
    pub maximum_daily_withdrawal_limit: Decimal,
    pub maximum_daily_deposit_limit: Decimal,
}

impl Account {
    /// Create a new account with a zero balance.
    pub fn new(fields: NewAccount, now: Timestamp) -> Self {
        Self {
            id: AccountId::new(),
            ledger_number: fields.ledger_number,
            account_number: fields.account_number,
            account_type: fields.account_type,
            currency: fields.currency,
            branch_code: fields.branch_code,
            balance: Decimal::ZERO,
            maximum_daily_withdrawal_limit: fields.maximum_daily_withdrawal_limit,
            maximum_daily_deposit_limit: fields.maximum_daily_deposit_limit,
            status: AccountStatus::ActiveTier1,
            owner: fields.owner,
            is_deleted: false,
            deleted_by: None,
            deleted_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check if account can transact.
    pub fn can_transact(&self) -> bool {
        !self.is_deleted
            && matches!(
                self.status,
                AccountStatus::ActiveTier1 | AccountStatus::ActiveTier2
            )
    }

    /// Fail unless the account can transact.
    pub fn ensure_can_transact(&self) -> Result<(), CoreError> {
        if self.can_transact() {
            Ok(())
        } else {
            Err(CoreError::validation(format!(
                "account {} is {} and cannot transact",
                self.account_number,
                if self.is_deleted {
                    "deleted"
                } else {
                    self.status.as_str()
                }
            )))
        }
    }

    pub fn balance_money(&self) -> Money {
        Money::new(self.balance, self.currency.clone())
    }

    /// Increase the balance.
    pub fn credit(&mut self, amount: Decimal, now: Timestamp) {
        self.balance += amount;
        self.updated_at = now;
    }

    /// Decrease the balance. Fails without touching it if funds are short.
    pub fn debit(&mut self, amount: Decimal, now: Timestamp) -> Result<(), CoreError> {
        if self.balance < amount {
            return Err(CoreError::InsufficientFunds {
                required: amount.to_string(),
                available: self.balance.to_string(),
            });
        }
        self.balance -= amount;
        self.updated_at = now;
        Ok(())
    }

    pub fn set_status(&mut self, status: AccountStatus, now: Timestamp) {
        self.status = status;
        self.updated_at = now;
    }

    pub fn set_limits(
        &mut self,
        withdrawal: Option<Decimal>,
        deposit: Option<Decimal>,
        now: Timestamp,
    ) {
        if let Some(limit) = withdrawal {
            self.maximum_daily_withdrawal_limit = limit;
        }
        if let Some(limit) = deposit {
            self.maximum_daily_deposit_limit = limit;
        }
        self.updated_at = now;
    }

    pub fn soft_delete(&mut self, by: UserId, now: Timestamp) {
        self.is_deleted = true;
        self.deleted_by = Some(by);
        self.deleted_at = Some(now);
        self.status = AccountStatus::Closed;
        self.updated_at = now;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    pub(crate) fn create_test_account(number: &str, owner: UserId) -> Account {
        Account::new(
            NewAccount {
                owner,
                account_type: AccountType::Savings,
                currency: Currency::ngn(),
                branch_code: "001".to_string(),
                ledger_number: LedgerNumber::new(format!("001{number}")),
                account_number: AccountNumber::parse(number).unwrap(),
                maximum_daily_withdrawal_limit: dec!(500000.00),
                maximum_daily_deposit_limit: dec!(5000000.00),
            },
            Utc::now(),
        )
    }

    #[test]
    fn test_new_account_is_active_and_empty() {
        let account = create_test_account("0000001236", UserId::new());
        assert!(account.can_transact());
        assert_eq!(account.balance, Decimal::ZERO);
    }

    #[test]
    fn test_debit_never_goes_negative() {
        let mut account = create_test_account("0000001236", UserId::new());
        account.credit(dec!(100), Utc::now());

        let err = account.debit(dec!(100.01), Utc::now()).unwrap_err();
        assert!(matches!(err, CoreError::InsufficientFunds { .. }));
        assert_eq!(account.balance, dec!(100));

        account.debit(dec!(100), Utc::now()).unwrap();
        assert_eq!(account.balance, Decimal::ZERO);
    }

    #[test]
    fn test_suspended_and_deleted_accounts_cannot_transact() {
        let mut account = create_test_account("0000001236", UserId::new());
        account.set_status(AccountStatus::Suspended, Utc::now());
        assert!(account.ensure_can_transact().is_err());

        let mut account = create_test_account("0000001236", UserId::new());
        account.soft_delete(UserId::new(), Utc::now());
        assert!(!account.can_transact());
    }

    #[test]
    fn test_type_codes() {
        assert_eq!(AccountType::Savings.code(), "10");
        assert_eq!(AccountType::Current.code(), "20");
        assert_eq!("fixed_deposit".parse::<AccountType>().unwrap(), AccountType::FixedDeposit);
        assert!("checking".parse::<AccountType>().is_err());
    }
}
