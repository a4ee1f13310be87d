//! Ledger configuration.

use chrono::FixedOffset;
use rust_decimal::Decimal;

use vaultline_common::{constants, offset_from_minutes, Currency};

/// Settings the ledger engine reads on every operation.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// The single currency accounts and transactions may use.
    pub supported_currency: Currency,
    /// Branch used when an opener does not name one.
    pub default_branch_code: String,
    /// Bank code embedded in account numbers (3 or 5 digits).
    pub bank_code: String,
    /// Daily withdrawal limit given to new accounts.
    pub default_daily_withdrawal_limit: Decimal,
    /// Daily deposit limit given to new accounts.
    pub default_daily_deposit_limit: Decimal,
    /// Attempts allowed for unique account-number generation.
    pub max_generation_attempts: u32,
    /// Business-day offset from UTC, in minutes.
    pub business_utc_offset_minutes: i32,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            supported_currency: Currency::ngn(),
            default_branch_code: "001".to_string(),
            bank_code: "058".to_string(),
            default_daily_withdrawal_limit: Decimal::new(50_000_000, 2),
            default_daily_deposit_limit: Decimal::new(500_000_000, 2),
            max_generation_attempts: constants::MAX_GENERATION_ATTEMPTS,
            business_utc_offset_minutes: 60,
        }
    }
}

impl LedgerConfig {
    pub fn business_offset(&self) -> FixedOffset {
        offset_from_minutes(self.business_utc_offset_minutes)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.supported_currency.code().len() != 3 {
            return Err("Supported currency must be a 3-letter code".to_string());
        }

        if !is_digits(&self.default_branch_code, 3) {
            return Err("Branch code must be 3 digits".to_string());
        }

        if !(is_digits(&self.bank_code, 3) || is_digits(&self.bank_code, 5)) {
            return Err("Bank code must be 3 or 5 digits".to_string());
        }

        if self.default_daily_withdrawal_limit <= Decimal::ZERO
            || self.default_daily_deposit_limit <= Decimal::ZERO
        {
            return Err("Daily limits must be positive".to_string());
        }

        if self.max_generation_attempts == 0 {
            return Err("Generation attempts cannot be 0".to_string());
        }

        if self.business_utc_offset_minutes.abs() >= 24 * 60 {
            return Err("Business UTC offset must be within a day".to_string());
        }

        Ok(())
    }
}

fn is_digits(s: &str, len: usize) -> bool {
    s.len() == len && s.bytes().all(|b| b.is_ascii_digit())
}
