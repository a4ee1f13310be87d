//! Ledger-number and account-number generation.
//!
//! Ledger numbers are deterministic: `branch + serial(6) + type code +
//! suffix`, where the suffix counts the accounts already filed under the
//! same prefix. Account numbers follow the NUBAN layout: a 9-digit serial
//! plus a check digit computed over the bank code and the serial.

use rand::Rng;
use tracing::{debug, warn};

use vaultline_common::{AccountNumber, CoreError, LedgerNumber, Result};

use crate::account::AccountType;
use crate::store::UnitOfWork;

const SERIAL_DIGITS: usize = 9;
const SERIAL_SPACE: i64 = 1_000_000_000;
const WEIGHTS: [u32; 3] = [3, 7, 3];

/// Ledger number for an explicit suffix.
pub fn ledger_number(
    branch_code: &str,
    customer_serial: i64,
    account_type: AccountType,
    suffix: u64,
) -> LedgerNumber {
    LedgerNumber::new(format!(
        "{}{}",
        ledger_prefix(branch_code, customer_serial, account_type),
        suffix
    ))
}

fn ledger_prefix(branch_code: &str, customer_serial: i64, account_type: AccountType) -> String {
    format!("{branch_code}{customer_serial:06}{}", account_type.code())
}

/// Bank code as it enters the checksum: 3-digit codes as-is, 5-digit codes
/// prefixed with `9`.
fn checksum_bank_code(bank_code: &str) -> Result<String> {
    if !bank_code.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CoreError::invalid_field("bankCode", "bank code must be digits"));
    }
    match bank_code.len() {
        3 => Ok(bank_code.to_string()),
        5 => Ok(format!("9{bank_code}")),
        _ => Err(CoreError::invalid_field(
            "bankCode",
            "bank code must be 3 or 5 digits",
        )),
    }
}

/// NUBAN check digit for `serial` under `bank_code`.
pub fn check_digit(bank_code: &str, serial: &str) -> Result<u32> {
    if serial.len() != SERIAL_DIGITS || !serial.bytes().all(|b| b.is_ascii_digit()) {
        return Err(CoreError::validation("serial must be 9 digits"));
    }
    let digits = format!("{}{serial}", checksum_bank_code(bank_code)?);
    let sum: u32 = digits
        .bytes()
        .zip(WEIGHTS.iter().cycle())
        .map(|(b, w)| u32::from(b - b'0') * w)
        .sum();
    Ok((10 - sum % 10) % 10)
}

/// Build the account number for a 9-digit serial.
pub fn account_number(bank_code: &str, serial: i64) -> Result<AccountNumber> {
    let serial = format!("{:09}", serial.rem_euclid(SERIAL_SPACE));
    let check = check_digit(bank_code, &serial)?;
    AccountNumber::parse(format!("{serial}{check}"))
}

/// Check that `number` is a well-formed account number for `bank_code`.
pub fn validate_account_number(bank_code: &str, number: &str) -> bool {
    if number.len() != AccountNumber::LEN || !number.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    let (serial, check) = number.split_at(SERIAL_DIGITS);
    match (check_digit(bank_code, serial), check.parse::<u32>()) {
        (Ok(expected), Ok(actual)) => expected == actual,
        _ => false,
    }
}

/// Reject missing or non-positive customer serials.
pub fn require_customer_serial(serial: Option<i64>, customer: impl ToString) -> Result<i64> {
    match serial {
        None => Err(CoreError::not_found("Customer", customer)),
        Some(s) if s <= 0 => Err(CoreError::invalid_field(
            "customer",
            format!("customer serial must be positive, got {s}"),
        )),
        Some(s) => Ok(s),
    }
}

/// Generates identifiers against the uniqueness store.
#[derive(Debug, Clone)]
pub struct AccountIdentifierGenerator {
    bank_code: String,
    max_attempts: u32,
}

impl AccountIdentifierGenerator {
    pub fn new(bank_code: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            bank_code: bank_code.into(),
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn bank_code(&self) -> &str {
        &self.bank_code
    }

    /// First free ledger number for this branch, customer and type.
    pub async fn generate_ledger_number(
        &self,
        uow: &mut dyn UnitOfWork,
        branch_code: &str,
        customer_serial: i64,
        account_type: AccountType,
    ) -> Result<LedgerNumber> {
        let candidate = ledger_number(branch_code, customer_serial, account_type, 0);
        if !uow.ledger_number_exists(&candidate).await? {
            return Ok(candidate);
        }

        let prefix = ledger_prefix(branch_code, customer_serial, account_type);
        let mut suffix = uow.count_ledger_numbers_with_prefix(&prefix).await?;
        for _ in 0..self.max_attempts {
            let candidate = ledger_number(branch_code, customer_serial, account_type, suffix);
            if !uow.ledger_number_exists(&candidate).await? {
                debug!(ledger_number = %candidate, suffix, "Ledger number collision resolved");
                return Ok(candidate);
            }
            suffix += 1;
        }

        Err(CoreError::GenerationExhausted {
            what: "ledger number",
            attempts: self.max_attempts,
        })
    }

    /// Unique account number, seeded from the customer serial and retried
    /// with random serials.
    pub async fn generate_unique_account_number(
        &self,
        uow: &mut dyn UnitOfWork,
        customer_serial: i64,
    ) -> Result<AccountNumber> {
        if customer_serial <= 0 {
            return Err(CoreError::invalid_field(
                "customer",
                "customer serial must be positive",
            ));
        }

        let mut serial = customer_serial;
        for attempt in 0..self.max_attempts {
            let candidate = account_number(&self.bank_code, serial)?;
            if !uow.account_number_exists(&candidate).await? {
                return Ok(candidate);
            }
            serial = rand::thread_rng().gen_range(1..SERIAL_SPACE);
            debug!(attempt, "Account number collision, retrying");
        }

        warn!(
            attempts = self.max_attempts,
            "Account number generation exhausted"
        );
        Err(CoreError::GenerationExhausted {
            what: "account number",
            attempts: self.max_attempts,
        })
    }
}
