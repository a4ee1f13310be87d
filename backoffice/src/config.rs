//! Back-office configuration.

use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;

use vaultline_common::{constants, Currency, DurationExt};
use vaultline_ledger::LedgerConfig;

/// Idempotency cache configuration.
#[derive(Debug, Clone)]
pub struct IdempotencyConfig {
    /// How long a recorded response is replayed.
    pub ttl: Duration,
    /// Interval of the background eviction pass.
    pub cleanup_interval: Duration,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            ttl: constants::idempotency_ttl().as_std(),
            cleanup_interval: constants::idempotency_cleanup_interval().as_std(),
        }
    }
}

/// Main back-office configuration.
#[derive(Debug, Clone)]
pub struct BackOfficeConfig {
    /// Ledger rules: currency, codes, limits.
    pub ledger: LedgerConfig,
    /// Idempotency cache.
    pub idempotency: IdempotencyConfig,
    /// PostgreSQL URL; the in-memory store is used when absent.
    pub database_url: Option<String>,
    /// Pool size for the PostgreSQL store.
    pub database_max_connections: u32,
    /// How long `stop` waits for in-flight verifications.
    pub drain_timeout: Duration,
    /// Log level.
    pub log_level: String,
}

impl Default for BackOfficeConfig {
    fn default() -> Self {
        Self {
            ledger: LedgerConfig::default(),
            idempotency: IdempotencyConfig::default(),
            database_url: None,
            database_max_connections: 10,
            drain_timeout: Duration::from_secs(30),
            log_level: "info".to_string(),
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

impl BackOfficeConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(code) = std::env::var("VAULTLINE_SUPPORTED_CURRENCY") {
            config.ledger.supported_currency = Currency::new(code);
        }
        if let Ok(branch) = std::env::var("VAULTLINE_BRANCH_CODE") {
            config.ledger.default_branch_code = branch;
        }
        if let Ok(bank) = std::env::var("VAULTLINE_BANK_CODE") {
            config.ledger.bank_code = bank;
        }
        if let Some(limit) = env_parse::<Decimal>("VAULTLINE_DAILY_WITHDRAWAL_LIMIT") {
            config.ledger.default_daily_withdrawal_limit = limit;
        }
        if let Some(limit) = env_parse::<Decimal>("VAULTLINE_DAILY_DEPOSIT_LIMIT") {
            config.ledger.default_daily_deposit_limit = limit;
        }
        if let Some(attempts) = env_parse("VAULTLINE_MAX_GENERATION_ATTEMPTS") {
            config.ledger.max_generation_attempts = attempts;
        }
        if let Some(minutes) = env_parse("VAULTLINE_BUSINESS_UTC_OFFSET_MINUTES") {
            config.ledger.business_utc_offset_minutes = minutes;
        }
        if let Some(secs) = env_parse("VAULTLINE_IDEMPOTENCY_TTL_SECS") {
            config.idempotency.ttl = Duration::from_secs(secs);
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.database_url = Some(url);
        }
        if let Some(max) = env_parse("VAULTLINE_DATABASE_MAX_CONNECTIONS") {
            config.database_max_connections = max;
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            config.log_level = level;
        }

        config
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        self.ledger.validate()?;

        if self.idempotency.ttl.is_zero() {
            return Err("Idempotency TTL cannot be 0".to_string());
        }

        if self.idempotency.cleanup_interval.is_zero() {
            return Err("Idempotency cleanup interval cannot be 0".to_string());
        }

        if matches!(&self.database_url, Some(url) if url.is_empty()) {
            return Err("Database URL cannot be empty".to_string());
        }

        if self.database_max_connections == 0 {
            return Err("Database pool needs at least one connection".to_string());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BackOfficeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.idempotency.ttl, Duration::from_secs(60));
        assert_eq!(config.ledger.max_generation_attempts, 1000);
    }

    #[test]
    fn test_invalid_config() {
        let mut config = BackOfficeConfig::default();
        config.idempotency.ttl = Duration::ZERO;
        assert!(config.validate().is_err());

        let mut config = BackOfficeConfig::default();
        config.database_url = Some(String::new());
        assert!(config.validate().is_err());

        let mut config = BackOfficeConfig::default();
        config.ledger.bank_code = "12".to_string();
        assert!(config.validate().is_err());
    }
}
