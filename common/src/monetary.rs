//! Monetary types. All amounts are fixed-point decimals.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::CoreError;

/// A monetary amount with currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    /// The amount value (high precision decimal).
    pub value: Decimal,
    /// ISO 4217 currency code.
    pub currency: Currency,
}

impl Money {
    /// Create a new Money instance.
    pub fn new(value: Decimal, currency: Currency) -> Self {
        Self { value, currency }
    }

    /// Create from a string value.
    pub fn parse(value: &str, currency: Currency) -> Result<Self, CoreError> {
        let value = value
            .parse::<Decimal>()
            .map_err(|e| CoreError::invalid_field("amount", e.to_string()))?;
        Ok(Self { value, currency })
    }

    /// Create from an amount in minor units (kobo, cents).
    pub fn from_minor_units(minor: i64, currency: Currency) -> Self {
        let value = Decimal::from(minor) / currency.minor_unit_factor();
        Self { value, currency }.round()
    }

    /// Amount in minor units, `None` if it does not fit or has sub-minor precision.
    pub fn to_minor_units(&self) -> Option<i64> {
        let scaled = self.value * self.currency.minor_unit_factor();
        if scaled.fract() != Decimal::ZERO {
            return None;
        }
        scaled.to_i64()
    }

    /// Create a zero amount in the given currency.
    pub fn zero(currency: Currency) -> Self {
        Self {
            value: Decimal::ZERO,
            currency,
        }
    }

    /// Check if the amount is positive.
    pub fn is_positive(&self) -> bool {
        self.value > Decimal::ZERO
    }

    /// Round to the currency's standard decimal places.
    pub fn round(&self) -> Self {
        let places = self.currency.decimal_places();
        Self {
            value: self.value.round_dp(places),
            currency: self.currency.clone(),
        }
    }

    /// Reject non-positive amounts and amounts finer than the currency allows.
    pub fn ensure_payable(&self) -> Result<(), CoreError> {
        if !self.is_positive() {
            return Err(CoreError::invalid_field("amount", "amount must be positive"));
        }
        if self.value.round_dp(self.currency.decimal_places()) != self.value {
            return Err(CoreError::invalid_field(
                "amount",
                format!(
                    "amount has more than {} decimal places",
                    self.currency.decimal_places()
                ),
            ));
        }
        Ok(())
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.value, self.currency)
    }
}

/// ISO 4217 currency code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Currency(String);

impl Currency {
    /// Create a new currency from code.
    pub fn new(code: impl Into<String>) -> Self {
        Self(code.into().trim().to_uppercase())
    }

    /// Get the currency code.
    pub fn code(&self) -> &str {
        &self.0
    }

    /// Get the standard decimal places for this currency.
    pub fn decimal_places(&self) -> u32 {
        match self.0.as_str() {
            "JPY" | "KRW" | "VND" => 0,
            "BHD" | "KWD" | "OMR" => 3,
            _ => 2,
        }
    }

    /// Divisor between minor and major units (100 for kobo/cents).
    pub fn minor_unit_factor(&self) -> Decimal {
        Decimal::from(10i64.pow(self.decimal_places()))
    }

    pub fn ngn() -> Self {
        Self::new("NGN")
    }

    pub fn usd() -> Self {
        Self::new("USD")
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Currency {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_minor_unit_conversion() {
        let m = Money::from_minor_units(500_000, Currency::ngn());
        assert_eq!(m.value, dec!(5000.00));
        assert_eq!(m.to_minor_units(), Some(500_000));
    }

    #[test]
    fn test_sub_minor_precision_is_not_representable() {
        let m = Money::new(dec!(1.005), Currency::ngn());
        assert_eq!(m.to_minor_units(), None);
        assert!(m.ensure_payable().is_err());
    }

    #[test]
    fn test_payable_amounts() {
        assert!(Money::new(dec!(10.50), Currency::ngn()).ensure_payable().is_ok());
        assert!(Money::new(dec!(0), Currency::ngn()).ensure_payable().is_err());
        assert!(Money::new(dec!(-1), Currency::ngn()).ensure_payable().is_err());
    }

    #[test]
    fn test_currency_normalises_code() {
        assert_eq!(Currency::new(" ngn "), Currency::ngn());
        assert_eq!(Currency::new("JPY").minor_unit_factor(), dec!(1));
    }
}
