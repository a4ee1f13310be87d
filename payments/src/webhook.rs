//! Provider webhook payloads.
//!
//! ```json
//! {"event": "charge.success",
//!  "data": {"reference": "VLT-...", "status": "success", "amount": 500000, "currency": "NGN"}}
//! ```

use serde::Deserialize;
use tracing::warn;

use vaultline_common::{Currency, PaymentReference, Timestamp};

use crate::error::{ProviderError, ProviderResult};
use crate::provider::Verification;

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawData {
    reference: String,
    status: String,
    amount: i64,
    currency: Option<String>,
    #[serde(default, alias = "paid_at")]
    paid_at: Option<Timestamp>,
}

#[derive(Debug, Clone, Deserialize)]
struct RawEvent {
    event: String,
    data: RawData,
}

/// A parsed webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookEvent {
    pub event: String,
    pub verification: Verification,
}

impl WebhookEvent {
    /// Parse a webhook body. A missing currency falls back to `default_currency`.
    pub fn parse(body: &[u8], default_currency: &Currency) -> ProviderResult<Self> {
        let raw: RawEvent = serde_json::from_slice(body).map_err(|e| {
            warn!(error = %e, "Unparsable webhook body");
            ProviderError::MalformedResponse(e.to_string())
        })?;

        if raw.data.amount < 0 {
            return Err(ProviderError::MalformedResponse(format!(
                "negative amount {}",
                raw.data.amount
            )));
        }
        let reference = PaymentReference::parse(raw.data.reference)
            .map_err(|e| ProviderError::MalformedResponse(e.to_string()))?;
        let currency = raw
            .data
            .currency
            .map(Currency::new)
            .unwrap_or_else(|| default_currency.clone());

        Ok(Self {
            event: raw.event,
            verification: Verification {
                reference,
                status: raw.data.status,
                amount: raw.data.amount,
                currency,
                paid_at: raw.data.paid_at,
            },
        })
    }

    pub fn reference(&self) -> &PaymentReference {
        &self.verification.reference
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_parse_success_event() {
        let body = br#"{"event":"charge.success","data":{"reference":"VLT-1","status":"Success","amount":500000,"currency":"ngn"}}"#;
        let event = WebhookEvent::parse(body, &Currency::usd()).unwrap();

        assert_eq!(event.event, "charge.success");
        assert_eq!(event.reference().as_str(), "VLT-1");
        assert!(event.verification.is_success());
        assert_eq!(event.verification.currency, Currency::ngn());
        assert_eq!(event.verification.amount().value, dec!(5000.00));
    }

    #[test]
    fn test_missing_currency_uses_default() {
        let body = br#"{"event":"charge.failed","data":{"reference":"VLT-2","status":"failed","amount":100}}"#;
        let event = WebhookEvent::parse(body, &Currency::ngn()).unwrap();
        assert_eq!(event.verification.currency, Currency::ngn());
        assert!(!event.verification.is_success());
    }

    #[test]
    fn test_malformed_bodies() {
        for body in [
            &b"not json"[..],
            br#"{"event":"x"}"#,
            br#"{"event":"x","data":{"reference":"bad ref!","status":"success","amount":1}}"#,
            br#"{"event":"x","data":{"reference":"R","status":"success","amount":-5}}"#,
        ] {
            assert!(matches!(
                WebhookEvent::parse(body, &Currency::ngn()),
                Err(ProviderError::MalformedResponse(_))
            ));
        }
    }
}
