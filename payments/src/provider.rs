//! Payment provider port and the mock used in tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use vaultline_common::{Currency, Money, PaymentChannel, PaymentReference, Timestamp, UserId};

use crate::error::ProviderResult;

/// Status string the provider uses for a successful payment.
pub const SUCCESS_STATUS: &str = "success";

/// A checkout to open with the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutRequest {
    pub reference: PaymentReference,
    pub amount: Money,
    pub channel: PaymentChannel,
    pub customer: UserId,
}

impl CheckoutRequest {
    /// Amount as the provider expects it, in minor units.
    pub fn amount_minor(&self) -> Option<i64> {
        self.amount.to_minor_units()
    }
}

/// An opened checkout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Checkout {
    pub reference: PaymentReference,
    pub checkout_url: String,
    pub access_code: Option<String>,
}

/// What the provider reports about a payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Verification {
    pub reference: PaymentReference,
    pub status: String,
    /// Amount in minor units.
    pub amount: i64,
    pub currency: Currency,
    pub paid_at: Option<Timestamp>,
}

impl Verification {
    /// Success is matched case-insensitively.
    pub fn is_success(&self) -> bool {
        self.status.trim().eq_ignore_ascii_case(SUCCESS_STATUS)
    }

    /// Reported amount in major units.
    pub fn amount(&self) -> Money {
        Money::from_minor_units(self.amount, self.currency.clone())
    }
}

/// The external checkout/verification provider.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Provider name for logs.
    fn name(&self) -> &str;

    /// Open a hosted checkout for a deposit.
    async fn initialize(&self, request: &CheckoutRequest) -> ProviderResult<Checkout>;

    /// Ask the provider for the status of a payment.
    async fn verify(&self, reference: &PaymentReference) -> ProviderResult<Verification>;
}

#[cfg(any(test, feature = "test-utils"))]
pub use mock::MockPaymentProvider;

#[cfg(any(test, feature = "test-utils"))]
mod mock {
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    use async_trait::async_trait;
    use dashmap::DashMap;
    use parking_lot::Mutex;
    use std::time::Duration;

    use vaultline_common::{Currency, PaymentReference};

    use super::{Checkout, CheckoutRequest, PaymentProvider, Verification, SUCCESS_STATUS};
    use crate::error::{ProviderError, ProviderResult};

    /// Provider double with scripted outcomes.
    ///
    /// Checkouts are remembered; `verify` reports whatever was scripted for
    /// the reference, or success for the checkout amount if nothing was.
    #[derive(Debug, Default)]
    pub struct MockPaymentProvider {
        checkouts: DashMap<PaymentReference, CheckoutRequest>,
        outcomes: DashMap<PaymentReference, Verification>,
        unreachable: AtomicBool,
        latency: Mutex<Option<Duration>>,
        verify_calls: AtomicU64,
    }

    impl MockPaymentProvider {
        pub fn new() -> Self {
            Self::default()
        }

        /// Script the provider's answer for `reference`.
        pub fn set_outcome(
            &self,
            reference: &PaymentReference,
            status: &str,
            amount_minor: i64,
            currency: Currency,
        ) {
            self.outcomes.insert(
                reference.clone(),
                Verification {
                    reference: reference.clone(),
                    status: status.to_string(),
                    amount: amount_minor,
                    currency,
                    paid_at: None,
                },
            );
        }

        pub fn set_unreachable(&self, unreachable: bool) {
            self.unreachable.store(unreachable, Ordering::SeqCst);
        }

        /// Delay every verification by `latency`.
        pub fn set_latency(&self, latency: Option<Duration>) {
            *self.latency.lock() = latency;
        }

        pub fn verify_calls(&self) -> u64 {
            self.verify_calls.load(Ordering::SeqCst)
        }

        /// Number of checkouts opened.
        pub fn checkout_count(&self) -> usize {
            self.checkouts.len()
        }

        pub fn checkout(&self, reference: &PaymentReference) -> Option<CheckoutRequest> {
            self.checkouts.get(reference).map(|c| c.clone())
        }

        fn ensure_reachable(&self) -> ProviderResult<()> {
            if self.unreachable.load(Ordering::SeqCst) {
                return Err(ProviderError::Unreachable("connection refused".to_string()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl PaymentProvider for MockPaymentProvider {
        fn name(&self) -> &str {
            "mock"
        }

        async fn initialize(&self, request: &CheckoutRequest) -> ProviderResult<Checkout> {
            self.ensure_reachable()?;
            if request.amount_minor().is_none() {
                return Err(ProviderError::CheckoutRefused(format!(
                    "amount {} has sub-minor precision",
                    request.amount
                )));
            }
            self.checkouts
                .insert(request.reference.clone(), request.clone());
            Ok(Checkout {
                reference: request.reference.clone(),
                checkout_url: format!("https://checkout.mock/{}", request.reference),
                access_code: Some(format!("ac_{}", request.reference.as_str().to_lowercase())),
            })
        }

        async fn verify(&self, reference: &PaymentReference) -> ProviderResult<Verification> {
            self.verify_calls.fetch_add(1, Ordering::SeqCst);
            let latency = *self.latency.lock();
            if let Some(latency) = latency {
                tokio::time::sleep(latency).await;
            }
            self.ensure_reachable()?;

            if let Some(outcome) = self.outcomes.get(reference) {
                return Ok(outcome.clone());
            }
            let checkout = self
                .checkouts
                .get(reference)
                .ok_or_else(|| ProviderError::UnknownReference(reference.clone()))?;
            let amount = checkout.amount_minor().ok_or_else(|| {
                ProviderError::MalformedResponse(format!("amount {}", checkout.amount))
            })?;
            Ok(Verification {
                reference: reference.clone(),
                status: SUCCESS_STATUS.to_string(),
                amount,
                currency: checkout.amount.currency.clone(),
                paid_at: None,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderError;
    use rust_decimal_macros::dec;

    fn request(amount: rust_decimal::Decimal) -> CheckoutRequest {
        CheckoutRequest {
            reference: PaymentReference::generate(),
            amount: Money::new(amount, Currency::ngn()),
            channel: PaymentChannel::Card,
            customer: UserId::new(),
        }
    }

    #[test]
    fn test_success_status_is_case_insensitive() {
        let mut v = Verification {
            reference: PaymentReference::parse("R1").unwrap(),
            status: "SUCCESS".to_string(),
            amount: 500_000,
            currency: Currency::ngn(),
            paid_at: None,
        };
        assert!(v.is_success());
        assert_eq!(v.amount().value, dec!(5000));
        v.status = "failed".to_string();
        assert!(!v.is_success());
    }

    #[tokio::test]
    async fn test_mock_verifies_checkout_amount() {
        let provider = MockPaymentProvider::new();
        let req = request(dec!(5000.00));
        let checkout = provider.initialize(&req).await.unwrap();
        assert!(checkout.checkout_url.ends_with(req.reference.as_str()));

        let verification = provider.verify(&req.reference).await.unwrap();
        assert!(verification.is_success());
        assert_eq!(verification.amount, 500_000);
        assert_eq!(provider.verify_calls(), 1);
    }

    #[tokio::test]
    async fn test_mock_scripted_failures() {
        let provider = MockPaymentProvider::new();
        let unknown = PaymentReference::generate();
        assert_eq!(
            provider.verify(&unknown).await.unwrap_err(),
            ProviderError::UnknownReference(unknown.clone())
        );

        provider.set_outcome(&unknown, "abandoned", 100, Currency::ngn());
        assert!(!provider.verify(&unknown).await.unwrap().is_success());

        provider.set_unreachable(true);
        assert!(matches!(
            provider.verify(&unknown).await,
            Err(ProviderError::Unreachable(_))
        ));
        assert!(provider.initialize(&request(dec!(1))).await.is_err());
    }

    #[tokio::test]
    async fn test_sub_minor_amount_refused() {
        let provider = MockPaymentProvider::new();
        let err = provider.initialize(&request(dec!(1.005))).await.unwrap_err();
        assert!(matches!(err, ProviderError::CheckoutRefused(_)));
    }
}
