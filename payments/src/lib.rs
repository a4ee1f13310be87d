//! Vaultline Payments
//!
//! Port to the external checkout/verification provider and parsing of its
//! webhook deliveries. Provider amounts travel in minor units; conversion to
//! major units happens in [`provider::Verification::amount`].
//!
//! # Example
//!
//! ```rust,ignore
//! use vaultline_payments::{MockPaymentProvider, PaymentProvider};
//!
//! let provider = MockPaymentProvider::new();
//! let checkout = provider.initialize(&request).await?;
//! let verification = provider.verify(&checkout.reference).await?;
//! assert!(verification.is_success());
//! ```

pub mod error;
pub mod provider;
pub mod webhook;

pub use error::{ProviderError, ProviderResult};
pub use provider::{Checkout, CheckoutRequest, PaymentProvider, Verification, SUCCESS_STATUS};
pub use webhook::WebhookEvent;

#[cfg(any(test, feature = "test-utils"))]
pub use provider::MockPaymentProvider;
