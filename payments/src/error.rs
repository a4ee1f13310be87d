//! Payment provider error types.

use thiserror::Error;
use vaultline_common::{CoreError, PaymentReference};

/// Errors raised while talking to the external payment provider.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProviderError {
    /// Provider could not be reached or timed out.
    #[error("Payment provider unreachable: {0}")]
    Unreachable(String),

    /// Provider answered with something we cannot parse.
    #[error("Malformed provider response: {0}")]
    MalformedResponse(String),

    /// Provider has no record of the reference.
    #[error("Provider has no payment {0}")]
    UnknownReference(PaymentReference),

    /// Provider refused to open a checkout.
    #[error("Checkout refused: {0}")]
    CheckoutRefused(String),
}

impl ProviderError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProviderError::Unreachable(_))
    }
}

impl From<ProviderError> for CoreError {
    fn from(e: ProviderError) -> Self {
        match e {
            ProviderError::UnknownReference(reference) => CoreError::not_found("Payment", reference),
            other => CoreError::UpstreamUnavailable(other.to_string()),
        }
    }
}

/// Result type for provider operations.
pub type ProviderResult<T> = Result<T, ProviderError>;
