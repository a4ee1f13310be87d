//! Error types for Vaultline ledger operations.

use thiserror::Error;

/// Main error type for ledger operations.
///
/// Variants follow the failure classes callers act on. `AuditLogFailed` is
/// kept apart from storage faults so it can be alerted on specifically.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CoreError {
    /// Bad input, unsupported currency, malformed request.
    #[error("Validation failed: {message}")]
    ValidationFailed {
        message: String,
        field: Option<String>,
    },

    /// Requested entity does not exist (or is soft-deleted).
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// Duplicate identifier or a state that already happened.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Role or ownership check failed.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// The audit gate did not succeed; the mutation was not applied.
    #[error("Audit logging failed: {0}")]
    AuditLogFailed(String),

    /// Unique-number generation ran out of attempts.
    #[error("Could not generate a unique {what} after {attempts} attempts")]
    GenerationExhausted { what: &'static str, attempts: u32 },

    /// External payment provider unreachable or returned garbage.
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Balance too low for the requested debit.
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: String, available: String },

    /// Operation aborted through its cancellation token.
    #[error("Operation cancelled")]
    Cancelled,

    /// Unexpected storage or transport fault.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CoreError {
    /// Validation failure without a field.
    pub fn validation(message: impl Into<String>) -> Self {
        CoreError::ValidationFailed {
            message: message.into(),
            field: None,
        }
    }

    /// Validation failure pinned to a request field.
    pub fn invalid_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        CoreError::ValidationFailed {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Not-found failure.
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        CoreError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Check if the caller may retry the same request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::UpstreamUnavailable(_)
                | CoreError::Internal(_)
                | CoreError::AuditLogFailed(_)
                | CoreError::Cancelled
        )
    }

    /// Get error code for structured responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoreError::ValidationFailed { .. } => "VALIDATION_FAILED",
            CoreError::NotFound { .. } => "NOT_FOUND",
            CoreError::Conflict(_) => "CONFLICT",
            CoreError::Unauthorized(_) => "UNAUTHORIZED",
            CoreError::AuditLogFailed(_) => "AUDIT_LOG_FAILED",
            CoreError::GenerationExhausted { .. } => "GENERATION_EXHAUSTED",
            CoreError::UpstreamUnavailable(_) => "UPSTREAM_UNAVAILABLE",
            CoreError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
            CoreError::Cancelled => "CANCELLED",
            CoreError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Transport status code the HTTP collaborator should answer with.
    pub fn status_code(&self) -> u16 {
        match self {
            CoreError::ValidationFailed { .. } | CoreError::InsufficientFunds { .. } => 400,
            CoreError::Unauthorized(_) => 403,
            CoreError::NotFound { .. } => 404,
            CoreError::Conflict(_) => 409,
            CoreError::Cancelled => 499,
            CoreError::UpstreamUnavailable(_) => 502,
            CoreError::GenerationExhausted { .. } => 503,
            CoreError::AuditLogFailed(_) | CoreError::Internal(_) => 500,
        }
    }
}

/// Result type alias for ledger operations.
pub type Result<T> = std::result::Result<T, CoreError>;
