//! Request and response bodies.
//!
//! These types are what the HTTP collaborator deserializes from callers and
//! serializes back. Field names are camelCase on the wire.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use vaultline_common::{AccountNumber, CoreError, PaymentChannel, PaymentReference, TransactionId};

/// Header carrying the caller's idempotency key.
pub const IDEMPOTENCE_KEY_HEADER: &str = "Idempotence-Key";

/// Routes of the back-office surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Route {
    OpenAccount,
    Deposit,
    Withdraw,
    Transfer,
    Flag,
    DeleteTransaction,
    Verify,
    Webhook,
}

impl Route {
    pub fn method(&self) -> &'static str {
        match self {
            Route::OpenAccount | Route::Deposit | Route::Withdraw | Route::Transfer => "POST",
            Route::Webhook => "POST",
            Route::Flag => "PUT",
            Route::DeleteTransaction => "DELETE",
            Route::Verify => "GET",
        }
    }

    pub fn path(&self) -> &'static str {
        match self {
            Route::OpenAccount => "/account",
            Route::Deposit => "/deposit",
            Route::Withdraw => "/withdraw",
            Route::Transfer => "/transfer",
            Route::Flag => "/flag",
            Route::DeleteTransaction => "/transaction/{id}",
            Route::Verify => "/verify/{id}",
            Route::Webhook => "/webhook",
        }
    }

    /// Whether the route refuses requests without an idempotency key.
    pub fn requires_idempotency_key(&self) -> bool {
        matches!(
            self,
            Route::OpenAccount | Route::Deposit | Route::Withdraw | Route::Transfer
        )
    }

    /// Scope name used to partition idempotency keys.
    pub fn scope(&self) -> &'static str {
        match self {
            Route::OpenAccount => "open_account",
            Route::Deposit => "deposit",
            Route::Withdraw => "withdraw",
            Route::Transfer => "transfer",
            Route::Flag => "flag",
            Route::DeleteTransaction => "delete_transaction",
            Route::Verify => "verify",
            Route::Webhook => "webhook",
        }
    }
}

/// Caller-supplied opaque idempotency key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    const MAX_LEN: usize = 255;

    /// Read the key from a header value. Missing or blank keys are a
    /// validation failure.
    pub fn from_header(value: Option<&str>) -> Result<Self, CoreError> {
        match value.map(str::trim) {
            None | Some("") => Err(CoreError::invalid_field(
                IDEMPOTENCE_KEY_HEADER,
                "idempotency key header is required",
            )),
            Some(v) => Self::parse(v),
        }
    }

    pub fn parse(value: impl Into<String>) -> Result<Self, CoreError> {
        let value = value.into();
        if value.is_empty() || value.len() > Self::MAX_LEN || value.chars().any(char::is_control) {
            return Err(CoreError::invalid_field(
                IDEMPOTENCE_KEY_HEADER,
                "idempotency key must be 1-255 printable characters",
            ));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for IdempotencyKey {
    type Error = CoreError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        Self::parse(s)
    }
}

impl From<IdempotencyKey> for String {
    fn from(k: IdempotencyKey) -> Self {
        k.0
    }
}

impl std::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// `POST /account`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpenAccountRequest {
    /// `savings`, `current`, `domiciliary` or `fixed_deposit`.
    pub account_type: String,
    pub branch_code: Option<String>,
}

/// `POST /deposit`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositRequest {
    pub account_number: Option<AccountNumber>,
    pub amount: Decimal,
    pub currency: String,
    pub channel: PaymentChannel,
}

/// `POST /withdraw`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawRequest {
    pub account_number: AccountNumber,
    pub amount: Decimal,
    pub currency: String,
    pub notes: Option<String>,
}

/// `POST /transfer`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    pub sender_account_number: AccountNumber,
    pub recipient_account_number: AccountNumber,
    pub amount: Decimal,
    pub currency: String,
    pub notes: Option<String>,
}

/// `PUT /flag`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FlagRequest {
    pub transaction_id: TransactionId,
}

/// Body of a successful deposit initiation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositReceipt {
    pub transaction: Value,
    pub payment_reference: PaymentReference,
    pub checkout_url: Option<String>,
}

/// Outcome class of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    Success,
    Failed,
}

/// Structured result of every back-office operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationResponse {
    pub status_code: u16,
    pub status: ResponseStatus,
    pub remark: String,
    /// Error code for failures, e.g. `AUDIT_LOG_FAILED`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub data: Option<Value>,
}

impl OperationResponse {
    /// Success carrying `data`.
    pub fn success<T: Serialize>(status_code: u16, remark: impl Into<String>, data: &T) -> Self {
        match serde_json::to_value(data) {
            Ok(value) => Self {
                status_code,
                status: ResponseStatus::Success,
                remark: remark.into(),
                error_code: None,
                data: Some(value),
            },
            Err(e) => Self::from_error(&CoreError::Internal(format!(
                "cannot serialize response: {e}"
            ))),
        }
    }

    /// Success without a body.
    pub fn empty(status_code: u16, remark: impl Into<String>) -> Self {
        Self {
            status_code,
            status: ResponseStatus::Success,
            remark: remark.into(),
            error_code: None,
            data: None,
        }
    }

    pub fn from_error(error: &CoreError) -> Self {
        let data = match error {
            CoreError::ValidationFailed {
                field: Some(field), ..
            } => Some(serde_json::json!({ "field": field })),
            _ => None,
        };
        Self {
            status_code: error.status_code(),
            status: ResponseStatus::Failed,
            remark: error.to_string(),
            error_code: Some(error.error_code().to_string()),
            data,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResponseStatus::Success
    }

    /// A failure that applied nothing and that the caller may retry under the
    /// same key: server-side faults and cancelled operations.
    pub fn is_retryable_failure(&self) -> bool {
        self.status_code >= 500 || self.error_code.as_deref() == Some("CANCELLED")
    }

    /// Deserialize the payload.
    pub fn data_as<T: serde::de::DeserializeOwned>(&self) -> Option<T> {
        self.data
            .as_ref()
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

impl<T: Serialize> From<Result<T, CoreError>> for OperationResponse {
    fn from(result: Result<T, CoreError>) -> Self {
        match result {
            Ok(data) => OperationResponse::success(200, "Successful", &data),
            Err(e) => OperationResponse::from_error(&e),
        }
    }
}
