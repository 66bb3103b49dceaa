//! Unified error handling for Playmeter
//!
//! Every failure on the billing path maps to a dedicated variant with a stable
//! error code. Infrastructure failures keep their own variants so operators can
//! tell a store outage apart from a rejected request.

use actix_web::{http::header, http::StatusCode, HttpResponse, ResponseError};
use serde_json::json;
use thiserror::Error;

/// Main application error type
///
/// All errors in the application should be converted to this type.
/// It implements `ResponseError` for automatic HTTP response generation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AppError {
    // ==================== Request Authentication ====================
    #[error("Unknown credential: {0}")]
    UnknownCredential(String),

    #[error("Request signature does not match")]
    SignatureInvalid,

    #[error("Request timestamp is outside the accepted window ({skew_secs}s skew)")]
    RequestExpired { skew_secs: i64 },

    #[error("Nonce has already been used")]
    NonceReused,

    // ==================== Abuse Controls ====================
    #[error("Rate limit exceeded for {scope}, retry in {retry_after_secs}s")]
    RateLimited {
        scope: String,
        retry_after_secs: u64,
    },

    #[error("Account locked: {0}")]
    AccountLocked(String),

    // ==================== Billing Validation ====================
    #[error("Account is not authorized for catalog item {0}")]
    AppNotAuthorized(String),

    #[error("Party size {requested} is outside the allowed range [{min}, {max}]")]
    PartySizeOutOfRange { requested: i32, min: i32, max: i32 },

    #[error("Session id has an invalid format: {0}")]
    SessionIdFormatInvalid(String),

    #[error("Insufficient balance: required {required}, available {available}")]
    InsufficientBalance { required: String, available: String },

    #[error("Refund of {requested} exceeds available balance {available}")]
    RefundExceedsBalance { requested: String, available: String },

    #[error("Account busy, lock not acquired within {wait_ms}ms")]
    LockTimeout { wait_ms: u64 },

    // ==================== Portal Authentication ====================
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("Token expired")]
    TokenExpired,

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: insufficient permissions")]
    Forbidden,

    #[error("Password hashing failed: {0}")]
    PasswordHash(String),

    // ==================== Validation ====================
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidField { field: String, message: String },

    #[error("Missing required field: {0}")]
    MissingField(String),

    // ==================== Resource Errors ====================
    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid state transition for {entity}: {from} -> {to}")]
    InvalidStateTransition {
        entity: String,
        from: String,
        to: String,
    },

    // ==================== Infrastructure ====================
    #[error("Database error: {0}")]
    Database(String),

    #[error("Database pool error: {0}")]
    Pool(String),

    #[error("Transaction failed: {0}")]
    Transaction(String),

    #[error("Cache error: {0}")]
    Cache(String),

    #[error("Cache connection failed: {0}")]
    CacheConnection(String),

    #[error("Settlement gateway error: {0}")]
    Settlement(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl AppError {
    /// Shorthand for a field-level validation failure
    pub fn invalid_field(field: impl Into<String>, message: impl Into<String>) -> Self {
        AppError::InvalidField {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Returns the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            AppError::Validation(_)
            | AppError::InvalidField { .. }
            | AppError::MissingField(_)
            | AppError::SessionIdFormatInvalid(_) => StatusCode::BAD_REQUEST,

            // 401 Unauthorized
            AppError::UnknownCredential(_)
            | AppError::SignatureInvalid
            | AppError::RequestExpired { .. }
            | AppError::NonceReused
            | AppError::InvalidCredentials
            | AppError::InvalidToken(_)
            | AppError::Unauthorized(_)
            | AppError::TokenExpired => StatusCode::UNAUTHORIZED,

            // 402 Payment Required
            AppError::InsufficientBalance { .. } => StatusCode::PAYMENT_REQUIRED,

            // 403 Forbidden
            AppError::Forbidden | AppError::AppNotAuthorized(_) => StatusCode::FORBIDDEN,

            // 404 Not Found
            AppError::AccountNotFound(_) | AppError::NotFound(_) => StatusCode::NOT_FOUND,

            // 409 Conflict
            AppError::Conflict(_)
            | AppError::AlreadyExists(_)
            | AppError::InvalidStateTransition { .. } => StatusCode::CONFLICT,

            // 422 Unprocessable
            AppError::PartySizeOutOfRange { .. } | AppError::RefundExceedsBalance { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }

            // 423 Locked
            AppError::AccountLocked(_) => StatusCode::LOCKED,

            // 429 Too Many Requests
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,

            // 502 Bad Gateway
            AppError::Settlement(_) => StatusCode::BAD_GATEWAY,

            // 503 Service Unavailable (retryable)
            AppError::LockTimeout { .. } => StatusCode::SERVICE_UNAVAILABLE,

            // 500 Internal Server Error
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns the error code for API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::UnknownCredential(_) => "unknown_credential",
            AppError::SignatureInvalid => "signature_invalid",
            AppError::RequestExpired { .. } => "request_expired",
            AppError::NonceReused => "nonce_reused",
            AppError::RateLimited { .. } => "rate_limited",
            AppError::AccountLocked(_) => "account_locked",
            AppError::AppNotAuthorized(_) => "app_not_authorized",
            AppError::PartySizeOutOfRange { .. } => "party_size_out_of_range",
            AppError::SessionIdFormatInvalid(_) => "session_id_format_invalid",
            AppError::InsufficientBalance { .. } => "insufficient_balance",
            AppError::RefundExceedsBalance { .. } => "refund_exceeds_balance",
            AppError::LockTimeout { .. } => "lock_timeout",
            AppError::InvalidCredentials => "invalid_credentials",
            AppError::TokenExpired => "token_expired",
            AppError::InvalidToken(_) => "invalid_token",
            AppError::Unauthorized(_) => "unauthorized",
            AppError::Forbidden => "forbidden",
            AppError::PasswordHash(_) => "password_error",
            AppError::Validation(_) => "validation_error",
            AppError::InvalidField { .. } => "invalid_field",
            AppError::MissingField(_) => "missing_field",
            AppError::AccountNotFound(_) => "account_not_found",
            AppError::NotFound(_) => "not_found",
            AppError::Conflict(_) => "conflict",
            AppError::AlreadyExists(_) => "already_exists",
            AppError::InvalidStateTransition { .. } => "invalid_state_transition",
            AppError::Database(_) => "database_error",
            AppError::Pool(_) => "pool_error",
            AppError::Transaction(_) => "transaction_error",
            AppError::Cache(_) => "cache_error",
            AppError::CacheConnection(_) => "cache_connection_error",
            AppError::Settlement(_) => "settlement_error",
            AppError::Internal(_) => "internal_error",
            AppError::Config(_) => "config_error",
            AppError::Serialization(_) => "serialization_error",
        }
    }

    /// Seconds the caller should wait before retrying, when the error is retryable
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            AppError::RateLimited {
                retry_after_secs, ..
            } => Some((*retry_after_secs).max(1)),
            AppError::LockTimeout { .. } => Some(1),
            _ => None,
        }
    }

    /// Authentication and request-validation failures feed the anomaly detector
    pub fn counts_as_failure(&self) -> bool {
        matches!(
            self,
            AppError::UnknownCredential(_)
                | AppError::SignatureInvalid
                | AppError::RequestExpired { .. }
                | AppError::NonceReused
                | AppError::AppNotAuthorized(_)
                | AppError::PartySizeOutOfRange { .. }
                | AppError::SessionIdFormatInvalid(_)
                | AppError::InvalidField { .. }
        )
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        AppError::status_code(self)
    }

    fn error_response(&self) -> HttpResponse {
        let status = self.status_code();
        let mut body = json!({
            "code": self.error_code(),
            "message": self.to_string(),
            "status": status.as_u16(),
        });

        if let AppError::InvalidField { field, .. } = self {
            body["field"] = json!(field);
        }

        let mut builder = HttpResponse::build(status);
        if let Some(retry_after) = self.retry_after() {
            body["retry_after"] = json!(retry_after);
            builder.insert_header((header::RETRY_AFTER, retry_after.to_string()));
        }

        builder.json(body)
    }
}

// ==================== From implementations ====================

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        match err.field_errors().into_iter().next() {
            Some((field, errors)) => {
                let message = errors
                    .first()
                    .and_then(|e| e.message.as_ref().map(|m| m.to_string()))
                    .unwrap_or_else(|| "invalid value".to_string());
                AppError::InvalidField {
                    field: field.to_string(),
                    message,
                }
            }
            None => AppError::Validation(err.to_string()),
        }
    }
}
