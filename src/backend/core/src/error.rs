//! Error handling for Keystone Core.
//!
//! This module provides:
//! - A single crate error type with machine-readable codes
//! - HTTP status code mapping for the administrative API
//! - Classification of subsystem failures (engine, cache, directory, store)
//!   so the guard can route them through its fallback policy
//! - User-facing vs internal messages
//! - Error logging and metrics
//!
//! # Usage
//!
//! ```rust,ignore
//! use keystone_core::error::{KeystoneError, Result, ErrorContext, ErrorCode};
//!
//! fn load() -> Result<()> {
//!     read_policy_file()
//!         .with_error_code(ErrorCode::InvalidConfiguration)?;
//!     Ok(())
//! }
//! ```

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Keystone operations.
pub type Result<T> = std::result::Result<T, KeystoneError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes for API responses.
///
/// These codes are stable and can be used by clients for programmatic error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Authentication (1000-1099)
    Unauthorized,
    InvalidToken,
    TokenExpired,

    // Authorization (1100-1199)
    Forbidden,

    // Validation (1200-1299)
    ValidationError,
    InvalidPermission,
    InvalidInput,
    MissingRequiredField,

    // Records (1300-1399)
    RecordNotFound,
    DuplicateRecord,
    IntegrityViolation,

    // Rule engine (2000-2099)
    RuleEngineError,
    RuleEngineUnavailable,
    CircuitOpen,

    // Character directory (2100-2199)
    DirectoryUnavailable,

    // Cache (2200-2299)
    CacheError,
    CacheConnectionFailed,

    // Database / audit store (2300-2399)
    DatabaseError,
    DatabaseConnectionFailed,
    DatabaseQueryFailed,
    DatabaseTransactionFailed,
    AuditSinkError,

    // Timing (2400-2499)
    Timeout,
    Cancelled,

    // Serialization (3000-3099)
    SerializationError,
    DeserializationError,
    InvalidJson,

    // Configuration (5000-5099)
    ConfigurationError,
    MissingConfiguration,
    InvalidConfiguration,

    // Internal (9000-9099)
    InternalError,
    UnknownError,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::Unauthorized => 1000,
            Self::InvalidToken => 1001,
            Self::TokenExpired => 1002,

            Self::Forbidden => 1100,

            Self::ValidationError => 1200,
            Self::InvalidPermission => 1201,
            Self::InvalidInput => 1202,
            Self::MissingRequiredField => 1203,

            Self::RecordNotFound => 1300,
            Self::DuplicateRecord => 1301,
            Self::IntegrityViolation => 1302,

            Self::RuleEngineError => 2000,
            Self::RuleEngineUnavailable => 2001,
            Self::CircuitOpen => 2002,

            Self::DirectoryUnavailable => 2100,

            Self::CacheError => 2200,
            Self::CacheConnectionFailed => 2201,

            Self::DatabaseError => 2300,
            Self::DatabaseConnectionFailed => 2301,
            Self::DatabaseQueryFailed => 2302,
            Self::DatabaseTransactionFailed => 2303,
            Self::AuditSinkError => 2304,

            Self::Timeout => 2400,
            Self::Cancelled => 2401,

            Self::SerializationError => 3000,
            Self::DeserializationError => 3001,
            Self::InvalidJson => 3002,

            Self::ConfigurationError => 5000,
            Self::MissingConfiguration => 5001,
            Self::InvalidConfiguration => 5002,

            Self::InternalError => 9000,
            Self::UnknownError => 9099,
        }
    }

    /// Get the HTTP status code for this error.
    pub const fn http_status(&self) -> StatusCode {
        match self {
            Self::Unauthorized | Self::InvalidToken | Self::TokenExpired => {
                StatusCode::UNAUTHORIZED
            }

            Self::Forbidden => StatusCode::FORBIDDEN,

            Self::ValidationError
            | Self::InvalidPermission
            | Self::InvalidInput
            | Self::MissingRequiredField
            | Self::InvalidJson
            | Self::DeserializationError => StatusCode::BAD_REQUEST,

            Self::RecordNotFound => StatusCode::NOT_FOUND,

            Self::DuplicateRecord => StatusCode::CONFLICT,

            Self::RuleEngineError
            | Self::RuleEngineUnavailable
            | Self::CircuitOpen
            | Self::DirectoryUnavailable
            | Self::CacheError
            | Self::CacheConnectionFailed
            | Self::DatabaseConnectionFailed
            | Self::AuditSinkError
            | Self::Timeout
            | Self::Cancelled => StatusCode::SERVICE_UNAVAILABLE,

            Self::IntegrityViolation
            | Self::DatabaseError
            | Self::DatabaseQueryFailed
            | Self::DatabaseTransactionFailed
            | Self::SerializationError
            | Self::ConfigurationError
            | Self::MissingConfiguration
            | Self::InvalidConfiguration
            | Self::InternalError
            | Self::UnknownError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether this code describes an unavailable or timed-out collaborator.
    ///
    /// These are the failures the guard degrades under `fallback_to_auth_only`.
    pub const fn is_subsystem_failure(&self) -> bool {
        matches!(
            self,
            Self::RuleEngineError
                | Self::RuleEngineUnavailable
                | Self::CircuitOpen
                | Self::DirectoryUnavailable
                | Self::CacheError
                | Self::CacheConnectionFailed
                | Self::DatabaseError
                | Self::DatabaseConnectionFailed
                | Self::DatabaseQueryFailed
                | Self::DatabaseTransactionFailed
                | Self::AuditSinkError
                | Self::Timeout
                | Self::Cancelled
        )
    }

    /// Check if this error is retryable.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RuleEngineUnavailable
                | Self::CircuitOpen
                | Self::DirectoryUnavailable
                | Self::CacheConnectionFailed
                | Self::DatabaseConnectionFailed
                | Self::DatabaseQueryFailed
                | Self::Timeout
        )
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "authentication",
            1100..=1199 => "authorization",
            1200..=1299 => "validation",
            1300..=1399 => "record",
            2000..=2099 => "rule_engine",
            2100..=2199 => "directory",
            2200..=2299 => "cache",
            2300..=2399 => "database",
            2400..=2499 => "timing",
            3000..=3099 => "serialization",
            5000..=5099 => "configuration",
            9000..=9099 => "internal",
            _ => "unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Severity
// ═══════════════════════════════════════════════════════════════════════════════

/// Severity level for errors (affects logging).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    /// Caller errors (bad input, missing credentials, denials)
    Low,
    /// Operational issues (timeouts, open circuit)
    Medium,
    /// Collaborator failures
    High,
    /// Errors requiring immediate attention
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::Unauthorized
            | ErrorCode::InvalidToken
            | ErrorCode::TokenExpired
            | ErrorCode::Forbidden
            | ErrorCode::ValidationError
            | ErrorCode::InvalidPermission
            | ErrorCode::InvalidInput
            | ErrorCode::MissingRequiredField
            | ErrorCode::RecordNotFound
            | ErrorCode::DuplicateRecord
            | ErrorCode::InvalidJson
            | ErrorCode::DeserializationError => Self::Low,

            ErrorCode::Timeout | ErrorCode::Cancelled | ErrorCode::CircuitOpen => Self::Medium,

            ErrorCode::RuleEngineError
            | ErrorCode::RuleEngineUnavailable
            | ErrorCode::DirectoryUnavailable
            | ErrorCode::CacheError
            | ErrorCode::AuditSinkError
            | ErrorCode::DatabaseError
            | ErrorCode::DatabaseQueryFailed
            | ErrorCode::DatabaseTransactionFailed
            | ErrorCode::SerializationError
            | ErrorCode::IntegrityViolation
            | ErrorCode::ConfigurationError
            | ErrorCode::MissingConfiguration
            | ErrorCode::InvalidConfiguration => Self::High,

            ErrorCode::DatabaseConnectionFailed
            | ErrorCode::CacheConnectionFailed
            | ErrorCode::InternalError
            | ErrorCode::UnknownError => Self::Critical,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Details
// ═══════════════════════════════════════════════════════════════════════════════

/// Additional structured details about an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorDetails {
    /// Additional context key-value pairs
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: HashMap<String, serde_json::Value>,

    /// Related entity ID (policy, user, character...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// Retry information
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
}

impl ErrorDetails {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        self.entity_type = Some(entity_type.into());
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.context.insert(key.into(), v);
        }
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after_secs = Some(seconds);
        self
    }

    fn is_empty(&self) -> bool {
        self.context.is_empty()
            && self.entity_id.is_none()
            && self.entity_type.is_none()
            && self.retry_after_secs.is_none()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The main error type for Keystone Core.
#[derive(Error, Debug)]
pub struct KeystoneError {
    /// Machine-readable error code
    code: ErrorCode,

    /// User-friendly error message (safe to expose to clients)
    user_message: Cow<'static, str>,

    /// Detailed internal message (for logging only)
    internal_message: Option<String>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for KeystoneError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.user_message)?;
        if let Some(ref internal) = self.internal_message {
            write!(f, " (internal: {})", internal)?;
        }
        Ok(())
    }
}

impl KeystoneError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and user message.
    pub fn new(code: ErrorCode, user_message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            user_message: user_message.into(),
            internal_message: None,
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an error with both user and internal messages.
    pub fn with_internal(
        code: ErrorCode,
        user_message: impl Into<Cow<'static, str>>,
        internal_message: impl Into<String>,
    ) -> Self {
        let mut error = Self::new(code, user_message);
        error.internal_message = Some(internal_message.into());
        error
    }

    /// Create an internal error (500).
    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_internal(ErrorCode::InternalError, "An internal error occurred", message)
    }

    /// Create a not found error.
    pub fn not_found(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        let entity_type = entity_type.into();
        let entity_id = entity_id.into();
        Self::new(
            ErrorCode::RecordNotFound,
            format!("{} not found: {}", entity_type, entity_id),
        )
        .with_details(ErrorDetails::new().with_entity(&entity_type, &entity_id))
    }

    /// Create a validation error.
    pub fn validation(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::ValidationError, message)
    }

    /// Create an unauthorized error.
    pub fn unauthorized(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::Unauthorized, message)
    }

    /// Create a forbidden error.
    pub fn forbidden(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::Forbidden, message)
    }

    /// The rule engine rejected or failed a call.
    pub fn rule_engine(message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::RuleEngineError,
            "The rule engine is unavailable",
            message,
        )
    }

    /// The character directory could not be reached.
    pub fn directory_unavailable(message: impl Into<String>) -> Self {
        Self::with_internal(
            ErrorCode::DirectoryUnavailable,
            "The character directory is unavailable",
            message,
        )
    }

    /// A collaborator call exceeded its deadline.
    pub fn timeout(operation: &'static str, timeout: std::time::Duration) -> Self {
        Self::new(
            ErrorCode::Timeout,
            format!("{} timed out after {}ms", operation, timeout.as_millis()),
        )
        .with_context("operation", operation)
    }

    /// The caller cancelled the request while a collaborator call was in flight.
    pub fn cancelled(operation: &'static str) -> Self {
        Self::new(ErrorCode::Cancelled, format!("{} was cancelled", operation))
            .with_context("operation", operation)
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ConfigurationError, message.into())
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Builder Methods
    // ─────────────────────────────────────────────────────────────────────────

    /// Add a source error.
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        self.source = Some(Box::new(source));
        self
    }

    /// Add error details.
    pub fn with_details(mut self, details: ErrorDetails) -> Self {
        self.details = details;
        self
    }

    /// Add context to details.
    pub fn with_context(mut self, key: impl Into<String>, value: impl Serialize) -> Self {
        if let Ok(v) = serde_json::to_value(value) {
            self.details.context.insert(key.into(), v);
        }
        self
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn code(&self) -> ErrorCode {
        self.code
    }

    pub fn user_message(&self) -> &str {
        &self.user_message
    }

    pub fn internal_message(&self) -> Option<&str> {
        self.internal_message.as_deref()
    }

    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    pub fn http_status(&self) -> StatusCode {
        self.code.http_status()
    }

    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    pub fn is_subsystem_failure(&self) -> bool {
        self.code.is_subsystem_failure()
    }

    pub fn severity(&self) -> ErrorSeverity {
        ErrorSeverity::from_code(&self.code)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Logging
    // ─────────────────────────────────────────────────────────────────────────

    /// Log this error with appropriate severity.
    pub fn log(&self) {
        let code = self.code.to_string();
        let category = self.code.category();
        let status = self.http_status().as_u16();

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    details = ?self.details,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                error!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    internal_message = ?self.internal_message,
                    "High severity error"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    "Medium severity error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    http_status = status,
                    user_message = %self.user_message,
                    "Low severity error"
                );
            }
        }
    }

    fn record_metrics(&self) {
        counter!(
            "keystone_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// API Response
// ═══════════════════════════════════════════════════════════════════════════════

/// Error envelope returned to API clients.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Always false for errors
    pub success: bool,

    /// Human-readable summary
    pub message: String,

    /// Error information
    pub error: ErrorInfo,
}

/// Detailed error information for API responses.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    pub numeric_code: u32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl From<&KeystoneError> for ErrorResponse {
    fn from(error: &KeystoneError) -> Self {
        Self {
            success: false,
            message: error.user_message.to_string(),
            error: ErrorInfo {
                code: error.code,
                numeric_code: error.code.numeric_code(),
                message: error.user_message.to_string(),
                details: if error.details.is_empty() {
                    None
                } else {
                    Some(error.details.clone())
                },
                timestamp: chrono::Utc::now(),
            },
        }
    }
}

impl IntoResponse for KeystoneError {
    fn into_response(self) -> Response {
        self.log();

        let status = self.http_status();
        let response = ErrorResponse::from(&self);

        (status, Json(response)).into_response()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Add context to an error.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Add context with error code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| KeystoneError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| KeystoneError::new(code, e.to_string()).with_source(e))
    }
}

impl<T> ErrorContext<T> for Option<T> {
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.ok_or_else(|| KeystoneError::new(ErrorCode::RecordNotFound, message.into()))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.ok_or_else(|| KeystoneError::new(code, "Resource not found"))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations for Common Error Types
// ═══════════════════════════════════════════════════════════════════════════════

impl From<sqlx::Error> for KeystoneError {
    fn from(error: sqlx::Error) -> Self {
        let (code, user_msg) = match &error {
            sqlx::Error::RowNotFound => (
                ErrorCode::RecordNotFound,
                "The requested record was not found",
            ),
            sqlx::Error::Database(db_err) => {
                if let Some(constraint) = db_err.constraint() {
                    if constraint.contains("unique") || constraint.contains("pkey") {
                        return Self::with_internal(
                            ErrorCode::DuplicateRecord,
                            "A record with this identifier already exists",
                            format!("Constraint violation: {}", constraint),
                        )
                        .with_source(error);
                    }
                }
                (ErrorCode::DatabaseQueryFailed, "A database error occurred")
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => (
                ErrorCode::DatabaseConnectionFailed,
                "Unable to connect to the database",
            ),
            _ => (ErrorCode::DatabaseError, "A database error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<redis::RedisError> for KeystoneError {
    fn from(error: redis::RedisError) -> Self {
        let (code, user_msg) = if error.is_connection_refusal() || error.is_connection_dropped() {
            (ErrorCode::CacheConnectionFailed, "Unable to connect to cache")
        } else if error.is_timeout() {
            (ErrorCode::CacheError, "Cache operation timed out")
        } else {
            (ErrorCode::CacheError, "A cache error occurred")
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<serde_json::Error> for KeystoneError {
    fn from(error: serde_json::Error) -> Self {
        let code = if error.is_syntax() || error.is_data() {
            ErrorCode::DeserializationError
        } else if error.is_eof() {
            ErrorCode::InvalidJson
        } else {
            ErrorCode::SerializationError
        };

        Self::with_internal(code, "Failed to process JSON data", error.to_string())
            .with_source(error)
    }
}

impl From<jsonwebtoken::errors::Error> for KeystoneError {
    fn from(error: jsonwebtoken::errors::Error) -> Self {
        use jsonwebtoken::errors::ErrorKind;

        let (code, user_msg) = match error.kind() {
            ErrorKind::ExpiredSignature => (ErrorCode::TokenExpired, "The token has expired"),
            ErrorKind::InvalidKeyFormat | ErrorKind::InvalidRsaKey(_) | ErrorKind::InvalidEcdsaKey => (
                ErrorCode::InvalidConfiguration,
                "The token verification key is invalid",
            ),
            _ => (ErrorCode::InvalidToken, "The token is invalid"),
        };

        Self::with_internal(code, user_msg, error.to_string()).with_source(error)
    }
}

impl From<tokio::time::error::Elapsed> for KeystoneError {
    fn from(error: tokio::time::error::Elapsed) -> Self {
        Self::with_internal(ErrorCode::Timeout, "Operation timed out", error.to_string())
            .with_source(error)
    }
}

impl From<anyhow::Error> for KeystoneError {
    fn from(error: anyhow::Error) -> Self {
        match error.downcast::<KeystoneError>() {
            Ok(keystone_error) => keystone_error,
            Err(error) => Self::with_internal(
                ErrorCode::InternalError,
                "An internal error occurred",
                error.to_string(),
            ),
        }
    }
}

impl From<config::ConfigError> for KeystoneError {
    fn from(error: config::ConfigError) -> Self {
        let (code, user_msg) = match &error {
            config::ConfigError::NotFound(_) => (
                ErrorCode::MissingConfiguration,
                "Required configuration not found",
            ),
            config::ConfigError::PathParse(_) | config::ConfigError::FileParse { .. } => (
                ErrorCode::InvalidConfiguration,
                "Configuration file is invalid",
            ),
            _ => (ErrorCode::ConfigurationError, "Configuration error occurred"),
        };

        Self::with_internal(code, user_msg, error.to_string())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_http_status() {
        assert_eq!(ErrorCode::InvalidToken.http_status(), StatusCode::UNAUTHORIZED);
        assert_eq!(ErrorCode::Forbidden.http_status(), StatusCode::FORBIDDEN);
        assert_eq!(ErrorCode::InvalidPermission.http_status(), StatusCode::BAD_REQUEST);
        assert_eq!(ErrorCode::DuplicateRecord.http_status(), StatusCode::CONFLICT);
        assert_eq!(
            ErrorCode::RuleEngineUnavailable.http_status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_subsystem_classification() {
        assert!(ErrorCode::RuleEngineError.is_subsystem_failure());
        assert!(ErrorCode::DirectoryUnavailable.is_subsystem_failure());
        assert!(ErrorCode::Timeout.is_subsystem_failure());
        assert!(ErrorCode::CircuitOpen.is_subsystem_failure());
        assert!(!ErrorCode::InvalidToken.is_subsystem_failure());
        assert!(!ErrorCode::Forbidden.is_subsystem_failure());
        assert!(!ErrorCode::IntegrityViolation.is_subsystem_failure());
    }

    #[test]
    fn test_error_context() {
        let error = KeystoneError::new(ErrorCode::ValidationError, "Invalid input")
            .with_context("field", "subject_id");

        assert!(error.details().context.contains_key("field"));
    }

    #[test]
    fn test_error_response_envelope() {
        let error = KeystoneError::validation("resource must not be empty");
        let response = ErrorResponse::from(&error);

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["message"], "resource must not be empty");
        assert_eq!(json["error"]["code"], "VALIDATION_ERROR");
    }

    #[test]
    fn test_timeout_constructor() {
        let error = KeystoneError::timeout("rule_engine.enforce", std::time::Duration::from_millis(250));
        assert_eq!(error.code(), ErrorCode::Timeout);
        assert!(error.user_message().contains("250ms"));
        assert!(error.is_subsystem_failure());
    }

    #[test]
    fn test_error_display() {
        let error = KeystoneError::with_internal(
            ErrorCode::DatabaseError,
            "Database connection failed",
            "Connection refused: localhost:5432",
        );

        let display = format!("{}", error);
        assert!(display.contains("DatabaseError"));
        assert!(display.contains("Connection refused"));
    }

    #[test]
    fn test_severity() {
        assert_eq!(ErrorSeverity::from_code(&ErrorCode::Forbidden), ErrorSeverity::Low);
        assert_eq!(ErrorSeverity::from_code(&ErrorCode::Timeout), ErrorSeverity::Medium);
        assert_eq!(
            ErrorSeverity::from_code(&ErrorCode::CacheConnectionFailed),
            ErrorSeverity::Critical
        );
    }
}
