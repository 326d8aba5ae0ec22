//! Structured error handling for Bastion Core.
//!
//! This module provides:
//! - A single error type carrying a machine-readable [`ErrorCode`]
//! - Retry classification so callers can tell transient cluster faults
//!   from permanent validation failures without parsing messages
//! - Structured details (entity, leader hint, retry hint)
//! - Error logging with tracing integration
//! - Metrics integration for error tracking
//!
//! # Usage
//!
//! ```rust,ignore
//! use bastion_core::error::{AclError, Result, ErrorCode};
//!
//! fn lookup(id: &str) -> Result<()> {
//!     Err(AclError::not_found("policy", id))
//! }
//!
//! match lookup("abc") {
//!     Err(e) if e.is_retryable() => { /* back off and retry */ }
//!     Err(e) => assert_eq!(e.code(), ErrorCode::NotFound),
//!     Ok(()) => {}
//! }
//! ```

use metrics::counter;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;
use tracing::{error, warn};

use crate::telemetry::SecretRedactor;

// ═══════════════════════════════════════════════════════════════════════════════
// Result Type Alias
// ═══════════════════════════════════════════════════════════════════════════════

/// A specialized Result type for Bastion operations.
pub type Result<T> = std::result::Result<T, AclError>;

// ═══════════════════════════════════════════════════════════════════════════════
// Error Codes
// ═══════════════════════════════════════════════════════════════════════════════

/// Machine-readable error codes.
///
/// These codes are stable and can be used by clients for programmatic error handling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Rule Errors (1000-1099)
    RuleSyntax,
    RuleSemantic,

    // Policy Store Errors (1100-1199)
    InvalidInput,
    Conflict,
    NotFound,

    // Consensus Errors (2000-2099)
    NoLeader,
    NotLeaderAnymore,
    Timeout,
    Cancelled,

    // Authorization (4000-4099)
    PermissionDenied,
    InvalidToken,

    // System Errors (5000-5099)
    Storage,
    Serialization,
    Configuration,

    // Internal Errors (9000-9099)
    Internal,
}

impl ErrorCode {
    /// Get the numeric code for this error.
    pub const fn numeric_code(&self) -> u32 {
        match self {
            Self::RuleSyntax => 1000,
            Self::RuleSemantic => 1001,

            Self::InvalidInput => 1100,
            Self::Conflict => 1101,
            Self::NotFound => 1102,

            Self::NoLeader => 2000,
            Self::NotLeaderAnymore => 2001,
            Self::Timeout => 2002,
            Self::Cancelled => 2003,

            Self::PermissionDenied => 4000,
            Self::InvalidToken => 4001,

            Self::Storage => 5000,
            Self::Serialization => 5001,
            Self::Configuration => 5002,

            Self::Internal => 9000,
        }
    }

    /// Check if this error is transient and safe to retry automatically.
    ///
    /// Only cluster-state faults qualify. `Conflict`, `Timeout` and
    /// `Cancelled` require the caller to re-read first.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::NoLeader | Self::NotLeaderAnymore)
    }

    /// Whether the caller should re-read current state before deciding what to do.
    pub const fn requires_reread(&self) -> bool {
        matches!(self, Self::Conflict | Self::Timeout | Self::Cancelled)
    }

    /// Get the error category for grouping.
    pub const fn category(&self) -> &'static str {
        match self.numeric_code() {
            1000..=1099 => "rules",
            1100..=1199 => "store",
            2000..=2099 => "consensus",
            4000..=4099 => "authorization",
            5000..=5099 => "system",
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
    /// User errors (bad input, bad rules, lookups of missing records)
    Low,
    /// Operational issues (leader churn, timeouts)
    Medium,
    /// Security-relevant outcomes kept for audit
    High,
    /// System faults requiring attention
    Critical,
}

impl ErrorSeverity {
    /// Get severity based on error code.
    pub const fn from_code(code: &ErrorCode) -> Self {
        match code {
            ErrorCode::RuleSyntax
            | ErrorCode::RuleSemantic
            | ErrorCode::InvalidInput
            | ErrorCode::Conflict
            | ErrorCode::NotFound => Self::Low,

            ErrorCode::NoLeader
            | ErrorCode::NotLeaderAnymore
            | ErrorCode::Timeout
            | ErrorCode::Cancelled => Self::Medium,

            ErrorCode::PermissionDenied | ErrorCode::InvalidToken => Self::High,

            ErrorCode::Storage
            | ErrorCode::Serialization
            | ErrorCode::Configuration
            | ErrorCode::Internal => Self::Critical,
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

    /// Related entity ID (policy, token, ...)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,

    /// Related entity type
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,

    /// Last known leader, for retrying against a refreshed target
    #[serde(skip_serializing_if = "Option::is_none")]
    pub leader_hint: Option<String>,

    /// Suggested backoff before retrying
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,

    /// Source position for rule compilation errors
    #[serde(skip_serializing_if = "Option::is_none")]
    pub position: Option<(usize, usize)>,
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

    pub fn with_leader_hint(mut self, leader: impl Into<String>) -> Self {
        self.leader_hint = Some(leader.into());
        self
    }

    pub fn with_retry_after(mut self, millis: u64) -> Self {
        self.retry_after_ms = Some(millis);
        self
    }

    pub fn with_position(mut self, line: usize, column: usize) -> Self {
        self.position = Some((line, column));
        self
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Main Error Type
// ═══════════════════════════════════════════════════════════════════════════════

/// The error type for every Bastion operation.
///
/// Carries a stable [`ErrorCode`], a human message, structured details and
/// an optional source error.
#[derive(Error, Debug)]
pub struct AclError {
    /// Machine-readable error code
    code: ErrorCode,

    /// Human-readable message
    message: Cow<'static, str>,

    /// Additional structured details
    details: ErrorDetails,

    /// The source error that caused this error
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl fmt::Display for AclError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

impl AclError {
    // ─────────────────────────────────────────────────────────────────────────
    // Constructors
    // ─────────────────────────────────────────────────────────────────────────

    /// Create a new error with code and message.
    pub fn new(code: ErrorCode, message: impl Into<Cow<'static, str>>) -> Self {
        let error = Self {
            code,
            message: message.into(),
            details: ErrorDetails::default(),
            source: None,
        };
        error.record_metrics();
        error
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    /// Create a not found error.
    pub fn not_found(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        let entity_type = entity_type.into();
        let entity_id = entity_id.into();
        Self::new(
            ErrorCode::NotFound,
            format!("{} not found: {}", entity_type, entity_id),
        )
        .with_details(ErrorDetails::new().with_entity(&entity_type, &entity_id))
    }

    /// Create a conflict error.
    pub fn conflict(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::Conflict, message)
    }

    /// Create an invalid input error.
    pub fn invalid_input(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    /// Create a rule syntax error at a source position.
    pub fn syntax(line: usize, column: usize, message: impl Into<String>) -> Self {
        Self::new(
            ErrorCode::RuleSyntax,
            format!("{}:{}: {}", line, column, message.into()),
        )
        .with_details(ErrorDetails::new().with_position(line, column))
    }

    /// Create a rule semantic error.
    pub fn semantic(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::RuleSemantic, message)
    }

    /// Create a permission denied error.
    ///
    /// The message names the missing privilege only, never the target.
    pub fn permission_denied(required: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::PermissionDenied,
            format!("Permission denied: token lacks {}", required),
        )
    }

    /// Create an invalid token error.
    pub fn invalid_token() -> Self {
        Self::new(ErrorCode::InvalidToken, "ACL token not found or expired")
    }

    /// Create a no-leader error.
    pub fn no_leader() -> Self {
        Self::new(ErrorCode::NoLeader, "No cluster leader")
            .with_details(ErrorDetails::new().with_retry_after(250))
    }

    /// Create a stale-term error pointing at the current leader, if known.
    pub fn not_leader_anymore(stale_term: u64, current_term: u64, leader: Option<&str>) -> Self {
        let mut details = ErrorDetails::new()
            .with_context("stale_term", stale_term)
            .with_context("current_term", current_term)
            .with_retry_after(50);
        if let Some(leader) = leader {
            details = details.with_leader_hint(leader);
        }
        Self::new(
            ErrorCode::NotLeaderAnymore,
            format!(
                "Leadership changed: request term {} is behind cluster term {}",
                stale_term, current_term
            ),
        )
        .with_details(details)
    }

    /// Create a timeout error for a submitted entry whose outcome is unknown.
    pub fn timeout(what: impl fmt::Display) -> Self {
        Self::new(
            ErrorCode::Timeout,
            format!("Timed out waiting for {}; the write may still commit", what),
        )
    }

    /// Create a cancellation error for a submitted entry whose outcome is unknown.
    pub fn cancelled() -> Self {
        Self::new(
            ErrorCode::Cancelled,
            "Request cancelled by caller; the write may still commit",
        )
    }

    /// Create a configuration error.
    pub fn configuration(message: impl Into<Cow<'static, str>>) -> Self {
        Self::new(ErrorCode::Configuration, message)
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

    /// Get the error code.
    pub fn code(&self) -> ErrorCode {
        self.code
    }

    /// Get the human-readable message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Get the error details.
    pub fn details(&self) -> &ErrorDetails {
        &self.details
    }

    /// Last known leader, if this error carries one.
    pub fn leader_hint(&self) -> Option<&str> {
        self.details.leader_hint.as_deref()
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        self.code.is_retryable()
    }

    /// Get the error severity.
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
        let message = SecretRedactor::global().redact(&self.message);

        match self.severity() {
            ErrorSeverity::Critical => {
                error!(
                    error_code = %code,
                    category = category,
                    message = %message,
                    details = ?self.details,
                    source = ?self.source,
                    "CRITICAL ERROR"
                );
            }
            ErrorSeverity::High => {
                warn!(
                    error_code = %code,
                    category = category,
                    message = %message,
                    audit = true,
                    "Authorization failure"
                );
            }
            ErrorSeverity::Medium => {
                warn!(
                    error_code = %code,
                    category = category,
                    message = %message,
                    leader_hint = ?self.details.leader_hint,
                    "Transient cluster error"
                );
            }
            ErrorSeverity::Low => {
                tracing::debug!(
                    error_code = %code,
                    category = category,
                    message = %message,
                    "Request rejected"
                );
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Metrics
    // ─────────────────────────────────────────────────────────────────────────

    fn record_metrics(&self) {
        counter!(
            "bastion_errors_total",
            "code" => self.code.to_string(),
            "category" => self.code.category().to_string(),
            "retryable" => self.is_retryable().to_string(),
        )
        .increment(1);
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Error Context Extension Trait
// ═══════════════════════════════════════════════════════════════════════════════

/// Extension trait for adding context to errors.
pub trait ErrorContext<T> {
    /// Wrap the error as an internal error with a message.
    fn context(self, message: impl Into<String>) -> Result<T>;

    /// Wrap the error with a specific code.
    fn with_error_code(self, code: ErrorCode) -> Result<T>;
}

impl<T, E> ErrorContext<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn context(self, message: impl Into<String>) -> Result<T> {
        self.map_err(|e| AclError::internal(message.into()).with_source(e))
    }

    fn with_error_code(self, code: ErrorCode) -> Result<T> {
        self.map_err(|e| AclError::new(code, e.to_string()).with_source(e))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// From Implementations
// ═══════════════════════════════════════════════════════════════════════════════

impl From<std::io::Error> for AclError {
    fn from(error: std::io::Error) -> Self {
        AclError::new(ErrorCode::Storage, format!("Log storage I/O failed: {}", error))
            .with_source(error)
    }
}

impl From<serde_json::Error> for AclError {
    fn from(error: serde_json::Error) -> Self {
        AclError::new(
            ErrorCode::Serialization,
            format!("Serialization failed: {}", error),
        )
        .with_source(error)
    }
}

impl From<config::ConfigError> for AclError {
    fn from(error: config::ConfigError) -> Self {
        AclError::configuration(error.to_string()).with_source(error)
    }
}

impl From<uuid::Error> for AclError {
    fn from(error: uuid::Error) -> Self {
        AclError::invalid_input(format!("Invalid UUID: {}", error)).with_source(error)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_errors_are_retryable() {
        assert!(ErrorCode::NoLeader.is_retryable());
        assert!(ErrorCode::NotLeaderAnymore.is_retryable());
        assert!(!ErrorCode::RuleSyntax.is_retryable());
        assert!(!ErrorCode::Conflict.is_retryable());
        assert!(!ErrorCode::PermissionDenied.is_retryable());
        assert!(!ErrorCode::Timeout.is_retryable());
    }

    #[test]
    fn test_reread_classification() {
        assert!(ErrorCode::Conflict.requires_reread());
        assert!(ErrorCode::Timeout.requires_reread());
        assert!(!ErrorCode::NotFound.requires_reread());
    }

    #[test]
    fn test_categories() {
        assert_eq!(ErrorCode::RuleSemantic.category(), "rules");
        assert_eq!(ErrorCode::Conflict.category(), "store");
        assert_eq!(ErrorCode::NoLeader.category(), "consensus");
        assert_eq!(ErrorCode::InvalidToken.category(), "authorization");
        assert_eq!(ErrorCode::Storage.category(), "system");
    }

    #[test]
    fn test_not_found_details() {
        let err = AclError::not_found("policy", "abc");
        assert_eq!(err.code(), ErrorCode::NotFound);
        assert_eq!(err.details().entity_type.as_deref(), Some("policy"));
        assert_eq!(err.details().entity_id.as_deref(), Some("abc"));
    }

    #[test]
    fn test_not_leader_anymore_carries_hint() {
        let err = AclError::not_leader_anymore(3, 4, Some("node-2"));
        assert!(err.is_retryable());
        assert_eq!(err.leader_hint(), Some("node-2"));
        assert!(err.message().contains("term 3"));
    }

    #[test]
    fn test_syntax_error_position() {
        let err = AclError::syntax(2, 7, "expected '{'");
        assert_eq!(err.code(), ErrorCode::RuleSyntax);
        assert_eq!(err.details().position, Some((2, 7)));
        assert_eq!(err.to_string(), "[RuleSyntax] 2:7: expected '{'");
    }

    #[test]
    fn test_permission_denied_does_not_name_target() {
        let err = AclError::permission_denied("acl:write");
        assert_eq!(err.severity(), ErrorSeverity::High);
        assert!(err.message().contains("acl:write"));
    }

    #[test]
    fn test_error_context() {
        let result: std::result::Result<(), std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::Other, "disk gone"));
        let err = result.context("flushing log").unwrap_err();
        assert_eq!(err.code(), ErrorCode::Internal);
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_error_code_serialization() {
        let json = serde_json::to_string(&ErrorCode::NotLeaderAnymore).unwrap();
        assert_eq!(json, "\"NOT_LEADER_ANYMORE\"");
    }
}
