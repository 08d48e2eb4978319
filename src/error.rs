//! # Error Handling Module
//!
//! Structured error types for the event processing core, with severity,
//! retryability, and category classification used by the worker pool's
//! retry pipeline and by the HTTP adapter's status-code mapping.

use std::fmt;
use thiserror::Error;
use uuid::Uuid;

/// Main error type for the event processing core
#[derive(Error, Debug)]
pub enum CoreError {
    /// Configuration errors, surfaced only at startup
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Log service errors (Redis Streams append/read/delete failures)
    #[error("log error: {message}")]
    Log {
        message: String,
        stream: Option<String>,
        retry_after: Option<u64>,
    },

    /// Event validation errors: malformed event, oversize batch
    #[error("validation error: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    /// Event processing errors: enrichment, anomaly detection, processed-log append
    #[error("processing error: {message}")]
    Processing {
        message: String,
        event_id: Option<Uuid>,
        retryable: bool,
    },

    /// Serialization/deserialization errors at the log or broadcast boundary
    #[error("serialization error: {message}")]
    Serialization { message: String },

    /// Broadcast/send failures to a subscriber session
    #[error("broadcast error: {message}")]
    Broadcast { message: String },

    /// Timeout on a blocking log read or a shutdown wait
    #[error("timeout error: {message}")]
    Timeout { message: String, operation: String },

    /// Unrecoverable setup error (e.g. cannot connect to the log at startup)
    #[error("internal error: {message}")]
    Internal { message: String },
}

/// Error severity levels for categorization and alerting
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Low => write!(f, "low"),
            ErrorSeverity::Medium => write!(f, "medium"),
            ErrorSeverity::High => write!(f, "high"),
            ErrorSeverity::Critical => write!(f, "critical"),
        }
    }
}

impl CoreError {
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            CoreError::Configuration { .. } => ErrorSeverity::High,
            CoreError::Log { .. } => ErrorSeverity::Medium,
            CoreError::Validation { .. } => ErrorSeverity::Low,
            CoreError::Processing { .. } => ErrorSeverity::Medium,
            CoreError::Serialization { .. } => ErrorSeverity::Low,
            CoreError::Broadcast { .. } => ErrorSeverity::Low,
            CoreError::Timeout { .. } => ErrorSeverity::Medium,
            CoreError::Internal { .. } => ErrorSeverity::Critical,
        }
    }

    /// Whether the worker loop should retry the operation that produced this error.
    /// Validation errors are never retried; log and processing errors are,
    /// subject to the retry scheduler's attempt budget.
    pub fn is_retryable(&self) -> bool {
        match self {
            CoreError::Configuration { .. } => false,
            CoreError::Log { .. } => true,
            CoreError::Validation { .. } => false,
            CoreError::Processing { retryable, .. } => *retryable,
            CoreError::Serialization { .. } => false,
            CoreError::Broadcast { .. } => false,
            CoreError::Timeout { .. } => true,
            CoreError::Internal { .. } => false,
        }
    }

    /// Error category for metrics labels and HTTP error bodies
    pub fn category(&self) -> &'static str {
        match self {
            CoreError::Configuration { .. } => "configuration",
            CoreError::Log { .. } => "log",
            CoreError::Validation { .. } => "validation",
            CoreError::Processing { .. } => "processing",
            CoreError::Serialization { .. } => "serialization",
            CoreError::Broadcast { .. } => "broadcast",
            CoreError::Timeout { .. } => "timeout",
            CoreError::Internal { .. } => "internal",
        }
    }

    /// HTTP status code the adapter should map this error to
    pub fn status_code(&self) -> u16 {
        match self {
            CoreError::Validation { .. } => 400,
            CoreError::Configuration { .. } | CoreError::Internal { .. } => 500,
            CoreError::Log { .. } | CoreError::Timeout { .. } => 503,
            CoreError::Processing { .. } | CoreError::Serialization { .. } | CoreError::Broadcast { .. } => 500,
        }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn log<S: Into<String>>(message: S, stream: impl Into<Option<String>>) -> Self {
        Self::Log {
            message: message.into(),
            stream: stream.into(),
            retry_after: Some(1),
        }
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
            field: None,
        }
    }

    pub fn processing<S: Into<String>>(message: S, event_id: Option<Uuid>, retryable: bool) -> Self {
        Self::Processing {
            message: message.into(),
            event_id,
            retryable,
        }
    }

    pub fn broadcast<S: Into<String>>(message: S) -> Self {
        Self::Broadcast {
            message: message.into(),
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }
}

/// Result type for core operations
pub type Result<T> = std::result::Result<T, CoreError>;

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization {
            message: err.to_string(),
        }
    }
}

impl From<redis::RedisError> for CoreError {
    fn from(err: redis::RedisError) -> Self {
        CoreError::Log {
            message: err.to_string(),
            stream: None,
            retry_after: Some(5),
        }
    }
}

impl From<tokio::time::error::Elapsed> for CoreError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        CoreError::Timeout {
            message: err.to_string(),
            operation: "unknown".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering_matches_config_over_validation() {
        let config_error = CoreError::configuration("bad config");
        let validation_error = CoreError::validation("bad field");
        assert!(config_error.severity() > validation_error.severity());
    }

    #[test]
    fn validation_errors_are_never_retryable() {
        let validation_error = CoreError::validation("missing timestamp");
        assert!(!validation_error.is_retryable());
    }

    #[test]
    fn processing_retryability_follows_flag() {
        let retryable = CoreError::processing("transient", None, true);
        let terminal = CoreError::processing("permanent", None, false);
        assert!(retryable.is_retryable());
        assert!(!terminal.is_retryable());
    }

    #[test]
    fn status_codes_map_by_category() {
        assert_eq!(CoreError::validation("x").status_code(), 400);
        assert_eq!(CoreError::log("x", None).status_code(), 503);
        assert_eq!(CoreError::internal("x").status_code(), 500);
    }

    #[test]
    fn redis_error_converts_to_log_category() {
        let redis_err = redis::RedisError::from((redis::ErrorKind::IoError, "disconnected"));
        let core_err: CoreError = redis_err.into();
        assert_eq!(core_err.category(), "log");
        assert!(core_err.is_retryable());
    }

    #[test]
    fn severity_ordering_total() {
        assert!(ErrorSeverity::Low < ErrorSeverity::Medium);
        assert!(ErrorSeverity::Medium < ErrorSeverity::High);
        assert!(ErrorSeverity::High < ErrorSeverity::Critical);
    }
}
