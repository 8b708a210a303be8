//! # Error Handling Module
//!
//! This module defines the error types for the event bus. Failures are
//! classified by kind rather than by concrete type: every failed delivery
//! that reaches the dead letter queue carries one of the [`ErrorKind`]
//! values on its latest failure reason, and bus operations surface
//! structured [`EventBusError`] values instead of unwinding.

use std::fmt;

use thiserror::Error;
use uuid::Uuid;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, EventBusError>;

/// Classification of failures, independent of the concrete error type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Handler invocation exceeded its timeout
    Timeout,
    /// Circuit breaker denied the delivery
    CircuitOpen,
    /// The in-dispatch retry budget was spent
    RetryExhausted,
    /// Schema validation rejected the event
    ValidationFailed,
    /// The poison-message policy flagged the event
    Poison,
    /// A referenced entity does not exist
    NotFound,
    /// Shutdown interrupted the operation
    Cancelled,
    /// Transient I/O failure, worth retrying
    RetryableIo,
    /// Invalid argument or state, not worth retrying
    NonRetryableInput,
    /// Payload could not be serialized or deserialized
    SerializationError,
    /// The subscription was inactive at dispatch time
    SubscriberInactive,
    /// Unclassified internal failure
    Internal,
}

impl ErrorKind {
    /// Default retryability classification
    ///
    /// Argument/state/serialization failures are not retryable;
    /// I/O and timeout failures are; unclassified failures default to
    /// retryable so transient faults are not silently dead-lettered.
    pub fn is_retryable_default(&self) -> bool {
        match self {
            ErrorKind::NonRetryableInput
            | ErrorKind::SerializationError
            | ErrorKind::ValidationFailed
            | ErrorKind::Poison
            | ErrorKind::NotFound
            | ErrorKind::Cancelled
            | ErrorKind::SubscriberInactive => false,
            ErrorKind::Timeout
            | ErrorKind::RetryableIo
            | ErrorKind::CircuitOpen
            | ErrorKind::RetryExhausted
            | ErrorKind::Internal => true,
        }
    }

    /// Stable string form, used as the default error class
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "Timeout",
            ErrorKind::CircuitOpen => "CircuitOpen",
            ErrorKind::RetryExhausted => "RetryExhausted",
            ErrorKind::ValidationFailed => "ValidationFailed",
            ErrorKind::Poison => "Poison",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::RetryableIo => "RetryableIo",
            ErrorKind::NonRetryableInput => "NonRetryableInput",
            ErrorKind::SerializationError => "SerializationError",
            ErrorKind::SubscriberInactive => "SubscriberInactive",
            ErrorKind::Internal => "Internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Failure produced by a subscriber handler
///
/// Handlers return this instead of panicking; the dispatcher captures it,
/// classifies retryability, and converts it into a failure reason.
#[derive(Debug, Clone, Error)]
#[error("{kind}: {message}")]
pub struct HandlerError {
    /// Failure classification
    pub kind: ErrorKind,

    /// Human-readable message
    pub message: String,

    /// Error class override for poison tracking; defaults to the kind name
    pub error_type: Option<String>,

    /// Captured stack trace, if the host supplies one
    pub stack_trace: Option<String>,
}

impl HandlerError {
    /// A transient failure worth retrying
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::RetryableIo,
            message: message.into(),
            error_type: None,
            stack_trace: None,
        }
    }

    /// A permanent failure that must not be retried
    pub fn non_retryable(message: impl Into<String>) -> Self {
        Self {
            kind: ErrorKind::NonRetryableInput,
            message: message.into(),
            error_type: None,
            stack_trace: None,
        }
    }

    /// A failure with an explicit classification
    pub fn with_kind(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            error_type: None,
            stack_trace: None,
        }
    }

    /// A handler timeout
    pub fn timeout(timeout_ms: u64) -> Self {
        Self {
            kind: ErrorKind::Timeout,
            message: format!("handler did not complete within {}ms", timeout_ms),
            error_type: None,
            stack_trace: None,
        }
    }

    /// Override the error class used by the poison-message tracker
    pub fn with_error_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    /// Attach a stack trace
    pub fn with_stack_trace(mut self, trace: impl Into<String>) -> Self {
        self.stack_trace = Some(trace.into());
        self
    }

    /// Error class for poison tracking
    pub fn error_type(&self) -> String {
        self.error_type
            .clone()
            .unwrap_or_else(|| self.kind.as_str().to_string())
    }

    /// Default retryability of this failure
    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable_default()
    }
}

/// Main error type for the event bus
#[derive(Error, Debug)]
pub enum EventBusError {
    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// Schema validation rejected an event at publish time
    #[error("Validation failed for event {event_id} ({event_type}): {message}")]
    Validation {
        message: String,
        event_id: Uuid,
        event_type: String,
        violations: Vec<String>,
    },

    /// No schema registered for the requested type/version
    #[error("Schema not found for {event_type} (version {version:?})")]
    SchemaNotFound {
        event_type: String,
        version: Option<String>,
    },

    /// A schema registration failed the compatibility check
    #[error("Schema {event_type} v{candidate} is incompatible with v{latest}: {message}")]
    SchemaIncompatible {
        event_type: String,
        latest: String,
        candidate: String,
        message: String,
    },

    /// A payload migration step failed or was missing
    #[error("Migration of {event_type} from v{from} to v{to} failed: {message}")]
    MigrationFailed {
        event_type: String,
        from: String,
        to: String,
        message: String,
    },

    /// Dead letter queue errors
    #[error("Dead letter queue error: {message}")]
    DeadLetter {
        message: String,
        dlq_id: Option<Uuid>,
    },

    /// The referenced dead letter entry does not exist
    #[error("Dead letter entry {dlq_id} not found")]
    DlqEntryNotFound { dlq_id: Uuid },

    /// A retry is already in flight for the entry
    #[error("Dead letter entry {dlq_id} is already retrying")]
    RetryInProgress { dlq_id: Uuid },

    /// The entry's retry budget is spent or its status forbids retry
    #[error("Dead letter entry {dlq_id} is not retryable: {message}")]
    RetryNotPermitted { dlq_id: Uuid, message: String },

    /// The bus is shutting down and rejects new work
    #[error("Event bus is shutting down")]
    ShutdownInProgress,

    /// An internal operation exceeded its deadline
    #[error("Timeout after {timeout_ms}ms in {operation}")]
    Timeout { operation: String, timeout_ms: u64 },

    /// Internal errors that never unwind through the publish path
    #[error("Internal error: {message}")]
    Internal {
        message: String,
        context: Option<String>,
    },
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

impl EventBusError {
    /// Shorthand for internal errors
    pub fn internal(message: impl Into<String>) -> Self {
        EventBusError::Internal {
            message: message.into(),
            context: None,
        }
    }

    /// Shorthand for configuration errors
    pub fn configuration(message: impl Into<String>) -> Self {
        EventBusError::Configuration {
            message: message.into(),
        }
    }

    /// Classification of this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            EventBusError::Configuration { .. } => ErrorKind::NonRetryableInput,
            EventBusError::Validation { .. } => ErrorKind::ValidationFailed,
            EventBusError::SchemaNotFound { .. } => ErrorKind::NotFound,
            EventBusError::SchemaIncompatible { .. } => ErrorKind::ValidationFailed,
            EventBusError::MigrationFailed { .. } => ErrorKind::NonRetryableInput,
            EventBusError::DeadLetter { .. } => ErrorKind::Internal,
            EventBusError::DlqEntryNotFound { .. } => ErrorKind::NotFound,
            EventBusError::RetryInProgress { .. } => ErrorKind::Internal,
            EventBusError::RetryNotPermitted { .. } => ErrorKind::RetryExhausted,
            EventBusError::ShutdownInProgress => ErrorKind::Cancelled,
            EventBusError::Timeout { .. } => ErrorKind::Timeout,
            EventBusError::Internal { .. } => ErrorKind::Internal,
        }
    }

    /// Get the error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            EventBusError::Configuration { .. } => ErrorSeverity::High,
            EventBusError::Validation { .. } => ErrorSeverity::Low,
            EventBusError::SchemaNotFound { .. } => ErrorSeverity::Low,
            EventBusError::SchemaIncompatible { .. } => ErrorSeverity::Medium,
            EventBusError::MigrationFailed { .. } => ErrorSeverity::Medium,
            EventBusError::DeadLetter { .. } => ErrorSeverity::Medium,
            EventBusError::DlqEntryNotFound { .. } => ErrorSeverity::Low,
            EventBusError::RetryInProgress { .. } => ErrorSeverity::Low,
            EventBusError::RetryNotPermitted { .. } => ErrorSeverity::Low,
            EventBusError::ShutdownInProgress => ErrorSeverity::Medium,
            EventBusError::Timeout { .. } => ErrorSeverity::Medium,
            EventBusError::Internal { .. } => ErrorSeverity::High,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_retryability() {
        assert!(ErrorKind::Timeout.is_retryable_default());
        assert!(ErrorKind::RetryableIo.is_retryable_default());
        assert!(ErrorKind::Internal.is_retryable_default());
        assert!(!ErrorKind::NonRetryableInput.is_retryable_default());
        assert!(!ErrorKind::SerializationError.is_retryable_default());
        assert!(!ErrorKind::ValidationFailed.is_retryable_default());
    }

    #[test]
    fn test_handler_error_class() {
        let err = HandlerError::retryable("connection refused");
        assert_eq!(err.error_type(), "RetryableIo");
        assert!(err.is_retryable());

        let err = HandlerError::non_retryable("bad payload").with_error_type("ClassCastException");
        assert_eq!(err.error_type(), "ClassCastException");
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_error_kind_mapping() {
        let err = EventBusError::ShutdownInProgress;
        assert_eq!(err.kind(), ErrorKind::Cancelled);

        let err = EventBusError::Timeout {
            operation: "dispatch".to_string(),
            timeout_ms: 500,
        };
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.severity(), ErrorSeverity::Medium);
    }

    #[test]
    fn test_validation_error_display() {
        let err = EventBusError::Validation {
            message: "missing required field: amount".to_string(),
            event_id: Uuid::nil(),
            event_type: "OrderCreated".to_string(),
            violations: vec!["missing_required_field: amount".to_string()],
        };

        let rendered = err.to_string();
        assert!(rendered.contains("OrderCreated"));
        assert!(rendered.contains("amount"));
    }
}
