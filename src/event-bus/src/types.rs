//! # Event Bus Types
//!
//! Core types, enums, and data structures shared across the event bus.
//! This module defines the vocabulary used by the dispatch engine, the
//! dead letter queue, the circuit breaker, and the schema registry.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorKind, HandlerError};

/// Event priority levels for dispatch ordering
///
/// The derived ordering is `Low < Normal < High < Critical`; subscription
/// lists are sorted by descending priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventPriority {
    /// Low priority events for background operations
    Low,
    /// Normal priority events for standard operations
    Normal,
    /// High priority events for important operations
    High,
    /// Critical events that must be processed first
    Critical,
}

impl Default for EventPriority {
    fn default() -> Self {
        EventPriority::Normal
    }
}

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, deliveries pass through
    Closed,
    /// Breaker is open, deliveries fail fast
    Open,
    /// Testing whether the subscriber recovered, limited deliveries allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Lifecycle status of a dead letter queue entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterStatus {
    /// Entry is stored and awaiting retry
    Failed,
    /// A retry is currently in flight for this entry
    Retrying,
    /// The retry budget is spent; manual intervention or purge only
    Exhausted,
    /// A retry succeeded and the entry was resolved
    Resolved,
    /// The entry was dropped by policy without storage
    Discarded,
    /// The entry was quarantined by the poison-message policy
    Quarantined,
    /// The entry requires an operator decision before any retry
    PendingManual,
    /// The entry was cancelled during shutdown
    Cancelled,
}

impl std::fmt::Display for DeadLetterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeadLetterStatus::Failed => write!(f, "failed"),
            DeadLetterStatus::Retrying => write!(f, "retrying"),
            DeadLetterStatus::Exhausted => write!(f, "exhausted"),
            DeadLetterStatus::Resolved => write!(f, "resolved"),
            DeadLetterStatus::Discarded => write!(f, "discarded"),
            DeadLetterStatus::Quarantined => write!(f, "quarantined"),
            DeadLetterStatus::PendingManual => write!(f, "pending_manual"),
            DeadLetterStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Aggregate health of the dead letter queue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqHealth {
    /// Problem ratio and entry age are within bounds
    Healthy,
    /// Elevated problem ratio or aging entries
    Warning,
    /// Majority of entries are stuck or the oldest entry is very old
    Critical,
    /// The queue itself is inoperative
    Failed,
}

/// Action taken when the poison-message policy trips
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoisonAction {
    /// Store the entry with `Quarantined` status, excluded from auto-retry
    Quarantine,
    /// Drop the event entirely, keeping only a counter
    Discard,
    /// Store the entry with `PendingManual` status
    RequireManual,
}

/// Pipeline stage at which a delivery failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStage {
    /// Schema validation before dispatch
    Validation,
    /// Subscription filter evaluation
    Filter,
    /// Circuit breaker gate
    CircuitBreaker,
    /// Handler invocation
    Handler,
    /// In-dispatch retry attempt
    Retry,
    /// Dead letter queue retry
    DlqRetry,
}

impl std::fmt::Display for ProcessingStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessingStage::Validation => write!(f, "validation"),
            ProcessingStage::Filter => write!(f, "filter"),
            ProcessingStage::CircuitBreaker => write!(f, "circuit_breaker"),
            ProcessingStage::Handler => write!(f, "handler"),
            ProcessingStage::Retry => write!(f, "retry"),
            ProcessingStage::DlqRetry => write!(f, "dlq_retry"),
        }
    }
}

/// Retry policy with exponential backoff
///
/// The delay for attempt `n` (1-based) is
/// `initial_delay * backoff_multiplier^(n-1)`, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first
    pub max_attempts: u32,

    /// Initial delay in milliseconds
    pub initial_delay_ms: u64,

    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,

    /// Maximum delay in milliseconds
    pub max_delay_ms: u64,

    /// Add random jitter (±30%) to each delay
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 100,
            backoff_multiplier: 2.0,
            max_delay_ms: 30_000,
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before the given attempt (1-based)
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let base = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent as i32);
        let capped = base.min(self.max_delay_ms as f64);

        let millis = if self.jitter {
            use rand::Rng;
            let factor = rand::thread_rng().gen_range(0.7..1.3);
            (capped * factor) as u64
        } else {
            capped as u64
        };

        Duration::from_millis(millis)
    }

    /// Whether another attempt remains after `attempt` attempts were used
    pub fn has_attempts_left(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Recorded reason for a single failed processing attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReason {
    /// When the failure occurred
    pub timestamp: DateTime<Utc>,

    /// Error class, used by the poison-message tracker
    pub error_type: String,

    /// Human-readable error message
    pub error_message: String,

    /// Captured stack trace, if enabled
    pub stack_trace: Option<String>,

    /// Pipeline stage at which the failure occurred
    pub processing_stage: ProcessingStage,

    /// Subscriber that observed the failure
    pub consumer_info: String,

    /// Attempt number within the delivery (0 when no handler ran)
    pub attempt_number: u32,

    /// Set when the poison-message policy flagged this failure
    pub is_poison_message: bool,

    /// Whether the failure was classified as retryable
    pub is_retryable: bool,
}

impl FailureReason {
    /// Build a failure reason from a handler error
    pub fn from_handler_error(
        err: &HandlerError,
        stage: ProcessingStage,
        consumer: impl Into<String>,
        attempt: u32,
        is_retryable: bool,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            error_type: err.error_type(),
            error_message: err.message.clone(),
            stack_trace: err.stack_trace.clone(),
            processing_stage: stage,
            consumer_info: consumer.into(),
            attempt_number: attempt,
            is_poison_message: false,
            is_retryable,
        }
    }

    /// Failure reason recorded when the circuit breaker denies a delivery
    ///
    /// The handler never ran, so the attempt number is zero.
    pub fn subscriber_unavailable(consumer: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            error_type: "SubscriberUnavailable".to_string(),
            error_message: "circuit breaker is open for this subscriber".to_string(),
            stack_trace: None,
            processing_stage: ProcessingStage::CircuitBreaker,
            consumer_info: consumer.into(),
            attempt_number: 0,
            is_poison_message: false,
            is_retryable: true,
        }
    }

    /// Error kind implied by this reason's stage and error class
    pub fn kind(&self) -> ErrorKind {
        match self.processing_stage {
            ProcessingStage::CircuitBreaker => ErrorKind::CircuitOpen,
            ProcessingStage::Validation => ErrorKind::ValidationFailed,
            _ if self.error_type == "Timeout" => ErrorKind::Timeout,
            _ if self.is_poison_message => ErrorKind::Poison,
            _ => ErrorKind::Internal,
        }
    }
}

/// Outcome of a single (event, subscription) delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The handler completed successfully
    Delivered,
    /// The subscription filter rejected the event
    Filtered,
    /// The subscription was inactive at dispatch time
    Inactive,
    /// The delivery failed and a dead letter entry was stored
    DeadLettered {
        dlq_id: Uuid,
        status: DeadLetterStatus,
    },
    /// The delivery failed with dead-lettering disabled; only counted
    Dropped,
    /// The poison-message policy discarded the event
    Discarded,
    /// Shutdown interrupted the delivery
    Cancelled,
}

impl DeliveryOutcome {
    /// Whether the delivery reached the handler and succeeded
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered)
    }
}

/// Snapshot of per-subscription counters
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SubscriptionStats {
    /// Subscription identity
    pub subscription_id: Uuid,

    /// Stable subscriber identifier
    pub subscriber_id: String,

    /// Event type the subscription listens to
    pub event_type: String,

    /// Successfully processed deliveries
    pub processed: u64,

    /// Failed deliveries (after retry)
    pub failed: u64,

    /// Timestamp of the last successful delivery
    pub last_processed_at: Option<DateTime<Utc>>,

    /// Message of the last failure, if any
    pub last_error: Option<String>,
}

/// Aggregate statistics over the dead letter queue
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DlqStatistics {
    /// Entries currently stored
    pub total_entries: usize,

    /// Entries by lifecycle status
    pub by_status: HashMap<DeadLetterStatus, u64>,

    /// Entries by event type
    pub by_event_type: HashMap<String, u64>,

    /// Entries by error class of the latest failure
    pub by_error_type: HashMap<String, u64>,

    /// Mean retry count across stored entries
    pub average_retry_count: f64,

    /// Age in seconds of the oldest stored entry
    pub oldest_entry_age_seconds: Option<i64>,

    /// Total entries stored over the queue lifetime
    pub total_stored: u64,

    /// Total entries resolved over the queue lifetime
    pub total_resolved: u64,

    /// Health rollup derived from problem ratio and entry age
    pub health: DlqHealth,
}

/// Counters maintained by the poison-message policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoisonMessageStatistics {
    /// Events declared poison over the policy lifetime
    pub total_poison_messages: u64,

    /// Poison events quarantined
    pub total_quarantined: u64,

    /// Poison events discarded
    pub total_discarded: u64,

    /// Poison events routed to manual intervention
    pub total_manual: u64,

    /// Trackers currently held for failing event ids
    pub active_trackers: usize,
}
