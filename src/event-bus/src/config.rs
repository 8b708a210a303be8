//! # Configuration Module
//!
//! This module defines the configuration structure for the event bus.
//! It handles loading configuration from environment variables, files,
//! and defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, EventBusError, Result};
use crate::schema::CompatibilityMode;
use crate::types::{PoisonAction, RetryPolicy};

/// Main configuration structure for the event bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBusConfig {
    /// Dispatch engine configuration
    pub bus: BusConfig,

    /// Per-subscriber circuit breaker configuration
    pub circuit_breaker: CircuitBreakerConfig,

    /// Dead letter queue configuration
    pub dead_letter: DeadLetterConfig,

    /// Poison-message policy configuration
    pub poison: PoisonPolicyConfig,

    /// Schema registry configuration
    pub schema: SchemaRegistryConfig,

    /// Tracing configuration
    pub tracing: TracingConfig,
}

impl EventBusConfig {
    /// Load configuration from environment variables and files
    pub fn from_env() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("config/event-bus").required(false))
            .add_source(config::File::with_name("config/event-bus.local").required(false))
            .add_source(
                config::Environment::with_prefix("EVENT_BUS")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .map_err(|e| EventBusError::configuration(format!("failed to load config: {}", e)))?;

        let config: Self = settings
            .try_deserialize()
            .map_err(|e| EventBusError::configuration(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.bus.default_retry.max_attempts == 0 {
            return Err(EventBusError::configuration(
                "bus.default_retry.max_attempts must be at least 1",
            ));
        }
        if self.bus.default_retry.backoff_multiplier < 1.0 {
            return Err(EventBusError::configuration(
                "bus.default_retry.backoff_multiplier must be at least 1.0",
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(EventBusError::configuration(
                "circuit_breaker.failure_threshold must be at least 1",
            ));
        }
        if self.circuit_breaker.permitted_calls_in_half_open == 0 {
            return Err(EventBusError::configuration(
                "circuit_breaker.permitted_calls_in_half_open must be at least 1",
            ));
        }
        if self.dead_letter.max_size == 0 {
            return Err(EventBusError::configuration(
                "dead_letter.max_size must be at least 1",
            ));
        }
        if self.poison.consecutive_failure_threshold == 0 {
            return Err(EventBusError::configuration(
                "poison.consecutive_failure_threshold must be at least 1",
            ));
        }
        if !(0.0..=1.0).contains(&self.tracing.sampling_rate) {
            return Err(EventBusError::configuration(
                "tracing.sampling_rate must be within [0, 1]",
            ));
        }
        Ok(())
    }
}

impl Default for EventBusConfig {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            dead_letter: DeadLetterConfig::default(),
            poison: PoisonPolicyConfig::default(),
            schema: SchemaRegistryConfig::default(),
            tracing: TracingConfig::default(),
        }
    }
}

/// Dispatch engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusConfig {
    /// Executor hint; the tokio runtime treats this as advisory only
    pub use_virtual_threads: bool,

    /// Wire the metrics sink into dispatch, DLQ, breaker, and registry
    pub enable_metrics: bool,

    /// Default handler timeout in milliseconds
    pub default_timeout_ms: u64,

    /// Retry policy applied when a subscription supplies none
    pub default_retry: RetryPolicy,

    /// Grace period for draining in-flight deliveries at shutdown
    pub shutdown_grace_ms: u64,
}

impl BusConfig {
    /// Default handler timeout
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Shutdown drain grace period
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            use_virtual_threads: false,
            enable_metrics: true,
            default_timeout_ms: 30_000,
            default_retry: RetryPolicy::default(),
            shutdown_grace_ms: 5_000,
        }
    }
}

/// Per-subscriber circuit breaker configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Failures that open the breaker
    ///
    /// Despite the rate-style name used by some hosts, this is an
    /// absolute count of consecutive counted failures, not a percentage.
    pub failure_threshold: u32,

    /// Time in milliseconds the breaker stays open before probing
    pub wait_duration_in_open_state_ms: u64,

    /// Consecutive successes in half-open state that close the breaker
    pub permitted_calls_in_half_open: u32,

    /// Error kinds that count as breaker failures; `None` counts all
    pub record_failure_kinds: Option<Vec<ErrorKind>>,
}

impl CircuitBreakerConfig {
    /// Time the breaker stays open before probing
    pub fn wait_duration(&self) -> Duration {
        Duration::from_millis(self.wait_duration_in_open_state_ms)
    }

    /// Whether a failure of the given kind counts toward the threshold
    pub fn records_failure(&self, kind: ErrorKind) -> bool {
        match &self.record_failure_kinds {
            Some(kinds) => kinds.contains(&kind),
            None => true,
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            wait_duration_in_open_state_ms: 30_000,
            permitted_calls_in_half_open: 3,
            record_failure_kinds: None,
        }
    }
}

/// Dead letter queue configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterConfig {
    /// Maximum stored entries; at capacity the oldest 10% are evicted
    pub max_size: usize,

    /// Retention in seconds used by the maintenance purge
    pub default_retention_seconds: u64,

    /// Enable the auto-retry scheduler for newly stored entries
    pub auto_retry_enabled: bool,

    /// Retry policy driving auto-retry delays
    pub auto_retry_policy: RetryPolicy,

    /// Interval in seconds between maintenance sweeps
    pub maintenance_interval_seconds: u64,
}

impl DeadLetterConfig {
    /// Retention window for the maintenance purge
    pub fn default_retention(&self) -> Duration {
        Duration::from_secs(self.default_retention_seconds)
    }

    /// Interval between maintenance sweeps
    pub fn maintenance_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_interval_seconds)
    }
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            max_size: 10_000,
            default_retention_seconds: 7 * 24 * 3600,
            auto_retry_enabled: false,
            auto_retry_policy: RetryPolicy::default(),
            maintenance_interval_seconds: 300,
        }
    }
}

/// Poison-message policy configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoisonPolicyConfig {
    /// Consecutive same-class failures tolerated before declaring poison
    pub consecutive_failure_threshold: u32,

    /// Action taken when an event is declared poison
    pub action: PoisonAction,

    /// Tracker time-to-live in seconds
    pub tracker_ttl_seconds: u64,

    /// Maximum tracked event ids
    pub max_trackers: usize,
}

impl PoisonPolicyConfig {
    /// Tracker time-to-live
    pub fn tracker_ttl(&self) -> Duration {
        Duration::from_secs(self.tracker_ttl_seconds)
    }
}

impl Default for PoisonPolicyConfig {
    fn default() -> Self {
        Self {
            consecutive_failure_threshold: 3,
            action: PoisonAction::Quarantine,
            tracker_ttl_seconds: 3600,
            max_trackers: 10_000,
        }
    }
}

/// Schema registry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaRegistryConfig {
    /// Check new schema versions against the prior latest on register
    pub enforce_compatibility: bool,

    /// Validate events against their schema at publish time
    pub enforce_schema_validation: bool,

    /// Allow registering additional versions for a known event type
    pub allow_schema_evolution: bool,

    /// Compatibility rule applied when a schema specifies none
    pub default_compatibility: CompatibilityMode,

    /// Treat unknown payload fields as errors rather than warnings
    pub strict_validation: bool,

    /// New schemas may add required fields under BACKWARD checking
    pub allow_required_field_additions: bool,

    /// New schemas may remove fields under BACKWARD checking
    pub allow_field_removals: bool,

    /// New schemas may change field types beyond the widening set
    pub allow_field_type_changes: bool,

    /// New schemas may add optional fields under FORWARD checking
    pub allow_extra_fields: bool,

    /// Bound on the migration path cache
    pub max_cache_size: usize,
}

impl Default for SchemaRegistryConfig {
    fn default() -> Self {
        Self {
            enforce_compatibility: true,
            enforce_schema_validation: false,
            allow_schema_evolution: true,
            default_compatibility: CompatibilityMode::Backward,
            strict_validation: false,
            allow_required_field_additions: false,
            allow_field_removals: false,
            allow_field_type_changes: false,
            allow_extra_fields: true,
            max_cache_size: 1_000,
        }
    }
}

/// Tracing configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracingConfig {
    /// Master switch for the tracing hook
    pub enabled: bool,

    /// Fraction of root traces that are sampled, within [0, 1]
    pub sampling_rate: f64,

    /// Capture stack traces on recorded errors
    pub include_stack_trace: bool,

    /// Export finished spans without blocking the dispatch path
    pub enable_async_tracing: bool,

    /// Bound on attributes per span
    pub max_span_attributes: usize,

    /// Bound on events per span
    pub max_span_events: usize,

    /// Service name stamped on spans
    pub service_name: String,

    /// Service version stamped on spans
    pub service_version: String,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            sampling_rate: 1.0,
            include_stack_trace: false,
            enable_async_tracing: true,
            max_span_attributes: 64,
            max_span_events: 64,
            service_name: "event-bus".to_string(),
            service_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EventBusConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_sampling_rate_rejected() {
        let mut config = EventBusConfig::default();
        config.tracing.sampling_rate = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_retry_config_rejected() {
        let mut config = EventBusConfig::default();
        config.bus.default_retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_breaker_failure_kind_filter() {
        let mut config = CircuitBreakerConfig::default();
        assert!(config.records_failure(ErrorKind::Timeout));
        assert!(config.records_failure(ErrorKind::NonRetryableInput));

        config.record_failure_kinds = Some(vec![ErrorKind::Timeout, ErrorKind::RetryableIo]);
        assert!(config.records_failure(ErrorKind::Timeout));
        assert!(!config.records_failure(ErrorKind::NonRetryableInput));
    }

    #[test]
    fn test_duration_accessors() {
        let config = EventBusConfig::default();
        assert_eq!(config.bus.default_timeout(), Duration::from_secs(30));
        assert_eq!(config.circuit_breaker.wait_duration(), Duration::from_secs(30));
        assert_eq!(
            config.dead_letter.default_retention(),
            Duration::from_secs(7 * 24 * 3600)
        );
    }

    #[test]
    fn test_config_serialization_round_trip() {
        let config = EventBusConfig::default();
        let serialized = serde_json::to_string(&config).unwrap();
        let deserialized: EventBusConfig = serde_json::from_str(&serialized).unwrap();
        assert_eq!(config, deserialized);
    }
}
