//! # Metrics Facade
//!
//! Pluggable counters and timers consumed by the dispatch engine, the
//! dead letter queue, the circuit breaker registry, and the schema
//! registry. The default sink drops everything; the Prometheus sink
//! registers the counters on a private registry and renders them in text
//! exposition format.

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use prometheus::{
    histogram_opts, opts, register_histogram_with_registry,
    register_int_counter_with_registry, Encoder, Histogram, IntCounter, Registry, TextEncoder,
};

use crate::error::{ErrorKind, EventBusError, Result};
use crate::types::CircuitState;

/// Metrics sink consumed by the bus components
///
/// All methods default to no-ops so custom sinks only implement what
/// they care about.
pub trait EventBusMetrics: Send + Sync {
    /// An event passed pre-dispatch checks and was fanned out
    fn record_event_published(&self, _event_type: &str, _source: &str) {}

    /// A delivery completed successfully
    fn record_event_processed(&self, _event_type: &str, _subscriber_id: &str, _duration: Duration) {
    }

    /// A delivery failed after its in-dispatch retry cycle
    fn record_event_failed(&self, _event_type: &str, _subscriber_id: &str, _kind: ErrorKind) {}

    /// A failed delivery was stored in the dead letter queue
    fn record_event_dead_lettered(&self, _event_type: &str, _subscriber_id: &str) {}

    /// A failed delivery was dropped because dead-lettering was disabled
    fn record_event_dropped(&self, _event_type: &str, _subscriber_id: &str) {}

    /// A circuit breaker changed state
    fn record_breaker_transition(&self, _subscriber_id: &str, _from: CircuitState, _to: CircuitState) {
    }

    /// Schema validation rejected an event at publish time
    fn record_validation_failure(&self, _event_type: &str) {}

    /// A dead letter retry finished
    fn record_dlq_retry(&self, _success: bool) {}
}

/// Sink that discards all measurements
#[derive(Debug, Default)]
pub struct NoopMetrics;

impl EventBusMetrics for NoopMetrics {}

static NOOP_METRICS: Lazy<Arc<NoopMetrics>> = Lazy::new(|| Arc::new(NoopMetrics));

/// The shared default sink
pub fn noop_metrics() -> Arc<dyn EventBusMetrics> {
    NOOP_METRICS.clone()
}

/// Prometheus-backed metrics sink
pub struct PrometheusMetrics {
    registry: Registry,

    events_published_total: IntCounter,
    events_processed_total: IntCounter,
    events_failed_total: IntCounter,
    events_dead_lettered_total: IntCounter,
    events_dropped_total: IntCounter,
    validation_failures_total: IntCounter,
    breaker_transitions_total: IntCounter,
    dlq_retry_success_total: IntCounter,
    dlq_retry_failure_total: IntCounter,
    processing_duration_seconds: Histogram,
}

impl PrometheusMetrics {
    /// Create a sink with its own private registry
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let events_published_total = register_int_counter_with_registry!(
            opts!("events_published_total", "Total number of events published"),
            &registry
        )
        .map_err(|e| EventBusError::internal(format!("failed to register metric: {}", e)))?;

        let events_processed_total = register_int_counter_with_registry!(
            opts!(
                "events_processed_total",
                "Total number of deliveries processed successfully"
            ),
            &registry
        )
        .map_err(|e| EventBusError::internal(format!("failed to register metric: {}", e)))?;

        let events_failed_total = register_int_counter_with_registry!(
            opts!(
                "events_failed_total",
                "Total number of deliveries that failed after retry"
            ),
            &registry
        )
        .map_err(|e| EventBusError::internal(format!("failed to register metric: {}", e)))?;

        let events_dead_lettered_total = register_int_counter_with_registry!(
            opts!(
                "events_dead_lettered_total",
                "Total number of deliveries stored in the dead letter queue"
            ),
            &registry
        )
        .map_err(|e| EventBusError::internal(format!("failed to register metric: {}", e)))?;

        let events_dropped_total = register_int_counter_with_registry!(
            opts!(
                "events_dropped_total",
                "Total number of failed deliveries dropped without dead-lettering"
            ),
            &registry
        )
        .map_err(|e| EventBusError::internal(format!("failed to register metric: {}", e)))?;

        let validation_failures_total = register_int_counter_with_registry!(
            opts!(
                "validation_failures_total",
                "Total number of events rejected by schema validation"
            ),
            &registry
        )
        .map_err(|e| EventBusError::internal(format!("failed to register metric: {}", e)))?;

        let breaker_transitions_total = register_int_counter_with_registry!(
            opts!(
                "breaker_transitions_total",
                "Total number of circuit breaker state transitions"
            ),
            &registry
        )
        .map_err(|e| EventBusError::internal(format!("failed to register metric: {}", e)))?;

        let dlq_retry_success_total = register_int_counter_with_registry!(
            opts!(
                "dlq_retry_success_total",
                "Total number of dead letter retries that resolved the entry"
            ),
            &registry
        )
        .map_err(|e| EventBusError::internal(format!("failed to register metric: {}", e)))?;

        let dlq_retry_failure_total = register_int_counter_with_registry!(
            opts!(
                "dlq_retry_failure_total",
                "Total number of dead letter retries that failed"
            ),
            &registry
        )
        .map_err(|e| EventBusError::internal(format!("failed to register metric: {}", e)))?;

        let processing_duration_seconds = register_histogram_with_registry!(
            histogram_opts!(
                "processing_duration_seconds",
                "Time spent in handler invocations",
                vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]
            ),
            &registry
        )
        .map_err(|e| EventBusError::internal(format!("failed to register metric: {}", e)))?;

        Ok(Self {
            registry,
            events_published_total,
            events_processed_total,
            events_failed_total,
            events_dead_lettered_total,
            events_dropped_total,
            validation_failures_total,
            breaker_transitions_total,
            dlq_retry_success_total,
            dlq_retry_failure_total,
            processing_duration_seconds,
        })
    }

    /// Render all registered metrics in text exposition format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&families, &mut buffer)
            .map_err(|e| EventBusError::internal(format!("failed to encode metrics: {}", e)))?;
        String::from_utf8(buffer)
            .map_err(|e| EventBusError::internal(format!("metrics are not valid UTF-8: {}", e)))
    }
}

impl EventBusMetrics for PrometheusMetrics {
    fn record_event_published(&self, _event_type: &str, _source: &str) {
        self.events_published_total.inc();
    }

    fn record_event_processed(&self, _event_type: &str, _subscriber_id: &str, duration: Duration) {
        self.events_processed_total.inc();
        self.processing_duration_seconds.observe(duration.as_secs_f64());
    }

    fn record_event_failed(&self, _event_type: &str, _subscriber_id: &str, _kind: ErrorKind) {
        self.events_failed_total.inc();
    }

    fn record_event_dead_lettered(&self, _event_type: &str, _subscriber_id: &str) {
        self.events_dead_lettered_total.inc();
    }

    fn record_event_dropped(&self, _event_type: &str, _subscriber_id: &str) {
        self.events_dropped_total.inc();
    }

    fn record_breaker_transition(&self, _subscriber_id: &str, _from: CircuitState, _to: CircuitState) {
        self.breaker_transitions_total.inc();
    }

    fn record_validation_failure(&self, _event_type: &str) {
        self.validation_failures_total.inc();
    }

    fn record_dlq_retry(&self, success: bool) {
        if success {
            self.dlq_retry_success_total.inc();
        } else {
            self.dlq_retry_failure_total.inc();
        }
    }
}
