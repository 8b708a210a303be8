//! # Event Bus
//!
//! An in-process, typed, generic event bus with production hardening:
//! - Per-subscription asynchronous dispatch with bounded concurrency
//! - Retry with exponential backoff and per-subscriber circuit breaking
//! - Dead letter queue with poison-message detection and auto-retry
//! - Schema registry enforcing validation and version compatibility
//! - Trace-context propagation through event headers
//!
//! ```no_run
//! use event_bus::{
//!     handler_fn, Event, EventBus, EventBusConfig, SubscriptionOptions,
//! };
//! use serde_json::json;
//!
//! # async fn example() -> event_bus::Result<()> {
//! let bus = EventBus::new(EventBusConfig::default()).await?;
//!
//! bus.subscribe(
//!     "order.created",
//!     handler_fn(|event: Event| async move {
//!         println!("processing {}", event.id);
//!         Ok(())
//!     }),
//!     SubscriptionOptions::new("order-worker"),
//! );
//!
//! let receipt = bus
//!     .publish(Event::new("order.created", "order-service", json!({"id": "O1"})))
//!     .await?;
//! receipt.settled().await;
//! # Ok(())
//! # }
//! ```

pub mod breaker;
pub mod config;
pub mod dispatch;
pub mod dlq;
pub mod error;
pub mod event;
pub mod metrics;
pub mod poison;
pub mod schema;
pub mod storage;
pub mod subscription;
pub mod trace;
pub mod types;

// Re-export the primary surface
pub use breaker::{CircuitBreaker, CircuitBreakerRegistry, CircuitBreakerSnapshot};
pub use config::{
    BusConfig, CircuitBreakerConfig, DeadLetterConfig, EventBusConfig, PoisonPolicyConfig,
    SchemaRegistryConfig, TracingConfig,
};
pub use dispatch::{EventBus, EventBusBuilder, PublishReceipt};
pub use dlq::{
    DeadLetterEvent, DeadLetterQueue, DeadLetterReprocessor, DlqFilter, DlqNotification,
    DlqRetryOutcome,
};
pub use error::{ErrorKind, EventBusError, HandlerError, Result};
pub use event::{headers, Event};
pub use metrics::{noop_metrics, EventBusMetrics, NoopMetrics, PrometheusMetrics};
pub use schema::{
    CompatibilityMode, EventSchema, FieldDefinition, FieldType, MigrationFn, SchemaRegistry,
    ValidationErrorKind, ValidationIssue, ValidationResult, VersionComparator,
};
pub use storage::{EventPersistence, InMemoryEventStore};
pub use subscription::{
    handler_fn, EventHandler, Subscription, SubscriptionManager, SubscriptionOptions,
};
pub use trace::{
    InMemoryExporter, NoopExporter, SpanExporter, SpanEvent, SpanKind, SpanStatus, TraceContext,
    TraceSpan, Tracer,
};
pub use types::{
    CircuitState, DeadLetterStatus, DeliveryOutcome, DlqHealth, DlqStatistics, EventPriority,
    FailureReason, PoisonAction, PoisonMessageStatistics, ProcessingStage, RetryPolicy,
    SubscriptionStats,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
