//! # Dispatch Engine
//!
//! The [`EventBus`] facade: receives publishes, fans out to matching
//! subscriptions, and applies the per-delivery pipeline
//! (active check → filter → circuit-breaker gate → timeout → invoke →
//! retry → dead-letter hand-off), threading the trace context through
//! the event headers.
//!
//! `ordered=true` subscriptions are served by a serial worker fed from
//! an in-memory queue, preserving publish order with at most one
//! in-flight invocation; unordered deliveries run concurrently.
//! `publish` itself never blocks on handlers: the returned receipt
//! resolves once every matching delivery finishes its in-dispatch
//! attempt cycle, while dead-letter auto-retries stay decoupled.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::join_all;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::breaker::{CircuitBreakerRegistry, CircuitBreakerSnapshot};
use crate::config::EventBusConfig;
use crate::dlq::{DeadLetterEvent, DeadLetterQueue, DeadLetterReprocessor};
use crate::error::{ErrorKind, EventBusError, HandlerError, Result};
use crate::event::Event;
use crate::metrics::{noop_metrics, EventBusMetrics};
use crate::schema::SchemaRegistry;
use crate::storage::EventPersistence;
use crate::subscription::{EventHandler, Subscription, SubscriptionManager, SubscriptionOptions};
use crate::trace::{NoopExporter, SpanExporter, Tracer};
use crate::types::{
    DeliveryOutcome, FailureReason, ProcessingStage, RetryPolicy, SubscriptionStats,
};

/// Job queued on an ordered subscription's serial lane
struct OrderedJob {
    event: Event,
    ack: oneshot::Sender<DeliveryOutcome>,
}

/// Handle returned by `publish`
///
/// `settled()` resolves once every matching delivery has finished its
/// in-dispatch attempt cycle (success, drop, or dead-letter hand-off).
pub struct PublishReceipt {
    /// Id of the published event
    pub event_id: Uuid,
    receivers: Vec<oneshot::Receiver<DeliveryOutcome>>,
}

impl PublishReceipt {
    /// Number of subscriptions the event was dispatched to
    pub fn matched(&self) -> usize {
        self.receivers.len()
    }

    /// Await the outcome of every matching delivery
    pub async fn settled(self) -> Vec<DeliveryOutcome> {
        join_all(self.receivers)
            .await
            .into_iter()
            .map(|result| result.unwrap_or(DeliveryOutcome::Cancelled))
            .collect()
    }
}

/// Builder wiring pluggable sinks into the bus
pub struct EventBusBuilder {
    config: EventBusConfig,
    metrics: Option<Arc<dyn EventBusMetrics>>,
    span_exporter: Option<Arc<dyn SpanExporter>>,
    persistence: Option<Arc<dyn EventPersistence>>,
}

impl EventBusBuilder {
    pub fn new(config: EventBusConfig) -> Self {
        Self {
            config,
            metrics: None,
            span_exporter: None,
            persistence: None,
        }
    }

    /// Install a metrics sink
    pub fn with_metrics(mut self, metrics: Arc<dyn EventBusMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Install a span exporter for the tracing hook
    pub fn with_span_exporter(mut self, exporter: Arc<dyn SpanExporter>) -> Self {
        self.span_exporter = Some(exporter);
        self
    }

    /// Install an optional persistence sink
    pub fn with_persistence(mut self, persistence: Arc<dyn EventPersistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Validate the configuration and assemble the bus
    pub async fn build(self) -> Result<EventBus> {
        self.config.validate()?;
        let config = Arc::new(self.config);

        let metrics = if config.bus.enable_metrics {
            self.metrics.unwrap_or_else(noop_metrics)
        } else {
            noop_metrics()
        };

        let exporter = self
            .span_exporter
            .unwrap_or_else(|| Arc::new(NoopExporter));
        let tracer = Tracer::new(config.tracing.clone(), exporter);

        let dlq = DeadLetterQueue::new(
            config.dead_letter.clone(),
            config.poison.clone(),
            metrics.clone(),
        );

        let bus = EventBus {
            subscriptions: Arc::new(SubscriptionManager::new()),
            breakers: Arc::new(CircuitBreakerRegistry::new(config.circuit_breaker.clone())),
            dlq,
            schema_registry: Arc::new(SchemaRegistry::new(config.schema.clone())),
            tracer,
            metrics,
            persistence: self.persistence,
            ordered_lanes: Arc::new(DashMap::new()),
            accepting: Arc::new(AtomicBool::new(true)),
            in_flight: Arc::new(AtomicU64::new(0)),
            shutdown: CancellationToken::new(),
            config,
        };

        bus.dlq.set_reprocessor(Arc::new(BusReprocessor {
            manager: bus.subscriptions.clone(),
            breakers: bus.breakers.clone(),
            config: bus.config.clone(),
            metrics: bus.metrics.clone(),
        }));
        bus.dlq.start_maintenance();

        info!("event bus started");
        Ok(bus)
    }
}

/// In-process typed event bus
#[derive(Clone)]
pub struct EventBus {
    config: Arc<EventBusConfig>,
    subscriptions: Arc<SubscriptionManager>,
    breakers: Arc<CircuitBreakerRegistry>,
    dlq: DeadLetterQueue,
    schema_registry: Arc<SchemaRegistry>,
    tracer: Tracer,
    metrics: Arc<dyn EventBusMetrics>,
    persistence: Option<Arc<dyn EventPersistence>>,
    ordered_lanes: Arc<DashMap<Uuid, mpsc::UnboundedSender<OrderedJob>>>,
    accepting: Arc<AtomicBool>,
    in_flight: Arc<AtomicU64>,
    shutdown: CancellationToken,
}

impl EventBus {
    /// Create a bus with the default sinks
    pub async fn new(config: EventBusConfig) -> Result<Self> {
        Self::builder(config).build().await
    }

    /// Builder for wiring custom metrics, tracing, and persistence
    pub fn builder(config: EventBusConfig) -> EventBusBuilder {
        EventBusBuilder::new(config)
    }

    /// Register a handler for an event type
    pub fn subscribe(
        &self,
        event_type: impl Into<String>,
        handler: Arc<dyn EventHandler>,
        options: SubscriptionOptions,
    ) -> Arc<Subscription> {
        self.subscriptions.subscribe(event_type, handler, options)
    }

    /// Deactivate and remove a subscription
    pub fn unsubscribe(&self, subscription_id: Uuid) -> bool {
        let removed = self.subscriptions.unsubscribe(subscription_id);
        if removed {
            self.ordered_lanes.remove(&subscription_id);
        }
        removed
    }

    /// Remove every subscription owned by a subscriber id
    pub fn unsubscribe_all(&self, subscriber_id: &str) -> usize {
        let removed = self.subscriptions.unsubscribe_all(subscriber_id);
        if removed > 0 {
            self.ordered_lanes
                .retain(|id, _| self.subscriptions.contains(*id));
        }
        removed
    }

    /// Publish an event to every active, matching subscription
    ///
    /// Only pre-dispatch failures surface here: shutdown in progress,
    /// or schema validation rejection when enforcement is on.
    pub async fn publish(&self, event: Event) -> Result<PublishReceipt> {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(EventBusError::ShutdownInProgress);
        }

        if self.config.schema.enforce_schema_validation {
            let validation = self.schema_registry.validate(&event);
            if !validation.valid {
                self.metrics.record_validation_failure(&event.event_type);
                let violations = validation.error_summaries();
                return Err(EventBusError::Validation {
                    message: violations.join(", "),
                    event_id: event.id,
                    event_type: event.event_type.clone(),
                    violations,
                });
            }
        }

        self.metrics
            .record_event_published(&event.event_type, &event.source);

        let mut event = event;
        let publish_span = self.tracer.start_publish_trace(&event);
        if let Some(span) = &publish_span {
            event = self.tracer.add_tracing_headers(event, span);
        }

        if let Some(persistence) = &self.persistence {
            if let Err(err) = persistence.persist_event(&event).await {
                warn!(event_id = %event.id, error = %err, "event persistence failed");
            }
        }

        let subscriptions = self.subscriptions.subscriptions_for(&event.event_type);
        debug!(
            event_id = %event.id,
            event_type = %event.event_type,
            matched = subscriptions.len(),
            "dispatching event"
        );

        let mut receivers = Vec::with_capacity(subscriptions.len());
        for subscription in subscriptions {
            let (ack, receiver) = oneshot::channel();
            receivers.push(receiver);

            if subscription.options.ordered {
                let sender = {
                    let lane = self
                        .ordered_lanes
                        .entry(subscription.id)
                        .or_insert_with(|| self.spawn_ordered_worker(subscription.clone()));
                    lane.value().clone()
                };
                // A closed lane means the subscription is gone; the
                // dropped ack resolves as Cancelled
                let _ = sender.send(OrderedJob {
                    event: event.clone(),
                    ack,
                });
            } else {
                let bus = self.clone();
                let event = event.clone();
                tokio::spawn(async move {
                    let outcome = bus.deliver(subscription, event).await;
                    let _ = ack.send(outcome);
                });
            }
        }

        if let Some(mut span) = publish_span {
            span.set_attribute("subscriptions.matched", receivers.len().to_string());
            self.tracer.finish_span(span);
        }

        Ok(PublishReceipt {
            event_id: event.id,
            receivers,
        })
    }

    fn spawn_ordered_worker(
        &self,
        subscription: Arc<Subscription>,
    ) -> mpsc::UnboundedSender<OrderedJob> {
        let (tx, mut rx) = mpsc::unbounded_channel::<OrderedJob>();
        let bus = self.clone();
        let subscription_id = subscription.id;

        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                let outcome = bus.deliver(subscription.clone(), job.event).await;
                let _ = job.ack.send(outcome);
            }
            debug!(subscription_id = %subscription_id, "ordered worker stopped");
        });
        tx
    }

    async fn deliver(&self, subscription: Arc<Subscription>, event: Event) -> DeliveryOutcome {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let outcome = self.deliver_inner(&subscription, event).await;
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        outcome
    }

    /// The per-delivery pipeline for one (event, subscription) pair
    async fn deliver_inner(
        &self,
        subscription: &Arc<Subscription>,
        event: Event,
    ) -> DeliveryOutcome {
        if self.shutdown.is_cancelled() {
            return DeliveryOutcome::Cancelled;
        }

        if !subscription.is_active() {
            debug!(
                event_id = %event.id,
                subscription_id = %subscription.id,
                "subscription inactive, dropping delivery"
            );
            return DeliveryOutcome::Inactive;
        }

        if let Some(filter) = &subscription.options.filter {
            if !filter(&event) {
                debug!(
                    event_id = %event.id,
                    subscription_id = %subscription.id,
                    "event filtered out"
                );
                return DeliveryOutcome::Filtered;
            }
        }

        let subscriber_id = subscription.options.subscriber_id.clone();
        let breaker = self.breakers.breaker_for(&subscriber_id);
        let retry_policy = subscription
            .options
            .retry_policy
            .clone()
            .unwrap_or_else(|| self.config.bus.default_retry.clone());

        if !breaker.allow() {
            let reason = FailureReason::subscriber_unavailable(subscriber_id.as_str());
            subscription.record_failure(&reason.error_message);
            self.metrics
                .record_event_failed(&event.event_type, &subscriber_id, ErrorKind::CircuitOpen);
            return self.hand_off_failure(subscription, &event, vec![reason], retry_policy);
        }

        let timeout_duration = subscription
            .options
            .timeout
            .unwrap_or_else(|| self.config.bus.default_timeout());
        let handler = subscription.handler();
        let mut span = self.tracer.start_processing_trace(&event, &subscriber_id);
        let mut history: Vec<FailureReason> = Vec::new();
        let mut attempt: u32 = 1;

        loop {
            let started = Instant::now();
            let result = match timeout(timeout_duration, handler.handle(&event)).await {
                Ok(Ok(())) => Ok(started.elapsed()),
                Ok(Err(err)) => Err(err),
                Err(_) => Err(HandlerError::timeout(timeout_duration.as_millis() as u64)),
            };

            match result {
                Ok(duration) => {
                    if let Some((from, to)) = breaker.record_success() {
                        self.metrics.record_breaker_transition(&subscriber_id, from, to);
                    }
                    subscription.record_success();
                    self.dlq.record_processing_success(event.id);
                    self.metrics
                        .record_event_processed(&event.event_type, &subscriber_id, duration);
                    if let Some(span) = span.take() {
                        self.tracer.finish_span(span);
                    }
                    debug!(
                        event_id = %event.id,
                        subscriber_id = %subscriber_id,
                        attempt,
                        "delivery succeeded"
                    );
                    return DeliveryOutcome::Delivered;
                }
                Err(err) => {
                    if let Some(span) = span.as_mut() {
                        self.tracer.record_error(span, &err);
                    }

                    let retryable = match &subscription.options.retry_classifier {
                        Some(classifier) => classifier(&err),
                        None => err.is_retryable(),
                    };
                    let stage = if attempt == 1 {
                        ProcessingStage::Handler
                    } else {
                        ProcessingStage::Retry
                    };
                    history.push(FailureReason::from_handler_error(
                        &err,
                        stage,
                        subscriber_id.as_str(),
                        attempt,
                        retryable,
                    ));

                    if retryable && retry_policy.has_attempts_left(attempt) {
                        let delay = retry_policy.delay(attempt);
                        debug!(
                            event_id = %event.id,
                            subscriber_id = %subscriber_id,
                            attempt,
                            delay_ms = delay.as_millis() as u64,
                            "retrying delivery"
                        );
                        tokio::select! {
                            _ = self.shutdown.cancelled() => {
                                if let Some(span) = span.take() {
                                    self.tracer.finish_span(span);
                                }
                                return DeliveryOutcome::Cancelled;
                            }
                            _ = sleep(delay) => {}
                        }
                        attempt += 1;
                        continue;
                    }

                    if self.config.circuit_breaker.records_failure(err.kind) {
                        if let Some((from, to)) = breaker.record_failure() {
                            self.metrics
                                .record_breaker_transition(&subscriber_id, from, to);
                        }
                    }
                    subscription.record_failure(&err.message);
                    self.metrics
                        .record_event_failed(&event.event_type, &subscriber_id, err.kind);
                    if let Some(span) = span.take() {
                        self.tracer.finish_span(span);
                    }
                    return self.hand_off_failure(subscription, &event, history, retry_policy);
                }
            }
        }
    }

    fn hand_off_failure(
        &self,
        subscription: &Arc<Subscription>,
        event: &Event,
        history: Vec<FailureReason>,
        retry_policy: RetryPolicy,
    ) -> DeliveryOutcome {
        if !subscription.options.dead_letter_enabled {
            self.metrics
                .record_event_dropped(&event.event_type, &subscription.options.subscriber_id);
            debug!(
                event_id = %event.id,
                subscriber_id = %subscription.options.subscriber_id,
                "dead-lettering disabled, dropping failed delivery"
            );
            return DeliveryOutcome::Dropped;
        }

        match self.dlq.handle_failure(
            event,
            &subscription.options.subscriber_id,
            history,
            retry_policy,
        ) {
            Some((dlq_id, status)) => DeliveryOutcome::DeadLettered { dlq_id, status },
            None => DeliveryOutcome::Discarded,
        }
    }

    /// Counter snapshots for all registered subscriptions
    pub fn subscription_stats(&self) -> Vec<SubscriptionStats> {
        self.subscriptions.stats()
    }

    /// The dead letter queue
    pub fn dlq(&self) -> &DeadLetterQueue {
        &self.dlq
    }

    /// The schema registry
    pub fn schema_registry(&self) -> &SchemaRegistry {
        &self.schema_registry
    }

    /// The tracing hook
    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    /// The circuit breaker registry
    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }

    /// Snapshots of all known circuit breakers
    pub fn breaker_snapshots(&self) -> Vec<CircuitBreakerSnapshot> {
        self.breakers.snapshots()
    }

    /// The effective configuration
    pub fn config(&self) -> &EventBusConfig {
        &self.config
    }

    /// Whether the bus still accepts publishes
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Two-phase shutdown: stop accepting publishes, drain in-flight
    /// deliveries within the grace period, then cancel timers and
    /// schedulers and flush the tracer
    pub async fn shutdown(&self) {
        info!("shutting down event bus");
        self.accepting.store(false, Ordering::Release);

        let deadline = Instant::now() + self.config.bus.shutdown_grace();
        while self.in_flight.load(Ordering::Acquire) > 0 && Instant::now() < deadline {
            sleep(Duration::from_millis(10)).await;
        }

        let drained = self.in_flight.load(Ordering::Acquire) == 0;
        if !drained {
            warn!(
                in_flight = self.in_flight.load(Ordering::Acquire),
                "grace period elapsed with deliveries still in flight"
            );
        }

        self.shutdown.cancel();
        self.ordered_lanes.clear();
        self.dlq.shutdown();
        self.tracer.shutdown();
        info!("event bus stopped");
    }
}

/// Reprocessor re-invoking the original subscriber for DLQ retries
struct BusReprocessor {
    manager: Arc<SubscriptionManager>,
    breakers: Arc<CircuitBreakerRegistry>,
    config: Arc<EventBusConfig>,
    metrics: Arc<dyn EventBusMetrics>,
}

#[async_trait]
impl DeadLetterReprocessor for BusReprocessor {
    async fn reprocess(
        &self,
        entry: &DeadLetterEvent,
    ) -> std::result::Result<(), HandlerError> {
        let subscription = self
            .manager
            .find_for_subscriber(&entry.subscriber_id, &entry.event_type)
            .ok_or_else(|| {
                HandlerError::with_kind(
                    ErrorKind::NotFound,
                    format!(
                        "subscriber {} has no active subscription for {}",
                        entry.subscriber_id, entry.event_type
                    ),
                )
            })?;

        let timeout_duration = subscription
            .options
            .timeout
            .unwrap_or_else(|| self.config.bus.default_timeout());
        let handler = subscription.handler();
        let breaker = self.breakers.breaker_for(&entry.subscriber_id);
        let started = Instant::now();

        let result = match timeout(timeout_duration, handler.handle(&entry.original_event)).await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(HandlerError::timeout(timeout_duration.as_millis() as u64)),
        };

        match result {
            Ok(()) => {
                subscription.record_success();
                if let Some((from, to)) = breaker.record_success() {
                    self.metrics
                        .record_breaker_transition(&entry.subscriber_id, from, to);
                }
                self.metrics.record_event_processed(
                    &entry.event_type,
                    &entry.subscriber_id,
                    started.elapsed(),
                );
                Ok(())
            }
            Err(err) => {
                subscription.record_failure(&err.message);
                if self.config.circuit_breaker.records_failure(err.kind) {
                    if let Some((from, to)) = breaker.record_failure() {
                        self.metrics
                            .record_breaker_transition(&entry.subscriber_id, from, to);
                    }
                }
                Err(err)
            }
        }
    }
}
