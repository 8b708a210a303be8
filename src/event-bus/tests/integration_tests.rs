//! # Integration Tests for the Event Bus
//!
//! End-to-end scenarios exercising dispatch, retry, circuit breaking,
//! the dead letter queue, the schema registry, and trace propagation
//! through the public API.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use serde_json::json;
use serial_test::serial;
use tokio::time::sleep;
use tokio_test::assert_ok;

use event_bus::{
    handler_fn, CircuitState, DeadLetterStatus, DeliveryOutcome, Event, EventBus, EventBusConfig,
    EventBusError, EventSchema, FieldType, HandlerError, InMemoryExporter, PrometheusMetrics,
    RetryPolicy, SubscriptionOptions,
};

/// Capture bus logs when a test runs with `RUST_LOG` set
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Test configuration with fast timings
fn create_test_config() -> EventBusConfig {
    init_tracing();
    let mut config = EventBusConfig::default();
    config.bus.default_timeout_ms = 1_000;
    config.bus.shutdown_grace_ms = 500;
    config.bus.default_retry = RetryPolicy {
        max_attempts: 1,
        initial_delay_ms: 5,
        backoff_multiplier: 2.0,
        max_delay_ms: 50,
        jitter: false,
    };
    config.circuit_breaker.wait_duration_in_open_state_ms = 200;
    config.tracing.enable_async_tracing = false;
    config
}

async fn create_test_bus() -> EventBus {
    EventBus::new(create_test_config()).await.unwrap()
}

fn order_created(data: serde_json::Value) -> Event {
    Event::new("ORDER_CREATED", "order-service", data)
}

#[tokio::test]
async fn test_single_subscriber_success() {
    let bus = create_test_bus().await;
    let invocations = Arc::new(AtomicU32::new(0));
    let invocations_clone = invocations.clone();

    bus.subscribe(
        "ORDER_CREATED",
        handler_fn(move |_event| {
            let invocations = invocations_clone.clone();
            async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }),
        SubscriptionOptions::new("order-worker"),
    );

    let receipt = assert_ok!(bus.publish(order_created(json!({"id": "O1"}))).await);
    let outcomes = receipt.settled().await;

    assert_eq!(outcomes, vec![DeliveryOutcome::Delivered]);
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    let stats = bus.subscription_stats();
    assert_eq!(stats.len(), 1);
    assert_eq!(stats[0].processed, 1);
    assert_eq!(stats[0].failed, 0);
    assert!(bus.dlq().is_empty());
}

#[tokio::test]
async fn test_retry_then_dead_letter() {
    let bus = create_test_bus().await;
    let invocations = Arc::new(AtomicU32::new(0));
    let invocations_clone = invocations.clone();

    bus.subscribe(
        "ORDER_CREATED",
        handler_fn(move |_event| {
            let invocations = invocations_clone.clone();
            async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                Err(HandlerError::retryable("downstream unavailable"))
            }
        }),
        SubscriptionOptions::new("order-worker").with_retry_policy(RetryPolicy {
            max_attempts: 2,
            initial_delay_ms: 10,
            backoff_multiplier: 2.0,
            max_delay_ms: 100,
            jitter: false,
        }),
    );

    let receipt = bus
        .publish(order_created(json!({"id": "O2"})))
        .await
        .unwrap();
    let outcomes = receipt.settled().await;

    assert_eq!(invocations.load(Ordering::SeqCst), 2);
    assert_eq!(outcomes.len(), 1);
    let (dlq_id, status) = match &outcomes[0] {
        DeliveryOutcome::DeadLettered { dlq_id, status } => (*dlq_id, *status),
        other => panic!("expected dead-lettered outcome, got {:?}", other),
    };
    assert_eq!(status, DeadLetterStatus::Exhausted);

    let entry = bus.dlq().get(dlq_id).unwrap();
    assert_eq!(entry.retry_count, 2);
    assert_eq!(entry.max_retries, 2);
    assert_eq!(entry.status, DeadLetterStatus::Exhausted);
    assert_eq!(entry.failure_history.len(), 2);
    assert_eq!(entry.failure_history[0].attempt_number, 1);
    assert_eq!(entry.failure_history[1].attempt_number, 2);
}

#[tokio::test]
#[serial]
async fn test_circuit_opens_and_recovers() {
    let mut config = create_test_config();
    config.circuit_breaker.failure_threshold = 2;
    config.circuit_breaker.permitted_calls_in_half_open = 1;
    let bus = EventBus::new(config).await.unwrap();

    let failing = Arc::new(AtomicBool::new(true));
    let invocations = Arc::new(AtomicU32::new(0));
    let failing_clone = failing.clone();
    let invocations_clone = invocations.clone();

    bus.subscribe(
        "ORDER_CREATED",
        handler_fn(move |_event| {
            let failing = failing_clone.clone();
            let invocations = invocations_clone.clone();
            async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                if failing.load(Ordering::SeqCst) {
                    Err(HandlerError::retryable("downstream unavailable"))
                } else {
                    Ok(())
                }
            }
        }),
        SubscriptionOptions::new("flaky-worker"),
    );

    // Two failing deliveries open the breaker
    for n in 0..2 {
        let receipt = bus
            .publish(order_created(json!({ "n": n })))
            .await
            .unwrap();
        receipt.settled().await;
    }
    assert_eq!(invocations.load(Ordering::SeqCst), 2);

    let breaker = bus.breakers().get("flaky-worker").unwrap();
    assert_eq!(breaker.state(), CircuitState::Open);

    // Third publish: the handler is not invoked, the failure reason is
    // SubscriberUnavailable
    let receipt = bus.publish(order_created(json!({"n": 2}))).await.unwrap();
    let outcomes = receipt.settled().await;
    assert_eq!(invocations.load(Ordering::SeqCst), 2);

    let dlq_id = match &outcomes[0] {
        DeliveryOutcome::DeadLettered { dlq_id, .. } => *dlq_id,
        other => panic!("expected dead-lettered outcome, got {:?}", other),
    };
    let entry = bus.dlq().get(dlq_id).unwrap();
    assert_eq!(
        entry.latest_reason().unwrap().error_type,
        "SubscriberUnavailable"
    );

    // After the wait window a probe goes through and closes the breaker
    sleep(Duration::from_millis(250)).await;
    failing.store(false, Ordering::SeqCst);

    let receipt = bus.publish(order_created(json!({"n": 3}))).await.unwrap();
    assert_eq!(receipt.settled().await, vec![DeliveryOutcome::Delivered]);
    assert_eq!(breaker.state(), CircuitState::Closed);
}

#[tokio::test]
async fn test_strict_schema_validation_rejects_publish() {
    let mut config = create_test_config();
    config.schema.enforce_schema_validation = true;
    let bus = EventBus::new(config).await.unwrap();

    bus.schema_registry()
        .register(
            EventSchema::new("OrderCreated", "1.0.0")
                .with_required_field("orderId", FieldType::String)
                .with_required_field("amount", FieldType::Double),
        )
        .unwrap();

    let handled = Arc::new(AtomicU32::new(0));
    let handled_clone = handled.clone();
    bus.subscribe(
        "OrderCreated",
        handler_fn(move |_event| {
            let handled = handled_clone.clone();
            async move {
                handled.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }),
        SubscriptionOptions::new("order-worker"),
    );

    let result = bus
        .publish(Event::new(
            "OrderCreated",
            "order-service",
            json!({"orderId": "O1"}),
        ))
        .await;

    match result {
        Err(EventBusError::Validation { violations, .. }) => {
            assert!(violations.iter().any(|v| v.contains("amount")));
        }
        other => panic!("expected validation error, got {:?}", other.map(|_| ())),
    }
    assert_eq!(handled.load(Ordering::SeqCst), 0);

    // A complete payload passes
    let receipt = bus
        .publish(Event::new(
            "OrderCreated",
            "order-service",
            json!({"orderId": "O1", "amount": 10.5}),
        ))
        .await
        .unwrap();
    assert_eq!(receipt.settled().await, vec![DeliveryOutcome::Delivered]);
}

#[tokio::test]
async fn test_schema_evolution_and_versioned_validation() -> anyhow::Result<()> {
    let mut config = create_test_config();
    config.schema.allow_required_field_additions = true;
    let bus = EventBus::new(config).await?;
    let registry = bus.schema_registry();

    registry.register(
        EventSchema::new("OrderCreated", "1.0.0")
            .with_required_field("orderId", FieldType::String)
            .with_required_field("amount", FieldType::Double),
    )?;
    registry.register(
        EventSchema::new("OrderCreated", "1.0.1")
            .with_required_field("orderId", FieldType::String)
            .with_required_field("amount", FieldType::Double)
            .with_required_field("customerId", FieldType::String)
            .with_optional_field("discountCode", FieldType::String),
    )?;

    assert!(registry.is_compatible("OrderCreated", "1.0.0", "1.0.1")?);

    let payload = json!({"orderId": "O1", "amount": 10.0});
    let v1_event = Event::new("OrderCreated", "order-service", payload.clone())
        .with_header(event_bus::headers::SCHEMA_VERSION, "1.0.0");
    assert!(registry.validate(&v1_event).valid);

    let v2_event = Event::new("OrderCreated", "order-service", payload)
        .with_header(event_bus::headers::SCHEMA_VERSION, "1.0.1");
    let result = registry.validate(&v2_event);
    assert!(!result.valid);
    assert_eq!(result.errors.len(), 1);
    assert_eq!(result.errors[0].field.as_deref(), Some("customerId"));
    Ok(())
}

#[tokio::test]
async fn test_poison_detection_quarantines_after_repeat_failures() {
    let mut config = create_test_config();
    config.poison.consecutive_failure_threshold = 3;
    let bus = EventBus::new(config).await.unwrap();

    bus.subscribe(
        "ORDER_CREATED",
        handler_fn(|_event| async {
            Err(HandlerError::non_retryable("cannot cast payload")
                .with_error_type("ClassCastException"))
        }),
        SubscriptionOptions::new("order-worker").with_retry_policy(RetryPolicy {
            max_attempts: 10,
            initial_delay_ms: 5,
            backoff_multiplier: 1.0,
            max_delay_ms: 5,
            jitter: false,
        }),
    );

    // First failure stores the entry
    let receipt = bus
        .publish(order_created(json!({"id": "O6"})))
        .await
        .unwrap();
    let outcomes = receipt.settled().await;
    let dlq_id = match &outcomes[0] {
        DeliveryOutcome::DeadLettered { dlq_id, status } => {
            assert_eq!(*status, DeadLetterStatus::Failed);
            *dlq_id
        }
        other => panic!("expected dead-lettered outcome, got {:?}", other),
    };

    // Failures two and three keep the streak going; the fourth failure
    // of the same event id with the same error class quarantines it
    for _ in 0..2 {
        bus.dlq().retry(dlq_id).await.unwrap();
        let entry = bus.dlq().get(dlq_id).unwrap();
        assert_eq!(entry.status, DeadLetterStatus::Failed);
    }

    bus.dlq().retry(dlq_id).await.unwrap();
    let entry = bus.dlq().get(dlq_id).unwrap();
    assert_eq!(entry.status, DeadLetterStatus::Quarantined);
    assert!(entry.latest_reason().unwrap().is_poison_message);

    let stats = bus.dlq().poison_statistics();
    assert_eq!(stats.total_poison_messages, 1);
    assert_eq!(stats.total_quarantined, 1);
}

#[tokio::test]
#[serial]
async fn test_dlq_auto_retry_loops_back_into_dispatch() {
    let mut config = create_test_config();
    config.dead_letter.auto_retry_enabled = true;
    config.dead_letter.auto_retry_policy = RetryPolicy {
        max_attempts: 5,
        initial_delay_ms: 20,
        backoff_multiplier: 1.0,
        max_delay_ms: 20,
        jitter: false,
    };
    let bus = EventBus::new(config).await.unwrap();

    let failures_remaining = Arc::new(AtomicU32::new(1));
    let hard_fail = Arc::new(AtomicBool::new(false));
    let invocations = Arc::new(AtomicU32::new(0));
    let failures_clone = failures_remaining.clone();
    let hard_fail_clone = hard_fail.clone();
    let invocations_clone = invocations.clone();

    bus.subscribe(
        "ORDER_CREATED",
        handler_fn(move |_event| {
            let failures = failures_clone.clone();
            let hard_fail = hard_fail_clone.clone();
            let invocations = invocations_clone.clone();
            async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                if failures.load(Ordering::SeqCst) > 0 {
                    failures.fetch_sub(1, Ordering::SeqCst);
                    if hard_fail.load(Ordering::SeqCst) {
                        Err(HandlerError::non_retryable("malformed payload"))
                    } else {
                        Err(HandlerError::retryable("transient"))
                    }
                } else {
                    Ok(())
                }
            }
        }),
        SubscriptionOptions::new("order-worker").with_retry_policy(RetryPolicy {
            max_attempts: 3,
            initial_delay_ms: 5,
            backoff_multiplier: 1.0,
            max_delay_ms: 5,
            jitter: false,
        }),
    );

    let receipt = bus
        .publish(order_created(json!({"id": "O7"})))
        .await
        .unwrap();
    let outcomes = receipt.settled().await;

    // The first attempt failed, the in-dispatch retry succeeded
    assert_eq!(outcomes, vec![DeliveryOutcome::Delivered]);
    assert_eq!(invocations.load(Ordering::SeqCst), 2);
    assert!(bus.dlq().is_empty());

    // A non-retryable failure lands in the DLQ with budget remaining;
    // the auto-retry scheduler resolves it once the handler recovers
    failures_remaining.store(1, Ordering::SeqCst);
    hard_fail.store(true, Ordering::SeqCst);
    let receipt = bus
        .publish(order_created(json!({"id": "O8"})))
        .await
        .unwrap();
    let outcomes = receipt.settled().await;
    assert!(matches!(
        outcomes[0],
        DeliveryOutcome::DeadLettered {
            status: DeadLetterStatus::Failed,
            ..
        }
    ));

    let mut resolved = false;
    for _ in 0..100 {
        sleep(Duration::from_millis(10)).await;
        if bus.dlq().is_empty() {
            resolved = true;
            break;
        }
    }
    assert!(resolved, "auto-retry should resolve the entry");
    bus.shutdown().await;
}

#[tokio::test]
async fn test_unsubscribe_during_dispatch_completes_in_flight() {
    let bus = create_test_bus().await;
    let invocations = Arc::new(AtomicU32::new(0));
    let invocations_clone = invocations.clone();

    let subscription = bus.subscribe(
        "ORDER_CREATED",
        handler_fn(move |_event| {
            let invocations = invocations_clone.clone();
            async move {
                sleep(Duration::from_millis(50)).await;
                invocations.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }),
        SubscriptionOptions::new("slow-worker"),
    );

    let receipt = bus
        .publish(order_created(json!({"id": "O9"})))
        .await
        .unwrap();

    // Unsubscribe while the invocation is in flight
    sleep(Duration::from_millis(10)).await;
    assert!(bus.unsubscribe(subscription.id));

    assert_eq!(receipt.settled().await, vec![DeliveryOutcome::Delivered]);
    assert_eq!(invocations.load(Ordering::SeqCst), 1);

    // No new invocation after removal
    let receipt = bus
        .publish(order_created(json!({"id": "O10"})))
        .await
        .unwrap();
    assert_eq!(receipt.matched(), 0);
    receipt.settled().await;
    assert_eq!(invocations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_trace_propagates_from_publish_to_processing() {
    let exporter = Arc::new(InMemoryExporter::new());
    let bus = EventBus::builder(create_test_config())
        .with_span_exporter(exporter.clone())
        .build()
        .await
        .unwrap();

    bus.subscribe(
        "ORDER_CREATED",
        handler_fn(|_event| async { Ok(()) }),
        SubscriptionOptions::new("order-worker"),
    );

    let receipt = bus
        .publish(order_created(json!({"id": "O11"})))
        .await
        .unwrap();
    receipt.settled().await;

    let spans = exporter.finished_spans();
    assert_eq!(spans.len(), 2);

    let producer = spans
        .iter()
        .find(|s| s.name.ends_with("publish"))
        .expect("producer span");
    let consumer = spans
        .iter()
        .find(|s| s.name.ends_with("process"))
        .expect("consumer span");

    assert_eq!(producer.context.trace_id, consumer.context.trace_id);
    assert_eq!(
        consumer.context.parent_span_id.as_deref(),
        Some(producer.context.span_id.as_str())
    );
    assert_eq!(
        consumer.attributes.get("subscriber.id").map(String::as_str),
        Some("order-worker")
    );
}

#[tokio::test]
#[serial]
async fn test_handler_timeout_is_classified_and_dead_lettered() {
    let mut config = create_test_config();
    config.bus.default_timeout_ms = 30;
    let bus = EventBus::new(config).await.unwrap();

    bus.subscribe(
        "ORDER_CREATED",
        handler_fn(|_event| async {
            sleep(Duration::from_secs(5)).await;
            Ok(())
        }),
        SubscriptionOptions::new("stuck-worker").with_retry_policy(RetryPolicy {
            max_attempts: 1,
            initial_delay_ms: 5,
            backoff_multiplier: 1.0,
            max_delay_ms: 5,
            jitter: false,
        }),
    );

    let receipt = bus
        .publish(order_created(json!({"id": "O12"})))
        .await
        .unwrap();
    let outcomes = receipt.settled().await;

    let dlq_id = match &outcomes[0] {
        DeliveryOutcome::DeadLettered { dlq_id, .. } => *dlq_id,
        other => panic!("expected dead-lettered outcome, got {:?}", other),
    };
    let entry = bus.dlq().get(dlq_id).unwrap();
    assert_eq!(entry.latest_reason().unwrap().error_type, "Timeout");
}

#[tokio::test]
async fn test_prometheus_metrics_observe_dispatch() {
    let metrics = Arc::new(PrometheusMetrics::new().unwrap());
    let bus = EventBus::builder(create_test_config())
        .with_metrics(metrics.clone())
        .build()
        .await
        .unwrap();

    bus.subscribe(
        "ORDER_CREATED",
        handler_fn(|_event| async { Ok(()) }),
        SubscriptionOptions::new("order-worker"),
    );
    bus.subscribe(
        "ORDER_CREATED",
        handler_fn(|_event| async { Err(HandlerError::non_retryable("bad")) }),
        SubscriptionOptions::new("broken-worker"),
    );

    let receipt = bus
        .publish(order_created(json!({"id": "O13"})))
        .await
        .unwrap();
    receipt.settled().await;

    let rendered = metrics.gather().unwrap();
    assert!(rendered.contains("events_published_total 1"));
    assert!(rendered.contains("events_processed_total 1"));
    assert!(rendered.contains("events_failed_total 1"));
    assert!(rendered.contains("events_dead_lettered_total 1"));
}

#[tokio::test]
async fn test_published_events_reach_the_persistence_sink() -> anyhow::Result<()> {
    let store = event_bus::InMemoryEventStore::new();
    let bus = EventBus::builder(create_test_config())
        .with_persistence(store.clone())
        .build()
        .await?;

    bus.subscribe(
        "ORDER_CREATED",
        handler_fn(|_event| async { Ok(()) }),
        SubscriptionOptions::new("order-worker"),
    );

    let receipt = bus.publish(order_created(json!({"id": "O15"}))).await?;
    let event_id = receipt.event_id;
    receipt.settled().await;

    use event_bus::EventPersistence;
    let persisted = store
        .get_event(event_id)
        .await?
        .expect("published event should be persisted");
    assert_eq!(persisted.id, event_id);
    assert_eq!(persisted.event_type, "ORDER_CREATED");
    Ok(())
}

#[tokio::test]
async fn test_fanout_reaches_every_matching_subscription() {
    let bus = create_test_bus().await;
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

    for (subscriber, priority) in [
        ("low-worker", event_bus::EventPriority::Low),
        ("critical-worker", event_bus::EventPriority::Critical),
        ("normal-worker", event_bus::EventPriority::Normal),
    ] {
        let seen = seen.clone();
        let name = subscriber.to_string();
        bus.subscribe(
            "ORDER_CREATED",
            handler_fn(move |_event| {
                let seen = seen.clone();
                let name = name.clone();
                async move {
                    seen.lock().push(name);
                    Ok(())
                }
            }),
            SubscriptionOptions::new(subscriber).with_priority(priority),
        );
    }
    bus.subscribe(
        "OTHER_TYPE",
        handler_fn(|_event| async { Ok(()) }),
        SubscriptionOptions::new("other-worker"),
    );

    let receipt = bus
        .publish(order_created(json!({"id": "O14"})))
        .await
        .unwrap();
    let outcomes = receipt.settled().await;

    assert_eq!(outcomes.len(), 3);
    assert!(outcomes.iter().all(DeliveryOutcome::is_delivered));

    let mut delivered_to = seen.lock().clone();
    delivered_to.sort();
    assert_eq!(
        delivered_to,
        vec!["critical-worker", "low-worker", "normal-worker"]
    );
}
