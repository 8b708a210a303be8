//! # Subscription Manager
//!
//! Registry of subscriptions per event type. Per-type lists are kept
//! sorted by (priority descending, creation order ascending) so dispatch
//! fan-out is deterministic. Lookups never block publishers; all state
//! lives in concurrent maps and atomics.

use std::cmp::Reverse;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::HandlerError;
use crate::event::Event;
use crate::types::{EventPriority, RetryPolicy, SubscriptionStats};

/// Predicate applied to events before dispatching to a subscription
pub type EventFilter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Predicate deciding whether a handler failure is retryable,
/// overriding the default kind-based classification
pub type RetryClassifier = Arc<dyn Fn(&HandlerError) -> bool + Send + Sync>;

/// Handler invoked for each delivered event
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> std::result::Result<(), HandlerError>;
}

struct FnHandler {
    f: Box<
        dyn Fn(Event) -> BoxFuture<'static, std::result::Result<(), HandlerError>> + Send + Sync,
    >,
}

#[async_trait]
impl EventHandler for FnHandler {
    async fn handle(&self, event: &Event) -> std::result::Result<(), HandlerError> {
        (self.f)(event.clone()).await
    }
}

/// Wrap an async closure as an [`EventHandler`]
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn EventHandler>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler {
        f: Box::new(move |event| Box::pin(f(event))),
    })
}

/// Per-subscription delivery options
#[derive(Clone)]
pub struct SubscriptionOptions {
    /// Stable subscriber identifier; circuit-breaker key and DLQ attribution
    pub subscriber_id: String,

    /// Dispatch priority relative to other subscriptions of the same type
    pub priority: EventPriority,

    /// Predicate on events; `false` drops the delivery silently
    pub filter: Option<EventFilter>,

    /// Retry policy; the bus default applies when unset
    pub retry_policy: Option<RetryPolicy>,

    /// Retryability override for handler failures
    pub retry_classifier: Option<RetryClassifier>,

    /// Handler timeout; the bus default applies when unset
    pub timeout: Option<Duration>,

    /// Serialize deliveries for this subscription in publish order
    pub ordered: bool,

    /// Hand exhausted failures to the dead letter queue
    pub dead_letter_enabled: bool,
}

impl SubscriptionOptions {
    pub fn new(subscriber_id: impl Into<String>) -> Self {
        Self {
            subscriber_id: subscriber_id.into(),
            priority: EventPriority::Normal,
            filter: None,
            retry_policy: None,
            retry_classifier: None,
            timeout: None,
            ordered: false,
            dead_letter_enabled: true,
        }
    }

    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&Event) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn with_retry_classifier<F>(mut self, classifier: F) -> Self
    where
        F: Fn(&HandlerError) -> bool + Send + Sync + 'static,
    {
        self.retry_classifier = Some(Arc::new(classifier));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn ordered(mut self) -> Self {
        self.ordered = true;
        self
    }

    pub fn without_dead_letter(mut self) -> Self {
        self.dead_letter_enabled = false;
        self
    }
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        Self::new("default")
    }
}

impl fmt::Debug for SubscriptionOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionOptions")
            .field("subscriber_id", &self.subscriber_id)
            .field("priority", &self.priority)
            .field("has_filter", &self.filter.is_some())
            .field("retry_policy", &self.retry_policy)
            .field("timeout", &self.timeout)
            .field("ordered", &self.ordered)
            .field("dead_letter_enabled", &self.dead_letter_enabled)
            .finish()
    }
}

/// A registered handler for one event type
pub struct Subscription {
    /// Subscription identity
    pub id: Uuid,

    /// Event type this subscription listens to
    pub event_type: String,

    /// Delivery options
    pub options: SubscriptionOptions,

    handler: Arc<dyn EventHandler>,
    seq: u64,
    active: AtomicBool,
    processed: AtomicU64,
    failed: AtomicU64,
    last_processed_at: Mutex<Option<DateTime<Utc>>>,
    last_error: Mutex<Option<String>>,
}

impl Subscription {
    /// Whether the subscription still receives deliveries
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Stop further deliveries; in-flight invocations complete
    pub fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// The registered handler
    pub fn handler(&self) -> Arc<dyn EventHandler> {
        self.handler.clone()
    }

    /// Record a successful delivery
    pub fn record_success(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        *self.last_processed_at.lock() = Some(Utc::now());
    }

    /// Record a failed delivery
    pub fn record_failure(&self, error: &str) {
        self.failed.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock() = Some(error.to_string());
    }

    /// Counter snapshot
    pub fn stats(&self) -> SubscriptionStats {
        SubscriptionStats {
            subscription_id: self.id,
            subscriber_id: self.options.subscriber_id.clone(),
            event_type: self.event_type.clone(),
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            last_processed_at: *self.last_processed_at.lock(),
            last_error: self.last_error.lock().clone(),
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("event_type", &self.event_type)
            .field("options", &self.options)
            .field("active", &self.is_active())
            .finish()
    }
}

/// Registry of subscriptions keyed by event type
pub struct SubscriptionManager {
    by_type: DashMap<String, Vec<Arc<Subscription>>>,
    by_id: DashMap<Uuid, Arc<Subscription>>,
    next_seq: AtomicU64,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self {
            by_type: DashMap::new(),
            by_id: DashMap::new(),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Register a handler for an event type
    pub fn subscribe(
        &self,
        event_type: impl Into<String>,
        handler: Arc<dyn EventHandler>,
        options: SubscriptionOptions,
    ) -> Arc<Subscription> {
        let event_type = event_type.into();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);

        let subscription = Arc::new(Subscription {
            id: Uuid::new_v4(),
            event_type: event_type.clone(),
            options,
            handler,
            seq,
            active: AtomicBool::new(true),
            processed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            last_processed_at: Mutex::new(None),
            last_error: Mutex::new(None),
        });

        self.by_id.insert(subscription.id, subscription.clone());

        let mut list = self.by_type.entry(event_type.clone()).or_default();
        let key = (Reverse(subscription.options.priority), subscription.seq);
        let position = match list
            .binary_search_by(|existing| (Reverse(existing.options.priority), existing.seq).cmp(&key))
        {
            Ok(position) | Err(position) => position,
        };
        list.insert(position, subscription.clone());

        info!(
            subscription_id = %subscription.id,
            subscriber_id = %subscription.options.subscriber_id,
            event_type = %event_type,
            "registered subscription"
        );
        subscription
    }

    /// Deactivate and remove a subscription
    ///
    /// Unknown ids are not an error; `false` is returned.
    pub fn unsubscribe(&self, subscription_id: Uuid) -> bool {
        let Some((_, subscription)) = self.by_id.remove(&subscription_id) else {
            return false;
        };

        subscription.deactivate();
        if let Some(mut list) = self.by_type.get_mut(&subscription.event_type) {
            list.retain(|s| s.id != subscription_id);
        }

        debug!(subscription_id = %subscription_id, "removed subscription");
        true
    }

    /// Remove every subscription owned by a subscriber id
    pub fn unsubscribe_all(&self, subscriber_id: &str) -> usize {
        let ids: Vec<Uuid> = self
            .by_id
            .iter()
            .filter(|entry| entry.options.subscriber_id == subscriber_id)
            .map(|entry| entry.id)
            .collect();

        let mut removed = 0;
        for id in ids {
            if self.unsubscribe(id) {
                removed += 1;
            }
        }
        removed
    }

    /// Active subscriptions for an event type, in dispatch order
    pub fn subscriptions_for(&self, event_type: &str) -> Vec<Arc<Subscription>> {
        self.by_type
            .get(event_type)
            .map(|list| {
                list.iter()
                    .filter(|s| s.is_active())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Active subscription for a subscriber id on an event type
    pub fn find_for_subscriber(
        &self,
        subscriber_id: &str,
        event_type: &str,
    ) -> Option<Arc<Subscription>> {
        self.subscriptions_for(event_type)
            .into_iter()
            .find(|s| s.options.subscriber_id == subscriber_id)
    }

    /// Counter snapshots for all registered subscriptions
    pub fn stats(&self) -> Vec<SubscriptionStats> {
        let mut stats: Vec<SubscriptionStats> =
            self.by_id.iter().map(|entry| entry.stats()).collect();
        stats.sort_by(|a, b| a.subscriber_id.cmp(&b.subscriber_id));
        stats
    }

    /// Whether a subscription id is still registered
    pub fn contains(&self, subscription_id: Uuid) -> bool {
        self.by_id.contains_key(&subscription_id)
    }

    /// Number of registered subscriptions
    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ok_handler() -> Arc<dyn EventHandler> {
        handler_fn(|_event| async { Ok(()) })
    }

    #[tokio::test]
    async fn test_handler_fn_invocation() {
        let handler = handler_fn(|event: Event| async move {
            if event.event_type == "bad" {
                Err(HandlerError::non_retryable("rejected"))
            } else {
                Ok(())
            }
        });

        let ok = Event::new("good", "s", json!({}));
        assert!(handler.handle(&ok).await.is_ok());

        let bad = Event::new("bad", "s", json!({}));
        assert!(handler.handle(&bad).await.is_err());
    }

    #[test]
    fn test_dispatch_order_priority_then_creation() {
        let manager = SubscriptionManager::new();

        let low = manager.subscribe(
            "order.created",
            ok_handler(),
            SubscriptionOptions::new("low").with_priority(EventPriority::Low),
        );
        let critical = manager.subscribe(
            "order.created",
            ok_handler(),
            SubscriptionOptions::new("critical").with_priority(EventPriority::Critical),
        );
        let normal_first = manager.subscribe(
            "order.created",
            ok_handler(),
            SubscriptionOptions::new("normal-first"),
        );
        let normal_second = manager.subscribe(
            "order.created",
            ok_handler(),
            SubscriptionOptions::new("normal-second"),
        );

        let order: Vec<Uuid> = manager
            .subscriptions_for("order.created")
            .iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(
            order,
            vec![critical.id, normal_first.id, normal_second.id, low.id]
        );
    }

    #[test]
    fn test_unsubscribe_unknown_returns_false() {
        let manager = SubscriptionManager::new();
        assert!(!manager.unsubscribe(Uuid::new_v4()));
    }

    #[test]
    fn test_unsubscribe_removes_and_deactivates() {
        let manager = SubscriptionManager::new();
        let subscription =
            manager.subscribe("order.created", ok_handler(), SubscriptionOptions::new("w"));

        assert!(manager.unsubscribe(subscription.id));
        assert!(!subscription.is_active());
        assert!(manager.subscriptions_for("order.created").is_empty());
        assert!(!manager.unsubscribe(subscription.id));
    }

    #[test]
    fn test_unsubscribe_all_by_subscriber() {
        let manager = SubscriptionManager::new();
        manager.subscribe("a", ok_handler(), SubscriptionOptions::new("worker"));
        manager.subscribe("b", ok_handler(), SubscriptionOptions::new("worker"));
        manager.subscribe("a", ok_handler(), SubscriptionOptions::new("other"));

        assert_eq!(manager.unsubscribe_all("worker"), 2);
        assert_eq!(manager.len(), 1);
        assert_eq!(manager.unsubscribe_all("worker"), 0);
    }

    #[test]
    fn test_stats_reflect_counters() {
        let manager = SubscriptionManager::new();
        let subscription =
            manager.subscribe("order.created", ok_handler(), SubscriptionOptions::new("w"));

        subscription.record_success();
        subscription.record_success();
        subscription.record_failure("boom");

        let stats = manager.stats();
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].processed, 2);
        assert_eq!(stats[0].failed, 1);
        assert_eq!(stats[0].last_error.as_deref(), Some("boom"));
        assert!(stats[0].last_processed_at.is_some());
    }

    #[test]
    fn test_find_for_subscriber() {
        let manager = SubscriptionManager::new();
        manager.subscribe("order.created", ok_handler(), SubscriptionOptions::new("a"));
        let b = manager.subscribe("order.created", ok_handler(), SubscriptionOptions::new("b"));

        let found = manager.find_for_subscriber("b", "order.created").unwrap();
        assert_eq!(found.id, b.id);
        assert!(manager.find_for_subscriber("c", "order.created").is_none());
    }
}
