//! # Trace Context Propagation
//!
//! This module threads causal identifiers through publish and processing.
//! A [`TraceContext`] travels inside event headers under the reserved
//! `x-trace-id` / `x-span-id` / `x-parent-span-id` / `x-sampled` keys, so
//! no thread-local state is involved: the context is an explicit value
//! attached to the dispatched event.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::config::TracingConfig;
use crate::error::HandlerError;
use crate::event::{headers, Event};

/// Propagated trace identifiers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    /// Trace identifier shared by all spans of one causal chain
    pub trace_id: String,

    /// Identifier of the current span
    pub span_id: String,

    /// Identifier of the parent span, if any
    pub parent_span_id: Option<String>,

    /// Sampling decision made at the trace root
    pub sampled: bool,

    /// Key-value baggage carried alongside the identifiers
    pub baggage: HashMap<String, String>,
}

impl TraceContext {
    /// Start a new root context
    pub fn new_root(sampled: bool) -> Self {
        Self {
            trace_id: new_trace_id(),
            span_id: new_span_id(),
            parent_span_id: None,
            sampled,
            baggage: HashMap::new(),
        }
    }

    /// Derive a child context continuing this trace
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id.clone(),
            span_id: new_span_id(),
            parent_span_id: Some(self.span_id.clone()),
            sampled: self.sampled,
            baggage: self.baggage.clone(),
        }
    }

    /// Reconstruct a context from event headers
    pub fn from_headers(header_map: &BTreeMap<String, String>) -> Option<Self> {
        let trace_id = header_map.get(headers::TRACE_ID)?.clone();
        let span_id = header_map
            .get(headers::SPAN_ID)
            .cloned()
            .unwrap_or_else(new_span_id);
        let parent_span_id = header_map.get(headers::PARENT_SPAN_ID).cloned();
        let sampled = header_map
            .get(headers::SAMPLED)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(true);

        Some(Self {
            trace_id,
            span_id,
            parent_span_id,
            sampled,
            baggage: HashMap::new(),
        })
    }

    /// Stamp this context onto a header map
    pub fn apply_to(&self, header_map: &mut BTreeMap<String, String>) {
        header_map.insert(headers::TRACE_ID.to_string(), self.trace_id.clone());
        header_map.insert(headers::SPAN_ID.to_string(), self.span_id.clone());
        if let Some(parent) = &self.parent_span_id {
            header_map.insert(headers::PARENT_SPAN_ID.to_string(), parent.clone());
        }
        header_map.insert(
            headers::SAMPLED.to_string(),
            if self.sampled { "1" } else { "0" }.to_string(),
        );
    }
}

fn new_trace_id() -> String {
    Uuid::new_v4().simple().to_string()
}

fn new_span_id() -> String {
    Uuid::new_v4().simple().to_string()[..16].to_string()
}

/// Role of a span within the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    /// Publish-side span
    Producer,
    /// Processing-side span, one per (event, subscriber)
    Consumer,
}

/// Final status of a span
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpanStatus {
    Unset,
    Ok,
    Error { message: String },
}

/// Point-in-time annotation on a span
#[derive(Debug, Clone, PartialEq)]
pub struct SpanEvent {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub attributes: HashMap<String, String>,
}

/// A single unit of traced work
#[derive(Debug, Clone, PartialEq)]
pub struct TraceSpan {
    /// Identifiers of this span
    pub context: TraceContext,

    /// Span name
    pub name: String,

    /// Producer or consumer role
    pub kind: SpanKind,

    /// Service name from the tracing configuration
    pub service_name: String,

    /// Service version from the tracing configuration
    pub service_version: String,

    /// Start timestamp
    pub start_time: DateTime<Utc>,

    /// End timestamp, set by `finish_span`
    pub end_time: Option<DateTime<Utc>>,

    /// Attributes, bounded by `max_span_attributes`
    pub attributes: HashMap<String, String>,

    /// Events, bounded by `max_span_events`
    pub events: Vec<SpanEvent>,

    /// Final status
    pub status: SpanStatus,

    /// Attributes dropped because the bound was reached
    pub dropped_attributes: u32,

    /// Events dropped because the bound was reached
    pub dropped_events: u32,

    max_attributes: usize,
    max_events: usize,
}

impl TraceSpan {
    fn new(
        context: TraceContext,
        name: String,
        kind: SpanKind,
        config: &TracingConfig,
    ) -> Self {
        Self {
            context,
            name,
            kind,
            service_name: config.service_name.clone(),
            service_version: config.service_version.clone(),
            start_time: Utc::now(),
            end_time: None,
            attributes: HashMap::new(),
            events: Vec::new(),
            status: SpanStatus::Unset,
            dropped_attributes: 0,
            dropped_events: 0,
            max_attributes: config.max_span_attributes,
            max_events: config.max_span_events,
        }
    }

    /// Set an attribute, honoring the configured bound
    pub fn set_attribute(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        if self.attributes.len() >= self.max_attributes && !self.attributes.contains_key(&key) {
            self.dropped_attributes += 1;
            return;
        }
        self.attributes.insert(key, value.into());
    }

    /// Append an event, honoring the configured bound
    pub fn add_event(&mut self, name: impl Into<String>, attributes: HashMap<String, String>) {
        if self.events.len() >= self.max_events {
            self.dropped_events += 1;
            return;
        }
        self.events.push(SpanEvent {
            name: name.into(),
            timestamp: Utc::now(),
            attributes,
        });
    }

    /// Span duration, once finished
    pub fn duration_ms(&self) -> Option<i64> {
        self.end_time
            .map(|end| (end - self.start_time).num_milliseconds())
    }
}

/// Destination for finished spans
pub trait SpanExporter: Send + Sync {
    /// Receive a finished span
    fn export(&self, span: &TraceSpan);

    /// Flush any buffered spans
    fn flush(&self) {}

    /// Release exporter resources
    fn shutdown(&self) {}
}

/// Exporter that drops every span
#[derive(Debug, Default)]
pub struct NoopExporter;

impl SpanExporter for NoopExporter {
    fn export(&self, _span: &TraceSpan) {}
}

/// Exporter that collects finished spans in memory, for tests and demos
#[derive(Debug, Default)]
pub struct InMemoryExporter {
    spans: Mutex<Vec<TraceSpan>>,
}

impl InMemoryExporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all finished spans
    pub fn finished_spans(&self) -> Vec<TraceSpan> {
        self.spans.lock().clone()
    }
}

impl SpanExporter for InMemoryExporter {
    fn export(&self, span: &TraceSpan) {
        self.spans.lock().push(span.clone());
    }
}

/// Tracing hook threading contexts through publish and processing
#[derive(Clone)]
pub struct Tracer {
    config: Arc<TracingConfig>,
    exporter: Arc<dyn SpanExporter>,
}

impl Tracer {
    /// Create a tracer with the given configuration and exporter
    pub fn new(config: TracingConfig, exporter: Arc<dyn SpanExporter>) -> Self {
        Self {
            config: Arc::new(config),
            exporter,
        }
    }

    /// A disabled tracer that produces no spans
    pub fn disabled() -> Self {
        let config = TracingConfig {
            enabled: false,
            ..TracingConfig::default()
        };
        Self::new(config, Arc::new(NoopExporter))
    }

    fn sample(&self) -> bool {
        if self.config.sampling_rate >= 1.0 {
            return true;
        }
        if self.config.sampling_rate <= 0.0 {
            return false;
        }
        rand::random::<f64>() < self.config.sampling_rate
    }

    fn context_for(&self, header_map: &BTreeMap<String, String>) -> Option<TraceContext> {
        match TraceContext::from_headers(header_map) {
            Some(parent) if parent.sampled => Some(parent.child()),
            Some(_) => None,
            None => {
                if self.sample() {
                    Some(TraceContext::new_root(true))
                } else {
                    None
                }
            }
        }
    }

    /// Start a producer span for a publish, if sampled
    pub fn start_publish_trace(&self, event: &Event) -> Option<TraceSpan> {
        if !self.config.enabled {
            return None;
        }

        let context = self.context_for(&event.headers)?;
        let mut span = TraceSpan::new(
            context,
            format!("{} publish", event.event_type),
            SpanKind::Producer,
            &self.config,
        );
        span.set_attribute("event.type", event.event_type.clone());
        span.set_attribute("event.id", event.id.to_string());
        Some(span)
    }

    /// Start a consumer span continuing the event's trace, if sampled
    pub fn start_processing_trace(&self, event: &Event, subscriber_id: &str) -> Option<TraceSpan> {
        if !self.config.enabled {
            return None;
        }

        let context = self.context_for(&event.headers)?;
        let mut span = TraceSpan::new(
            context,
            format!("{} process", event.event_type),
            SpanKind::Consumer,
            &self.config,
        );
        span.set_attribute("event.type", event.event_type.clone());
        span.set_attribute("event.id", event.id.to_string());
        span.set_attribute("subscriber.id", subscriber_id.to_string());
        Some(span)
    }

    /// Reconstruct the trace context carried by a header map
    pub fn continue_trace(&self, header_map: &BTreeMap<String, String>) -> Option<TraceContext> {
        TraceContext::from_headers(header_map)
    }

    /// Return a copy of the event with the span's context in its headers
    pub fn add_tracing_headers(&self, event: Event, span: &TraceSpan) -> Event {
        let mut event = event;
        span.context.apply_to(&mut event.headers);
        event
    }

    /// Record a named event on the span
    pub fn record_span_event(
        &self,
        span: &mut TraceSpan,
        name: impl Into<String>,
        attributes: HashMap<String, String>,
    ) {
        span.add_event(name, attributes);
    }

    /// Record a handler failure on the span
    pub fn record_error(&self, span: &mut TraceSpan, err: &HandlerError) {
        span.status = SpanStatus::Error {
            message: err.message.clone(),
        };

        let mut attributes = HashMap::new();
        attributes.insert("error.type".to_string(), err.error_type());
        attributes.insert("error.message".to_string(), err.message.clone());
        if self.config.include_stack_trace {
            if let Some(trace) = &err.stack_trace {
                attributes.insert("error.stack_trace".to_string(), trace.clone());
            }
        }
        span.add_event("exception", attributes);
    }

    /// Finish and export a span
    pub fn finish_span(&self, mut span: TraceSpan) {
        span.end_time = Some(Utc::now());
        if span.status == SpanStatus::Unset {
            span.status = SpanStatus::Ok;
        }

        debug!(
            trace_id = %span.context.trace_id,
            span_id = %span.context.span_id,
            name = %span.name,
            "finishing span"
        );

        if self.config.enable_async_tracing {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let exporter = self.exporter.clone();
                handle.spawn(async move {
                    exporter.export(&span);
                });
                return;
            }
        }
        self.exporter.export(&span);
    }

    /// Flush the exporter
    pub fn flush(&self) {
        self.exporter.flush();
    }

    /// Shut the exporter down
    pub fn shutdown(&self) {
        self.exporter.flush();
        self.exporter.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_tracer() -> (Tracer, Arc<InMemoryExporter>) {
        let exporter = Arc::new(InMemoryExporter::new());
        let config = TracingConfig {
            enable_async_tracing: false,
            ..TracingConfig::default()
        };
        (Tracer::new(config, exporter.clone()), exporter)
    }

    #[test]
    fn test_header_round_trip() {
        let (tracer, _) = test_tracer();
        let ctx = TraceContext::new_root(true);

        let mut header_map = BTreeMap::new();
        ctx.apply_to(&mut header_map);

        let restored = tracer.continue_trace(&header_map).unwrap();
        assert_eq!(restored.trace_id, ctx.trace_id);
        assert_eq!(restored.span_id, ctx.span_id);
        assert!(restored.sampled);
    }

    #[test]
    fn test_publish_then_process_shares_trace() {
        let (tracer, _) = test_tracer();
        let event = Event::new("order.created", "order-service", json!({}));

        let publish_span = tracer.start_publish_trace(&event).unwrap();
        let event = tracer.add_tracing_headers(event, &publish_span);

        let process_span = tracer.start_processing_trace(&event, "order-worker").unwrap();
        assert_eq!(
            process_span.context.trace_id,
            publish_span.context.trace_id
        );
        assert_eq!(
            process_span.context.parent_span_id.as_deref(),
            Some(publish_span.context.span_id.as_str())
        );
    }

    #[test]
    fn test_unsampled_trace_produces_no_spans() {
        let exporter = Arc::new(InMemoryExporter::new());
        let config = TracingConfig {
            sampling_rate: 0.0,
            enable_async_tracing: false,
            ..TracingConfig::default()
        };
        let tracer = Tracer::new(config, exporter);

        let event = Event::new("order.created", "order-service", json!({}));
        assert!(tracer.start_publish_trace(&event).is_none());
    }

    #[test]
    fn test_disabled_tracer() {
        let tracer = Tracer::disabled();
        let event = Event::new("order.created", "order-service", json!({}));
        assert!(tracer.start_publish_trace(&event).is_none());
        assert!(tracer.start_processing_trace(&event, "w").is_none());
    }

    #[test]
    fn test_span_attribute_bound() {
        let config = TracingConfig {
            max_span_attributes: 2,
            enable_async_tracing: false,
            ..TracingConfig::default()
        };
        let mut span = TraceSpan::new(
            TraceContext::new_root(true),
            "test".to_string(),
            SpanKind::Producer,
            &config,
        );

        span.set_attribute("a", "1");
        span.set_attribute("b", "2");
        span.set_attribute("c", "3");

        assert_eq!(span.attributes.len(), 2);
        assert_eq!(span.dropped_attributes, 1);
    }

    #[test]
    fn test_record_error_sets_status_and_event() {
        let (tracer, exporter) = test_tracer();
        let event = Event::new("order.created", "order-service", json!({}));

        let mut span = tracer.start_processing_trace(&event, "w").unwrap();
        let err = HandlerError::retryable("connection refused");
        tracer.record_error(&mut span, &err);
        tracer.finish_span(span);

        let finished = exporter.finished_spans();
        assert_eq!(finished.len(), 1);
        assert!(matches!(finished[0].status, SpanStatus::Error { .. }));
        assert_eq!(finished[0].events[0].name, "exception");
        assert!(finished[0].end_time.is_some());
    }
}
