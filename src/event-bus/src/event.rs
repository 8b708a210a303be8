//! # Event Structure
//!
//! This module defines the core [`Event`] value carried by the bus. Events
//! are immutable value objects: every mutator returns a new value, so a
//! published event can be shared freely between subscriptions without
//! synchronization.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::EventPriority;

/// Reserved header keys recognized by the bus
pub mod headers {
    /// Trace identifier propagated across publish and processing
    pub const TRACE_ID: &str = "x-trace-id";
    /// Span identifier of the current span
    pub const SPAN_ID: &str = "x-span-id";
    /// Span identifier of the parent span
    pub const PARENT_SPAN_ID: &str = "x-parent-span-id";
    /// Sampling decision flag
    pub const SAMPLED: &str = "x-sampled";
    /// Correlation identifier for request chains
    pub const CORRELATION_ID: &str = "correlation-id";
    /// Schema version the payload was written against
    pub const SCHEMA_VERSION: &str = "schemaVersion";
}

/// Immutable event value carried by the bus
///
/// The event type is a host-chosen string with equality and hashing; the
/// bus imposes no enumeration. The payload is opaque JSON validated only
/// by the schema registry when one is registered for the type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Unique event identifier
    pub id: Uuid,

    /// Event type identifier
    pub event_type: String,

    /// Opaque payload
    pub data: serde_json::Value,

    /// Ordered headers, including reserved trace and schema keys
    pub headers: BTreeMap<String, String>,

    /// Producer label
    pub source: String,

    /// Event creation timestamp
    pub timestamp: DateTime<Utc>,

    /// Dispatch priority
    pub priority: EventPriority,

    /// Event payload version
    pub version: String,

    /// Correlation identifier for grouping related events
    pub correlation_id: Option<String>,

    /// Identifier of the event that caused this one
    pub causation_id: Option<String>,
}

impl Event {
    /// Create a new event with the given type, source, and payload
    pub fn new(
        event_type: impl Into<String>,
        source: impl Into<String>,
        data: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type: event_type.into(),
            data,
            headers: BTreeMap::new(),
            source: source.into(),
            timestamp: Utc::now(),
            priority: EventPriority::Normal,
            version: "1.0.0".to_string(),
            correlation_id: None,
            causation_id: None,
        }
    }

    /// Return a copy with the given header set
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Return a copy with the given headers merged in
    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Return a copy with the given priority
    pub fn with_priority(mut self, priority: EventPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Return a copy with the given payload version
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Return a copy with the given payload
    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    /// Return a copy with the given correlation id
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Return a copy with the given causation id
    pub fn with_causation_id(mut self, causation_id: impl Into<String>) -> Self {
        self.causation_id = Some(causation_id.into());
        self
    }

    /// Look up a header value
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Schema version requested via the `schemaVersion` header
    pub fn schema_version(&self) -> Option<&str> {
        self.header(headers::SCHEMA_VERSION)
    }

    /// Event age in seconds
    pub fn age_seconds(&self) -> i64 {
        (Utc::now() - self.timestamp).num_seconds()
    }
}
