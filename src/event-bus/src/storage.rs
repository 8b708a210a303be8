//! # Event Persistence
//!
//! Optional sink for published events. The bus works without one; when a
//! sink is installed, events are persisted best-effort after passing
//! pre-dispatch checks. The in-memory implementation backs tests and
//! demos; durable backends live behind the same trait.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;
use uuid::Uuid;

use crate::error::Result;
use crate::event::Event;

/// Pluggable persistence sink for published events
#[async_trait]
pub trait EventPersistence: Send + Sync {
    /// Persist one event
    async fn persist_event(&self, event: &Event) -> Result<()>;

    /// Fetch an event by id
    async fn get_event(&self, event_id: Uuid) -> Result<Option<Event>>;

    /// Delete events older than the cutoff; returns the number removed
    async fn delete_events_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize>;
}

/// In-memory persistence backed by a concurrent map
#[derive(Default)]
pub struct InMemoryEventStore {
    events: DashMap<Uuid, Event>,
}

impl InMemoryEventStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of stored events
    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

#[async_trait]
impl EventPersistence for InMemoryEventStore {
    async fn persist_event(&self, event: &Event) -> Result<()> {
        debug!(event_id = %event.id, "persisting event");
        self.events.insert(event.id, event.clone());
        Ok(())
    }

    async fn get_event(&self, event_id: Uuid) -> Result<Option<Event>> {
        Ok(self.events.get(&event_id).map(|e| e.value().clone()))
    }

    async fn delete_events_older_than(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let before = self.events.len();
        self.events.retain(|_, event| event.timestamp >= cutoff);
        Ok(before - self.events.len())
    }
}
