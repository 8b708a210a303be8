//! # Dead Letter Queue
//!
//! In-process store for events that failed processing. Entries carry the
//! full failure history and walk a status lifecycle
//! (`Failed` ↔ `Retrying` → `Resolved`/`Exhausted`, plus the poison
//! statuses). Retries go back through the bus to the original subscriber
//! via the [`DeadLetterReprocessor`] seam; a CAS-guarded in-flight set
//! ensures a single retry per entry at a time.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{DeadLetterConfig, PoisonPolicyConfig};
use crate::error::{EventBusError, HandlerError, Result};
use crate::event::Event;
use crate::metrics::EventBusMetrics;
use crate::poison::PoisonMessageDetector;
use crate::types::{
    DeadLetterStatus, DlqHealth, DlqStatistics, FailureReason, PoisonAction,
    PoisonMessageStatistics, ProcessingStage, RetryPolicy,
};

/// A failed event stored for retry or manual intervention
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEvent {
    /// Dead letter entry identity, distinct from the event id
    pub id: Uuid,

    /// The event that failed processing
    pub original_event: Event,

    /// Subscriber the failure is attributed to
    pub subscriber_id: String,

    /// Timestamp of the first recorded failure
    pub first_failure_time: DateTime<Utc>,

    /// Timestamp of the latest recorded failure
    pub last_failure_time: DateTime<Utc>,

    /// Handler attempts consumed so far
    pub retry_count: u32,

    /// Total attempt budget for this entry
    pub max_retries: u32,

    /// Ordered failure history, one reason per attempt
    pub failure_history: Vec<FailureReason>,

    /// Lifecycle status
    pub status: DeadLetterStatus,

    /// Denormalized event type for filtering
    pub event_type: String,

    /// Denormalized event source for filtering
    pub event_source: String,

    /// Free-form entry metadata
    pub metadata: HashMap<String, String>,

    /// Retry policy governing further attempts
    pub retry_policy: RetryPolicy,
}

impl DeadLetterEvent {
    /// The most recent failure reason
    pub fn latest_reason(&self) -> Option<&FailureReason> {
        self.failure_history.last()
    }
}

/// Query over stored entries
///
/// Results are sorted by `last_failure_time` descending and capped by
/// `limit` (100 by default).
#[derive(Debug, Clone, Default)]
pub struct DlqFilter {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub event_type: Option<String>,
    pub error_type: Option<String>,
    pub status: Option<DeadLetterStatus>,
    pub max_retry_count: Option<u32>,
    pub limit: Option<usize>,
}

impl DlqFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_time_range(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    pub fn with_error_type(mut self, error_type: impl Into<String>) -> Self {
        self.error_type = Some(error_type.into());
        self
    }

    pub fn with_status(mut self, status: DeadLetterStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_max_retry_count(mut self, ceiling: u32) -> Self {
        self.max_retry_count = Some(ceiling);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, entry: &DeadLetterEvent) -> bool {
        if let Some(from) = self.from {
            if entry.last_failure_time < from {
                return false;
            }
        }
        if let Some(to) = self.to {
            if entry.last_failure_time > to {
                return false;
            }
        }
        if let Some(event_type) = &self.event_type {
            if entry.event_type != *event_type {
                return false;
            }
        }
        if let Some(error_type) = &self.error_type {
            let latest = entry.latest_reason().map(|r| r.error_type.as_str());
            if latest != Some(error_type.as_str()) {
                return false;
            }
        }
        if let Some(status) = self.status {
            if entry.status != status {
                return false;
            }
        }
        if let Some(ceiling) = self.max_retry_count {
            if entry.retry_count > ceiling {
                return false;
            }
        }
        true
    }
}

/// Internal queue notifications for observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DlqNotification {
    EventStored { dlq_id: Uuid, event_type: String },
    RetryStarted { dlq_id: Uuid, attempt: u32 },
    EventResolved { dlq_id: Uuid },
    EventExhausted { dlq_id: Uuid },
    EventQuarantined { dlq_id: Uuid },
    EventDiscarded { event_id: Uuid },
    EventRemoved { dlq_id: Uuid },
}

/// Outcome of a single retry call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DlqRetryOutcome {
    /// The subscriber processed the event; the entry was removed
    Resolved,
    /// The retry failed; the entry remains with the given status
    Failed {
        status: DeadLetterStatus,
        retry_count: u32,
    },
}

/// Hook through which retries re-invoke the original subscriber
///
/// The dispatch engine installs an implementation that resolves the
/// subscriber by id and runs a single timeout-bounded invocation.
#[async_trait]
pub trait DeadLetterReprocessor: Send + Sync {
    async fn reprocess(&self, entry: &DeadLetterEvent)
        -> std::result::Result<(), HandlerError>;
}

/// Bounded, concurrent dead letter queue with auto-retry
#[derive(Clone)]
pub struct DeadLetterQueue {
    config: Arc<DeadLetterConfig>,
    entries: Arc<DashMap<Uuid, DeadLetterEvent>>,
    retrying: Arc<DashSet<Uuid>>,
    poison: Arc<PoisonMessageDetector>,
    reprocessor: Arc<parking_lot::RwLock<Option<Arc<dyn DeadLetterReprocessor>>>>,
    metrics: Arc<dyn EventBusMetrics>,
    notifications: broadcast::Sender<DlqNotification>,
    total_stored: Arc<AtomicU64>,
    total_resolved: Arc<AtomicU64>,
    shutdown: CancellationToken,
}

impl DeadLetterQueue {
    pub fn new(
        config: DeadLetterConfig,
        poison_config: PoisonPolicyConfig,
        metrics: Arc<dyn EventBusMetrics>,
    ) -> Self {
        let (notifications, _) = broadcast::channel(256);
        Self {
            config: Arc::new(config),
            entries: Arc::new(DashMap::new()),
            retrying: Arc::new(DashSet::new()),
            poison: Arc::new(PoisonMessageDetector::new(poison_config)),
            reprocessor: Arc::new(parking_lot::RwLock::new(None)),
            metrics,
            notifications,
            total_stored: Arc::new(AtomicU64::new(0)),
            total_resolved: Arc::new(AtomicU64::new(0)),
            shutdown: CancellationToken::new(),
        }
    }

    /// Install the hook used to re-invoke subscribers on retry
    pub fn set_reprocessor(&self, reprocessor: Arc<dyn DeadLetterReprocessor>) {
        *self.reprocessor.write() = Some(reprocessor);
    }

    /// Subscribe to internal queue notifications
    pub fn subscribe_notifications(&self) -> broadcast::Receiver<DlqNotification> {
        self.notifications.subscribe()
    }

    fn notify(&self, notification: DlqNotification) {
        let _ = self.notifications.send(notification);
    }

    /// Entries currently stored
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entry by id
    pub fn get(&self, dlq_id: Uuid) -> Option<DeadLetterEvent> {
        self.entries.get(&dlq_id).map(|entry| entry.value().clone())
    }

    /// A successful delivery clears the poison tracker for the event id
    pub fn record_processing_success(&self, event_id: Uuid) {
        self.poison.record_success(event_id);
    }

    /// Accept a failed delivery, applying the poison policy
    ///
    /// Returns the stored entry id and status, or `None` when the poison
    /// policy discarded the event.
    pub fn handle_failure(
        &self,
        event: &Event,
        subscriber_id: &str,
        mut history: Vec<FailureReason>,
        retry_policy: RetryPolicy,
    ) -> Option<(Uuid, DeadLetterStatus)> {
        let error_type = history
            .last()
            .map(|reason| reason.error_type.clone())
            .unwrap_or_else(|| "Internal".to_string());

        let action = self.poison.record_failure(event.id, &error_type);

        if action == Some(PoisonAction::Discard) {
            info!(event_id = %event.id, error_type, "poison event discarded");
            self.notify(DlqNotification::EventDiscarded { event_id: event.id });
            return None;
        }

        if action.is_some() {
            if let Some(last) = history.last_mut() {
                last.is_poison_message = true;
            }
        }

        let retry_count = history
            .iter()
            .map(|reason| reason.attempt_number)
            .max()
            .unwrap_or(0);
        let max_retries = retry_policy.max_attempts;

        let status = match action {
            Some(PoisonAction::Quarantine) => DeadLetterStatus::Quarantined,
            Some(PoisonAction::RequireManual) => DeadLetterStatus::PendingManual,
            _ if retry_count >= max_retries => DeadLetterStatus::Exhausted,
            _ => DeadLetterStatus::Failed,
        };

        let now = Utc::now();
        let entry = DeadLetterEvent {
            id: Uuid::new_v4(),
            original_event: event.clone(),
            subscriber_id: subscriber_id.to_string(),
            first_failure_time: history.first().map(|r| r.timestamp).unwrap_or(now),
            last_failure_time: history.last().map(|r| r.timestamp).unwrap_or(now),
            retry_count,
            max_retries,
            failure_history: history,
            status,
            event_type: event.event_type.clone(),
            event_source: event.source.clone(),
            metadata: HashMap::new(),
            retry_policy,
        };

        let dlq_id = self.store(entry);
        self.metrics
            .record_event_dead_lettered(&event.event_type, subscriber_id);

        match status {
            DeadLetterStatus::Quarantined => self.notify(DlqNotification::EventQuarantined { dlq_id }),
            DeadLetterStatus::Exhausted => self.notify(DlqNotification::EventExhausted { dlq_id }),
            DeadLetterStatus::Failed => self.schedule_auto_retry(dlq_id, retry_count),
            _ => {}
        }

        Some((dlq_id, status))
    }

    /// Insert an entry, evicting the oldest 10% at capacity
    fn store(&self, entry: DeadLetterEvent) -> Uuid {
        if self.entries.len() >= self.config.max_size {
            let batch = (self.config.max_size / 10).max(1);
            self.evict_oldest(batch);
        }

        let dlq_id = entry.id;
        let event_type = entry.event_type.clone();
        warn!(
            dlq_id = %dlq_id,
            event_id = %entry.original_event.id,
            subscriber_id = %entry.subscriber_id,
            status = %entry.status,
            "stored dead letter entry"
        );

        self.entries.insert(dlq_id, entry);
        self.total_stored.fetch_add(1, Ordering::Relaxed);
        self.notify(DlqNotification::EventStored { dlq_id, event_type });
        dlq_id
    }

    fn evict_oldest(&self, count: usize) {
        let mut candidates: Vec<(Uuid, DateTime<Utc>)> = self
            .entries
            .iter()
            .map(|entry| (entry.id, entry.first_failure_time))
            .collect();
        candidates.sort_by_key(|(_, first_failure)| *first_failure);

        for (dlq_id, _) in candidates.into_iter().take(count) {
            self.entries.remove(&dlq_id);
            self.retrying.remove(&dlq_id);
        }
        warn!(count, "evicted oldest dead letter entries at capacity");
    }

    /// Query stored entries
    pub fn retrieve(&self, filter: &DlqFilter) -> Vec<DeadLetterEvent> {
        let mut matched: Vec<DeadLetterEvent> = self
            .entries
            .iter()
            .filter(|entry| filter.matches(entry))
            .map(|entry| entry.value().clone())
            .collect();

        matched.sort_by(|a, b| b.last_failure_time.cmp(&a.last_failure_time));
        matched.truncate(filter.limit.unwrap_or(100));
        matched
    }

    /// Retry one entry through the installed reprocessor
    ///
    /// The entry is marked `Retrying` under a CAS guard so a single
    /// event cannot retry concurrently.
    pub async fn retry(&self, dlq_id: Uuid) -> Result<DlqRetryOutcome> {
        let snapshot = self
            .get(dlq_id)
            .ok_or(EventBusError::DlqEntryNotFound { dlq_id })?;

        match snapshot.status {
            DeadLetterStatus::Failed
            | DeadLetterStatus::PendingManual
            | DeadLetterStatus::Quarantined => {}
            DeadLetterStatus::Retrying => {
                return Err(EventBusError::RetryInProgress { dlq_id });
            }
            other => {
                return Err(EventBusError::RetryNotPermitted {
                    dlq_id,
                    message: format!("status {} does not permit retry", other),
                });
            }
        }

        // Single insertion wins; losers observe a retry in progress
        if !self.retrying.insert(dlq_id) {
            return Err(EventBusError::RetryInProgress { dlq_id });
        }

        let previous_status = snapshot.status;
        match self.entries.get_mut(&dlq_id) {
            Some(mut entry) => {
                entry.status = DeadLetterStatus::Retrying;
            }
            None => {
                self.retrying.remove(&dlq_id);
                return Err(EventBusError::DlqEntryNotFound { dlq_id });
            }
        }

        let attempt = snapshot.retry_count + 1;
        self.notify(DlqNotification::RetryStarted { dlq_id, attempt });
        debug!(dlq_id = %dlq_id, attempt, "retrying dead letter entry");

        let reprocessor = self.reprocessor.read().clone();
        let reprocessor = match reprocessor {
            Some(reprocessor) => reprocessor,
            None => {
                if let Some(mut entry) = self.entries.get_mut(&dlq_id) {
                    entry.status = previous_status;
                }
                self.retrying.remove(&dlq_id);
                return Err(EventBusError::internal(
                    "no dead letter reprocessor is installed",
                ));
            }
        };

        let result = reprocessor.reprocess(&snapshot).await;
        let outcome = match result {
            Ok(()) => {
                self.entries.remove(&dlq_id);
                self.poison.record_success(snapshot.original_event.id);
                self.total_resolved.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_dlq_retry(true);
                self.notify(DlqNotification::EventResolved { dlq_id });
                info!(dlq_id = %dlq_id, attempt, "dead letter entry resolved");
                Ok(DlqRetryOutcome::Resolved)
            }
            Err(err) => {
                let action = self
                    .poison
                    .record_failure(snapshot.original_event.id, &err.error_type());

                let status = match action {
                    Some(PoisonAction::Discard) => DeadLetterStatus::Discarded,
                    Some(PoisonAction::Quarantine) => DeadLetterStatus::Quarantined,
                    Some(PoisonAction::RequireManual) => DeadLetterStatus::PendingManual,
                    None if attempt >= snapshot.max_retries => DeadLetterStatus::Exhausted,
                    None => DeadLetterStatus::Failed,
                };

                let mut reason = FailureReason::from_handler_error(
                    &err,
                    ProcessingStage::DlqRetry,
                    snapshot.subscriber_id.clone(),
                    attempt,
                    err.is_retryable(),
                );
                reason.is_poison_message = action.is_some();

                if status == DeadLetterStatus::Discarded {
                    self.entries.remove(&dlq_id);
                    self.notify(DlqNotification::EventDiscarded {
                        event_id: snapshot.original_event.id,
                    });
                } else if let Some(mut entry) = self.entries.get_mut(&dlq_id) {
                    entry.retry_count = attempt;
                    entry.last_failure_time = reason.timestamp;
                    entry.failure_history.push(reason);
                    entry.status = status;
                }

                match status {
                    DeadLetterStatus::Exhausted => {
                        self.notify(DlqNotification::EventExhausted { dlq_id });
                    }
                    DeadLetterStatus::Quarantined => {
                        self.notify(DlqNotification::EventQuarantined { dlq_id });
                    }
                    _ => {}
                }

                self.metrics.record_dlq_retry(false);
                debug!(dlq_id = %dlq_id, attempt, status = %status, "dead letter retry failed");
                Ok(DlqRetryOutcome::Failed {
                    status,
                    retry_count: attempt,
                })
            }
        };

        self.retrying.remove(&dlq_id);
        if let Ok(DlqRetryOutcome::Failed {
            status: DeadLetterStatus::Failed,
            retry_count,
        }) = &outcome
        {
            self.schedule_auto_retry(dlq_id, *retry_count);
        }
        outcome
    }

    /// Retry a batch of entries concurrently
    pub async fn retry_batch(&self, dlq_ids: &[Uuid]) -> Vec<(Uuid, Result<DlqRetryOutcome>)> {
        let futures = dlq_ids.iter().map(|dlq_id| {
            let queue = self.clone();
            let dlq_id = *dlq_id;
            async move { (dlq_id, queue.retry(dlq_id).await) }
        });
        join_all(futures).await
    }

    /// Unconditionally delete an entry
    pub fn remove(&self, dlq_id: Uuid) -> bool {
        let removed = self.entries.remove(&dlq_id).is_some();
        if removed {
            self.retrying.remove(&dlq_id);
            self.notify(DlqNotification::EventRemoved { dlq_id });
        }
        removed
    }

    /// Delete entries whose first failure is older than the retention
    pub fn purge(&self, retention: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(retention).unwrap_or_else(|_| chrono::Duration::zero());

        let expired: Vec<Uuid> = self
            .entries
            .iter()
            .filter(|entry| entry.first_failure_time < cutoff)
            .map(|entry| entry.id)
            .collect();

        for dlq_id in &expired {
            self.entries.remove(dlq_id);
            self.retrying.remove(dlq_id);
        }

        if !expired.is_empty() {
            info!(purged = expired.len(), "purged dead letter entries past retention");
        }
        expired.len()
    }

    /// Aggregate statistics and health rollup
    pub fn statistics(&self) -> DlqStatistics {
        let mut by_status: HashMap<DeadLetterStatus, u64> = HashMap::new();
        let mut by_event_type: HashMap<String, u64> = HashMap::new();
        let mut by_error_type: HashMap<String, u64> = HashMap::new();
        let mut retry_sum: u64 = 0;
        let mut oldest: Option<DateTime<Utc>> = None;
        let mut total = 0usize;

        for entry in self.entries.iter() {
            total += 1;
            *by_status.entry(entry.status).or_insert(0) += 1;
            *by_event_type.entry(entry.event_type.clone()).or_insert(0) += 1;
            if let Some(reason) = entry.latest_reason() {
                *by_error_type.entry(reason.error_type.clone()).or_insert(0) += 1;
            }
            retry_sum += entry.retry_count as u64;
            if oldest.map(|t| entry.first_failure_time < t).unwrap_or(true) {
                oldest = Some(entry.first_failure_time);
            }
        }

        let oldest_entry_age_seconds = oldest.map(|t| (Utc::now() - t).num_seconds());
        let average_retry_count = if total > 0 {
            retry_sum as f64 / total as f64
        } else {
            0.0
        };

        let problems = by_status.get(&DeadLetterStatus::Exhausted).copied().unwrap_or(0)
            + by_status
                .get(&DeadLetterStatus::Quarantined)
                .copied()
                .unwrap_or(0);
        let health = health_rollup(total, problems, oldest_entry_age_seconds);

        DlqStatistics {
            total_entries: total,
            by_status,
            by_event_type,
            by_error_type,
            average_retry_count,
            oldest_entry_age_seconds,
            total_stored: self.total_stored.load(Ordering::Relaxed),
            total_resolved: self.total_resolved.load(Ordering::Relaxed),
            health,
        }
    }

    /// Poison policy counters
    pub fn poison_statistics(&self) -> PoisonMessageStatistics {
        self.poison.statistics()
    }

    /// Schedule an auto-retry for a stored entry
    ///
    /// The scheduled task verifies the entry still exists, skips ids
    /// already retrying, and stops once the budget is exhausted.
    fn schedule_auto_retry(&self, dlq_id: Uuid, attempt_count: u32) {
        if !self.config.auto_retry_enabled {
            return;
        }

        let delay = self.config.auto_retry_policy.delay(attempt_count + 1);
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = queue.shutdown.cancelled() => return,
                _ = sleep(delay) => {}
            }

            let eligible = queue
                .entries
                .get(&dlq_id)
                .map(|entry| {
                    entry.status == DeadLetterStatus::Failed
                        && entry.retry_count < entry.max_retries
                })
                .unwrap_or(false);
            if !eligible || queue.retrying.contains(&dlq_id) {
                return;
            }

            if let Err(err) = queue.retry(dlq_id).await {
                debug!(dlq_id = %dlq_id, error = %err, "auto-retry skipped");
            }
        });
    }

    /// Start the periodic retention purge and poison-tracker sweep
    pub fn start_maintenance(&self) {
        let queue = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(queue.config.maintenance_interval());
            loop {
                tokio::select! {
                    _ = queue.shutdown.cancelled() => {
                        debug!("dead letter maintenance received shutdown signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        queue.purge(queue.config.default_retention());
                        queue.poison.purge_expired();
                    }
                }
            }
        });
    }

    /// Stop schedulers and maintenance
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

fn health_rollup(total: usize, problems: u64, oldest_age_seconds: Option<i64>) -> DlqHealth {
    if total == 0 {
        return DlqHealth::Healthy;
    }

    let problem_ratio = problems as f64 / total as f64;
    let oldest_hours = oldest_age_seconds.unwrap_or(0) as f64 / 3600.0;

    if problem_ratio > 0.5 || oldest_hours > 168.0 {
        DlqHealth::Critical
    } else if problem_ratio > 0.2 || oldest_hours > 72.0 {
        DlqHealth::Warning
    } else {
        DlqHealth::Healthy
    }
}
