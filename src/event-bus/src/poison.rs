//! # Poison-Message Policy
//!
//! Detects events that repeatedly fail with the same error class. The
//! detector keeps a bounded tracker per failing event id; once the same
//! class has failed more than the configured number of consecutive
//! times, the event is declared poison and the configured action
//! (quarantine, discard, or manual intervention) is returned to the
//! dead letter queue.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use dashmap::DashMap;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::PoisonPolicyConfig;
use crate::types::{PoisonAction, PoisonMessageStatistics};

/// Tracking state for one failing event id
#[derive(Debug, Clone, PartialEq, Eq)]
struct PoisonTracker {
    consecutive_failures: u32,
    last_error_type: String,
    first_seen: DateTime<Utc>,
    last_updated: DateTime<Utc>,
}

/// Detector deciding, per failed (event, attempt) pair, whether the
/// event has become poison
pub struct PoisonMessageDetector {
    config: PoisonPolicyConfig,
    trackers: DashMap<Uuid, PoisonTracker>,
    total_poison: AtomicU64,
    total_quarantined: AtomicU64,
    total_discarded: AtomicU64,
    total_manual: AtomicU64,
}

impl PoisonMessageDetector {
    pub fn new(config: PoisonPolicyConfig) -> Self {
        Self {
            config,
            trackers: DashMap::new(),
            total_poison: AtomicU64::new(0),
            total_quarantined: AtomicU64::new(0),
            total_discarded: AtomicU64::new(0),
            total_manual: AtomicU64::new(0),
        }
    }

    fn ttl(&self) -> ChronoDuration {
        ChronoDuration::seconds(self.config.tracker_ttl_seconds as i64)
    }

    fn is_expired(&self, tracker: &PoisonTracker, now: DateTime<Utc>) -> bool {
        now - tracker.last_updated > self.ttl()
    }

    /// Record one failed attempt for an event id
    ///
    /// Returns the poison action once the same error class has failed
    /// more than `consecutive_failure_threshold` consecutive times. A
    /// different error class resets the streak. The tracker is removed
    /// when the action fires, so a later failure starts a fresh streak.
    pub fn record_failure(&self, event_id: Uuid, error_type: &str) -> Option<PoisonAction> {
        let now = Utc::now();

        if !self.trackers.contains_key(&event_id) && self.trackers.len() >= self.config.max_trackers
        {
            self.make_room(now);
        }

        let count = {
            let mut tracker = self.trackers.entry(event_id).or_insert_with(|| PoisonTracker {
                consecutive_failures: 0,
                last_error_type: error_type.to_string(),
                first_seen: now,
                last_updated: now,
            });

            if self.is_expired(&tracker, now) || tracker.last_error_type != error_type {
                tracker.consecutive_failures = 1;
                tracker.last_error_type = error_type.to_string();
                tracker.first_seen = now;
            } else {
                tracker.consecutive_failures += 1;
            }
            tracker.last_updated = now;
            tracker.consecutive_failures
        };

        if count > self.config.consecutive_failure_threshold {
            self.trackers.remove(&event_id);
            self.total_poison.fetch_add(1, Ordering::Relaxed);
            match self.config.action {
                PoisonAction::Quarantine => {
                    self.total_quarantined.fetch_add(1, Ordering::Relaxed);
                }
                PoisonAction::Discard => {
                    self.total_discarded.fetch_add(1, Ordering::Relaxed);
                }
                PoisonAction::RequireManual => {
                    self.total_manual.fetch_add(1, Ordering::Relaxed);
                }
            }

            warn!(
                event_id = %event_id,
                error_type,
                consecutive_failures = count,
                action = ?self.config.action,
                "poison message detected"
            );
            return Some(self.config.action);
        }

        debug!(
            event_id = %event_id,
            error_type,
            consecutive_failures = count,
            "tracked failure"
        );
        None
    }

    /// A successful processing clears the tracker for the event id
    pub fn record_success(&self, event_id: Uuid) {
        self.trackers.remove(&event_id);
    }

    /// Drop trackers past their TTL; returns the number removed
    pub fn purge_expired(&self) -> usize {
        let now = Utc::now();
        let before = self.trackers.len();
        self.trackers.retain(|_, tracker| !self.is_expired(tracker, now));
        before - self.trackers.len()
    }

    /// Current detector counters
    pub fn statistics(&self) -> PoisonMessageStatistics {
        PoisonMessageStatistics {
            total_poison_messages: self.total_poison.load(Ordering::Relaxed),
            total_quarantined: self.total_quarantined.load(Ordering::Relaxed),
            total_discarded: self.total_discarded.load(Ordering::Relaxed),
            total_manual: self.total_manual.load(Ordering::Relaxed),
            active_trackers: self.trackers.len(),
        }
    }

    /// Expire stale trackers, then evict the stalest if still at capacity
    fn make_room(&self, now: DateTime<Utc>) {
        self.trackers.retain(|_, tracker| !self.is_expired(tracker, now));

        if self.trackers.len() >= self.config.max_trackers {
            let stalest = self
                .trackers
                .iter()
                .min_by_key(|entry| entry.last_updated)
                .map(|entry| *entry.key());
            if let Some(key) = stalest {
                self.trackers.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector(threshold: u32, action: PoisonAction) -> PoisonMessageDetector {
        PoisonMessageDetector::new(PoisonPolicyConfig {
            consecutive_failure_threshold: threshold,
            action,
            tracker_ttl_seconds: 3600,
            max_trackers: 16,
        })
    }

    #[test]
    fn test_poison_detected_after_threshold_exceeded() {
        let detector = detector(3, PoisonAction::Quarantine);
        let event_id = Uuid::new_v4();

        for _ in 0..3 {
            assert_eq!(
                detector.record_failure(event_id, "ClassCastException"),
                None
            );
        }

        // The fourth same-class failure trips the policy
        assert_eq!(
            detector.record_failure(event_id, "ClassCastException"),
            Some(PoisonAction::Quarantine)
        );

        let stats = detector.statistics();
        assert_eq!(stats.total_poison_messages, 1);
        assert_eq!(stats.total_quarantined, 1);
        assert_eq!(stats.active_trackers, 0);
    }

    #[test]
    fn test_different_error_class_resets_streak() {
        let detector = detector(2, PoisonAction::Discard);
        let event_id = Uuid::new_v4();

        detector.record_failure(event_id, "TimeoutError");
        detector.record_failure(event_id, "TimeoutError");
        // Class change resets the consecutive counter
        assert_eq!(detector.record_failure(event_id, "IoError"), None);
        assert_eq!(detector.record_failure(event_id, "IoError"), None);
        assert_eq!(
            detector.record_failure(event_id, "IoError"),
            Some(PoisonAction::Discard)
        );
        assert_eq!(detector.statistics().total_discarded, 1);
    }

    #[test]
    fn test_success_clears_tracker() {
        let detector = detector(1, PoisonAction::Quarantine);
        let event_id = Uuid::new_v4();

        detector.record_failure(event_id, "Err");
        detector.record_success(event_id);
        assert_eq!(detector.statistics().active_trackers, 0);

        // The streak starts over
        assert_eq!(detector.record_failure(event_id, "Err"), None);
    }

    #[test]
    fn test_tracker_capacity_eviction() {
        let detector = PoisonMessageDetector::new(PoisonPolicyConfig {
            consecutive_failure_threshold: 10,
            action: PoisonAction::Quarantine,
            tracker_ttl_seconds: 3600,
            max_trackers: 4,
        });

        for _ in 0..8 {
            detector.record_failure(Uuid::new_v4(), "Err");
        }

        assert!(detector.statistics().active_trackers <= 4);
    }

    #[test]
    fn test_purge_expired_removes_stale_trackers() {
        let detector = PoisonMessageDetector::new(PoisonPolicyConfig {
            consecutive_failure_threshold: 10,
            action: PoisonAction::Quarantine,
            tracker_ttl_seconds: 0,
            max_trackers: 16,
        });

        detector.record_failure(Uuid::new_v4(), "Err");
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert_eq!(detector.purge_expired(), 1);
        assert_eq!(detector.statistics().active_trackers, 0);
    }
}
