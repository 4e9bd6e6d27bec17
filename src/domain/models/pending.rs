//! Scheduled, cancellable invalidations.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use super::cache_key::ResolvedTarget;
use super::event::DomainEvent;

/// Identity of a pending invalidation.
///
/// Two schedules with the same key collapse into one: the later one
/// reschedules the earlier instead of firing twice.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DedupeKey {
    pub event_type: String,
    pub entity_id: String,
    pub rule: String,
}

impl DedupeKey {
    /// Key from its parts.
    pub fn new(event_type: impl Into<String>, entity_id: impl Into<String>, rule: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            entity_id: entity_id.into(),
            rule: rule.into(),
        }
    }

    /// Key for `rule` firing on `event`.
    pub fn for_event(event: &DomainEvent, rule: &str) -> Self {
        Self::new(event.event_type(), event.entity_id.clone(), rule)
    }
}

impl std::fmt::Display for DedupeKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.event_type, self.entity_id, self.rule)
    }
}

/// A delayed invalidation waiting in a scheduler.
#[derive(Debug, Clone)]
pub struct PendingInvalidation {
    pub key: DedupeKey,
    pub event: Arc<DomainEvent>,
    pub rule: String,
    /// Targets already resolved against the event's entity id.
    pub targets: Vec<ResolvedTarget>,
    pub fire_at: Instant,
    pub scheduled_at: DateTime<Utc>,
}

/// What happened when a pending invalidation was handed to a scheduler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleOutcome {
    Scheduled(DedupeKey),
    Rescheduled(DedupeKey),
}

impl ScheduleOutcome {
    /// Dedupe key of the scheduled work.
    pub fn key(&self) -> &DedupeKey {
        match self {
            Self::Scheduled(k) | Self::Rescheduled(k) => k,
        }
    }
}
