//! Applies resolved invalidation targets to the cache store.

use std::sync::Arc;

use crate::domain::models::{DomainEvent, ResolvedTarget, ScheduleOutcome};
use crate::domain::ports::CacheStore;

/// One bulk deletion by pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternDeletion {
    pub pattern: String,
    pub removed: u64,
}

/// A cache operation that the backend rejected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetFailure {
    pub rule: String,
    pub target: String,
    pub error: String,
}

/// Everything one invalidation pass did, including what it could not do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationReport {
    pub event_type: String,
    pub entity_id: String,
    pub rules_applied: Vec<String>,
    /// Rules whose predicate rejected the payload
    pub rules_skipped: Vec<String>,
    pub keys_deleted: Vec<String>,
    /// Keys that were already absent; deleting them was a no-op
    pub keys_absent: Vec<String>,
    pub pattern_deletions: Vec<PatternDeletion>,
    pub scheduled: Vec<ScheduleOutcome>,
    pub failures: Vec<TargetFailure>,
}

impl InvalidationReport {
    /// Empty report for `event`.
    pub fn for_event(event: &DomainEvent) -> Self {
        Self::new(event.event_type(), event.entity_id.clone())
    }

    /// Empty report for an event type and entity id.
    pub fn new(event_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            entity_id: entity_id.into(),
            ..Self::default()
        }
    }

    /// Whether no cache operation failed.
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    /// Exact keys deleted plus keys removed by pattern deletions.
    pub fn keys_removed(&self) -> u64 {
        let exact = u64::try_from(self.keys_deleted.len()).unwrap_or(u64::MAX);
        exact.saturating_add(self.pattern_deletions.iter().map(|p| p.removed).sum::<u64>())
    }

    /// Fold another report for the same event into this one.
    pub fn merge(&mut self, other: Self) {
        self.rules_applied.extend(other.rules_applied);
        self.rules_skipped.extend(other.rules_skipped);
        self.keys_deleted.extend(other.keys_deleted);
        self.keys_absent.extend(other.keys_absent);
        self.pattern_deletions.extend(other.pattern_deletions);
        self.scheduled.extend(other.scheduled);
        self.failures.extend(other.failures);
    }

    /// Failures joined into one line.
    pub fn failure_summary(&self) -> String {
        self.failures
            .iter()
            .map(|f| format!("{} ({}): {}", f.target, f.rule, f.error))
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Deletes concrete keys and bulk-deletes patterns. Failures are recorded,
/// not retried.
#[derive(Clone)]
pub struct InvalidationExecutor {
    cache: Arc<dyn CacheStore>,
}

impl InvalidationExecutor {
    /// Executor deleting from `cache`.
    pub fn new(cache: Arc<dyn CacheStore>) -> Self {
        Self { cache }
    }

    /// Delete every target, recording results into `report`. Failures are recorded, never retried.
    pub async fn execute(&self, rule: &str, targets: &[ResolvedTarget], report: &mut InvalidationReport) {
        for target in targets {
            match target {
                ResolvedTarget::Key(key) => match self.cache.delete(key.as_str()).await {
                    Ok(true) => report.keys_deleted.push(key.to_string()),
                    Ok(false) => report.keys_absent.push(key.to_string()),
                    Err(e) => Self::record_failure(report, rule, target, &e.to_string()),
                },
                ResolvedTarget::Pattern(pattern) => match self.cache.delete_pattern(pattern).await {
                    Ok(removed) => report.pattern_deletions.push(PatternDeletion {
                        pattern: pattern.to_string(),
                        removed,
                    }),
                    Err(e) => Self::record_failure(report, rule, target, &e.to_string()),
                },
            }
        }
    }

    fn record_failure(report: &mut InvalidationReport, rule: &str, target: &ResolvedTarget, error: &str) {
        tracing::warn!(
            rule = rule,
            target = %target,
            entity_id = %report.entity_id,
            error = error,
            "Cache invalidation failed"
        );
        report.failures.push(TargetFailure {
            rule: rule.to_string(),
            target: target.to_string(),
            error: error.to_string(),
        });
    }
}
