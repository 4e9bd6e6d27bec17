//! Invalidation rule engine.
//!
//! Matches published domain events against the rule registry, substitutes
//! the event's entity id into each rule's key templates and deletes the
//! resulting keys, either immediately or through the scheduler when the rule
//! carries a delay. Relationship-driven cascades and frequency-aware smart
//! invalidation go through the same executor.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::time::Instant;

use super::event_dispatcher::{DomainEventDispatcher, DomainEventHandler, SubscriptionId};
use super::invalidation_executor::{InvalidationExecutor, InvalidationReport};
use super::invalidation_scheduler::InvalidationScheduler;
use crate::domain::errors::{CoherenceError, CoherenceResult};
use crate::domain::models::{
    resolve_target, CascadeTable, DedupeKey, DomainEvent, EventKey, InvalidationConfig,
    Operation, PendingInvalidation, ResolvedTarget, RuleRegistry,
};

/// Rule name used for smart invalidations in reports and dedupe keys.
pub const SMART_RULE: &str = "smart";

/// Matches events against the rule and cascade tables and clears stale cache entries.
pub struct InvalidationEngine {
    registry: Arc<RuleRegistry>,
    cascades: Arc<CascadeTable>,
    executor: InvalidationExecutor,
    scheduler: Arc<dyn InvalidationScheduler>,
    high_frequency_threshold: f64,
    low_frequency_delay: Duration,
}

impl InvalidationEngine {
    /// Engine over a frozen rule registry and cascade table.
    pub fn new(
        registry: Arc<RuleRegistry>,
        cascades: Arc<CascadeTable>,
        executor: InvalidationExecutor,
        scheduler: Arc<dyn InvalidationScheduler>,
        config: &InvalidationConfig,
    ) -> Self {
        Self {
            registry,
            cascades,
            executor,
            scheduler,
            high_frequency_threshold: config.high_frequency_threshold,
            low_frequency_delay: config.low_frequency_delay(),
        }
    }

    /// Rules this engine matches.
    pub fn registry(&self) -> &RuleRegistry {
        &self.registry
    }

    /// Apply every rule matching the event's type.
    ///
    /// Immediate targets are deleted before this returns; delayed rules are
    /// handed to the scheduler and show up in `report.scheduled`. Cache
    /// failures are collected in the report rather than returned as `Err`.
    pub async fn invalidate(&self, event: &DomainEvent) -> CoherenceResult<InvalidationReport> {
        event.validate()?;
        let mut report = InvalidationReport::for_event(event);
        let shared_event = Arc::new(event.clone());

        for rule in self.registry.rules_for(&event.key()) {
            if !rule.accepts(event.payload.as_ref()) {
                tracing::debug!(rule = %rule.name, entity_id = %event.entity_id, "Rule predicate rejected payload");
                report.rules_skipped.push(rule.name.clone());
                continue;
            }

            let targets = resolve_all(&rule.target_patterns, &event.entity_id);
            report.rules_applied.push(rule.name.clone());

            match rule.delay {
                Some(delay) => {
                    let outcome = self
                        .scheduler
                        .schedule(pending(Arc::clone(&shared_event), &rule.name, targets, delay))
                        .await;
                    report.scheduled.push(outcome);
                }
                None => self.executor.execute(&rule.name, &targets, &mut report).await,
            }
        }

        if let Some(Value::Object(changed)) = &event.payload {
            let cascaded = self.cascade_invalidation(&event.entity_type, &event.entity_id, changed).await?;
            report.merge(cascaded);
        }

        tracing::info!(
            event_type = %report.event_type,
            entity_id = %report.entity_id,
            rules = report.rules_applied.len(),
            removed = report.keys_removed(),
            scheduled = report.scheduled.len(),
            failures = report.failures.len(),
            "Invalidation complete"
        );

        Ok(report)
    }

    /// Delete dependents of an entity according to the cascade table.
    pub async fn cascade_invalidation(
        &self,
        entity_type: &str,
        entity_id: &str,
        changed_fields: &Map<String, Value>,
    ) -> CoherenceResult<InvalidationReport> {
        validate_target(entity_type, entity_id)?;
        let mut report = InvalidationReport::new(format!("{entity_type}:cascade"), entity_id);

        for cascade in self.cascades.triggered(entity_type, changed_fields) {
            let targets = resolve_all(&cascade.targets, entity_id);
            report.rules_applied.push(cascade.name.clone());
            self.executor.execute(&cascade.name, &targets, &mut report).await;
        }

        if !report.rules_applied.is_empty() {
            tracing::debug!(
                entity_type = entity_type,
                entity_id = entity_id,
                cascades = report.rules_applied.len(),
                removed = report.keys_removed(),
                "Cascade invalidation complete"
            );
        }

        Ok(report)
    }

    /// Invalidate an entity's update targets now if it is hot, later if not.
    ///
    /// At or above the configured access frequency threshold the targets are
    /// deleted immediately; below it they are scheduled after the configured
    /// low-frequency delay, collapsing with any pending smart invalidation of
    /// the same entity. Targets come from the `update` rules for the type, or
    /// `{type}:*` and `{type}:*:*` when there are none.
    pub async fn smart_invalidate(
        &self,
        entity_type: &str,
        entity_id: &str,
        access_frequency: f64,
    ) -> CoherenceResult<InvalidationReport> {
        validate_target(entity_type, entity_id)?;
        if !access_frequency.is_finite() || access_frequency < 0.0 {
            return Err(CoherenceError::validation(format!(
                "access frequency must be a non-negative number, got {access_frequency}"
            )));
        }

        let event = DomainEvent::new(entity_type, entity_id, Operation::Update);
        let templates = self.smart_templates(&event.key());
        let targets = resolve_all(&templates, entity_id);
        let mut report = InvalidationReport::for_event(&event);
        report.rules_applied.push(SMART_RULE.to_string());

        if access_frequency >= self.high_frequency_threshold {
            self.executor.execute(SMART_RULE, &targets, &mut report).await;
        } else {
            let outcome = self
                .scheduler
                .schedule(pending(Arc::new(event), SMART_RULE, targets, self.low_frequency_delay))
                .await;
            report.scheduled.push(outcome);
        }

        tracing::debug!(
            entity_type = entity_type,
            entity_id = entity_id,
            access_frequency,
            immediate = report.scheduled.is_empty(),
            "Smart invalidation"
        );

        Ok(report)
    }

    /// Cancel a pending delayed invalidation.
    pub async fn cancel_pending(&self, key: &DedupeKey) -> bool {
        self.scheduler.cancel(key).await
    }

    /// Subscribe the engine to every rule trigger and to updates of every
    /// entity type that has cascades.
    pub async fn attach(self: &Arc<Self>, dispatcher: &DomainEventDispatcher) -> Vec<SubscriptionId> {
        let mut keys = self.registry.triggers();
        for entity_type in self.cascades.entity_types() {
            let key = EventKey::new(entity_type, Operation::Update);
            if !keys.contains(&key) {
                keys.push(key);
            }
        }

        let mut ids = Vec::with_capacity(keys.len());
        for key in keys {
            let handler: Arc<dyn DomainEventHandler> = Arc::clone(self) as Arc<dyn DomainEventHandler>;
            ids.push(dispatcher.subscribe(key, handler).await);
        }
        ids
    }

    fn smart_templates(&self, key: &EventKey) -> Vec<String> {
        let templates: Vec<String> = self
            .registry
            .rules_for(key)
            .iter()
            .filter(|r| r.accepts(None))
            .flat_map(|r| r.target_patterns.iter().cloned())
            .collect();

        if templates.is_empty() {
            vec![format!("{}:*", key.entity_type), format!("{}:*:*", key.entity_type)]
        } else {
            templates
        }
    }
}

#[async_trait]
impl DomainEventHandler for InvalidationEngine {
    fn name(&self) -> &str {
        "invalidation-engine"
    }

    async fn handle(&self, event: &DomainEvent) -> Result<(), String> {
        let report = self.invalidate(event).await.map_err(|e| e.to_string())?;
        if report.is_clean() {
            Ok(())
        } else {
            Err(report.failure_summary())
        }
    }
}

fn resolve_all(templates: &[String], entity_id: &str) -> Vec<ResolvedTarget> {
    templates.iter().map(|t| resolve_target(t, entity_id)).collect()
}

fn pending(event: Arc<DomainEvent>, rule: &str, targets: Vec<ResolvedTarget>, delay: Duration) -> PendingInvalidation {
    PendingInvalidation {
        key: DedupeKey::for_event(&event, rule),
        event,
        rule: rule.to_string(),
        targets,
        fire_at: Instant::now() + delay,
        scheduled_at: Utc::now(),
    }
}

fn validate_target(entity_type: &str, entity_id: &str) -> CoherenceResult<()> {
    // Same rules as a published event.
    DomainEvent::new(entity_type, entity_id, Operation::Update).validate()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::cache::MokaCacheStore;
    use crate::domain::models::{CascadeCondition, CascadeRule, InvalidationRule, KeyPattern, ScheduleOutcome};
    use crate::domain::ports::{CacheError, CacheResult, CacheStore};
    use crate::services::invalidation_scheduler::InProcessScheduler;
    use serde_json::json;

    async fn seeded_cache(keys: &[&str]) -> Arc<MokaCacheStore> {
        let cache = Arc::new(MokaCacheStore::new(1_000));
        for k in keys {
            cache.set(k, json!(true), Duration::from_secs(300)).await.unwrap();
        }
        cache
    }

    fn engine_with(
        cache: Arc<dyn CacheStore>,
        registry: RuleRegistry,
        cascades: CascadeTable,
    ) -> (Arc<InvalidationEngine>, InProcessScheduler) {
        let executor = InvalidationExecutor::new(cache);
        let scheduler = InProcessScheduler::new(executor.clone());
        let engine = InvalidationEngine::new(
            Arc::new(registry),
            Arc::new(cascades),
            executor,
            Arc::new(scheduler.clone()),
            &InvalidationConfig::default(),
        );
        (Arc::new(engine), scheduler)
    }

    fn key(t: &str, op: Operation) -> EventKey {
        EventKey::new(t, op)
    }

    #[tokio::test]
    async fn test_user_update_deletes_substituted_keys() {
        let cache = seeded_cache(&["user:U1", "user:U1:projects", "user:U2"]).await;
        let registry = RuleRegistry::builder()
            .rule(InvalidationRule::new(
                "user-update",
                key("user", Operation::Update),
                vec!["user:*".into(), "user:*:projects".into()],
            ))
            .build()
            .unwrap();
        let (engine, _) = engine_with(cache.clone(), registry, CascadeTable::new());

        let report = engine
            .invalidate(&DomainEvent::new("user", "U1", Operation::Update))
            .await
            .unwrap();

        assert_eq!(report.keys_deleted, vec!["user:U1", "user:U1:projects"]);
        assert!(cache.get("user:U1").await.unwrap().is_none());
        assert!(cache.get("user:U1:projects").await.unwrap().is_none());
        assert!(cache.get("user:U2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_predicate_sees_null_without_payload() {
        let cache = seeded_cache(&["team:T1"]).await;
        let registry = RuleRegistry::builder()
            .rule(
                InvalidationRule::new("public-only", key("team", Operation::Update), vec!["team:*".into()])
                    .with_predicate(|p| p.get("visibility") == Some(&json!("public"))),
            )
            .build()
            .unwrap();
        let (engine, _) = engine_with(cache.clone(), registry, CascadeTable::new());

        let report = engine
            .invalidate(&DomainEvent::new("team", "T1", Operation::Update))
            .await
            .unwrap();
        assert_eq!(report.rules_skipped, vec!["public-only"]);
        assert!(cache.get("team:T1").await.unwrap().is_some());

        let report = engine
            .invalidate(
                &DomainEvent::new("team", "T1", Operation::Update).with_payload(json!({"visibility": "public"})),
            )
            .await
            .unwrap();
        assert_eq!(report.rules_applied, vec!["public-only"]);
        assert!(cache.get("team:T1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delayed_rule_dedupes_per_entity() {
        let cache = seeded_cache(&["feed:F1"]).await;
        let registry = RuleRegistry::builder()
            .rule(
                InvalidationRule::new("feed", key("feed", Operation::Update), vec!["feed:*".into()])
                    .with_delay_ms(60_000),
            )
            .build()
            .unwrap();
        let (engine, scheduler) = engine_with(cache.clone(), registry, CascadeTable::new());

        let event = DomainEvent::new("feed", "F1", Operation::Update);
        let first = engine.invalidate(&event).await.unwrap();
        let second = engine.invalidate(&event).await.unwrap();

        assert!(matches!(first.scheduled[0], ScheduleOutcome::Scheduled(_)));
        assert!(matches!(second.scheduled[0], ScheduleOutcome::Rescheduled(_)));
        assert!(cache.get("feed:F1").await.unwrap().is_some());
        assert_eq!(scheduler.pending_count().await, 1);

        let reports = scheduler.drain().await;
        assert_eq!(reports.len(), 1);
        assert!(cache.get("feed:F1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cascade_on_status_change() {
        let cache = seeded_cache(&["agents:project:P1", "sessions:project:P1", "agents:project:P2"]).await;
        let cascades = CascadeTable::new()
            .with(CascadeRule::new(
                "project-deleted",
                "project",
                CascadeCondition::FieldEquals { field: "status".into(), value: json!("deleted") },
                vec!["agents:project:*".into(), "sessions:project:*".into()],
            ))
            .unwrap();
        let (engine, _) = engine_with(cache.clone(), RuleRegistry::default(), cascades);

        let mut changed = Map::new();
        changed.insert("status".into(), json!("active"));
        let report = engine.cascade_invalidation("project", "P1", &changed).await.unwrap();
        assert!(report.rules_applied.is_empty());

        changed.insert("status".into(), json!("deleted"));
        let report = engine.cascade_invalidation("project", "P1", &changed).await.unwrap();
        assert_eq!(report.keys_deleted.len(), 2);
        assert!(cache.get("agents:project:P2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_smart_invalidation_threshold() {
        let cache = seeded_cache(&["doc:D1", "doc:D1:meta", "doc:D2"]).await;
        let (engine, scheduler) = engine_with(cache.clone(), RuleRegistry::default(), CascadeTable::new());

        let report = engine.smart_invalidate("doc", "D2", 5.0).await.unwrap();
        assert_eq!(report.scheduled.len(), 1);
        assert!(cache.get("doc:D2").await.unwrap().is_some());

        // Exactly at the threshold counts as hot.
        let report = engine.smart_invalidate("doc", "D1", 100.0).await.unwrap();
        assert!(report.scheduled.is_empty());
        assert_eq!(report.keys_deleted, vec!["doc:D1"]);
        assert_eq!(report.pattern_deletions[0].removed, 1);

        assert!(engine
            .cancel_pending(&DedupeKey::new("doc:update", "D2", SMART_RULE))
            .await);
        assert_eq!(scheduler.pending_count().await, 0);
        assert!(engine.smart_invalidate("doc", "D3", f64::NAN).await.is_err());
    }

    struct FailingCache;

    #[async_trait]
    impl CacheStore for FailingCache {
        async fn get(&self, _key: &str) -> CacheResult<Option<Value>> {
            Ok(None)
        }
        async fn set(&self, _key: &str, _value: Value, _ttl: Duration) -> CacheResult<()> {
            Ok(())
        }
        async fn delete(&self, _key: &str) -> CacheResult<bool> {
            Err(CacheError::Transient("connection reset".into()))
        }
        async fn delete_pattern(&self, _pattern: &KeyPattern) -> CacheResult<u64> {
            Err(CacheError::Backend("scan disabled".into()))
        }
    }

    #[tokio::test]
    async fn test_cache_failures_surface_through_dispatcher() {
        let registry = RuleRegistry::builder()
            .rule(InvalidationRule::new(
                "user-update",
                key("user", Operation::Update),
                vec!["user:*".into(), "user:*:*".into()],
            ))
            .build()
            .unwrap();
        let (engine, _) = engine_with(Arc::new(FailingCache), registry, CascadeTable::new());
        let dispatcher = DomainEventDispatcher::default();
        assert_eq!(engine.attach(&dispatcher).await.len(), 1);

        let report = engine
            .invalidate(&DomainEvent::new("user", "U1", Operation::Update))
            .await
            .unwrap();
        assert_eq!(report.failures.len(), 2);

        let dispatch = dispatcher
            .publish(DomainEvent::new("user", "U1", Operation::Update))
            .await
            .unwrap();
        assert_eq!(dispatch.failures().count(), 1);
    }
}
