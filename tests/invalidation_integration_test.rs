//! End-to-end invalidation: events published through the dispatcher reach
//! the rule engine, which deletes keys now or through the scheduler.

mod common;

use std::sync::Arc;
use std::time::Duration;

use coherence::adapters::memory::InMemoryAuthoritativeStore;
use coherence::application::CoherenceRuntime;
use coherence::domain::models::{
    CascadeCondition, CascadeRule, CoherenceConfig, DomainEvent, EventKey, InvalidationRule, Operation,
};
use coherence::domain::ports::CacheStore;
use coherence::services::HandlerStatus;
use common::{present, seeded_cache};
use serde_json::json;

async fn runtime_with(
    rules: Vec<InvalidationRule>,
    cascades: Vec<CascadeRule>,
    cache: Arc<dyn CacheStore>,
) -> CoherenceRuntime {
    CoherenceRuntime::build(
        CoherenceConfig::default(),
        rules,
        cascades,
        vec![],
        Arc::new(InMemoryAuthoritativeStore::new()),
        cache,
    )
    .await
    .expect("runtime builds")
}

#[tokio::test]
async fn user_update_removes_user_and_project_listing() {
    let keys = ["user:U1", "user:U1:projects", "user:U2", "user:U2:projects"];
    let cache = seeded_cache(&keys).await;
    let runtime = runtime_with(
        vec![InvalidationRule::new(
            "user-update",
            EventKey::new("user", Operation::Update),
            vec!["user:*".into(), "user:*:projects".into()],
        )],
        vec![],
        cache.clone(),
    )
    .await;

    let report = runtime
        .dispatcher
        .publish(DomainEvent::new("user", "U1", Operation::Update))
        .await
        .unwrap();

    assert!(report.all_succeeded());
    assert_eq!(present(&cache, &keys).await, vec!["user:U2", "user:U2:projects"]);
    runtime.shutdown().await;
}

#[tokio::test]
async fn project_delete_cascades_to_its_own_dependents_only() {
    let keys = [
        "project:P1:agents",
        "project:P1:sessions",
        "agent:P1",
        "session:P1",
        "project:P2:agents",
        "agent:P2",
        "session:P2",
    ];
    let cache = seeded_cache(&keys).await;
    let runtime = runtime_with(
        vec![InvalidationRule::new(
            "project-delete",
            EventKey::new("project", Operation::Delete),
            vec!["project:*:*".into(), "agent:*".into(), "session:*".into()],
        )],
        vec![],
        cache.clone(),
    )
    .await;

    let report = runtime
        .engine
        .invalidate(&DomainEvent::new("project", "P1", Operation::Delete))
        .await
        .unwrap();

    assert!(report.is_clean());
    assert_eq!(report.keys_removed(), 4);
    assert_eq!(present(&cache, &keys).await, vec!["project:P2:agents", "agent:P2", "session:P2"]);
    runtime.shutdown().await;
}

#[tokio::test]
async fn repeated_invalidation_is_idempotent() {
    let keys = ["user:U1", "user:U1:projects"];
    let cache = seeded_cache(&keys).await;
    let runtime = runtime_with(
        vec![InvalidationRule::new(
            "user-update",
            EventKey::new("user", Operation::Update),
            vec!["user:*".into(), "user:*:projects".into()],
        )],
        vec![],
        cache.clone(),
    )
    .await;

    let event = DomainEvent::new("user", "U1", Operation::Update);
    let first = runtime.engine.invalidate(&event).await.unwrap();
    assert_eq!(first.keys_deleted.len(), 2);

    for _ in 0..3 {
        let again = runtime.engine.invalidate(&event).await.unwrap();
        assert!(again.is_clean());
        assert!(again.keys_deleted.is_empty());
        assert_eq!(again.keys_absent.len(), 2);
    }
    assert!(present(&cache, &keys).await.is_empty());
    runtime.shutdown().await;
}

#[tokio::test]
async fn status_change_cascades_through_update_events() {
    let keys = ["agents:project:P1", "sessions:project:P1", "agents:project:P2"];
    let cache = seeded_cache(&keys).await;
    let runtime = runtime_with(
        vec![],
        vec![CascadeRule::new(
            "project-deleted",
            "project",
            CascadeCondition::FieldEquals { field: "status".into(), value: json!("deleted") },
            vec!["agents:project:*".into(), "sessions:project:*".into()],
        )],
        cache.clone(),
    )
    .await;

    // The engine listens to project updates because a cascade exists for projects.
    let report = runtime
        .dispatcher
        .publish(DomainEvent::new("project", "P1", Operation::Update).with_payload(json!({"status": "active"})))
        .await
        .unwrap();
    assert_eq!(report.handler_count(), 1);
    assert_eq!(present(&cache, &keys).await.len(), 3);

    runtime
        .dispatcher
        .publish(DomainEvent::new("project", "P1", Operation::Update).with_payload(json!({"status": "deleted"})))
        .await
        .unwrap();
    assert_eq!(present(&cache, &keys).await, vec!["agents:project:P2"]);
    runtime.shutdown().await;
}

#[tokio::test]
async fn delayed_rule_fires_once_from_background_loop() {
    let keys = ["session:S1"];
    let cache = seeded_cache(&keys).await;
    let runtime = runtime_with(
        vec![InvalidationRule::new(
            "session-update",
            EventKey::new("session", Operation::Update),
            vec!["session:*".into()],
        )
        .with_delay_ms(50)],
        vec![],
        cache.clone(),
    )
    .await;
    let mut reports = runtime.scheduler.subscribe_reports();

    for _ in 0..3 {
        runtime
            .dispatcher
            .publish(DomainEvent::new("session", "S1", Operation::Update))
            .await
            .unwrap();
    }
    assert_eq!(runtime.scheduler.pending_count().await, 1);
    assert_eq!(present(&cache, &keys).await.len(), 1, "nothing fires before the delay");

    let fired = tokio::time::timeout(Duration::from_secs(2), reports.recv())
        .await
        .expect("delayed invalidation fires")
        .unwrap();
    assert_eq!(fired.keys_deleted, vec!["session:S1".to_string()]);
    assert!(present(&cache, &keys).await.is_empty());
    assert_eq!(runtime.scheduler.pending_count().await, 0);

    assert!(runtime.shutdown().await.is_empty());
}

#[tokio::test]
async fn shutdown_flushes_pending_work() {
    let keys = ["session:S9"];
    let cache = seeded_cache(&keys).await;
    let runtime = runtime_with(
        vec![InvalidationRule::new(
            "session-update",
            EventKey::new("session", Operation::Update),
            vec!["session:*".into()],
        )
        .with_delay(Duration::from_secs(600))],
        vec![],
        cache.clone(),
    )
    .await;

    runtime
        .dispatcher
        .publish(DomainEvent::new("session", "S9", Operation::Update))
        .await
        .unwrap();

    let flushed = runtime.shutdown().await;
    assert_eq!(flushed.len(), 1);
    assert!(present(&cache, &keys).await.is_empty());
}

#[tokio::test]
async fn malformed_events_never_reach_handlers() {
    let cache = seeded_cache(&[]).await;
    let runtime = runtime_with(
        vec![InvalidationRule::new(
            "user-update",
            EventKey::new("user", Operation::Update),
            vec!["user:*".into()],
        )],
        vec![],
        cache,
    )
    .await;

    for event in [
        DomainEvent::new("", "U1", Operation::Update),
        DomainEvent::new("user", "", Operation::Update),
        DomainEvent::new("us:er", "U1", Operation::Update),
        DomainEvent::new("user", "U*", Operation::Update),
    ] {
        let err = runtime.dispatcher.publish(event).await.unwrap_err();
        assert!(matches!(err, coherence::CoherenceError::Validation(_)));
    }
    runtime.shutdown().await;
}

#[tokio::test]
async fn slow_handler_times_out_without_blocking_invalidation() {
    let keys = ["user:U1"];
    let cache = seeded_cache(&keys).await;
    let mut config = CoherenceConfig::default();
    config.dispatcher.handler_timeout_ms = 50;
    let runtime = CoherenceRuntime::build(
        config,
        vec![InvalidationRule::new(
            "user-update",
            EventKey::new("user", Operation::Update),
            vec!["user:*".into()],
        )],
        vec![],
        vec![],
        Arc::new(InMemoryAuthoritativeStore::new()),
        cache.clone(),
    )
    .await
    .unwrap();

    // Registered after the engine, so it runs second.
    runtime
        .dispatcher
        .subscribe_fn(EventKey::new("user", Operation::Update), "slow", |_event| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<(), String>(())
        })
        .await;

    let report = runtime
        .dispatcher
        .publish(DomainEvent::new("user", "U1", Operation::Update))
        .await
        .unwrap();

    assert_eq!(report.outcomes[0].status, HandlerStatus::Succeeded);
    assert_eq!(report.outcomes[1].status, HandlerStatus::TimedOut);
    assert!(present(&cache, &keys).await.is_empty());
    runtime.shutdown().await;
}
