//! The coherent write path wired through `CoherenceRuntime`: commit, TTL,
//! cache refresh, event publication and downstream invalidation.

mod common;

use std::sync::Arc;
use std::time::Duration;

use coherence::adapters::sqlite::{create_migrated_test_pool, SqliteAuthoritativeStore};
use coherence::application::{CoherenceRuntime, WriteRequest};
use coherence::domain::models::{
    CoherenceConfig, EntityMetadata, EventKey, InvalidationRule, Operation, TtlFactors, TtlStrategy,
};
use coherence::domain::ports::CacheStore;
use coherence::{CoherenceError, ConflictKind};
use common::{present, seeded_cache};
use serde_json::json;

fn strategies() -> Vec<TtlStrategy> {
    vec![
        TtlStrategy::new("session", Duration::from_secs(1800)),
        TtlStrategy::new("user", Duration::from_secs(3600)).with_factors(TtlFactors {
            access_frequency_weight: 1.0,
            update_frequency_weight: 1.0,
            size_weight: 1.0,
        }),
    ]
}

async fn sqlite_runtime(cache: Arc<dyn CacheStore>, rules: Vec<InvalidationRule>) -> CoherenceRuntime {
    let pool = create_migrated_test_pool().await.expect("test pool");
    let mut config = CoherenceConfig::default();
    config.concurrency.backoff_base_ms = 1;
    config.concurrency.backoff_max_ms = 10;

    CoherenceRuntime::build(
        config,
        rules,
        vec![],
        strategies(),
        Arc::new(SqliteAuthoritativeStore::new(pool)),
        cache,
    )
    .await
    .expect("runtime builds")
}

#[tokio::test]
async fn write_refreshes_own_entry_and_invalidates_dependents() {
    let keys = ["user:U1:projects", "user:U1:teams", "user:U2:projects"];
    let cache = seeded_cache(&keys).await;
    let runtime = sqlite_runtime(
        cache.clone(),
        vec![
            InvalidationRule::new(
                "user-listings",
                EventKey::new("user", Operation::Update),
                vec!["user:*:projects".into(), "user:*:teams".into()],
            ),
            InvalidationRule::new(
                "user-created",
                EventKey::new("user", Operation::Create),
                vec!["directory:users".into()],
            ),
        ],
    )
    .await;

    let created = runtime
        .writer
        .write(WriteRequest::upsert("user", "U1", json!({"name": "Ada"})))
        .await
        .unwrap();
    assert_eq!(created.operation, Operation::Create);
    assert_eq!(created.dispatch.handler_count(), 1);
    assert_eq!(present(&cache, &keys).await.len(), 3, "create rules leave listings alone");

    let updated = runtime
        .writer
        .write(WriteRequest::upsert("user", "U1", json!({"name": "Ada L."})))
        .await
        .unwrap();
    assert_eq!(updated.operation, Operation::Update);
    assert_eq!(updated.version.as_ref().unwrap().version, 2);
    assert!(updated.dispatch.all_succeeded());
    assert_eq!(present(&cache, &keys).await, vec!["user:U2:projects"]);
    assert_eq!(cache.get("user:U1").await.unwrap(), Some(json!({"name": "Ada L."})));

    runtime.shutdown().await;
}

#[tokio::test]
async fn read_heavy_entities_get_longer_ttls_than_write_heavy_ones() {
    let cache = seeded_cache(&[]).await;
    let runtime = sqlite_runtime(cache.clone(), vec![]).await;

    let write_heavy = runtime
        .writer
        .write(WriteRequest::upsert("session", "S1", json!({})).with_metadata(EntityMetadata::new(0, 50, 10)))
        .await
        .unwrap();
    let read_heavy = runtime
        .writer
        .write(WriteRequest::upsert("session", "S2", json!({})).with_metadata(EntityMetadata::new(1000, 0, 10)))
        .await
        .unwrap();

    let (write_ttl, read_ttl) = (write_heavy.ttl.unwrap(), read_heavy.ttl.unwrap());
    assert!(write_ttl < read_ttl, "{write_ttl:?} should be shorter than {read_ttl:?}");

    let config = &runtime.config.ttl;
    for ttl in [write_ttl, read_ttl] {
        assert!(ttl >= config.min_ttl() && ttl <= config.max_ttl());
    }

    // Under high load the same entity is cached for longer.
    let loaded = runtime
        .writer
        .write(
            WriteRequest::upsert("session", "S3", json!({}))
                .with_metadata(EntityMetadata::new(0, 50, 10))
                .with_system_load(1.0),
        )
        .await
        .unwrap();
    assert!(loaded.ttl.unwrap() > write_ttl);

    runtime.shutdown().await;
}

#[tokio::test]
async fn delete_evicts_entry_and_publishes_delete_event() {
    let keys = ["project:P1:agents", "project:P2:agents"];
    let cache = seeded_cache(&keys).await;
    let runtime = sqlite_runtime(
        cache.clone(),
        vec![InvalidationRule::new(
            "project-delete",
            EventKey::new("project", Operation::Delete),
            vec!["project:*:*".into()],
        )],
    )
    .await;

    runtime
        .writer
        .write(WriteRequest::upsert("project", "P1", json!({"status": "active"})))
        .await
        .unwrap();
    assert!(cache.get("project:P1").await.unwrap().is_some());

    let deleted = runtime
        .writer
        .write(WriteRequest::delete("project", "P1").under_lock(Duration::from_secs(5)))
        .await
        .unwrap();
    assert_eq!(deleted.operation, Operation::Delete);
    assert!(deleted.lock_released);
    assert_eq!(deleted.version.unwrap().version, 1);
    assert!(cache.get("project:P1").await.unwrap().is_none());
    assert_eq!(present(&cache, &keys).await, vec!["project:P2:agents"]);
    assert!(runtime.concurrency.read_version("project:P1").await.unwrap().is_none());

    runtime.shutdown().await;
}

#[tokio::test]
async fn locked_writers_exclude_each_other() {
    let cache = seeded_cache(&[]).await;
    let runtime = sqlite_runtime(cache, vec![]).await;

    let holder = runtime
        .concurrency
        .acquire_lock("account:A", Some(Duration::from_secs(5)))
        .await
        .unwrap()
        .guard()
        .unwrap();

    let err = runtime
        .writer
        .write(WriteRequest::upsert("account", "A", json!({"balance": 10})).under_lock(Duration::from_secs(5)))
        .await
        .unwrap_err();
    assert!(matches!(err, CoherenceError::Conflict { kind: ConflictKind::LockHeld, .. }));

    runtime.concurrency.release(&holder).await.unwrap();
    let ok = runtime
        .writer
        .write(WriteRequest::upsert("account", "A", json!({"balance": 10})).under_lock(Duration::from_secs(5)))
        .await
        .unwrap();
    assert!(ok.lock_released);

    runtime.shutdown().await;
}
