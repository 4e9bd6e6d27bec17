//! Concurrency control against the in-memory store: optimistic retries,
//! lock leases and racing writers.

mod common;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use coherence::adapters::memory::InMemoryAuthoritativeStore;
use coherence::domain::models::{EntityVersion, LockAcquisition};
use coherence::domain::ports::{AuthoritativeStore, Condition, Item, StoreResult, TransactionItem};
use coherence::services::ConcurrencyControlManager;
use coherence::{CoherenceError, ConflictKind};
use common::{fast_concurrency_config, memory_manager};
use serde_json::{json, Value};

/// Simulates another writer: after each of the first `interfere` reads of a
/// record, bumps its version behind the reader's back.
struct InterferingStore {
    inner: InMemoryAuthoritativeStore,
    interfere: AtomicU32,
    reads: AtomicU32,
}

#[async_trait]
impl AuthoritativeStore for InterferingStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Item>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let current = self.inner.get(key).await?;

        let remaining = self.interfere.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if remaining.is_ok() {
            if let Some(item) = &current {
                let version = EntityVersion::from_item(key, item).expect("versioned record");
                let bumped = EntityVersion::new(key, version.version + 1, json!("other writer"));
                self.inner.put(key, bumped.to_item()).await?;
            }
        }
        Ok(current)
    }

    async fn put(&self, key: &str, item: Item) -> StoreResult<()> {
        self.inner.put(key, item).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.inner.delete(key).await
    }

    async fn conditional_put(&self, key: &str, item: Item, condition: Condition) -> StoreResult<()> {
        self.inner.conditional_put(key, item, condition).await
    }

    async fn conditional_delete(&self, key: &str, condition: Condition) -> StoreResult<()> {
        self.inner.conditional_delete(key, condition).await
    }

    async fn transact(&self, items: Vec<TransactionItem>) -> StoreResult<()> {
        self.inner.transact(items).await
    }
}

/// Simulates another writer that deletes and recreates a record right after
/// the first read, going through the same manager protocol.
struct RecreatingStore {
    inner: Arc<InMemoryAuthoritativeStore>,
    armed: AtomicBool,
}

#[async_trait]
impl AuthoritativeStore for RecreatingStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Item>> {
        let current = self.inner.get(key).await?;
        if self.armed.swap(false, Ordering::SeqCst) {
            let other = ConcurrencyControlManager::new(self.inner.clone(), &fast_concurrency_config());
            other.optimistic_delete(key, 3).await.expect("other writer deletes");
            other
                .optimistic_update(key, |_| Ok(json!({"owner": "B"})), 3)
                .await
                .expect("other writer recreates");
        }
        Ok(current)
    }

    async fn put(&self, key: &str, item: Item) -> StoreResult<()> {
        self.inner.put(key, item).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.inner.delete(key).await
    }

    async fn conditional_put(&self, key: &str, item: Item, condition: Condition) -> StoreResult<()> {
        self.inner.conditional_put(key, item, condition).await
    }

    async fn conditional_delete(&self, key: &str, condition: Condition) -> StoreResult<()> {
        self.inner.conditional_delete(key, condition).await
    }

    async fn transact(&self, items: Vec<TransactionItem>) -> StoreResult<()> {
        self.inner.transact(items).await
    }
}

#[tokio::test]
async fn update_racing_delete_and_recreate_sees_the_new_record() {
    let inner = Arc::new(InMemoryAuthoritativeStore::new());
    let setup = ConcurrencyControlManager::new(inner.clone(), &fast_concurrency_config());
    setup.optimistic_update("rec:1", |_| Ok(json!({"owner": "A"})), 3).await.unwrap();

    let store = Arc::new(RecreatingStore { inner, armed: AtomicBool::new(true) });
    let ccm = ConcurrencyControlManager::new(store, &fast_concurrency_config());

    let seen = Mutex::new(Vec::new());
    let committed = ccm
        .optimistic_update(
            "rec:1",
            |cur| {
                seen.lock().unwrap().push(cur.cloned());
                let mut next = cur.cloned().unwrap_or_else(|| json!({}));
                next["touched"] = json!(true);
                Ok(next)
            },
            3,
        )
        .await
        .unwrap();

    // The first attempt worked on A's record and must lose to B's recreate.
    let seen = seen.into_inner().unwrap();
    assert_eq!(seen, vec![Some(json!({"owner": "A"})), Some(json!({"owner": "B"}))]);
    assert_eq!(committed.value, json!({"owner": "B", "touched": true}));
    // A at 1, tombstone at 2, B at 3.
    assert_eq!(committed.version, 4);
}

#[tokio::test]
async fn optimistic_update_succeeds_on_third_read_after_two_interleaved_writes() {
    let store = Arc::new(InterferingStore {
        inner: InMemoryAuthoritativeStore::new(),
        interfere: AtomicU32::new(0),
        reads: AtomicU32::new(0),
    });
    store
        .put("rec:1", EntityVersion::new("rec:1", 1, json!("initial")).to_item())
        .await
        .unwrap();
    store.interfere.store(2, Ordering::SeqCst);

    let ccm = ConcurrencyControlManager::new(store.clone(), &fast_concurrency_config());
    let mut calls = 0;
    let result = ccm
        .optimistic_update(
            "rec:1",
            |_| {
                calls += 1;
                Ok(json!("mine"))
            },
            3,
        )
        .await
        .unwrap();

    assert_eq!(store.reads.load(Ordering::SeqCst), 3);
    assert_eq!(calls, 3);
    assert_eq!(result.version, 4);
    assert_eq!(ccm.read_version("rec:1").await.unwrap().unwrap().value, json!("mine"));
}

#[tokio::test]
async fn optimistic_update_reports_conflict_when_retries_run_out() {
    let store = Arc::new(InterferingStore {
        inner: InMemoryAuthoritativeStore::new(),
        interfere: AtomicU32::new(0),
        reads: AtomicU32::new(0),
    });
    store
        .put("rec:2", EntityVersion::new("rec:2", 1, json!(0)).to_item())
        .await
        .unwrap();
    store.interfere.store(100, Ordering::SeqCst);

    let ccm = ConcurrencyControlManager::new(store.clone(), &fast_concurrency_config());
    let err = ccm.optimistic_update("rec:2", |_| Ok(json!(1)), 2).await.unwrap_err();

    match err {
        CoherenceError::Conflict { kind: ConflictKind::VersionMismatch { .. }, attempts, .. } => {
            assert_eq!(attempts, 3);
        }
        other => panic!("expected version conflict, got {other:?}"),
    }
}

#[tokio::test]
async fn lock_blocks_second_caller_until_ttl_passes() {
    let (ccm, _) = memory_manager();

    let first = ccm.acquire_lock("L1", Some(Duration::from_millis(1000))).await.unwrap();
    assert!(first.is_acquired());

    let second = ccm.acquire_lock("L1", Some(Duration::from_millis(1000))).await.unwrap();
    match second {
        LockAcquisition::NotAcquired { lock_id, held_until_epoch_ms } => {
            assert_eq!(lock_id, "L1");
            assert!(held_until_epoch_ms.is_some());
        }
        LockAcquisition::Acquired(_) => panic!("lock granted twice"),
    }

    tokio::time::sleep(Duration::from_millis(1100)).await;
    let third = ccm.acquire_lock("L1", Some(Duration::from_millis(1000))).await.unwrap();
    let guard = third.guard().expect("expired lock can be taken over");
    assert_eq!(guard.fencing_token, 2);

    // The first holder's token no longer releases anything.
    let stale = first.guard().unwrap();
    assert!(matches!(
        ccm.release(&stale).await,
        Err(CoherenceError::UnauthorizedRelease { .. })
    ));
    ccm.release(&guard).await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_acquirers_get_exactly_one_lock() {
    let (ccm, _) = memory_manager();

    let attempts: Vec<_> = (0..16)
        .map(|_| {
            let ccm = ccm.clone();
            tokio::spawn(async move { ccm.acquire_lock("L-shared", Some(Duration::from_secs(10))).await })
        })
        .collect();

    let mut winners = 0;
    for attempt in futures::future::join_all(attempts).await {
        if attempt.unwrap().unwrap().is_acquired() {
            winners += 1;
        }
    }
    assert_eq!(winners, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_optimistic_increments_lose_no_updates() {
    let (ccm, _) = memory_manager();
    let per_writer = 20u64;

    let writers: Vec<_> = (0..2)
        .map(|_| {
            let ccm = ccm.clone();
            tokio::spawn(async move {
                for _ in 0..per_writer {
                    ccm.optimistic_update(
                        "counter",
                        |cur| Ok(json!(cur.and_then(Value::as_u64).unwrap_or(0) + 1)),
                        100,
                    )
                    .await?;
                }
                Ok::<(), CoherenceError>(())
            })
        })
        .collect();

    for writer in futures::future::join_all(writers).await {
        writer.unwrap().unwrap();
    }

    let final_version = ccm.read_version("counter").await.unwrap().unwrap();
    assert_eq!(final_version.value, json!(2 * per_writer));
    assert_eq!(final_version.version, 2 * per_writer);
}

#[tokio::test]
async fn guarded_commit_spans_multiple_records() {
    let (ccm, store) = memory_manager();
    let guard = ccm
        .acquire_lock("account-transfer", None)
        .await
        .unwrap()
        .guard()
        .unwrap();

    ccm.guarded_commit(
        &guard,
        vec![
            TransactionItem::put("account:A", EntityVersion::new("account:A", 1, json!(90)).to_item()),
            TransactionItem::put("account:B", EntityVersion::new("account:B", 1, json!(10)).to_item()),
        ],
    )
    .await
    .unwrap();
    assert!(store.get("account:A").await.unwrap().is_some());
    assert!(store.get("account:B").await.unwrap().is_some());

    // A failing item aborts the batch and reports its own index.
    let err = ccm
        .guarded_commit(
            &guard,
            vec![
                TransactionItem::delete("account:A"),
                TransactionItem::check("account:C", Condition::ItemExists),
            ],
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CoherenceError::Conflict { kind: ConflictKind::ConditionFailed { failed_index: Some(1) }, .. }
    ));
    assert!(store.get("account:A").await.unwrap().is_some());

    ccm.release(&guard).await.unwrap();
}
