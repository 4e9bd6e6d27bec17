//! Concurrency control over the authoritative store.
//!
//! Three mechanisms, all built on the store's atomic conditional writes:
//! - all-or-nothing multi-item transactions,
//! - optimistic read-modify-write against a version attribute,
//! - leased locks carrying a fencing token that grows on every acquisition.
//!
//! Lock records live under `lock#{id}`. The fencing counter lives under
//! `fence#{id}` and outlives the lock so tokens never repeat. Versioned
//! records are deleted by writing a tombstone for the same reason: a record
//! recreated after a delete must never reuse a version a reader has seen.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use backoff::backoff::Backoff;
use chrono::Utc;
use serde_json::{Map, Value};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::retry::RetryPolicy;
use crate::domain::errors::{CoherenceError, CoherenceResult, ConflictKind};
use crate::domain::models::lock::{EXPIRES_AT_ATTR, FENCING_TOKEN_ATTR, OWNER_TOKEN_ATTR};
use crate::domain::models::version::VERSION_ATTR;
use crate::domain::models::{ConcurrencyConfig, EntityVersion, LockAcquisition, LockGuard, LockRecord};
use crate::domain::ports::{AuthoritativeStore, Condition, Item, TransactionItem};

/// Largest batch accepted by [`ConcurrencyControlManager::execute_transaction`].
pub const MAX_TRANSACTION_ITEMS: usize = 100;

/// Store key of the lease record for `lock_id`.
pub fn lock_key(lock_id: &str) -> String {
    format!("lock#{lock_id}")
}

/// Store key of the fencing counter for `lock_id`.
pub fn fence_key(lock_id: &str) -> String {
    format!("fence#{lock_id}")
}

/// Transactions, optimistic updates and leased locks over one authoritative store.
///
/// Holds no state of its own beyond configuration; every guarantee comes
/// from the store's conditional writes, so any number of managers may share
/// a store.
pub struct ConcurrencyControlManager {
    store: Arc<dyn AuthoritativeStore>,
    retry: RetryPolicy,
    default_lock_ttl: Duration,
}

impl ConcurrencyControlManager {
    /// Build a manager using the retry and lock settings from `config`.
    pub fn new(store: Arc<dyn AuthoritativeStore>, config: &ConcurrencyConfig) -> Self {
        Self {
            store,
            retry: RetryPolicy::from_config(config),
            default_lock_ttl: config.lock_ttl(),
        }
    }

    /// Backoff applied to transient store errors and version conflicts.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Commit every item or none.
    ///
    /// A rejected item aborts the whole batch with a `Conflict` naming the
    /// failing item. Transient store errors are retried with backoff.
    pub async fn execute_transaction(&self, items: Vec<TransactionItem>) -> CoherenceResult<()> {
        validate_batch(&items, MAX_TRANSACTION_ITEMS)?;
        let count = items.len();
        self.retry
            .execute("transaction", || self.store.transact(items.clone()))
            .await?;
        debug!(items = count, "Transaction committed");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Optimistic concurrency
    // ------------------------------------------------------------------

    /// Current live version of a record. Deleted records read as `None`.
    pub async fn read_version(&self, key: &str) -> CoherenceResult<Option<EntityVersion>> {
        Ok(self.read_record(key).await?.live)
    }

    async fn read_record(&self, key: &str) -> CoherenceResult<RecordState> {
        let Some(item) = self.retry.execute("read version", || self.store.get(key)).await? else {
            return Ok(RecordState::default());
        };
        let version = EntityVersion::from_item(key, &item)?;
        Ok(RecordState {
            last_version: Some(version.version),
            live: (!EntityVersion::is_tombstone(&item)).then_some(version),
        })
    }

    /// Read-modify-write guarded by the record version.
    ///
    /// `update_fn` receives the current value (`None` for a new record) and
    /// may be called once per attempt. On a version conflict the record is
    /// re-read and the update retried up to `max_retries` times.
    pub async fn optimistic_update<F>(&self, key: &str, update_fn: F, max_retries: u32) -> CoherenceResult<EntityVersion>
    where
        F: FnMut(Option<&Value>) -> CoherenceResult<Value> + Send,
    {
        self.optimistic_loop(key, update_fn, max_retries, None).await
    }

    /// Like [`optimistic_update`](Self::optimistic_update), but gives up with
    /// `Timeout` rather than start an attempt or sleep past `deadline`.
    pub async fn optimistic_update_with_deadline<F>(
        &self,
        key: &str,
        update_fn: F,
        max_retries: u32,
        deadline: Instant,
    ) -> CoherenceResult<EntityVersion>
    where
        F: FnMut(Option<&Value>) -> CoherenceResult<Value> + Send,
    {
        self.optimistic_loop(key, update_fn, max_retries, Some(deadline)).await
    }

    async fn optimistic_loop<F>(
        &self,
        key: &str,
        mut update_fn: F,
        max_retries: u32,
        deadline: Option<Instant>,
    ) -> CoherenceResult<EntityVersion>
    where
        F: FnMut(Option<&Value>) -> CoherenceResult<Value> + Send,
    {
        if key.is_empty() {
            return Err(CoherenceError::validation("record key cannot be empty"));
        }
        let mut backoff = self.retry.backoff();
        let mut attempt = 0u32;

        loop {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(timeout(key, attempt));
            }
            attempt += 1;

            let current = self.read_record(key).await?;
            let observed = current.last_version;
            let value = update_fn(current.live.as_ref().map(|v| &v.value))?;
            let (record, condition) = next_version(key, observed, value);

            let item = record.to_item();
            let result = self
                .retry
                .execute("conditional put", || {
                    self.store.conditional_put(key, item.clone(), condition.clone())
                })
                .await;

            match result {
                Ok(()) => {
                    debug!(key = key, version = record.version, attempt, "Optimistic update committed");
                    return Ok(record);
                }
                Err(e) if e.is_conflict() => {
                    if attempt > max_retries {
                        warn!(key = key, attempts = attempt, "Optimistic update gave up on conflict");
                        return Err(CoherenceError::Conflict {
                            key: key.to_string(),
                            kind: ConflictKind::VersionMismatch { observed },
                            attempts: attempt,
                        });
                    }
                    let delay = backoff.next_backoff().unwrap_or(Duration::ZERO);
                    if deadline.is_some_and(|d| Instant::now() + delay >= d) {
                        return Err(timeout(key, attempt));
                    }
                    debug!(
                        key = key,
                        attempt,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "Version conflict, retrying"
                    );
                    sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Delete a versioned record, retrying if it changes underneath.
    ///
    /// The record is replaced by a tombstone one version past it. Returns
    /// the version that was deleted, or `None` if there was nothing to
    /// delete.
    pub async fn optimistic_delete(&self, key: &str, max_retries: u32) -> CoherenceResult<Option<EntityVersion>> {
        let mut backoff = self.retry.backoff();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let Some(current) = self.read_version(key).await? else {
                return Ok(None);
            };
            let (tombstone, condition) = tombstone_for(&current);
            let result = self
                .retry
                .execute("conditional delete", || {
                    self.store.conditional_put(key, tombstone.clone(), condition.clone())
                })
                .await;

            match result {
                Ok(()) => return Ok(Some(current)),
                Err(e) if e.is_conflict() && attempt <= max_retries => {
                    sleep(backoff.next_backoff().unwrap_or(Duration::ZERO)).await;
                }
                Err(e) if e.is_conflict() => {
                    return Err(CoherenceError::Conflict {
                        key: key.to_string(),
                        kind: ConflictKind::VersionMismatch { observed: Some(current.version) },
                        attempts: attempt,
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    // ------------------------------------------------------------------
    // Locks
    // ------------------------------------------------------------------

    /// Try to take a lease on `lock_id`.
    ///
    /// Succeeds only if no lock record exists or the existing one has
    /// expired. Contention yields `NotAcquired`, never an error.
    pub async fn acquire_lock(&self, lock_id: &str, ttl: Option<Duration>) -> CoherenceResult<LockAcquisition> {
        if lock_id.is_empty() {
            return Err(CoherenceError::validation("lock id cannot be empty"));
        }
        let ttl = ttl.unwrap_or(self.default_lock_ttl);
        if ttl.is_zero() {
            return Err(CoherenceError::validation("lock ttl must be positive"));
        }

        let lock_key = lock_key(lock_id);
        let fence_key = fence_key(lock_id);

        let fence = self.retry.execute("read fence", || self.store.get(&fence_key)).await?;
        let (fencing_token, fence_condition) = match fence {
            Some(item) => {
                let current = item.get(VERSION_ATTR).and_then(Value::as_u64).ok_or_else(|| {
                    CoherenceError::Store(format!("fence record for lock {lock_id} has no version"))
                })?;
                (current + 1, Condition::attribute_equals(VERSION_ATTR, current))
            }
            None => (1, Condition::ItemNotExists),
        };

        let now = now_ms();
        let record = LockRecord {
            lock_id: lock_id.to_string(),
            owner_token: Uuid::new_v4().to_string(),
            fencing_token,
            expires_at_epoch_ms: now.saturating_add(duration_ms(ttl)),
        };

        let mut fence_item = Map::new();
        fence_item.insert(VERSION_ATTR.to_string(), Value::from(fencing_token));

        let items = vec![
            TransactionItem::put(lock_key.clone(), record.to_item()).when(Condition::Any(vec![
                Condition::ItemNotExists,
                Condition::attribute_less_than(EXPIRES_AT_ATTR, now),
            ])),
            TransactionItem::put(fence_key, fence_item).when(fence_condition),
        ];

        match self.retry.execute("acquire lock", || self.store.transact(items.clone())).await {
            Ok(()) => {
                info!(lock_id = lock_id, fencing_token, ttl_ms = duration_ms(ttl), "Lock acquired");
                Ok(LockAcquisition::Acquired(LockGuard::from(&record)))
            }
            Err(e) if e.is_conflict() => {
                let held_until = self
                    .store
                    .get(&lock_key)
                    .await
                    .ok()
                    .flatten()
                    .and_then(|item| LockRecord::from_item(lock_id, &item).ok())
                    .map(|r| r.expires_at_epoch_ms);
                debug!(lock_id = lock_id, ?held_until, "Lock not acquired");
                Ok(LockAcquisition::NotAcquired {
                    lock_id: lock_id.to_string(),
                    held_until_epoch_ms: held_until,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Release a lock held under `owner_token`.
    ///
    /// A token mismatch, or a lock that no longer exists, is
    /// `UnauthorizedRelease`.
    pub async fn release_lock(&self, lock_id: &str, owner_token: &str) -> CoherenceResult<()> {
        let key = lock_key(lock_id);
        let condition = Condition::attribute_equals(OWNER_TOKEN_ATTR, owner_token);

        match self
            .retry
            .execute("release lock", || self.store.conditional_delete(&key, condition.clone()))
            .await
        {
            Ok(()) => {
                info!(lock_id = lock_id, "Lock released");
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                warn!(lock_id = lock_id, "Rejected lock release with foreign token");
                Err(CoherenceError::UnauthorizedRelease { lock_id: lock_id.to_string() })
            }
            Err(e) => Err(e),
        }
    }

    /// Release the lock `guard` was issued for.
    pub async fn release(&self, guard: &LockGuard) -> CoherenceResult<()> {
        self.release_lock(&guard.lock_id, &guard.owner_token).await
    }

    /// Extend a lease that is still held. Returns the guard with its new expiry.
    pub async fn refresh_lock(&self, guard: &LockGuard, ttl: Option<Duration>) -> CoherenceResult<LockGuard> {
        let ttl = ttl.unwrap_or(self.default_lock_ttl);
        let now = now_ms();
        let record = LockRecord {
            lock_id: guard.lock_id.clone(),
            owner_token: guard.owner_token.clone(),
            fencing_token: guard.fencing_token,
            expires_at_epoch_ms: now.saturating_add(duration_ms(ttl)),
        };
        let key = lock_key(&guard.lock_id);
        let condition = still_held(guard, now);
        let item = record.to_item();

        match self
            .retry
            .execute("refresh lock", || {
                self.store.conditional_put(&key, item.clone(), condition.clone())
            })
            .await
        {
            Ok(()) => {
                debug!(lock_id = %guard.lock_id, expires_at = record.expires_at_epoch_ms, "Lock refreshed");
                Ok(LockGuard::from(&record))
            }
            Err(e) if e.is_conflict() => Err(lock_lost(guard)),
            Err(e) => Err(e),
        }
    }

    /// Commit `items` only while `guard` still owns its lock.
    ///
    /// Ownership, fencing token and expiry are re-checked inside the same
    /// atomic commit, so a holder whose lease lapsed cannot write.
    pub async fn guarded_commit(&self, guard: &LockGuard, items: Vec<TransactionItem>) -> CoherenceResult<()> {
        validate_batch(&items, MAX_TRANSACTION_ITEMS - 1)?;

        let mut batch = Vec::with_capacity(items.len() + 1);
        batch.push(TransactionItem::check(lock_key(&guard.lock_id), still_held(guard, now_ms())));
        batch.extend(items);

        match self
            .retry
            .execute("guarded commit", || self.store.transact(batch.clone()))
            .await
        {
            Ok(()) => Ok(()),
            Err(CoherenceError::Conflict { kind: ConflictKind::ConditionFailed { failed_index: Some(0) }, .. }) => {
                Err(lock_lost(guard))
            }
            Err(CoherenceError::Conflict { key, kind: ConflictKind::ConditionFailed { failed_index }, attempts }) => {
                Err(CoherenceError::Conflict {
                    key,
                    kind: ConflictKind::ConditionFailed { failed_index: failed_index.map(|i| i - 1) },
                    attempts,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Versioned read-modify-write of one record under a held lock.
    pub async fn guarded_update<F>(&self, guard: &LockGuard, key: &str, update_fn: F) -> CoherenceResult<EntityVersion>
    where
        F: FnOnce(Option<&Value>) -> CoherenceResult<Value> + Send,
    {
        let current = self.read_record(key).await?;
        let observed = current.last_version;
        let value = update_fn(current.live.as_ref().map(|v| &v.value))?;
        let (record, condition) = next_version(key, observed, value);

        self.guarded_commit(guard, vec![TransactionItem::put(key, record.to_item()).when(condition)])
            .await
            .map_err(|e| version_mismatch(e, key, observed))?;
        Ok(record)
    }

    /// Versioned delete of one record under a held lock.
    ///
    /// Returns the version that was deleted, or `None` if the record did not
    /// exist.
    pub async fn guarded_delete(&self, guard: &LockGuard, key: &str) -> CoherenceResult<Option<EntityVersion>> {
        let Some(current) = self.read_version(key).await? else {
            return Ok(None);
        };
        let (tombstone, condition) = tombstone_for(&current);

        self.guarded_commit(guard, vec![TransactionItem::put(key, tombstone).when(condition)])
            .await
            .map_err(|e| version_mismatch(e, key, Some(current.version)))?;
        Ok(Some(current))
    }
}

/// What the store holds under a versioned key.
#[derive(Default)]
struct RecordState {
    /// Version of the live record or of its tombstone
    last_version: Option<u64>,
    live: Option<EntityVersion>,
}

fn next_version(key: &str, observed: Option<u64>, value: Value) -> (EntityVersion, Condition) {
    match observed {
        Some(v) => (
            EntityVersion::new(key, v + 1, value),
            Condition::attribute_equals(VERSION_ATTR, v),
        ),
        None => (EntityVersion::new(key, 1, value), Condition::ItemNotExists),
    }
}

fn tombstone_for(current: &EntityVersion) -> (Item, Condition) {
    (
        EntityVersion::tombstone_item(current.version + 1),
        Condition::attribute_equals(VERSION_ATTR, current.version),
    )
}

fn version_mismatch(err: CoherenceError, key: &str, observed: Option<u64>) -> CoherenceError {
    match err {
        CoherenceError::Conflict { kind: ConflictKind::ConditionFailed { .. }, attempts, .. } => CoherenceError::Conflict {
            key: key.to_string(),
            kind: ConflictKind::VersionMismatch { observed },
            attempts,
        },
        other => other,
    }
}

fn still_held(guard: &LockGuard, now: i64) -> Condition {
    Condition::All(vec![
        Condition::attribute_equals(OWNER_TOKEN_ATTR, guard.owner_token.clone()),
        Condition::attribute_equals(FENCING_TOKEN_ATTR, guard.fencing_token),
        Condition::attribute_greater_than(EXPIRES_AT_ATTR, now - 1),
    ])
}

fn lock_lost(guard: &LockGuard) -> CoherenceError {
    warn!(lock_id = %guard.lock_id, fencing_token = guard.fencing_token, "Lock lost");
    CoherenceError::Conflict {
        key: lock_key(&guard.lock_id),
        kind: ConflictKind::LockLost,
        attempts: 1,
    }
}

fn validate_batch(items: &[TransactionItem], max_items: usize) -> CoherenceResult<()> {
    if items.is_empty() {
        return Err(CoherenceError::validation("transaction has no items"));
    }
    if items.len() > max_items {
        return Err(CoherenceError::validation(format!(
            "transaction has {} items, limit is {max_items}",
            items.len()
        )));
    }
    let mut seen = HashSet::with_capacity(items.len());
    for item in items {
        if item.key().is_empty() {
            return Err(CoherenceError::validation("transaction item has an empty key"));
        }
        if !seen.insert(item.key()) {
            return Err(CoherenceError::validation(format!(
                "key '{}' appears more than once in the transaction",
                item.key()
            )));
        }
    }
    Ok(())
}

fn timeout(key: &str, attempts: u32) -> CoherenceError {
    CoherenceError::Timeout {
        operation: format!("optimistic update of {key}"),
        attempts,
    }
}

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

fn duration_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}
