//! The coherent write path.
//!
//! A write commits to the authoritative store first (optimistically, or as a
//! fenced commit under a lock), then refreshes the entity's own cache entry
//! and publishes a domain event so the invalidation engine can clear every
//! other entry that may now be stale.
//!
//! The refresh is checked against the store after the cache write: if a
//! newer version was committed in the meantime the entry is evicted, so a
//! slow writer can never leave its older value cached for a full TTL.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::domain::errors::{CoherenceError, CoherenceResult, ConflictKind};
use crate::domain::models::{CacheKey, DomainEvent, EntityMetadata, EntityVersion, LockAcquisition, LockGuard, Operation};
use crate::domain::ports::CacheStore;
use crate::services::{ConcurrencyControlManager, DispatchReport, DomainEventDispatcher, TtlStrategyManager};

/// What a write does to the record.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteChange {
    /// Create the record or replace its value.
    Upsert(Value),
    Delete,
}

/// One write against a single entity.
#[derive(Debug, Clone)]
pub struct WriteRequest {
    pub entity_type: String,
    pub entity_id: String,
    pub change: WriteChange,
    /// Access statistics feeding the TTL of the refreshed cache entry
    pub metadata: EntityMetadata,
    /// Take a lock on the record for this long around the commit
    pub lock_ttl: Option<Duration>,
    /// Current system load in `[0, 1]`, if the TTL should adapt to it
    pub system_load: Option<f64>,
    /// Event payload. Defaults to the new value for upserts.
    pub event_payload: Option<Value>,
}

impl WriteRequest {
    /// Create the entity or replace its value.
    pub fn upsert(entity_type: impl Into<String>, entity_id: impl Into<String>, value: Value) -> Self {
        Self::with_change(entity_type, entity_id, WriteChange::Upsert(value))
    }

    /// Delete the entity and evict its cache entry.
    pub fn delete(entity_type: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self::with_change(entity_type, entity_id, WriteChange::Delete)
    }

    fn with_change(entity_type: impl Into<String>, entity_id: impl Into<String>, change: WriteChange) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            change,
            metadata: EntityMetadata::default(),
            lock_ttl: None,
            system_load: None,
            event_payload: None,
        }
    }

    /// Access statistics used for the TTL of the refreshed entry.
    pub fn with_metadata(mut self, metadata: EntityMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    /// Hold a lock on the record for `ttl` around the commit.
    pub fn under_lock(mut self, ttl: Duration) -> Self {
        self.lock_ttl = Some(ttl);
        self
    }

    /// Adapt the TTL to the given load in `[0, 1]`.
    pub fn with_system_load(mut self, load: f64) -> Self {
        self.system_load = Some(load);
        self
    }

    /// Publish `payload` instead of the new value.
    pub fn with_event_payload(mut self, payload: Value) -> Self {
        self.event_payload = Some(payload);
        self
    }

    /// Key of the entity's own cache entry, also used as its record key.
    pub fn cache_key(&self) -> CacheKey {
        CacheKey::entity(&self.entity_type, &self.entity_id)
    }
}

/// Result of a committed write.
#[derive(Debug, Clone)]
pub struct WriteOutcome {
    /// The committed version, or for deletes the version that was removed
    pub version: Option<EntityVersion>,
    pub operation: Operation,
    /// TTL given to the refreshed cache entry. `None` for deletes.
    pub ttl: Option<Duration>,
    /// False when the entity's own cache entry could not be refreshed
    pub cache_updated: bool,
    /// False when a lock was taken but could not be released cleanly
    pub lock_released: bool,
    pub dispatch: DispatchReport,
}

struct Commit {
    version: Option<EntityVersion>,
    /// No live record existed before this write
    created: bool,
}

/// Write path tying the concurrency manager, TTL manager, cache and dispatcher together.
pub struct CoherentWriter {
    concurrency: Arc<ConcurrencyControlManager>,
    ttl: Arc<TtlStrategyManager>,
    cache: Arc<dyn CacheStore>,
    dispatcher: Arc<DomainEventDispatcher>,
}

impl CoherentWriter {
    /// Writer sharing the runtime's components.
    pub fn new(
        concurrency: Arc<ConcurrencyControlManager>,
        ttl: Arc<TtlStrategyManager>,
        cache: Arc<dyn CacheStore>,
        dispatcher: Arc<DomainEventDispatcher>,
    ) -> Self {
        Self {
            concurrency,
            ttl,
            cache,
            dispatcher,
        }
    }

    /// Commit a change and bring the cache tier in line with it.
    ///
    /// The event is validated before anything is written, so a malformed
    /// entity type or id never reaches the store. Once the commit succeeds
    /// the write counts as done: cache refresh and lock release problems
    /// are reported in the outcome instead of failing the call.
    #[instrument(skip(self, request), fields(entity_type = %request.entity_type, entity_id = %request.entity_id))]
    pub async fn write(&self, request: WriteRequest) -> CoherenceResult<WriteOutcome> {
        DomainEvent::new(&request.entity_type, &request.entity_id, Operation::Update).validate()?;
        let record_key = request.cache_key();

        let (Commit { version, created }, lock_released) = match request.lock_ttl {
            Some(lock_ttl) => self.commit_under_lock(&request, record_key.as_str(), lock_ttl).await?,
            None => (self.commit_optimistic(&request, record_key.as_str()).await?, true),
        };

        let operation = match &request.change {
            WriteChange::Delete => Operation::Delete,
            WriteChange::Upsert(_) if created => Operation::Create,
            WriteChange::Upsert(_) => Operation::Update,
        };

        let (ttl, cache_updated) = self.refresh_cache(&request, &record_key, version.as_ref()).await;

        let payload = request.event_payload.clone().or_else(|| match &request.change {
            WriteChange::Upsert(value) => Some(value.clone()),
            WriteChange::Delete => None,
        });
        let mut event = DomainEvent::new(&request.entity_type, &request.entity_id, operation);
        if let Some(payload) = payload {
            event = event.with_payload(payload);
        }
        let dispatch = self.dispatcher.publish(event).await?;

        info!(
            operation = %operation,
            version = version.as_ref().map(|v| v.version),
            handlers = dispatch.handler_count(),
            "Coherent write committed"
        );

        Ok(WriteOutcome {
            version,
            operation,
            ttl,
            cache_updated,
            lock_released,
            dispatch,
        })
    }

    async fn commit_optimistic(&self, request: &WriteRequest, record_key: &str) -> CoherenceResult<Commit> {
        let max_retries = self.concurrency.retry_policy().max_retries();
        match &request.change {
            WriteChange::Upsert(value) => {
                // Reflects the attempt that committed; earlier attempts are overwritten.
                let mut created = false;
                let version = self
                    .concurrency
                    .optimistic_update(
                        record_key,
                        |current| {
                            created = current.is_none();
                            Ok(value.clone())
                        },
                        max_retries,
                    )
                    .await?;
                Ok(Commit { version: Some(version), created })
            }
            WriteChange::Delete => Ok(Commit {
                version: self.concurrency.optimistic_delete(record_key, max_retries).await?,
                created: false,
            }),
        }
    }

    async fn commit_under_lock(
        &self,
        request: &WriteRequest,
        record_key: &str,
        lock_ttl: Duration,
    ) -> CoherenceResult<(Commit, bool)> {
        let guard = match self.concurrency.acquire_lock(record_key, Some(lock_ttl)).await? {
            LockAcquisition::Acquired(guard) => guard,
            LockAcquisition::NotAcquired { .. } => {
                return Err(CoherenceError::Conflict {
                    key: record_key.to_string(),
                    kind: ConflictKind::LockHeld,
                    attempts: 1,
                });
            }
        };

        let committed = self.fenced_commit(&guard, request, record_key).await;

        let released = match self.concurrency.release(&guard).await {
            Ok(()) => true,
            Err(e) => {
                warn!(lock_id = %guard.lock_id, error = %e, "Failed to release write lock");
                false
            }
        };
        committed.map(|commit| (commit, released))
    }

    async fn fenced_commit(
        &self,
        guard: &LockGuard,
        request: &WriteRequest,
        record_key: &str,
    ) -> CoherenceResult<Commit> {
        match &request.change {
            WriteChange::Upsert(value) => {
                let value = value.clone();
                let mut created = false;
                let version = self
                    .concurrency
                    .guarded_update(guard, record_key, |current| {
                        created = current.is_none();
                        Ok(value)
                    })
                    .await?;
                Ok(Commit { version: Some(version), created })
            }
            WriteChange::Delete => Ok(Commit {
                version: self.concurrency.guarded_delete(guard, record_key).await?,
                created: false,
            }),
        }
    }

    async fn refresh_cache(
        &self,
        request: &WriteRequest,
        key: &CacheKey,
        version: Option<&EntityVersion>,
    ) -> (Option<Duration>, bool) {
        match (&request.change, version) {
            (WriteChange::Upsert(_), Some(v)) => {
                let base = self.ttl.calculate_ttl(&request.entity_type, &request.metadata);
                let ttl = match request.system_load {
                    Some(load) => self.ttl.adapt_ttl_for_load(base, load),
                    None => base,
                };

                if let Err(e) = self.cache.set(key.as_str(), v.value.clone(), ttl).await {
                    warn!(key = %key, error = %e, "Cache refresh failed, evicting entry");
                    // A stale value must not outlive the failed refresh.
                    self.evict(key).await;
                    return (None, false);
                }
                if self.superseded(key, v.version).await {
                    debug!(key = %key, version = v.version, "Newer version committed meanwhile, evicting entry");
                    self.evict(key).await;
                    return (None, false);
                }
                debug!(key = %key, ttl_secs = ttl.as_secs(), "Cache entry refreshed");
                (Some(ttl), true)
            }
            _ => (None, self.evict(key).await),
        }
    }

    /// Whether the store no longer holds `version`. Unreadable counts as superseded.
    async fn superseded(&self, key: &CacheKey, version: u64) -> bool {
        match self.concurrency.read_version(key.as_str()).await {
            Ok(current) => current.map(|c| c.version) != Some(version),
            Err(e) => {
                warn!(key = %key, error = %e, "Could not confirm refreshed version");
                true
            }
        }
    }

    async fn evict(&self, key: &CacheKey) -> bool {
        match self.cache.delete(key.as_str()).await {
            Ok(_) => true,
            Err(e) => {
                warn!(key = %key, error = %e, "Cache eviction failed");
                false
            }
        }
    }
}
