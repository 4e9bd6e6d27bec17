//! Coherence - cache coherence for a read-optimized cache tier
//!
//! Keeps cached data consistent with an authoritative store under concurrent
//! writes: domain events fan out to an invalidation rule engine, cached
//! entries get adaptive TTLs, and writers race safely through optimistic
//! versioning, atomic transactions and fenced leases.
//!
//! # Architecture
//!
//! This crate follows Clean Architecture / Hexagonal Architecture principles:
//!
//! - **Domain Layer** (`domain`): models, errors and the store/cache ports
//! - **Service Layer** (`services`): dispatcher, invalidation engine, TTL
//!   strategy manager and concurrency control
//! - **Application Layer** (`application`): the coherent write path and wiring
//! - **Adapters** (`adapters`): moka cache, in-memory and SQLite stores
//! - **Infrastructure Layer** (`infrastructure`): configuration and logging
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use coherence::adapters::cache::MokaCacheStore;
//! use coherence::adapters::memory::InMemoryAuthoritativeStore;
//! use coherence::application::{CoherenceRuntime, WriteRequest};
//! use coherence::domain::models::{CoherenceConfig, EventKey, InvalidationRule, Operation};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let rules = vec![InvalidationRule::new(
//!         "user-projects",
//!         EventKey::new("user", Operation::Update),
//!         vec!["user:*".into(), "user:*:projects".into()],
//!     )];
//!     let runtime = CoherenceRuntime::build(
//!         CoherenceConfig::default(),
//!         rules,
//!         vec![],
//!         vec![],
//!         Arc::new(InMemoryAuthoritativeStore::new()),
//!         Arc::new(MokaCacheStore::default()),
//!     )
//!     .await?;
//!
//!     runtime
//!         .writer
//!         .write(WriteRequest::upsert("user", "U1", serde_json::json!({"name": "Ada"})))
//!         .await?;
//!     runtime.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod adapters;
pub mod application;
pub mod domain;
pub mod infrastructure;
pub mod services;

// Re-export commonly used types for convenience
pub use application::{CoherenceRuntime, CoherentWriter, WriteOutcome, WriteRequest};
pub use domain::models::{
    CacheKey, CascadeRule, CoherenceConfig, DomainEvent, EntityMetadata, EventKey, InvalidationRule, KeyPattern,
    LockAcquisition, LockGuard, Operation, RuleRegistry, TtlStrategy,
};
pub use domain::ports::{AuthoritativeStore, CacheStore};
pub use domain::{CoherenceError, CoherenceResult, ConflictKind};
pub use infrastructure::config::{ConfigError, ConfigLoader};
pub use services::{
    ConcurrencyControlManager, DomainEventDispatcher, InvalidationEngine, InProcessScheduler, TtlStrategyManager,
};
