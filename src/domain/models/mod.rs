//! Domain models.

pub mod cache_key;
pub mod cascade;
pub mod config;
pub mod event;
pub mod lock;
pub mod pending;
pub mod rule;
pub mod ttl;
pub mod version;

pub use cache_key::{resolve_target, CacheKey, KeyPattern, ResolvedTarget, WILDCARD};
pub use cascade::{CascadeCondition, CascadeRule, CascadeTable};
pub use config::{
    CoherenceConfig, ConcurrencyConfig, DatabaseConfig, DispatchMode, DispatcherConfig,
    InvalidationConfig, LoggingConfig, TtlConfig,
};
pub use event::{DomainEvent, EventKey, Operation};
pub use lock::{LockAcquisition, LockGuard, LockRecord};
pub use pending::{DedupeKey, PendingInvalidation, ScheduleOutcome};
pub use rule::{InvalidationRule, PayloadPredicate, RuleRegistry, RuleRegistryBuilder, RuleSpec};
pub use ttl::{AccessHistogram, EntityMetadata, TtlFactors, TtlStrategy};
pub use version::EntityVersion;
