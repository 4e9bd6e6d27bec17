//! Coherence services: concurrency control, invalidation and event fan-out.

pub mod concurrency_control;
pub mod event_dispatcher;
pub mod invalidation_engine;
pub mod invalidation_executor;
pub mod invalidation_scheduler;
pub mod retry;
pub mod ttl_strategy;

pub use concurrency_control::{ConcurrencyControlManager, MAX_TRANSACTION_ITEMS};
pub use event_dispatcher::{
    DispatchReport, DomainEventDispatcher, DomainEventHandler, FnHandler, HandlerOutcome, HandlerStatus,
    SubscriptionId,
};
pub use invalidation_engine::InvalidationEngine;
pub use invalidation_executor::{InvalidationExecutor, InvalidationReport, PatternDeletion, TargetFailure};
pub use invalidation_scheduler::{InProcessScheduler, InvalidationScheduler};
pub use retry::RetryPolicy;
pub use ttl_strategy::TtlStrategyManager;
