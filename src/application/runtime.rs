//! Wiring for a complete coherence subsystem.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use super::coherent_writer::CoherentWriter;
use crate::domain::errors::{CoherenceError, CoherenceResult};
use crate::domain::models::{CascadeRule, CascadeTable, CoherenceConfig, InvalidationRule, RuleRegistry, TtlStrategy};
use crate::domain::ports::{AuthoritativeStore, CacheStore};
use crate::infrastructure::config::ConfigLoader;
use crate::services::{
    ConcurrencyControlManager, DomainEventDispatcher, InProcessScheduler, InvalidationEngine, InvalidationExecutor,
    InvalidationReport, InvalidationScheduler, SubscriptionId, TtlStrategyManager,
};

/// All four components plus the write path, sharing one store and one cache.
///
/// Rules and cascades passed to [`CoherenceRuntime::build`] are registered
/// before the ones declared in configuration, so their relative order is
/// stable.
pub struct CoherenceRuntime {
    pub config: CoherenceConfig,
    pub dispatcher: Arc<DomainEventDispatcher>,
    pub scheduler: InProcessScheduler,
    pub engine: Arc<InvalidationEngine>,
    pub ttl: Arc<TtlStrategyManager>,
    pub concurrency: Arc<ConcurrencyControlManager>,
    pub writer: CoherentWriter,
    subscriptions: Vec<SubscriptionId>,
    scheduler_task: Option<JoinHandle<()>>,
}

impl CoherenceRuntime {
    /// Assemble the runtime and start the delayed-invalidation loop.
    ///
    /// The configuration is validated first, so a hand-built config with
    /// inverted TTL bounds or zero retries is rejected here rather than
    /// failing on the first write. Must be called from within a tokio runtime.
    pub async fn build(
        config: CoherenceConfig,
        rules: Vec<InvalidationRule>,
        cascades: Vec<CascadeRule>,
        strategies: Vec<TtlStrategy>,
        store: Arc<dyn AuthoritativeStore>,
        cache: Arc<dyn CacheStore>,
    ) -> CoherenceResult<Self> {
        ConfigLoader::validate(&config).map_err(|e| CoherenceError::validation(e.to_string()))?;

        let registry = RuleRegistry::builder()
            .rules(rules)
            .specs(config.invalidation.rules.clone())
            .build()?;
        let cascades = CascadeTable::from_rules(cascades.into_iter().chain(config.invalidation.cascades.clone()))?;

        let dispatcher = Arc::new(DomainEventDispatcher::new(&config.dispatcher));
        let executor = InvalidationExecutor::new(cache.clone());
        let scheduler = InProcessScheduler::new(executor.clone());
        let engine = Arc::new(InvalidationEngine::new(
            Arc::new(registry),
            Arc::new(cascades),
            executor,
            Arc::new(scheduler.clone()) as Arc<dyn InvalidationScheduler>,
            &config.invalidation,
        ));
        let subscriptions = engine.attach(&dispatcher).await;

        let ttl = Arc::new(TtlStrategyManager::new(config.ttl.clone(), strategies));
        let concurrency = Arc::new(ConcurrencyControlManager::new(store, &config.concurrency));
        let writer = CoherentWriter::new(concurrency.clone(), ttl.clone(), cache, dispatcher.clone());

        let scheduler_task = Some(scheduler.start());

        info!(
            rules = engine.registry().len(),
            subscriptions = subscriptions.len(),
            mode = ?dispatcher.mode(),
            "Coherence runtime started"
        );

        Ok(Self {
            config,
            dispatcher,
            scheduler,
            engine,
            ttl,
            concurrency,
            writer,
            subscriptions,
            scheduler_task,
        })
    }

    /// Dispatcher subscriptions held by the invalidation engine.
    pub fn subscriptions(&self) -> &[SubscriptionId] {
        &self.subscriptions
    }

    /// Stop the scheduler loop and fire whatever is still pending, so no
    /// accepted invalidation is dropped on a clean shutdown.
    pub async fn shutdown(mut self) -> Vec<InvalidationReport> {
        self.scheduler.shutdown();
        if let Some(task) = self.scheduler_task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Scheduler task ended abnormally");
            }
        }
        for id in &self.subscriptions {
            self.dispatcher.unsubscribe(*id).await;
        }
        let flushed = self.scheduler.drain().await;
        info!(flushed = flushed.len(), "Coherence runtime stopped");
        flushed
    }
}
