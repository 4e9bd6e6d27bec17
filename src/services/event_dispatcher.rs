//! Domain event dispatcher.
//!
//! Handlers subscribe to an event key (`entityType:operation`) and are
//! invoked in subscription order whenever a matching event is published.
//! Every handler runs as its own task under a timeout, so an error, a panic
//! or a hang in one handler is recorded in the [`DispatchReport`] and never
//! prevents the remaining handlers from running.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::domain::errors::CoherenceResult;
use crate::domain::models::{DispatchMode, DispatcherConfig, DomainEvent, EventKey};

/// A consumer of domain events.
#[async_trait]
pub trait DomainEventHandler: Send + Sync {
    /// Name used in logs and dispatch reports.
    fn name(&self) -> &str;

    async fn handle(&self, event: &DomainEvent) -> Result<(), String>;
}

/// Adapts an async closure into a [`DomainEventHandler`].
pub struct FnHandler<F> {
    name: String,
    f: F,
}

impl<F, Fut> FnHandler<F>
where
    F: Fn(DomainEvent) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), String>> + Send,
{
    /// Handler named `name` running `f`.
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self { name: name.into(), f }
    }
}

#[async_trait]
impl<F, Fut> DomainEventHandler for FnHandler<F>
where
    F: Fn(DomainEvent) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), String>> + Send + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn handle(&self, event: &DomainEvent) -> Result<(), String> {
        (self.f)(event.clone()).await
    }
}

/// Handle for removing a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// How one handler finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerStatus {
    Succeeded,
    Failed(String),
    TimedOut,
    Panicked(String),
}

/// Result of one handler for one event.
#[derive(Debug, Clone)]
pub struct HandlerOutcome {
    pub subscription: SubscriptionId,
    pub handler: String,
    pub status: HandlerStatus,
    pub elapsed: Duration,
}

impl HandlerOutcome {
    /// Whether the handler returned `Ok` in time.
    pub fn is_success(&self) -> bool {
        self.status == HandlerStatus::Succeeded
    }
}

/// Outcome of one `publish`, one entry per handler in subscription order.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub event_id: Uuid,
    pub event_type: String,
    pub outcomes: Vec<HandlerOutcome>,
}

impl DispatchReport {
    /// Whether every handler succeeded.
    pub fn all_succeeded(&self) -> bool {
        self.outcomes.iter().all(HandlerOutcome::is_success)
    }

    /// Outcomes of handlers that failed, panicked or timed out.
    pub fn failures(&self) -> impl Iterator<Item = &HandlerOutcome> {
        self.outcomes.iter().filter(|o| !o.is_success())
    }

    /// Number of handlers that ran.
    pub fn handler_count(&self) -> usize {
        self.outcomes.len()
    }
}

#[derive(Clone)]
struct Subscription {
    id: SubscriptionId,
    handler: Arc<dyn DomainEventHandler>,
}

/// Fans published events out to the handlers subscribed to their type.
pub struct DomainEventDispatcher {
    subscriptions: RwLock<HashMap<EventKey, Vec<Subscription>>>,
    next_id: AtomicU64,
    handler_timeout: Duration,
    mode: DispatchMode,
}

impl Default for DomainEventDispatcher {
    fn default() -> Self {
        Self::new(&DispatcherConfig::default())
    }
}

impl DomainEventDispatcher {
    /// Dispatcher with the configured mode and handler timeout.
    pub fn new(config: &DispatcherConfig) -> Self {
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            handler_timeout: config.handler_timeout(),
            mode: config.mode,
        }
    }

    /// Configured dispatch mode.
    pub fn mode(&self) -> DispatchMode {
        self.mode
    }

    /// Register a handler. Handlers for the same key run in subscription order.
    pub async fn subscribe(&self, key: EventKey, handler: Arc<dyn DomainEventHandler>) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        tracing::debug!(event_type = %key, handler = handler.name(), "Subscribed handler");
        self.subscriptions
            .write()
            .await
            .entry(key)
            .or_default()
            .push(Subscription { id, handler });
        id
    }

    /// Subscribe a closure returning a future.
    pub async fn subscribe_fn<F, Fut>(&self, key: EventKey, name: impl Into<String>, f: F) -> SubscriptionId
    where
        F: Fn(DomainEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), String>> + Send + 'static,
    {
        self.subscribe(key, Arc::new(FnHandler::new(name, f))).await
    }

    /// Returns false if the subscription was not found.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subs = self.subscriptions.write().await;
        for handlers in subs.values_mut() {
            if let Some(pos) = handlers.iter().position(|s| s.id == id) {
                handlers.remove(pos);
                return true;
            }
        }
        false
    }

    /// Handlers currently subscribed to `key`.
    pub async fn handler_count(&self, key: &EventKey) -> usize {
        self.subscriptions.read().await.get(key).map_or(0, Vec::len)
    }

    /// Deliver an event to every handler subscribed to its key.
    ///
    /// Malformed events are rejected with a validation error before any
    /// handler runs. Handler failures are reported, never returned as `Err`.
    pub async fn publish(&self, event: DomainEvent) -> CoherenceResult<DispatchReport> {
        event.validate()?;

        let key = event.key();
        let handlers: Vec<Subscription> = self
            .subscriptions
            .read()
            .await
            .get(&key)
            .cloned()
            .unwrap_or_default();

        let event = Arc::new(event);
        let outcomes = match self.mode {
            DispatchMode::Sequential => {
                let mut outcomes = Vec::with_capacity(handlers.len());
                for sub in &handlers {
                    let started = Instant::now();
                    let task = spawn_handler(Arc::clone(&sub.handler), Arc::clone(&event));
                    outcomes.push(self.await_handler(sub, task, started).await);
                }
                outcomes
            }
            DispatchMode::Concurrent => {
                let started = Instant::now();
                let tasks: Vec<_> = handlers
                    .iter()
                    .map(|sub| (sub, spawn_handler(Arc::clone(&sub.handler), Arc::clone(&event))))
                    .collect();
                join_all(tasks.into_iter().map(|(sub, task)| self.await_handler(sub, task, started))).await
            }
        };

        let report = DispatchReport {
            event_id: event.id,
            event_type: key.to_string(),
            outcomes,
        };

        if report.all_succeeded() {
            tracing::debug!(
                event_type = %report.event_type,
                entity_id = %event.entity_id,
                handlers = report.handler_count(),
                "Published domain event"
            );
        }

        Ok(report)
    }

    async fn await_handler(
        &self,
        sub: &Subscription,
        mut task: JoinHandle<Result<(), String>>,
        started: Instant,
    ) -> HandlerOutcome {
        let name = sub.handler.name().to_string();
        let status = match tokio::time::timeout(self.handler_timeout, &mut task).await {
            Ok(Ok(Ok(()))) => HandlerStatus::Succeeded,
            Ok(Ok(Err(e))) => {
                tracing::warn!(handler = %name, error = %e, "Event handler failed");
                HandlerStatus::Failed(e)
            }
            Ok(Err(join_err)) => {
                tracing::warn!(handler = %name, error = %join_err, "Event handler panicked");
                HandlerStatus::Panicked(join_err.to_string())
            }
            Err(_) => {
                task.abort();
                tracing::warn!(
                    handler = %name,
                    timeout_ms = u64::try_from(self.handler_timeout.as_millis()).unwrap_or(u64::MAX),
                    "Event handler timed out"
                );
                HandlerStatus::TimedOut
            }
        };

        HandlerOutcome {
            subscription: sub.id,
            handler: name,
            status,
            elapsed: started.elapsed(),
        }
    }
}

fn spawn_handler(handler: Arc<dyn DomainEventHandler>, event: Arc<DomainEvent>) -> JoinHandle<Result<(), String>> {
    tokio::spawn(async move { handler.handle(&event).await })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::Operation;
    use std::sync::Mutex;

    fn dispatcher(mode: DispatchMode, timeout_ms: u64) -> DomainEventDispatcher {
        DomainEventDispatcher::new(&DispatcherConfig { handler_timeout_ms: timeout_ms, mode })
    }

    fn user_update() -> EventKey {
        EventKey::new("user", Operation::Update)
    }

    fn recorder(log: &Arc<Mutex<Vec<String>>>, tag: &'static str) -> impl Fn(DomainEvent) -> futures::future::Ready<Result<(), String>> {
        let log = Arc::clone(log);
        move |e: DomainEvent| {
            log.lock().unwrap().push(format!("{tag}:{}", e.entity_id));
            futures::future::ready(Ok(()))
        }
    }

    async fn panicking(_: DomainEvent) -> Result<(), String> {
        panic!("handler panic")
    }

    #[tokio::test]
    async fn test_handlers_run_in_subscription_order() {
        let d = dispatcher(DispatchMode::Sequential, 1000);
        let log = Arc::new(Mutex::new(Vec::new()));
        d.subscribe_fn(user_update(), "first", recorder(&log, "a")).await;
        d.subscribe_fn(user_update(), "second", recorder(&log, "b")).await;
        d.subscribe_fn(EventKey::new("user", Operation::Delete), "other", recorder(&log, "x")).await;

        let report = d.publish(DomainEvent::new("user", "U1", Operation::Update)).await.unwrap();

        assert!(report.all_succeeded());
        assert_eq!(report.handler_count(), 2);
        assert_eq!(*log.lock().unwrap(), vec!["a:U1", "b:U1"]);
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let d = dispatcher(DispatchMode::Sequential, 50);
        let log = Arc::new(Mutex::new(Vec::new()));

        d.subscribe_fn(user_update(), "errors", |_| async { Err::<(), String>("boom".to_string()) }).await;
        d.subscribe_fn(user_update(), "panics", panicking).await;
        d.subscribe_fn(user_update(), "hangs", |_| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<(), String>(())
        })
        .await;
        d.subscribe_fn(user_update(), "ok", recorder(&log, "ok")).await;

        let report = d.publish(DomainEvent::new("user", "U1", Operation::Update)).await.unwrap();
        let statuses: Vec<_> = report.outcomes.iter().map(|o| o.status.clone()).collect();

        assert_eq!(statuses[0], HandlerStatus::Failed("boom".into()));
        assert!(matches!(statuses[1], HandlerStatus::Panicked(_)));
        assert_eq!(statuses[2], HandlerStatus::TimedOut);
        assert_eq!(statuses[3], HandlerStatus::Succeeded);
        assert_eq!(report.failures().count(), 3);
        assert_eq!(*log.lock().unwrap(), vec!["ok:U1"]);
    }

    #[tokio::test]
    async fn test_concurrent_mode_bounds_total_latency() {
        let d = dispatcher(DispatchMode::Concurrent, 1000);
        for i in 0..4 {
            d.subscribe_fn(user_update(), format!("slow-{i}"), |_| async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok::<(), String>(())
            })
            .await;
        }

        let started = Instant::now();
        let report = d.publish(DomainEvent::new("user", "U1", Operation::Update)).await.unwrap();

        assert!(report.all_succeeded());
        assert!(started.elapsed() < Duration::from_millis(350));
        let names: Vec<_> = report.outcomes.iter().map(|o| o.handler.as_str()).collect();
        assert_eq!(names, vec!["slow-0", "slow-1", "slow-2", "slow-3"]);
    }

    #[tokio::test]
    async fn test_malformed_event_rejected_before_handlers() {
        let d = dispatcher(DispatchMode::Sequential, 1000);
        let log = Arc::new(Mutex::new(Vec::new()));
        d.subscribe_fn(user_update(), "h", recorder(&log, "h")).await;

        let err = d.publish(DomainEvent::new("user", "", Operation::Update)).await.unwrap_err();
        assert!(matches!(err, crate::domain::errors::CoherenceError::Validation(_)));
        assert!(d.publish(DomainEvent::new("user", "U*", Operation::Update)).await.is_err());
        assert!(log.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unsubscribe_and_no_subscribers() {
        let d = dispatcher(DispatchMode::Sequential, 1000);
        let log = Arc::new(Mutex::new(Vec::new()));
        let id = d.subscribe_fn(user_update(), "h", recorder(&log, "h")).await;
        assert_eq!(d.handler_count(&user_update()).await, 1);

        assert!(d.unsubscribe(id).await);
        assert!(!d.unsubscribe(id).await);

        let report = d.publish(DomainEvent::new("user", "U1", Operation::Update)).await.unwrap();
        assert_eq!(report.handler_count(), 0);
        assert!(log.lock().unwrap().is_empty());
    }
}
