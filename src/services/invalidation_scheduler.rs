//! Delayed invalidation scheduling.
//!
//! Pending invalidations are keyed by [`DedupeKey`]. Scheduling a key that is
//! already pending replaces its event and targets but keeps the earlier fire
//! time, so a burst of updates to one entity results in a single invalidation
//! no later than one delay after the first update.
//! Pending work lives in memory only and is lost on restart.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::time::Instant;

use super::invalidation_executor::{InvalidationExecutor, InvalidationReport};
use crate::domain::models::{DedupeKey, PendingInvalidation, ScheduleOutcome};

/// Owns delayed invalidations until they fire or are cancelled.
#[async_trait]
pub trait InvalidationScheduler: Send + Sync {
    /// Schedule, or reschedule if the dedupe key is already pending.
    async fn schedule(&self, pending: PendingInvalidation) -> ScheduleOutcome;

    /// Returns false if nothing was pending under this key.
    async fn cancel(&self, key: &DedupeKey) -> bool;

    /// Snapshot of pending work ordered by fire time.
    async fn pending(&self) -> Vec<PendingInvalidation>;
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Slot {
    fire_at: Instant,
    generation: u64,
    key: DedupeKey,
}

struct Entry {
    pending: PendingInvalidation,
    generation: u64,
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<Reverse<Slot>>,
    entries: HashMap<DedupeKey, Entry>,
    next_generation: u64,
}

impl QueueState {
    fn insert(&mut self, mut pending: PendingInvalidation) -> ScheduleOutcome {
        let key = pending.key.clone();

        // A reschedule refreshes the event and targets but never pushes the
        // fire time back, so steady updates cannot starve the invalidation.
        if let Some(existing) = self.entries.get_mut(&key) {
            if existing.pending.fire_at <= pending.fire_at {
                pending.fire_at = existing.pending.fire_at;
                pending.scheduled_at = existing.pending.scheduled_at;
                existing.pending = pending;
                return ScheduleOutcome::Rescheduled(key);
            }
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        self.heap.push(Reverse(Slot {
            fire_at: pending.fire_at,
            generation,
            key: key.clone(),
        }));
        // Superseded heap slots are skipped when popped.
        match self.entries.insert(key.clone(), Entry { pending, generation }) {
            Some(_) => ScheduleOutcome::Rescheduled(key),
            None => ScheduleOutcome::Scheduled(key),
        }
    }

    fn is_live(&self, slot: &Slot) -> bool {
        self.entries
            .get(&slot.key)
            .is_some_and(|e| e.generation == slot.generation)
    }

    fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse(slot)) = self.heap.peek() {
            if self.is_live(slot) {
                return Some(slot.fire_at);
            }
            self.heap.pop();
        }
        None
    }

    fn pop_due(&mut self, now: Instant) -> Vec<PendingInvalidation> {
        let mut due = Vec::new();
        while let Some(Reverse(slot)) = self.heap.peek() {
            if slot.fire_at > now {
                break;
            }
            let Some(Reverse(slot)) = self.heap.pop() else { break };
            if self.is_live(&slot) {
                if let Some(entry) = self.entries.remove(&slot.key) {
                    due.push(entry.pending);
                }
            }
        }
        due
    }

    fn take_all(&mut self) -> Vec<PendingInvalidation> {
        self.heap.clear();
        let mut all: Vec<_> = self.entries.drain().map(|(_, e)| e.pending).collect();
        all.sort_by_key(|p| p.fire_at);
        all
    }
}

struct Inner {
    state: Mutex<QueueState>,
    wakeup: Notify,
    running: AtomicBool,
    executor: InvalidationExecutor,
    reports: broadcast::Sender<InvalidationReport>,
}

/// In-process scheduler backed by a priority queue.
///
/// Cheap to clone; clones share the same queue. Delayed work fires from the
/// task returned by [`InProcessScheduler::start`], or on demand through
/// [`InProcessScheduler::flush_due`].
#[derive(Clone)]
pub struct InProcessScheduler {
    inner: Arc<Inner>,
}

impl InProcessScheduler {
    /// Create a stopped scheduler that fires through `executor`.
    pub fn new(executor: InvalidationExecutor) -> Self {
        let (reports, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::default()),
                wakeup: Notify::new(),
                running: AtomicBool::new(false),
                executor,
                reports,
            }),
        }
    }

    /// Receive a report for every delayed invalidation that fires.
    pub fn subscribe_reports(&self) -> broadcast::Receiver<InvalidationReport> {
        self.inner.reports.subscribe()
    }

    /// Start the firing loop. Returns a JoinHandle.
    ///
    /// Only one loop runs per queue: if it is already running, the returned
    /// handle completes immediately.
    pub fn start(&self) -> tokio::task::JoinHandle<()> {
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Invalidation scheduler already running");
            return tokio::spawn(async {});
        }
        let scheduler = self.clone();

        tokio::spawn(async move {
            while scheduler.is_running() {
                let deadline = scheduler.inner.state.lock().await.next_deadline();
                match deadline {
                    Some(at) => {
                        tokio::select! {
                            () = tokio::time::sleep_until(at) => {}
                            () = scheduler.inner.wakeup.notified() => {}
                        }
                    }
                    None => scheduler.inner.wakeup.notified().await,
                }

                if !scheduler.is_running() {
                    break;
                }
                scheduler.flush_due().await;
            }
            tracing::debug!("Invalidation scheduler stopped");
        })
    }

    /// Stop the firing loop. Pending work stays queued.
    pub fn shutdown(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.wakeup.notify_one();
    }

    /// Whether the firing loop has been started and not shut down.
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// Fire everything whose time has come.
    pub async fn flush_due(&self) -> Vec<InvalidationReport> {
        let due = self.inner.state.lock().await.pop_due(Instant::now());
        self.fire_all(due).await
    }

    /// Fire everything pending now, regardless of fire time.
    pub async fn drain(&self) -> Vec<InvalidationReport> {
        let all = self.inner.state.lock().await.take_all();
        self.fire_all(all).await
    }

    /// Number of pending invalidations.
    pub async fn pending_count(&self) -> usize {
        self.inner.state.lock().await.entries.len()
    }

    async fn fire_all(&self, batch: Vec<PendingInvalidation>) -> Vec<InvalidationReport> {
        let mut reports = Vec::with_capacity(batch.len());
        for pending in batch {
            reports.push(self.fire(pending).await);
        }
        reports
    }

    async fn fire(&self, pending: PendingInvalidation) -> InvalidationReport {
        let mut report = InvalidationReport::for_event(&pending.event);
        report.rules_applied.push(pending.rule.clone());
        self.inner
            .executor
            .execute(&pending.rule, &pending.targets, &mut report)
            .await;

        tracing::debug!(
            key = %pending.key,
            removed = report.keys_removed(),
            failures = report.failures.len(),
            "Fired delayed invalidation"
        );

        // No receivers is fine.
        let _ = self.inner.reports.send(report.clone());
        report
    }
}

#[async_trait]
impl InvalidationScheduler for InProcessScheduler {
    async fn schedule(&self, pending: PendingInvalidation) -> ScheduleOutcome {
        let outcome = self.inner.state.lock().await.insert(pending);
        if matches!(outcome, ScheduleOutcome::Rescheduled(_)) {
            tracing::debug!(key = %outcome.key(), "Rescheduled pending invalidation");
        }
        self.inner.wakeup.notify_one();
        outcome
    }

    async fn cancel(&self, key: &DedupeKey) -> bool {
        let removed = self.inner.state.lock().await.entries.remove(key).is_some();
        if removed {
            tracing::debug!(key = %key, "Cancelled pending invalidation");
            self.inner.wakeup.notify_one();
        }
        removed
    }

    async fn pending(&self) -> Vec<PendingInvalidation> {
        let state = self.inner.state.lock().await;
        let mut all: Vec<_> = state.entries.values().map(|e| e.pending.clone()).collect();
        all.sort_by_key(|p| p.fire_at);
        all
    }
}
