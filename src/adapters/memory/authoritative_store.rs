//! In-memory AuthoritativeStore.
//!
//! A single `RwLock` guards the whole map, so a transaction evaluates all of
//! its conditions and applies all of its writes without any other operation
//! observing a partial state. Useful for tests and single-process setups.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::domain::ports::{
    AuthoritativeStore, Condition, Item, StoreError, StoreResult, TransactionItem, WriteEffect,
};

/// Authoritative store kept in a map. Conditional writes serialize on one lock.
#[derive(Default)]
pub struct InMemoryAuthoritativeStore {
    items: RwLock<HashMap<String, Item>>,
    injected_failures: AtomicU32,
}

impl InMemoryAuthoritativeStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` operations fail with a transient error.
    pub fn fail_next_transient(&self, n: u32) {
        self.injected_failures.store(n, Ordering::SeqCst);
    }

    /// Number of stored items, tombstones and lock records included.
    pub async fn len(&self) -> usize {
        self.items.read().await.len()
    }

    /// Whether the store holds no items.
    pub async fn is_empty(&self) -> bool {
        self.items.read().await.is_empty()
    }

    fn injected_failure(&self) -> StoreResult<()> {
        let consumed = self
            .injected_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match consumed {
            Ok(_) => Err(StoreError::Transient("injected failure".to_string())),
            Err(_) => Ok(()),
        }
    }

    async fn single(&self, item: TransactionItem) -> StoreResult<()> {
        self.transact(vec![item]).await.map_err(|e| match e {
            StoreError::TransactionCanceled { key, .. } => StoreError::ConditionFailed { key },
            other => other,
        })
    }
}

#[async_trait]
impl AuthoritativeStore for InMemoryAuthoritativeStore {
    async fn get(&self, key: &str) -> StoreResult<Option<Item>> {
        self.injected_failure()?;
        Ok(self.items.read().await.get(key).cloned())
    }

    async fn put(&self, key: &str, item: Item) -> StoreResult<()> {
        self.single(TransactionItem::put(key, item)).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.single(TransactionItem::delete(key)).await
    }

    async fn conditional_put(&self, key: &str, item: Item, condition: Condition) -> StoreResult<()> {
        self.single(TransactionItem::put(key, item).when(condition)).await
    }

    async fn conditional_delete(&self, key: &str, condition: Condition) -> StoreResult<()> {
        self.single(TransactionItem::delete(key).when(condition)).await
    }

    async fn transact(&self, items: Vec<TransactionItem>) -> StoreResult<()> {
        self.injected_failure()?;
        let mut map = self.items.write().await;

        // Evaluate everything first; nothing is written unless all conditions hold.
        let mut effects = Vec::with_capacity(items.len());
        for (idx, item) in items.iter().enumerate() {
            let current = map.get(item.key());
            if !item.is_satisfied(current) {
                return Err(StoreError::TransactionCanceled {
                    failed_index: idx,
                    key: item.key().to_string(),
                });
            }
            effects.push(item.apply(current));
        }

        for (item, effect) in items.iter().zip(effects) {
            match effect {
                WriteEffect::Write(next) => {
                    map.insert(item.key().to_string(), next);
                }
                WriteEffect::Remove => {
                    map.remove(item.key());
                }
                WriteEffect::Unchanged => {}
            }
        }
        Ok(())
    }
}
