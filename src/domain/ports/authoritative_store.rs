//! Port for the authoritative data store.
//!
//! The store is the source of truth. It offers point reads and writes,
//! conditional writes evaluated atomically against the current item, and
//! multi-item all-or-nothing commits. Keys are opaque strings and items are
//! flat JSON attribute maps.

use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

/// A stored record: attribute name to JSON value.
pub type Item = Map<String, Value>;

/// Errors reported by authoritative store adapters.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Condition failed for key {key}")]
    ConditionFailed { key: String },

    #[error("Transaction canceled: item {failed_index} ({key}) failed its condition")]
    TransactionCanceled { failed_index: usize, key: String },

    /// Throttling, lock contention or a dropped connection. Safe to retry.
    #[error("Transient store error: {0}")]
    Transient(String),

    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    /// Whether retrying may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

/// Result alias for authoritative store calls.
pub type StoreResult<T> = Result<T, StoreError>;

/// Write condition evaluated against the item currently stored under a key.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    ItemExists,
    ItemNotExists,
    AttributeEquals { name: String, value: Value },
    AttributeNotExists { name: String },
    /// Numeric attribute strictly below `value`. Missing or non-numeric fails.
    AttributeLessThan { name: String, value: i64 },
    /// Numeric attribute strictly above `value`. Missing or non-numeric fails.
    AttributeGreaterThan { name: String, value: i64 },
    Any(Vec<Condition>),
    All(Vec<Condition>),
}

impl Condition {
    /// Attribute present and equal to `value`.
    pub fn attribute_equals(name: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::AttributeEquals { name: name.into(), value: value.into() }
    }

    /// Numeric attribute strictly below `value`.
    pub fn attribute_less_than(name: impl Into<String>, value: i64) -> Self {
        Self::AttributeLessThan { name: name.into(), value }
    }

    /// Numeric attribute strictly above `value`.
    pub fn attribute_greater_than(name: impl Into<String>, value: i64) -> Self {
        Self::AttributeGreaterThan { name: name.into(), value }
    }

    /// Evaluate against the current item, `None` if absent.
    pub fn evaluate(&self, current: Option<&Item>) -> bool {
        match self {
            Self::ItemExists => current.is_some(),
            Self::ItemNotExists => current.is_none(),
            Self::AttributeEquals { name, value } => current.and_then(|i| i.get(name)) == Some(value),
            Self::AttributeNotExists { name } => current.is_none_or(|i| !i.contains_key(name)),
            Self::AttributeLessThan { name, value } => {
                numeric(current, name).is_some_and(|n| n < *value)
            }
            Self::AttributeGreaterThan { name, value } => {
                numeric(current, name).is_some_and(|n| n > *value)
            }
            Self::Any(conds) => conds.iter().any(|c| c.evaluate(current)),
            Self::All(conds) => conds.iter().all(|c| c.evaluate(current)),
        }
    }
}

fn numeric(current: Option<&Item>, name: &str) -> Option<i64> {
    current.and_then(|i| i.get(name)).and_then(Value::as_i64)
}

/// What applying a transaction item does to the stored item.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteEffect {
    Write(Item),
    Remove,
    Unchanged,
}

/// One operation inside an atomic commit.
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionItem {
    /// Replace the whole item.
    Put { key: String, item: Item, condition: Option<Condition> },
    /// Merge attributes into an existing item. Fails if the item is absent.
    Update { key: String, attributes: Item, condition: Option<Condition> },
    Delete { key: String, condition: Option<Condition> },
    /// Assert a condition without writing.
    ConditionCheck { key: String, condition: Condition },
}

impl TransactionItem {
    /// Replace the whole item.
    pub fn put(key: impl Into<String>, item: Item) -> Self {
        Self::Put { key: key.into(), item, condition: None }
    }

    /// Merge `attributes` into the existing item.
    pub fn update(key: impl Into<String>, attributes: Item) -> Self {
        Self::Update { key: key.into(), attributes, condition: None }
    }

    /// Remove the item.
    pub fn delete(key: impl Into<String>) -> Self {
        Self::Delete { key: key.into(), condition: None }
    }

    /// Assert `condition` without writing.
    pub fn check(key: impl Into<String>, condition: Condition) -> Self {
        Self::ConditionCheck { key: key.into(), condition }
    }

    /// Attach a condition. A condition check keeps its own.
    #[must_use]
    pub fn when(self, cond: Condition) -> Self {
        match self {
            Self::Put { key, item, .. } => Self::Put { key, item, condition: Some(cond) },
            Self::Update { key, attributes, .. } => Self::Update { key, attributes, condition: Some(cond) },
            Self::Delete { key, .. } => Self::Delete { key, condition: Some(cond) },
            check @ Self::ConditionCheck { .. } => check,
        }
    }

    /// Key this item touches.
    pub fn key(&self) -> &str {
        match self {
            Self::Put { key, .. }
            | Self::Update { key, .. }
            | Self::Delete { key, .. }
            | Self::ConditionCheck { key, .. } => key,
        }
    }

    /// Whether this item may be applied given the currently stored item.
    pub fn is_satisfied(&self, current: Option<&Item>) -> bool {
        let cond = match self {
            Self::Put { condition, .. } | Self::Delete { condition, .. } => condition.as_ref(),
            Self::Update { condition, .. } => {
                if current.is_none() {
                    return false;
                }
                condition.as_ref()
            }
            Self::ConditionCheck { condition, .. } => Some(condition),
        };
        cond.is_none_or(|c| c.evaluate(current))
    }

    /// The effect of applying this item on top of `current`.
    pub fn apply(&self, current: Option<&Item>) -> WriteEffect {
        match self {
            Self::Put { item, .. } => WriteEffect::Write(item.clone()),
            Self::Update { attributes, .. } => {
                let mut merged = current.cloned().unwrap_or_default();
                for (k, v) in attributes {
                    merged.insert(k.clone(), v.clone());
                }
                WriteEffect::Write(merged)
            }
            Self::Delete { .. } => WriteEffect::Remove,
            Self::ConditionCheck { .. } => WriteEffect::Unchanged,
        }
    }
}

/// Authoritative store operations the coherence subsystem depends on.
///
/// Conditional operations and `transact` must evaluate conditions and apply
/// writes atomically with respect to every other writer of the same keys.
#[async_trait]
pub trait AuthoritativeStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<Item>>;

    async fn put(&self, key: &str, item: Item) -> StoreResult<()>;

    /// Delete a key. Deleting an absent key is not an error.
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Put only if `condition` holds; otherwise `StoreError::ConditionFailed`.
    async fn conditional_put(&self, key: &str, item: Item, condition: Condition) -> StoreResult<()>;

    /// Delete only if `condition` holds; otherwise `StoreError::ConditionFailed`.
    async fn conditional_delete(&self, key: &str, condition: Condition) -> StoreResult<()>;

    /// Apply every item or none. The first failing item is reported as
    /// `StoreError::TransactionCanceled` with its index.
    async fn transact(&self, items: Vec<TransactionItem>) -> StoreResult<()>;
}
