//! Port for the read-optimized cache tier.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::domain::models::KeyPattern;

/// Failures reported by a cache backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("Transient cache error: {0}")]
    Transient(String),

    #[error("Cache backend error: {0}")]
    Backend(String),
}

/// Result alias for cache calls.
pub type CacheResult<T> = Result<T, CacheError>;

/// Port for the read-optimized cache tier.
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> CacheResult<Option<Value>>;

    async fn set(&self, key: &str, value: Value, ttl: Duration) -> CacheResult<()>;

    /// Remove one key. Returns whether it was present; absence is not an error.
    async fn delete(&self, key: &str) -> CacheResult<bool>;

    /// Remove every key matching the pattern. Returns how many were removed.
    async fn delete_pattern(&self, pattern: &KeyPattern) -> CacheResult<u64>;
}
