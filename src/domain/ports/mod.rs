//! Port trait definitions (Hexagonal Architecture)
//!
//! Async trait interfaces that infrastructure adapters implement:
//! - AuthoritativeStore: point, conditional and transactional writes to the source of truth
//! - CacheStore: keyed get/set/delete plus pattern bulk-delete on the cache tier

pub mod authoritative_store;
pub mod cache_store;

pub use authoritative_store::{
    AuthoritativeStore, Condition, Item, StoreError, StoreResult, TransactionItem, WriteEffect,
};
pub use cache_store::{CacheError, CacheResult, CacheStore};
