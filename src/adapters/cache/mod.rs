//! Cache tier adapters.
//!
//! Uses `moka` for concurrent in-process caching with per-entry TTLs.

pub mod moka_cache_store;

pub use moka_cache_store::MokaCacheStore;
