//! Common test utilities for integration tests
//!
//! Provides shared fixtures and helpers used across multiple integration
//! test files.

use std::sync::Arc;
use std::time::Duration;

use coherence::adapters::cache::MokaCacheStore;
use coherence::adapters::memory::InMemoryAuthoritativeStore;
use coherence::domain::models::ConcurrencyConfig;
use coherence::domain::ports::CacheStore;
use coherence::services::ConcurrencyControlManager;
use serde_json::json;

/// Setup test logging
///
/// Initializes tracing subscriber for test output.
/// Call this at the beginning of tests that need logging.
#[allow(dead_code)]
pub fn setup_test_logging() {
    use tracing_subscriber::fmt;

    let _ = fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// Concurrency settings with millisecond backoff so retry tests stay fast.
#[allow(dead_code)]
pub fn fast_concurrency_config() -> ConcurrencyConfig {
    ConcurrencyConfig {
        max_retries: 3,
        backoff_base_ms: 1,
        backoff_max_ms: 10,
        jitter: 0.5,
        lock_ttl_ms: 30_000,
    }
}

#[allow(dead_code)]
pub fn memory_manager() -> (Arc<ConcurrencyControlManager>, Arc<InMemoryAuthoritativeStore>) {
    let store = Arc::new(InMemoryAuthoritativeStore::new());
    let manager = Arc::new(ConcurrencyControlManager::new(store.clone(), &fast_concurrency_config()));
    (manager, store)
}

/// A moka cache holding each key with a one-minute TTL.
#[allow(dead_code)]
pub async fn seeded_cache(keys: &[&str]) -> Arc<MokaCacheStore> {
    let cache = Arc::new(MokaCacheStore::default());
    for key in keys {
        cache
            .set(key, json!({ "key": key }), Duration::from_secs(60))
            .await
            .expect("seeding cache");
    }
    cache
}

/// Keys from `keys` that are still cached.
#[allow(dead_code)]
pub async fn present(cache: &MokaCacheStore, keys: &[&str]) -> Vec<String> {
    let mut out = Vec::new();
    for key in keys {
        if cache.get(key).await.expect("cache get").is_some() {
            out.push((*key).to_string());
        }
    }
    out
}
