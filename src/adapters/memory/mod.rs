//! In-process adapters.

pub mod authoritative_store;

pub use authoritative_store::InMemoryAuthoritativeStore;
