//! Adapters for the cache tier and the authoritative store.

pub mod cache;
pub mod memory;
pub mod sqlite;
