//! Domain layer for the cache coherence subsystem
//!
//! Core models, port traits and the error taxonomy shared by every service.

pub mod errors;
pub mod models;
pub mod ports;

pub use errors::{CoherenceError, CoherenceResult, ConflictKind};
