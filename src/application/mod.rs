//! Application layer: the coherent write path and runtime wiring.

pub mod coherent_writer;
pub mod runtime;

pub use coherent_writer::{CoherentWriter, WriteChange, WriteOutcome, WriteRequest};
pub use runtime::CoherenceRuntime;
