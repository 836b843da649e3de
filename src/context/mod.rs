//! Context Manager (spec §4.4).

pub mod budget;
mod pipeline;
mod sentinel;

pub use pipeline::{CompressionOutcome, ContextManager};
