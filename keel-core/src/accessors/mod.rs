//! Accessor implementations

pub mod memory;

pub use memory::{CallCounts, MemoryAccessor, Operation};
