//! Caches and memory accounting.
//!
//! - [`OpBlockedArrayCache`]: block-wise cache of array data with inner-block
//!   invalidation, single-flight fetches, freezing and writes.
//! - [`OpValueCache`]: whole-value cache for parameter slots.
//! - [`MemoryManager`]: budget enforcement across all caches of a graph.

mod blocked;
mod memory;
mod value;

pub use blocked::{CacheStats, OpBlockedArrayCache};
pub use memory::{EvictionCandidate, ManagedCache, MemoryManager, TARGET_FRACTION};
pub use value::OpValueCache;
