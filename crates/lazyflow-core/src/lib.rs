//! Lazyflow Core - lazy dataflow engine for N-dimensional arrays
//!
//! A graph of stateful operators connected by typed slots. Outputs are
//! computed on demand over arbitrary regions of interest, cached in blocks
//! and invalidated incrementally as upstream data or parameters change.
//!
//! # Core Abstractions
//!
//! ## Regions
//!
//! - [`Roi`] - Half-open N-d box with intersection, halo and block algebra
//! - [`intersecting_blocks`] / [`block_roi`] - Block decomposition of a ROI
//!
//! ## Data
//!
//! - [`Buffer`] - dtype-tagged N-d array over `ndarray::ArcArray`
//! - [`Value`] - What a slot carries: an array or a parameter
//! - [`Meta`] - Shape, dtype, axis tags and block hints of a slot
//!
//! ## Graph
//!
//! - [`Operator`] - Trait implemented by every node
//! - [`Slot`] - Typed connection point; `get(roi)` returns a [`Request`]
//! - [`Graph`] - Owner of operators, worker pool and memory manager
//!
//! ## Requests
//!
//! - [`Request`] - Deferred computation with thread donation and
//!   reference-counted cancellation
//! - [`RequestBatch`] - Submit many, wait for all
//! - [`ThreadPool`] - Named worker threads fed by a channel
//!
//! ## Caches
//!
//! - [`OpBlockedArrayCache`] - Block cache with inner-block invalidation
//! - [`OpValueCache`] - Whole-value cache
//! - [`MemoryManager`] - LRU eviction against a byte budget
//!
//! # Example
//!
//! ```rust,ignore
//! use lazyflow_core::{Graph, GraphConfig, OpBlockedArrayCache};
//!
//! let graph = Graph::new(GraphConfig::default());
//! let cache = graph.add(OpBlockedArrayCache::new())?;
//! cache.input(OpBlockedArrayCache::INPUT).set_value(data)?;
//! cache.input(OpBlockedArrayCache::BLOCK_SHAPE).set_value(vec![64, 64])?;
//!
//! let tile = cache
//!     .output(OpBlockedArrayCache::OUTPUT)
//!     .get_slicing("[0:32,0:32]")?
//!     .wait()?;
//! ```
//!
//! # Design Principles
//!
//! - **Lazy**: metadata flows eagerly, data only when a request is waited on
//! - **Incremental**: dirty regions travel downstream and invalidate only
//!   what they overlap
//! - **Bounded**: a fixed worker pool; waiting threads run unstarted work

pub mod array;
pub mod cache;
pub mod error;
pub mod graph;
pub mod meta;
pub mod request;
pub mod roi;
pub mod value;

// Re-export main types at crate root
pub use array::{ArcArrayD, Buffer, DType, Element};
pub use cache::{CacheStats, MemoryManager, OpBlockedArrayCache, OpValueCache};
pub use error::{LazyflowError, Result};
pub use graph::{
    DirtyPropagation, Graph, GraphConfig, GraphContext, InputId, Operator, OperatorContext,
    OperatorHandle, OperatorState, OutputId, SetupContext, Slot, SlotKind, SlotSpec,
    propagate_by_rule,
};
pub use meta::{Axis, AxisTags, BlockHints, Meta};
pub use request::{Request, RequestBatch, RequestState, ThreadPool};
pub use roi::{BlockIndex, Roi, block_roi, determine_block_shape, intersecting_blocks};
pub use value::Value;
