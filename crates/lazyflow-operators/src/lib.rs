//! Lazyflow Operators - stock operators for the lazyflow dataflow engine
//!
//! Small operators built on lazyflow-core that exercise each part of the
//! operator contract:
//!
//! - [`OpArrayPiper`] - Identity pass-through
//! - [`OpConstant`] / [`OpArange`] - Parameter-driven sources
//! - [`OpSubRegion`] / [`OpChannelSelector`] - Geometry changes with
//!   remapped dirty regions
//! - [`OpBoxFilter`] - Halo-reading mean filter
//! - [`OpThreshold`] - Pointwise mask
//! - [`OpNormalize`] - Whole-input dependency (mean subtraction)
//! - [`OpCachedBoxFilter`] - Composite: box filter feeding a block cache
//! - [`OpLabelArray`] - Composite: sparse, writable label store
//!
//! [`label_io`] moves label blocks in and out of a graph as serde records.
//!
//! ## Example
//!
//! ```rust,ignore
//! use lazyflow_core::{Graph, GraphConfig};
//! use lazyflow_operators::{OpArange, OpCachedBoxFilter};
//!
//! let graph = Graph::new(GraphConfig::default());
//! let source = graph.add(OpArange::new())?;
//! source.input(OpArange::SHAPE).set_value(vec![512, 512])?;
//!
//! let smooth = graph.add(OpCachedBoxFilter::new())?;
//! smooth.input(OpCachedBoxFilter::INPUT).connect(source.output(OpArange::OUTPUT))?;
//! smooth.input(OpCachedBoxFilter::RADIUS).set_value(2i64)?;
//!
//! let tile = smooth.output(OpCachedBoxFilter::OUTPUT).get_slicing("[0:64,0:64]")?.wait()?;
//! ```

pub mod composite;
pub mod filter;
pub mod geometry;
pub mod label_io;
pub mod labels;
pub mod piper;
pub mod source;

// Re-export main types at crate root
pub use composite::OpCachedBoxFilter;
pub use filter::{OpBoxFilter, OpNormalize, OpThreshold};
pub use geometry::{OpChannelSelector, OpSubRegion};
pub use label_io::{StoredBlock, StoredValues, export_blocks, import_blocks};
pub use labels::OpLabelArray;
pub use piper::OpArrayPiper;
pub use source::{OpArange, OpConstant};
