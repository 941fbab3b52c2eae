//! Operator graph.
//!
//! Operators are nodes; slots are their typed connection points. A graph is
//! built by adding operators and connecting an input slot of one operator to
//! an output slot of another (or giving the input a value directly).
//!
//! # Architecture
//!
//! - [`Graph`] owns the top-level operators and the [`GraphContext`] (worker
//!   pool, memory manager, configuration) that every operator can reach.
//! - [`OperatorNode`] wraps one [`Operator`] implementation with its slots and
//!   life-cycle state. Composite operators own child nodes; ownership is a
//!   strict tree and children refer to their parent weakly.
//! - [`Slot`] carries metadata downstream eagerly (on every connect or value
//!   change) and data lazily (only when [`Slot::get`] is called and the
//!   returned [`Request`](crate::request::Request) is waited on).
//!
//! Two notifications travel the graph. *Metadata changes* travel downstream
//! and reconfigure each operator they reach. *Dirty regions* travel
//! downstream too, translated at every operator by
//! [`Operator::propagate_dirty`], and invalidate cached data on the way.
//!
//! # Example
//!
//! ```rust,ignore
//! use lazyflow_core::graph::{Graph, GraphConfig};
//!
//! let graph = Graph::new(GraphConfig::default());
//! let source = graph.add(OpArrayPiper::new())?;
//! let cache = graph.add(OpBlockedArrayCache::new())?;
//! source.input(OpArrayPiper::INPUT).set_value(data)?;
//! cache.input(OpBlockedArrayCache::INPUT).connect(source.output(OpArrayPiper::OUTPUT))?;
//! let block = cache.output(OpBlockedArrayCache::OUTPUT).get_slicing("[0:10,0:10]")?.wait()?;
//! ```

mod engine;
mod node;
mod operator;
mod slot;

pub use engine::{DEFAULT_BLOCK_BYTES, Graph, GraphConfig, GraphContext, default_threads};
pub use node::{OperatorHandle, OperatorId, OperatorNode, OperatorState};
pub use operator::{
    AsAny, DirtyPropagation, InputId, Operator, OperatorContext, OutputId, SetupContext,
    SlotKind, SlotSpec, propagate_by_rule,
};
pub use slot::{Slot, SlotDirection, SubscriptionId};
