//! The operator trait and the contexts handed to its callbacks.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::array::Buffer;
use crate::error::{LazyflowError, Result};
use crate::meta::Meta;
use crate::roi::Roi;
use crate::value::Value;

use super::engine::GraphContext;
use super::node::{OperatorHandle, OperatorNode};
use super::slot::Slot;

/// Position of an input slot in an operator's [`Operator::inputs`] list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InputId(pub usize);

/// Position of an output slot in an operator's [`Operator::outputs`] list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OutputId(pub usize);

/// Whether a slot carries N-d array data or a single parameter value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    /// Region-addressable array data.
    Array,
    /// A whole value (flag, shape, number, block list, ...).
    Value,
}

impl fmt::Display for SlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotKind::Array => f.write_str("array"),
            SlotKind::Value => f.write_str("value"),
        }
    }
}

/// Declaration of one slot: name, kind, optionality and default.
#[derive(Debug, Clone)]
pub struct SlotSpec {
    /// Slot name, unique within its operator side.
    pub name: &'static str,
    /// Array or value slot.
    pub kind: SlotKind,
    /// Optional inputs do not block configuration.
    pub optional: bool,
    /// Value the slot holds until connected or set.
    pub default: Option<Value>,
}

impl SlotSpec {
    /// A required array slot.
    pub fn array(name: &'static str) -> Self {
        Self {
            name,
            kind: SlotKind::Array,
            optional: false,
            default: None,
        }
    }

    /// A required value slot.
    pub fn value(name: &'static str) -> Self {
        Self {
            name,
            kind: SlotKind::Value,
            optional: false,
            default: None,
        }
    }

    /// Mark optional.
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Give a default value.
    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }
}

/// How dirtiness of one input maps onto the operator's outputs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DirtyPropagation {
    /// Outputs are dirty over the same region.
    Identity,
    /// Outputs are dirty everywhere.
    WholeOutput,
    /// Outputs are dirty over the region grown by a per-axis margin.
    Halo(Vec<usize>),
    /// The input does not influence the outputs.
    Ignore,
}

/// Blanket helper giving every operator `Any`-style downcasting.
pub trait AsAny {
    /// `self` as `&dyn Any`.
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A node of the dataflow graph.
///
/// Implementations declare their slots, derive output metadata in
/// [`setup_outputs`](Self::setup_outputs) and compute output regions in
/// [`execute`](Self::execute). `execute` may run concurrently on several
/// threads; `setup_outputs` runs exclusively and waits for in-flight
/// executes to drain.
pub trait Operator: AsAny + Send + Sync + 'static {
    /// Operator class name, used in slot names and logs.
    fn name(&self) -> &'static str;

    /// Input slot declarations.
    fn inputs(&self) -> Vec<SlotSpec>;

    /// Output slot declarations.
    fn outputs(&self) -> Vec<SlotSpec>;

    /// Called once after the slots exist. Composite operators create their
    /// children and wire them to their own slots here.
    fn init(&mut self, _ctx: &OperatorContext<'_>) -> Result<()> {
        Ok(())
    }

    /// Derive output metadata from input metadata. Runs whenever an input
    /// changes and all required inputs are ready.
    fn setup_outputs(&mut self, ctx: &mut SetupContext<'_>) -> Result<()>;

    /// Fill `result` with the data of `output` over `roi`. Array results
    /// arrive zero-filled with `roi`'s shape.
    fn execute(
        &self,
        ctx: &OperatorContext<'_>,
        output: OutputId,
        roi: &Roi,
        result: &mut Value,
    ) -> Result<()>;

    /// Dirty mapping for `input`, consulted by the default
    /// [`propagate_dirty`](Self::propagate_dirty).
    fn dirty_propagation(&self, _input: InputId) -> DirtyPropagation {
        DirtyPropagation::Identity
    }

    /// React to `input` becoming dirty over `roi`, usually by dirtying
    /// outputs.
    fn propagate_dirty(&self, ctx: &OperatorContext<'_>, input: InputId, roi: &Roi) {
        propagate_by_rule(&self.dirty_propagation(input), ctx, roi);
    }

    /// Accept data written into `input` over `roi`.
    fn set_in_slot(
        &self,
        _ctx: &OperatorContext<'_>,
        _input: InputId,
        _roi: &Roi,
        _value: &Value,
    ) -> Result<()> {
        Err(LazyflowError::unsupported(self.name(), "writing into slots"))
    }

    /// Release resources when the operator is removed from the graph.
    fn teardown(&mut self) {}
}

/// Apply `rule` to every computed (non-forwarded) output of the operator.
pub fn propagate_by_rule(rule: &DirtyPropagation, ctx: &OperatorContext<'_>, roi: &Roi) {
    if *rule == DirtyPropagation::Ignore {
        return;
    }
    for output in ctx.computed_outputs() {
        let Some(meta) = output.meta() else {
            continue;
        };
        let full = meta.full_roi();
        let same_rank = roi.ndim() == meta.shape.len();
        let dirty = match rule {
            DirtyPropagation::Identity if same_rank => roi.intersect(&full),
            DirtyPropagation::Halo(halo) if same_rank && halo.len() == roi.ndim() => {
                roi.extend_by_halo(halo, &meta.shape)
            }
            _ => full,
        };
        output.set_dirty(&dirty);
    }
}

/// Access to an operator's slots and graph from inside its callbacks.
pub struct OperatorContext<'a> {
    node: &'a Arc<OperatorNode>,
}

impl<'a> OperatorContext<'a> {
    pub(crate) fn new(node: &'a Arc<OperatorNode>) -> Self {
        Self { node }
    }

    /// Name of the operator.
    pub fn name(&self) -> &str {
        self.node.name()
    }

    /// Input slot `id`.
    pub fn input(&self, id: InputId) -> &'a Slot {
        self.node.input_slot(id)
    }

    /// Output slot `id`.
    pub fn output(&self, id: OutputId) -> &'a Slot {
        self.node.output_slot(id)
    }

    /// Outputs computed by this operator (forwarded outputs excluded).
    pub fn computed_outputs(&self) -> impl Iterator<Item = &'a Slot> {
        self.node.outputs().iter().filter(|s| s.upstream().is_none())
    }

    /// Graph-wide services (pool, memory manager, configuration).
    pub fn context(&self) -> &'a Arc<GraphContext> {
        self.node.context()
    }

    /// Handle to this operator.
    pub fn handle(&self) -> OperatorHandle {
        OperatorHandle::from_node(Arc::clone(self.node))
    }

    /// Create a child operator owned by this one.
    pub fn add_child(&self, op: impl Operator) -> Result<OperatorHandle> {
        self.node.add_child(Box::new(op))
    }

    /// Read `roi` of an array input and wait for the data.
    pub fn read(&self, id: InputId, roi: &Roi) -> Result<Buffer> {
        self.input(id).get(roi)?.wait()?.into_buffer()
    }

    /// Read the whole value of an input.
    pub fn input_value(&self, id: InputId) -> Result<Value> {
        self.input(id).value()
    }

    /// Fail with [`LazyflowError::Cancelled`] if the request being served was
    /// cancelled.
    pub fn check_cancelled(&self) -> Result<()> {
        crate::request::check_cancelled()
    }
}

/// Context for [`Operator::setup_outputs`]: read inputs, stage output
/// metadata. Staged metadata is committed after `setup_outputs` returns;
/// outputs left unstaged become not ready.
pub struct SetupContext<'a> {
    node: &'a Arc<OperatorNode>,
    staged: Vec<Option<Meta>>,
}

impl<'a> SetupContext<'a> {
    pub(crate) fn new(node: &'a Arc<OperatorNode>) -> Self {
        Self {
            node,
            staged: vec![None; node.outputs().len()],
        }
    }

    pub(crate) fn into_staged(self) -> Vec<Option<Meta>> {
        self.staged
    }

    /// Name of the operator.
    pub fn name(&self) -> &str {
        self.node.name()
    }

    /// Input slot `id`.
    pub fn input(&self, id: InputId) -> &'a Slot {
        self.node.input_slot(id)
    }

    /// True if input `id` has metadata.
    pub fn input_ready(&self, id: InputId) -> bool {
        self.input(id).is_ready()
    }

    /// Metadata of input `id`.
    pub fn input_meta(&self, id: InputId) -> Result<Meta> {
        let slot = self.input(id);
        slot.meta()
            .ok_or_else(|| LazyflowError::not_ready(slot.qualified_name()))
    }

    /// Whole value of input `id`.
    pub fn input_value(&self, id: InputId) -> Result<Value> {
        self.input(id).value()
    }

    /// Whole value of an optional input, `None` if it is not ready.
    pub fn optional_value(&self, id: InputId) -> Result<Option<Value>> {
        if self.input_ready(id) {
            self.input_value(id).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Stage metadata for output `id`.
    pub fn set_output_meta(&mut self, id: OutputId, meta: Meta) {
        self.staged[id.0] = Some(meta);
    }

    /// Stage a copy of input `from`'s metadata on output `to`.
    pub fn copy_meta(&mut self, from: InputId, to: OutputId) -> Result<Meta> {
        let meta = self.input_meta(from)?;
        self.set_output_meta(to, meta.clone());
        Ok(meta)
    }

    /// Metadata output `id` had before this setup.
    pub fn current_output_meta(&self, id: OutputId) -> Option<Meta> {
        self.node.output_slot(id).meta()
    }

    /// Graph-wide services.
    pub fn context(&self) -> &'a Arc<GraphContext> {
        self.node.context()
    }
}
