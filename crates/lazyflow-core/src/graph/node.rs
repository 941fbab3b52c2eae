//! Operator instances in the graph.
//!
//! An [`OperatorNode`] owns one boxed [`Operator`] together with its slots,
//! its life-cycle state and its children. The operator sits behind a
//! read/write lock: executes and dirty propagation take shared (recursive)
//! read access, `setup_outputs` takes exclusive access. Reconfiguration
//! therefore waits for in-flight executes and blocks new ones until the new
//! output metadata is committed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::array::Buffer;
use crate::error::{LazyflowError, Result};
use crate::roi::Roi;
use crate::value::Value;

use super::engine::GraphContext;
use super::operator::{InputId, Operator, OperatorContext, OutputId, SetupContext};
use super::slot::{Slot, SlotDirection};

static NEXT_OPERATOR_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier of an operator instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperatorId(pub(crate) u64);

impl std::fmt::Display for OperatorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OperatorId({})", self.0)
    }
}

/// Life-cycle state of an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorState {
    /// Some required input is not ready, or setup failed.
    Unconfigured,
    /// `setup_outputs` is running.
    Configuring,
    /// Outputs have metadata and can be read.
    Ready,
    /// Removed from the graph.
    Closed,
}

/// One operator instance with its slots.
pub struct OperatorNode {
    id: OperatorId,
    name: &'static str,
    context: Arc<GraphContext>,
    parent: Weak<OperatorNode>,
    inputs: Vec<Slot>,
    outputs: Vec<Slot>,
    op: RwLock<Box<dyn Operator>>,
    state: Mutex<OperatorState>,
    children: Mutex<Vec<OperatorHandle>>,
}

impl OperatorNode {
    /// Build the node, apply slot defaults, run `init` and a first
    /// configuration attempt.
    pub(crate) fn create(
        context: Arc<GraphContext>,
        parent: Weak<OperatorNode>,
        op: Box<dyn Operator>,
    ) -> Result<OperatorHandle> {
        let name = op.name();
        let input_specs = op.inputs();
        let output_specs = op.outputs();
        let id = OperatorId(NEXT_OPERATOR_ID.fetch_add(1, Ordering::Relaxed));
        let node = Arc::new_cyclic(|weak: &Weak<OperatorNode>| OperatorNode {
            id,
            name,
            context,
            parent,
            inputs: input_specs
                .into_iter()
                .enumerate()
                .map(|(i, spec)| Slot::new(spec, SlotDirection::Input, i, name, weak.clone()))
                .collect(),
            outputs: output_specs
                .into_iter()
                .enumerate()
                .map(|(i, spec)| Slot::new(spec, SlotDirection::Output, i, name, weak.clone()))
                .collect(),
            op: RwLock::new(op),
            state: Mutex::new(OperatorState::Unconfigured),
            children: Mutex::new(Vec::new()),
        });
        tracing::debug!("operator_add: {name} ({id})");

        {
            let ctx = OperatorContext::new(&node);
            node.op.write().init(&ctx)?;
        }
        node.configure();
        Ok(OperatorHandle(node))
    }

    pub(crate) fn add_child(self: &Arc<Self>, op: Box<dyn Operator>) -> Result<OperatorHandle> {
        let child = OperatorNode::create(Arc::clone(&self.context), Arc::downgrade(self), op)?;
        self.children.lock().push(child.clone());
        Ok(child)
    }

    /// Operator class name.
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn context(&self) -> &Arc<GraphContext> {
        &self.context
    }

    pub(crate) fn input_slot(&self, id: InputId) -> &Slot {
        &self.inputs[id.0]
    }

    pub(crate) fn output_slot(&self, id: OutputId) -> &Slot {
        &self.outputs[id.0]
    }

    pub(crate) fn outputs(&self) -> &[Slot] {
        &self.outputs
    }

    fn state(&self) -> OperatorState {
        *self.state.lock()
    }

    /// Run `setup_outputs` if every required input is ready; otherwise mark
    /// the operator unconfigured and clear its computed outputs.
    pub(crate) fn configure(self: &Arc<Self>) {
        if self.state() == OperatorState::Closed {
            return;
        }
        let ready = self.inputs.iter().all(|s| s.is_ready() || s.spec().optional);
        if !ready {
            let previous = std::mem::replace(&mut *self.state.lock(), OperatorState::Unconfigured);
            if previous == OperatorState::Ready {
                tracing::debug!("operator_unconfigured: {} ({})", self.name, self.id);
            }
            self.clear_outputs();
            return;
        }

        *self.state.lock() = OperatorState::Configuring;
        let mut setup = SetupContext::new(self);
        let result = self.op.write().setup_outputs(&mut setup);
        let staged = setup.into_staged();
        let result = result.and_then(|()| {
            for (slot, meta) in self.outputs.iter().zip(&staged) {
                if let Some(meta) = meta.as_ref().filter(|m| m.is_array()) {
                    meta.validate(&slot.qualified_name())?;
                }
            }
            Ok(())
        });

        match result {
            Ok(()) => {
                {
                    let mut state = self.state.lock();
                    if *state == OperatorState::Closed {
                        return;
                    }
                    *state = OperatorState::Ready;
                }
                tracing::debug!("operator_configured: {} ({})", self.name, self.id);
                for (slot, meta) in self.outputs.iter().zip(staged) {
                    if slot.upstream().is_none() {
                        slot.set_meta(meta);
                    }
                }
            }
            Err(err) => {
                tracing::warn!("setup_outputs failed for {} ({}): {err}", self.name, self.id);
                *self.state.lock() = OperatorState::Unconfigured;
                self.clear_outputs();
            }
        }
    }

    fn clear_outputs(&self) {
        for slot in &self.outputs {
            if slot.upstream().is_none() && slot.is_ready() {
                slot.set_meta(None);
            }
        }
    }

    /// Compute `roi` of output `index`.
    pub(crate) fn execute_output(self: &Arc<Self>, index: usize, roi: &Roi) -> Result<Value> {
        let op = self.op.read_recursive();
        let slot = &self.outputs[index];
        match self.state() {
            OperatorState::Closed => return Err(LazyflowError::Closed(self.name.to_string())),
            OperatorState::Unconfigured => {
                return Err(LazyflowError::not_ready(slot.qualified_name()));
            }
            OperatorState::Configuring | OperatorState::Ready => {}
        }
        let meta = slot
            .meta()
            .ok_or_else(|| LazyflowError::not_ready(slot.qualified_name()))?;
        let mut result = if meta.is_array() {
            meta.check_roi(roi)?;
            Value::Array(Buffer::zeros(meta.dtype, &roi.shape())?)
        } else {
            Value::Empty
        };

        let ctx = OperatorContext::new(self);
        op.execute(&ctx, OutputId(index), roi, &mut result)?;

        if meta.is_array() {
            let buffer = result.as_buffer()?;
            if buffer.shape() != roi.shape().as_slice() || buffer.dtype() != meta.dtype {
                return Err(LazyflowError::computation(
                    self.name,
                    format!(
                        "{} produced {} data of shape {:?} for {roi}, expected {}",
                        slot.qualified_name(),
                        buffer.dtype(),
                        buffer.shape(),
                        meta.dtype
                    ),
                ));
            }
        }
        Ok(result)
    }

    pub(crate) fn propagate_dirty(self: &Arc<Self>, index: usize, roi: &Roi) {
        if self.state() != OperatorState::Ready {
            return;
        }
        let op = self.op.read_recursive();
        let ctx = OperatorContext::new(self);
        op.propagate_dirty(&ctx, InputId(index), roi);
    }

    pub(crate) fn set_in_slot(self: &Arc<Self>, index: usize, roi: &Roi, value: &Value) -> Result<()> {
        match self.state() {
            OperatorState::Ready => {}
            OperatorState::Closed => return Err(LazyflowError::Closed(self.name.to_string())),
            _ => return Err(LazyflowError::not_ready(self.inputs[index].qualified_name())),
        }
        let op = self.op.read_recursive();
        let ctx = OperatorContext::new(self);
        op.set_in_slot(&ctx, InputId(index), roi, value)
    }

    /// Tear down: close children, disconnect every slot, release resources.
    pub(crate) fn close(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            if *state == OperatorState::Closed {
                return;
            }
            *state = OperatorState::Closed;
        }
        let children = std::mem::take(&mut *self.children.lock());
        for child in children.iter().rev() {
            child.0.close();
        }
        for input in &self.inputs {
            input.disconnect();
        }
        for output in &self.outputs {
            for partner in output.partners() {
                partner.disconnect();
            }
            output.disconnect();
            output.set_meta(None);
        }
        self.op.write().teardown();
        tracing::debug!("operator_closed: {} ({})", self.name, self.id);
    }
}

/// Shared handle to an operator in the graph.
#[derive(Clone)]
pub struct OperatorHandle(Arc<OperatorNode>);

impl PartialEq for OperatorHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for OperatorHandle {}

impl std::fmt::Debug for OperatorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperatorHandle")
            .field("id", &self.0.id)
            .field("name", &self.0.name)
            .field("state", &self.state())
            .finish()
    }
}

impl OperatorHandle {
    pub(crate) fn from_node(node: Arc<OperatorNode>) -> Self {
        Self(node)
    }

    pub(crate) fn node(&self) -> &Arc<OperatorNode> {
        &self.0
    }

    /// Unique id.
    pub fn id(&self) -> OperatorId {
        self.0.id
    }

    /// Operator class name.
    pub fn name(&self) -> &'static str {
        self.0.name
    }

    /// Life-cycle state.
    pub fn state(&self) -> OperatorState {
        self.0.state()
    }

    /// True once `setup_outputs` has succeeded for the current inputs.
    pub fn is_configured(&self) -> bool {
        self.state() == OperatorState::Ready
    }

    /// Input slot `id`.
    pub fn input(&self, id: InputId) -> &Slot {
        self.0.input_slot(id)
    }

    /// Output slot `id`.
    pub fn output(&self, id: OutputId) -> &Slot {
        self.0.output_slot(id)
    }

    /// All input slots.
    pub fn inputs(&self) -> &[Slot] {
        &self.0.inputs
    }

    /// All output slots.
    pub fn outputs(&self) -> &[Slot] {
        &self.0.outputs
    }

    /// Input slot by name.
    pub fn input_named(&self, name: &str) -> Option<&Slot> {
        self.0.inputs.iter().find(|s| s.name() == name)
    }

    /// Output slot by name.
    pub fn output_named(&self, name: &str) -> Option<&Slot> {
        self.0.outputs.iter().find(|s| s.name() == name)
    }

    /// Child operators (composites only).
    pub fn children(&self) -> Vec<OperatorHandle> {
        self.0.children.lock().clone()
    }

    /// Owning composite, if any.
    pub fn parent(&self) -> Option<OperatorHandle> {
        self.0.parent.upgrade().map(OperatorHandle)
    }

    /// Run `f` on the concrete operator if it is a `T`.
    ///
    /// Holds the operator's read lock while `f` runs.
    pub fn with_op<T: Operator, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        let guard = self.0.op.read_recursive();
        let op: &dyn Operator = &**guard;
        op.as_any().downcast_ref::<T>().map(f)
    }
}
