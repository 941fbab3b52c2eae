//! Typed connection points between operators.
//!
//! A [`Slot`] is either an input or an output of one operator. Its source is
//! one of three things: nothing, a connection to an upstream slot, or a value
//! set directly on it. Output slots with no source are computed by their
//! operator.
//!
//! Connections are recorded in both directions: the downstream slot owns a
//! strong handle to its upstream, the upstream keeps weak handles to its
//! downstream partners. Metadata, dirtiness and writes flow along these
//! links.
//!
//! # Change cascade
//!
//! `connect`, `set_value` and `disconnect` recompute the slot's metadata,
//! push it to every downstream partner and, for inputs, reconfigure the owning
//! operator. The cascade always runs, even when metadata is unchanged:
//! parameter slots share one opaque metadata, so a new threshold or block
//! shape is only visible to `setup_outputs` through the cascade. A new source
//! is then announced with a full-range dirty notification.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::array::Buffer;
use crate::error::{LazyflowError, Result};
use crate::meta::Meta;
use crate::request::Request;
use crate::roi::Roi;
use crate::value::Value;

use super::node::{OperatorHandle, OperatorNode};
use super::operator::{SlotKind, SlotSpec};

/// Input or output side of an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotDirection {
    /// Consumes data.
    Input,
    /// Produces data.
    Output,
}

/// Token returned by the `notify_*` registrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type SlotCallback = Arc<dyn Fn(&Slot) + Send + Sync>;
type DirtyCallback = Arc<dyn Fn(&Slot, &Roi) + Send + Sync>;

#[derive(Default)]
struct Listeners {
    next_id: u64,
    meta_changed: Vec<(u64, SlotCallback)>,
    ready: Vec<(u64, SlotCallback)>,
    unready: Vec<(u64, SlotCallback)>,
    dirty: Vec<(u64, DirtyCallback)>,
}

enum Source {
    Unconnected,
    Connected(Slot),
    Value { value: Value, is_default: bool },
}

struct SlotState {
    source: Source,
    meta: Option<Meta>,
    partners: Vec<Weak<SlotInner>>,
}

struct SlotInner {
    spec: SlotSpec,
    direction: SlotDirection,
    index: usize,
    operator_name: String,
    operator: Weak<OperatorNode>,
    state: RwLock<SlotState>,
    listeners: Mutex<Listeners>,
}

/// Handle to an input or output slot. Cloning yields another handle to the
/// same slot.
#[derive(Clone)]
pub struct Slot {
    inner: Arc<SlotInner>,
}

impl PartialEq for Slot {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Slot {}

impl fmt::Debug for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slot")
            .field("name", &self.qualified_name())
            .field("direction", &self.inner.direction)
            .field("ready", &self.is_ready())
            .finish()
    }
}

fn meta_for(kind: SlotKind, value: &Value) -> Meta {
    match (kind, value) {
        (SlotKind::Array, Value::Array(buffer)) => Meta::for_buffer(buffer),
        _ => Meta::opaque(),
    }
}

impl Slot {
    pub(crate) fn new(
        spec: SlotSpec,
        direction: SlotDirection,
        index: usize,
        operator_name: &str,
        operator: Weak<OperatorNode>,
    ) -> Self {
        let (source, meta) = match &spec.default {
            Some(value) if direction == SlotDirection::Input => (
                Source::Value {
                    value: value.clone(),
                    is_default: true,
                },
                Some(meta_for(spec.kind, value)),
            ),
            _ => (Source::Unconnected, None),
        };
        Self {
            inner: Arc::new(SlotInner {
                spec,
                direction,
                index,
                operator_name: operator_name.to_string(),
                operator,
                state: RwLock::new(SlotState {
                    source,
                    meta,
                    partners: Vec::new(),
                }),
                listeners: Mutex::new(Listeners::default()),
            }),
        }
    }

    fn from_inner(inner: Arc<SlotInner>) -> Self {
        Self { inner }
    }

    // --- identity ---

    /// Slot name.
    pub fn name(&self) -> &'static str {
        self.inner.spec.name
    }

    /// `Operator.Slot`, for messages.
    pub fn qualified_name(&self) -> String {
        format!("{}.{}", self.inner.operator_name, self.inner.spec.name)
    }

    /// Declaration this slot was created from.
    pub fn spec(&self) -> &SlotSpec {
        &self.inner.spec
    }

    /// Array or value slot.
    pub fn kind(&self) -> SlotKind {
        self.inner.spec.kind
    }

    /// Input or output.
    pub fn direction(&self) -> SlotDirection {
        self.inner.direction
    }

    /// Position in the operator's slot list.
    pub fn index(&self) -> usize {
        self.inner.index
    }

    /// The owning operator, if it still exists.
    pub fn operator(&self) -> Option<OperatorHandle> {
        self.inner.operator.upgrade().map(OperatorHandle::from_node)
    }

    // --- state ---

    /// Current metadata.
    pub fn meta(&self) -> Option<Meta> {
        self.inner.state.read().meta.clone()
    }

    /// True once the slot has metadata.
    pub fn is_ready(&self) -> bool {
        self.inner.state.read().meta.is_some()
    }

    /// The slot this one is connected to.
    pub fn upstream(&self) -> Option<Slot> {
        match &self.inner.state.read().source {
            Source::Connected(up) => Some(up.clone()),
            _ => None,
        }
    }

    /// True if the slot holds a value (set or default).
    pub fn has_value(&self) -> bool {
        matches!(self.inner.state.read().source, Source::Value { .. })
    }

    /// Live downstream slots connected to this one.
    pub fn partners(&self) -> Vec<Slot> {
        self.inner
            .state
            .read()
            .partners
            .iter()
            .filter_map(Weak::upgrade)
            .map(Slot::from_inner)
            .collect()
    }

    // --- wiring ---

    /// Connect this slot to `upstream`, replacing any previous connection or
    /// default value.
    pub fn connect(&self, upstream: &Slot) -> Result<()> {
        if self == upstream {
            return Err(LazyflowError::incompatible(
                self.qualified_name(),
                "cannot connect a slot to itself",
            ));
        }
        if self.direction() == SlotDirection::Output && upstream.direction() == SlotDirection::Input
        {
            return Err(LazyflowError::incompatible(
                self.qualified_name(),
                format!("an output cannot read from input {}", upstream.qualified_name()),
            ));
        }
        if self.kind() != upstream.kind() {
            return Err(LazyflowError::incompatible(
                self.qualified_name(),
                format!(
                    "cannot connect {} slot to {} slot {}",
                    self.kind(),
                    upstream.kind(),
                    upstream.qualified_name()
                ),
            ));
        }
        match &self.inner.state.read().source {
            Source::Value {
                is_default: false, ..
            } => {
                return Err(LazyflowError::incompatible(
                    self.qualified_name(),
                    "holds a value; disconnect it before connecting",
                ));
            }
            Source::Connected(current) if current == upstream => return Ok(()),
            _ => {}
        }
        if self.reaches(upstream) {
            return Err(LazyflowError::CycleDetected);
        }

        self.detach_upstream();
        self.inner.state.write().source = Source::Connected(upstream.clone());
        upstream
            .inner
            .state
            .write()
            .partners
            .push(Arc::downgrade(&self.inner));
        tracing::debug!(
            "slot_connect: {} → {}",
            upstream.qualified_name(),
            self.qualified_name()
        );
        self.refresh();
        self.set_dirty_all();
        Ok(())
    }

    /// Give the slot a fixed value. Fails if the slot is connected.
    pub fn set_value(&self, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        if self.direction() == SlotDirection::Output {
            return Err(LazyflowError::incompatible(
                self.qualified_name(),
                "outputs are computed by their operator",
            ));
        }
        if self.kind() == SlotKind::Array && !matches!(value, Value::Array(_)) {
            return Err(LazyflowError::ValueKind {
                expected: "array",
                found: value.kind(),
            });
        }
        match &self.inner.state.read().source {
            Source::Connected(up) => {
                return Err(LazyflowError::incompatible(
                    self.qualified_name(),
                    format!("is connected to {}", up.qualified_name()),
                ));
            }
            Source::Value {
                value: current,
                is_default: false,
            } if current.same_as(&value) => return Ok(()),
            _ => {}
        }
        self.inner.state.write().source = Source::Value {
            value,
            is_default: false,
        };
        tracing::debug!("slot_set_value: {}", self.qualified_name());
        self.refresh();
        self.set_dirty_all();
        Ok(())
    }

    /// Replace the fixed value of an input without reconfiguring its
    /// operator or sending dirty notifications. For command inputs that an
    /// operator clears from inside its own callbacks, where
    /// [`set_value`](Self::set_value) would re-enter it. The new value must
    /// leave the slot's metadata unchanged.
    pub fn reset_value(&self, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        if self.direction() == SlotDirection::Output {
            return Err(LazyflowError::incompatible(
                self.qualified_name(),
                "outputs are computed by their operator",
            ));
        }
        let meta = meta_for(self.kind(), &value);
        let mut state = self.inner.state.write();
        if let Source::Connected(up) = &state.source {
            return Err(LazyflowError::incompatible(
                self.qualified_name(),
                format!("is connected to {}", up.qualified_name()),
            ));
        }
        if state.meta.as_ref() != Some(&meta) {
            return Err(LazyflowError::incompatible(
                self.qualified_name(),
                "a reset value must keep the slot's metadata",
            ));
        }
        state.source = Source::Value {
            value,
            is_default: false,
        };
        tracing::debug!("slot_reset_value: {}", self.qualified_name());
        Ok(())
    }

    /// Drop the connection or value. The slot falls back to its declared
    /// default, if any.
    pub fn disconnect(&self) {
        let had_source = !matches!(
            self.inner.state.read().source,
            Source::Unconnected | Source::Value { is_default: true, .. }
        );
        if !had_source {
            return;
        }
        self.detach_upstream();
        let restored = {
            let mut state = self.inner.state.write();
            state.source = match (&self.inner.spec.default, self.direction()) {
                (Some(value), SlotDirection::Input) => Source::Value {
                    value: value.clone(),
                    is_default: true,
                },
                _ => Source::Unconnected,
            };
            matches!(state.source, Source::Value { .. })
        };
        tracing::debug!("slot_disconnect: {}", self.qualified_name());
        match self.direction() {
            SlotDirection::Output => self.set_meta(None),
            SlotDirection::Input => self.refresh(),
        }
        if restored {
            self.set_dirty_all();
        }
    }

    fn detach_upstream(&self) {
        let previous = {
            let mut state = self.inner.state.write();
            match std::mem::replace(&mut state.source, Source::Unconnected) {
                Source::Connected(up) => Some(up),
                other => {
                    state.source = other;
                    None
                }
            }
        };
        if let Some(up) = previous {
            up.inner
                .state
                .write()
                .partners
                .retain(|w| w.upgrade().is_some_and(|p| !Arc::ptr_eq(&p, &self.inner)));
        }
    }

    /// Would connecting `self` to `upstream` close a loop? True if `upstream`
    /// is reachable downstream of `self`.
    fn reaches(&self, upstream: &Slot) -> bool {
        let mut visited = HashSet::new();
        let mut stack = vec![self.clone()];
        while let Some(slot) = stack.pop() {
            if &slot == upstream {
                return true;
            }
            if !visited.insert(Arc::as_ptr(&slot.inner) as usize) {
                continue;
            }
            stack.extend(slot.partners());
            if slot.direction() == SlotDirection::Input {
                if let Some(op) = slot.operator() {
                    stack.extend(op.outputs().iter().cloned());
                }
            }
        }
        false
    }

    /// Recompute metadata from the source and run the change cascade.
    pub(crate) fn refresh(&self) {
        let meta = {
            let state = self.inner.state.read();
            match &state.source {
                Source::Connected(up) => up.meta(),
                Source::Value { value, .. } => Some(meta_for(self.kind(), value)),
                Source::Unconnected => match self.direction() {
                    SlotDirection::Input => None,
                    SlotDirection::Output => state.meta.clone(),
                },
            }
        };
        self.set_meta(meta);
    }

    /// Replace the metadata, notify listeners, cascade downstream and
    /// reconfigure the owning operator of an input.
    pub(crate) fn set_meta(&self, meta: Option<Meta>) {
        let (was_ready, changed) = {
            let mut state = self.inner.state.write();
            let was_ready = state.meta.is_some();
            let changed = state.meta != meta;
            state.meta = meta;
            (was_ready, changed)
        };
        let now_ready = self.is_ready();
        if changed {
            let callbacks = self.callbacks(|l| &l.meta_changed);
            callbacks.iter().for_each(|f| f(self));
        }
        if !was_ready && now_ready {
            let callbacks = self.callbacks(|l| &l.ready);
            callbacks.iter().for_each(|f| f(self));
        } else if was_ready && !now_ready {
            let callbacks = self.callbacks(|l| &l.unready);
            callbacks.iter().for_each(|f| f(self));
        }
        for partner in self.partners() {
            partner.refresh();
        }
        if self.direction() == SlotDirection::Input {
            if let Some(node) = self.inner.operator.upgrade() {
                node.configure();
            }
        }
    }

    // --- data ---

    /// Request the data of `roi`.
    pub fn get(&self, roi: &Roi) -> Result<Request> {
        let state = self.inner.state.read();
        let meta = state
            .meta
            .clone()
            .ok_or_else(|| LazyflowError::not_ready(self.qualified_name()))?;
        if meta.is_array() {
            meta.check_roi(roi)?;
        }
        match &state.source {
            Source::Connected(up) => {
                let up = up.clone();
                drop(state);
                up.get(roi)
            }
            Source::Value { value, .. } => Ok(Request::ready(match value {
                Value::Array(buffer) if roi.shape() != buffer.shape() => {
                    Value::Array(buffer.extract(roi)?)
                }
                other => other.clone(),
            })),
            Source::Unconnected => {
                drop(state);
                if self.direction() == SlotDirection::Input {
                    return Err(LazyflowError::not_ready(self.qualified_name()));
                }
                let node = self
                    .inner
                    .operator
                    .upgrade()
                    .ok_or_else(|| LazyflowError::Closed(self.inner.operator_name.clone()))?;
                if node.context().is_finalized() {
                    return Err(LazyflowError::Finalized);
                }
                if meta.is_array() && roi.is_empty() {
                    return Ok(Request::ready(Value::Array(Buffer::zeros(
                        meta.dtype,
                        &roi.shape(),
                    )?)));
                }
                let index = self.inner.index;
                let roi = roi.clone();
                let pool = node.context().pool().clone();
                Ok(Request::new(Some(&pool), move || {
                    node.execute_output(index, &roi)
                }))
            }
        }
    }

    /// Request the whole slot.
    pub fn get_all(&self) -> Result<Request> {
        let meta = self
            .meta()
            .ok_or_else(|| LazyflowError::not_ready(self.qualified_name()))?;
        self.get(&meta.full_roi())
    }

    /// Request a region given as slice text, e.g. `"[0:5,2:3]"`.
    pub fn get_slicing(&self, slicing: &str) -> Result<Request> {
        self.get(&slicing.parse()?)
    }

    /// Read the whole slot and wait for the value.
    pub fn value(&self) -> Result<Value> {
        self.get_all()?.wait()
    }

    /// Write `value` over `roi`: patches a value-backed slot in place,
    /// otherwise hands the data to the owning operator's `set_in_slot` and
    /// to connected inner inputs.
    pub fn write(&self, roi: &Roi, value: Value) -> Result<()> {
        let meta = self
            .meta()
            .ok_or_else(|| LazyflowError::not_ready(self.qualified_name()))?;
        meta.check_roi(roi)?;
        if let Value::Array(buffer) = &value {
            if buffer.shape() != roi.shape().as_slice() {
                return Err(LazyflowError::InvalidRoi(format!(
                    "cannot write data of shape {:?} into {roi}",
                    buffer.shape()
                )));
            }
        }
        {
            let mut state = self.inner.state.write();
            if let Source::Value {
                value: Value::Array(stored),
                is_default,
            } = &mut state.source
            {
                stored.assign_region(roi, value.as_buffer()?)?;
                *is_default = false;
                drop(state);
                self.set_dirty(roi);
                return Ok(());
            }
        }

        let mut handled = false;
        if self.direction() == SlotDirection::Input {
            if let Some(node) = self.inner.operator.upgrade() {
                match node.set_in_slot(self.inner.index, roi, &value) {
                    Ok(()) => handled = true,
                    Err(LazyflowError::Unsupported { .. }) => {}
                    Err(err) => return Err(err),
                }
            }
        }
        for partner in self.partners() {
            if partner.direction() == SlotDirection::Input {
                partner.write(roi, value.clone())?;
                handled = true;
            }
        }
        if handled {
            Ok(())
        } else {
            Err(LazyflowError::unsupported(
                self.inner.operator_name.clone(),
                "writing into slots",
            ))
        }
    }

    // --- dirtiness ---

    /// Announce that the data over `roi` changed.
    pub fn set_dirty(&self, roi: &Roi) {
        let Some(meta) = self.meta() else {
            return;
        };
        let full = meta.full_roi();
        let roi = if meta.is_array() && roi.ndim() == full.ndim() {
            roi.intersect(&full)
        } else {
            full
        };
        if roi.is_empty() && !meta.is_empty() {
            return;
        }
        tracing::trace!("slot_dirty: {} {roi}", self.qualified_name());
        for partner in self.partners() {
            partner.set_dirty(&roi);
        }
        let callbacks = self.callbacks(|l| &l.dirty);
        callbacks.iter().for_each(|f| f(self, &roi));
        if self.direction() == SlotDirection::Input {
            if let Some(node) = self.inner.operator.upgrade() {
                node.propagate_dirty(self.inner.index, &roi);
            }
        }
    }

    /// Announce that all data changed.
    pub fn set_dirty_all(&self) {
        if let Some(meta) = self.meta() {
            self.set_dirty(&meta.full_roi());
        }
    }

    // --- listeners ---

    /// Call `f` whenever the metadata changes.
    pub fn notify_meta_changed(&self, f: impl Fn(&Slot) + Send + Sync + 'static) -> SubscriptionId {
        self.subscribe(|l, id| l.meta_changed.push((id, Arc::new(f))))
    }

    /// Call `f` when the slot becomes ready.
    pub fn notify_ready(&self, f: impl Fn(&Slot) + Send + Sync + 'static) -> SubscriptionId {
        self.subscribe(|l, id| l.ready.push((id, Arc::new(f))))
    }

    /// Call `f` when the slot stops being ready.
    pub fn notify_unready(&self, f: impl Fn(&Slot) + Send + Sync + 'static) -> SubscriptionId {
        self.subscribe(|l, id| l.unready.push((id, Arc::new(f))))
    }

    /// Call `f` with each dirty region.
    pub fn notify_dirty(
        &self,
        f: impl Fn(&Slot, &Roi) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.subscribe(|l, id| l.dirty.push((id, Arc::new(f))))
    }

    /// Remove a registration.
    pub fn unregister(&self, id: SubscriptionId) {
        let mut l = self.inner.listeners.lock();
        l.meta_changed.retain(|(i, _)| *i != id.0);
        l.ready.retain(|(i, _)| *i != id.0);
        l.unready.retain(|(i, _)| *i != id.0);
        l.dirty.retain(|(i, _)| *i != id.0);
    }

    fn subscribe(&self, add: impl FnOnce(&mut Listeners, u64)) -> SubscriptionId {
        let mut l = self.inner.listeners.lock();
        l.next_id += 1;
        let id = l.next_id;
        add(&mut l, id);
        SubscriptionId(id)
    }

    fn callbacks<F: Clone>(&self, pick: impl FnOnce(&Listeners) -> &Vec<(u64, F)>) -> Vec<F> {
        let l = self.inner.listeners.lock();
        pick(&l).iter().map(|(_, f)| f.clone()).collect()
    }
}
