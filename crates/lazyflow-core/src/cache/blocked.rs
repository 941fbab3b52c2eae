//! Blocked array cache.
//!
//! [`OpBlockedArrayCache`] is a pass-through operator that keeps the data of
//! its input in fixed-size blocks. Reads decompose into blocks; cached blocks
//! are served from memory, missing blocks are fetched from upstream (whole,
//! never just the overlap) and stored.
//!
//! Each block is further divided into inner blocks, which are the unit of
//! validity: a dirty notification invalidates only the inner blocks it
//! overlaps, and a later read refetches only those. Without an inner block
//! shape the inner block is the whole block.
//!
//! At most one upstream fetch per block is in flight; concurrent readers of a
//! missing block share its request. The fetch belongs to none of them: a
//! cancelled reader withdraws, and the fetch is cancelled only when its last
//! reader has. A fetch that was overtaken by a dirty notification or a write
//! still answers its waiters but does not store.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::array::{Buffer, DType};
use crate::error::{LazyflowError, Result};
use crate::graph::{
    InputId, Operator, OperatorContext, OutputId, SetupContext, Slot, SlotSpec,
};
use crate::meta::{Axis, Meta};
use crate::request::{self, Request, RequestBatch, RequestState, ThreadPool};
use crate::roi::{self, BlockIndex, Roi};
use crate::value::Value;

use super::memory::{EvictionCandidate, ManagedCache, MemoryManager};

/// Block geometry of a configured cache.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Layout {
    shape: Vec<usize>,
    dtype: DType,
    block_shape: Vec<usize>,
    inner_shape: Vec<usize>,
}

impl Layout {
    fn block_roi(&self, index: &[usize]) -> Roi {
        roi::block_roi(index, &self.block_shape, &self.shape)
    }

    /// Inner block ROIs of block `index`, in global coordinates.
    fn inner_rois(&self, index: &[usize]) -> Vec<Roi> {
        let outer = self.block_roi(index);
        roi::intersecting_blocks(&outer, &self.inner_shape)
            .map(|i| roi::block_roi(&i, &self.inner_shape, &self.shape).intersect(&outer))
            .collect()
    }
}

struct Block {
    data: Buffer,
    valid: Vec<bool>,
    pinned: bool,
    last_access: AtomicU64,
}

impl Block {
    fn is_valid(&self) -> bool {
        self.valid.iter().all(|&v| v)
    }
}

/// An upstream fetch and the number of readers still waiting for it.
struct InFlight {
    id: u64,
    request: Request,
    readers: usize,
}

/// A reader's share of an in-flight fetch.
struct Fetch {
    id: u64,
    request: Request,
}

#[derive(Default)]
struct CacheInner {
    layout: Option<Layout>,
    blocks: HashMap<BlockIndex, Block>,
    in_flight: HashMap<BlockIndex, InFlight>,
    frozen: bool,
    /// Regions dirtied, or served as zeros, while frozen.
    frozen_dirty: Vec<Roi>,
    /// Regions invalidated by unfreezing, not yet announced downstream.
    released: Vec<Roi>,
    memory: Option<MemoryManager>,
}

impl CacheInner {
    fn tick(&self) -> u64 {
        self.memory.as_ref().map_or(0, MemoryManager::tick)
    }

    /// Mark the inner blocks overlapping `dirty` invalid and abandon the
    /// fetches of every block it touches.
    fn invalidate(&mut self, dirty: &Roi) {
        let Some(layout) = self.layout.clone() else {
            return;
        };
        if dirty.ndim() != layout.shape.len() {
            return;
        }
        let dirty = dirty.intersect(&Roi::from_shape(&layout.shape));
        for index in roi::intersecting_blocks(&dirty, &layout.block_shape) {
            self.in_flight.remove(&index);
            let Some(block) = self.blocks.get_mut(&index) else {
                continue;
            };
            for (valid, inner) in block.valid.iter_mut().zip(layout.inner_rois(&index)) {
                if inner.overlaps(&dirty) {
                    *valid = false;
                }
            }
            if block.valid.iter().all(|&v| !v) {
                self.blocks.remove(&index);
            }
        }
    }

    /// Returns true if the flag changed. Unfreezing invalidates everything
    /// recorded while frozen and queues it in `released`.
    fn set_frozen(&mut self, frozen: bool) -> bool {
        if self.frozen == frozen {
            return false;
        }
        self.frozen = frozen;
        tracing::debug!("cache_frozen: {frozen}");
        if !frozen {
            let recorded = std::mem::take(&mut self.frozen_dirty);
            for region in &recorded {
                self.invalidate(region);
            }
            let ndim = self.layout.as_ref().map(|l| l.shape.len());
            self.released
                .extend(recorded.into_iter().filter(|r| Some(r.ndim()) == ndim));
        }
        true
    }

    fn clean_blocks(&self) -> Vec<Roi> {
        let Some(layout) = &self.layout else {
            return Vec::new();
        };
        let mut indices: Vec<&BlockIndex> = self
            .blocks
            .iter()
            .filter(|(_, b)| b.is_valid())
            .map(|(i, _)| i)
            .collect();
        indices.sort();
        indices.into_iter().map(|i| layout.block_roi(i)).collect()
    }
}

/// Counters reported by [`OpBlockedArrayCache::stats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    /// Upstream block fetches started.
    pub fetches: u64,
    /// Blocks served from memory.
    pub hits: u64,
    /// Blocks currently held.
    pub blocks: usize,
    /// Bytes currently held.
    pub used_bytes: usize,
}

enum Lookup {
    Ready(Buffer),
    Zeros,
    Pending(Fetch),
}

/// Block store shared between the operator and its fetch requests.
struct BlockCache {
    inner: RwLock<CacheInner>,
    fetches: AtomicU64,
    hits: AtomicU64,
    next_fetch: AtomicU64,
}

impl BlockCache {
    fn new() -> Self {
        Self {
            inner: RwLock::new(CacheInner::default()),
            fetches: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            next_fetch: AtomicU64::new(1),
        }
    }

    /// Adopt `layout` and the freeze flag `fix`. Cached data survives only
    /// if the geometry is unchanged. Regions released by unfreezing here are
    /// announced by the next freeze-flag dirty notification.
    fn configure(&self, layout: Layout, fix: bool) {
        let mut inner = self.inner.write();
        if inner.layout.as_ref() == Some(&layout) {
            inner.set_frozen(fix);
            return;
        }
        if inner.layout.is_some() {
            tracing::debug!(
                "cache_reset: block shape {:?}, inner {:?}",
                layout.block_shape,
                layout.inner_shape
            );
        }
        inner.frozen = fix;
        inner.blocks.clear();
        inner.in_flight.clear();
        inner.frozen_dirty.clear();
        inner.released.clear();
        inner.layout = Some(layout);
    }

    fn layout(&self) -> Option<Layout> {
        self.inner.read().layout.clone()
    }

    fn lookup(
        self: &Arc<Self>,
        index: &BlockIndex,
        layout: &Layout,
        input: &Slot,
        pool: &ThreadPool,
    ) -> Lookup {
        {
            let inner = self.inner.read();
            if let Some(block) = inner.blocks.get(index) {
                if block.is_valid() || inner.frozen {
                    block.last_access.store(inner.tick(), Ordering::Relaxed);
                    self.hits.fetch_add(1, Ordering::Relaxed);
                    return Lookup::Ready(block.data.clone());
                }
            }
        }

        let mut inner = self.inner.write();
        if let Some(block) = inner.blocks.get(index) {
            if block.is_valid() || inner.frozen {
                block.last_access.store(inner.tick(), Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Lookup::Ready(block.data.clone());
            }
        }
        if let Some(fetch) = inner.in_flight.get_mut(index) {
            if matches!(fetch.request.state(), RequestState::Cancelled | RequestState::Failed) {
                inner.in_flight.remove(index);
            } else {
                fetch.readers += 1;
                return Lookup::Pending(Fetch {
                    id: fetch.id,
                    request: fetch.request.clone(),
                });
            }
        }
        let block_roi = layout.block_roi(index);
        if inner.frozen {
            if !inner.frozen_dirty.contains(&block_roi) {
                inner.frozen_dirty.push(block_roi);
            }
            return Lookup::Zeros;
        }

        let (base, pending) = match inner.blocks.get(index) {
            Some(block) => (
                Some(block.data.clone()),
                layout
                    .inner_rois(index)
                    .into_iter()
                    .zip(&block.valid)
                    .filter(|(_, valid)| !**valid)
                    .map(|(r, _)| r)
                    .collect(),
            ),
            None => (None, layout.inner_rois(index)),
        };
        let fetch_id = self.next_fetch.fetch_add(1, Ordering::Relaxed);
        let cache = Arc::downgrade(self);
        let input = input.clone();
        let block = index.clone();
        let dtype = layout.dtype;
        let request = Request::detached(Some(pool), move || {
            let result = fetch_block(&input, &block_roi, dtype, base, &pending);
            if let Some(cache) = cache.upgrade() {
                cache.complete(&block, fetch_id, &result);
            }
            result.map(Value::Array)
        });
        self.fetches.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("cache_fetch: block {index:?} (fetch {fetch_id})");
        inner.in_flight.insert(
            index.clone(),
            InFlight {
                id: fetch_id,
                request: request.clone(),
                readers: 1,
            },
        );
        Lookup::Pending(Fetch {
            id: fetch_id,
            request,
        })
    }

    /// A reader gives up on `fetch`. The last reader to leave cancels it.
    fn withdraw(&self, index: &BlockIndex, fetch: &Fetch) {
        fetch.request.cancel();
        let abandoned = {
            let mut inner = self.inner.write();
            let last = match inner.in_flight.get_mut(index) {
                Some(current) if current.id == fetch.id => {
                    current.readers = current.readers.saturating_sub(1);
                    current.readers == 0
                }
                _ => false,
            };
            if last { inner.in_flight.remove(index) } else { None }
        };
        if let Some(abandoned) = abandoned {
            tracing::debug!("cache_cancel: block {index:?} (fetch {}) has no readers", fetch.id);
            abandoned.request.cancel();
        }
    }

    /// Store the result of fetch `fetch_id` unless it was overtaken.
    fn complete(&self, index: &BlockIndex, fetch_id: u64, result: &Result<Buffer>) {
        let memory = {
            let mut inner = self.inner.write();
            let current = inner
                .in_flight
                .get(index)
                .is_some_and(|f| f.id == fetch_id);
            if !current {
                tracing::debug!("cache_discard: block {index:?} changed during fetch {fetch_id}");
                return;
            }
            inner.in_flight.remove(index);
            let data = match result {
                Ok(data) => data.clone(),
                Err(err) => {
                    if !err.is_cancelled() {
                        tracing::warn!("cache fetch of block {index:?} failed: {err}");
                    }
                    return;
                }
            };
            let Some(layout) = inner.layout.clone() else {
                return;
            };
            if data.shape() != layout.block_roi(index).shape().as_slice() {
                return;
            }
            let pinned = inner.blocks.get(index).is_some_and(|b| b.pinned);
            let now = inner.tick();
            inner.blocks.insert(
                index.clone(),
                Block {
                    data,
                    valid: vec![true; layout.inner_rois(index).len()],
                    pinned,
                    last_access: AtomicU64::new(now),
                },
            );
            inner.memory.clone()
        };
        if let Some(memory) = memory {
            memory.enforce();
        }
    }

    /// Overwrite `region` with `data`; touched blocks become valid and pinned.
    fn write(&self, region: &Roi, data: &Buffer) -> Result<()> {
        let mut inner = self.inner.write();
        let layout = inner
            .layout
            .clone()
            .ok_or_else(|| LazyflowError::not_ready("OpBlockedArrayCache.Input"))?;
        if data.dtype() != layout.dtype {
            return Err(LazyflowError::DTypeMismatch {
                expected: layout.dtype,
                found: data.dtype(),
            });
        }
        let now = inner.tick();
        for index in roi::intersecting_blocks(region, &layout.block_shape) {
            let block_roi = layout.block_roi(&index);
            let overlap = block_roi.intersect(region);
            let patch = data.extract(&overlap.relative_to(region.start()))?;
            inner.in_flight.remove(&index);
            let block = match inner.blocks.entry(index.clone()) {
                Entry::Occupied(e) => e.into_mut(),
                Entry::Vacant(e) => e.insert(Block {
                    data: Buffer::zeros(layout.dtype, &block_roi.shape())?,
                    valid: Vec::new(),
                    pinned: true,
                    last_access: AtomicU64::new(now),
                }),
            };
            block
                .data
                .assign_region(&overlap.relative_to(block_roi.start()), &patch)?;
            block.valid = vec![true; layout.inner_rois(&index).len()];
            block.pinned = true;
            block.last_access.store(now, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Apply a dirty notification; returns false if it was recorded because
    /// the cache is frozen.
    fn dirty(&self, region: &Roi) -> bool {
        let mut inner = self.inner.write();
        if inner.frozen {
            inner.frozen_dirty.push(region.clone());
            false
        } else {
            inner.invalidate(region);
            true
        }
    }

    /// Freeze or unfreeze. Returns the bounding box of every region released
    /// by unfreezing since the last call, here or during configuration.
    fn set_frozen(&self, frozen: bool) -> Option<Roi> {
        let mut inner = self.inner.write();
        inner.set_frozen(frozen);
        let released = std::mem::take(&mut inner.released);
        Roi::bounding_box(&released)
    }

    fn stats(&self) -> CacheStats {
        let inner = self.inner.read();
        CacheStats {
            fetches: self.fetches.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            blocks: inner.blocks.len(),
            used_bytes: inner.blocks.values().map(|b| b.data.nbytes()).sum(),
        }
    }

    fn clear(&self) {
        let mut inner = self.inner.write();
        inner.blocks.clear();
        inner.in_flight.clear();
        inner.frozen_dirty.clear();
        inner.released.clear();
    }
}

impl ManagedCache for BlockCache {
    fn cache_name(&self) -> String {
        "OpBlockedArrayCache".into()
    }

    fn used_memory(&self) -> usize {
        self.inner
            .read()
            .blocks
            .values()
            .map(|b| b.data.nbytes())
            .sum()
    }

    fn eviction_candidates(&self) -> Vec<EvictionCandidate> {
        let inner = self.inner.read();
        if inner.frozen {
            return Vec::new();
        }
        inner
            .blocks
            .iter()
            .filter(|(i, b)| !b.pinned && !inner.in_flight.contains_key(*i))
            .map(|(i, b)| EvictionCandidate {
                block: i.clone(),
                last_access: b.last_access.load(Ordering::Relaxed),
                bytes: b.data.nbytes(),
            })
            .collect()
    }

    fn evict(&self, block: &BlockIndex) -> usize {
        let mut inner = self.inner.write();
        if inner.blocks.get(block).is_some_and(|b| !b.pinned) {
            inner.blocks.remove(block).map_or(0, |b| b.data.nbytes())
        } else {
            0
        }
    }

    fn free_all(&self) {
        self.inner.write().blocks.retain(|_, b| b.pinned);
    }
}

fn fetch_block(
    input: &Slot,
    block_roi: &Roi,
    dtype: DType,
    base: Option<Buffer>,
    pending: &[Roi],
) -> Result<Buffer> {
    let batch = pending
        .iter()
        .map(|r| input.get(r))
        .collect::<Result<Vec<_>>>()?
        .into_iter()
        .collect::<RequestBatch>();
    let mut parts = batch.wait()?;

    if base.is_none() && pending.len() == 1 && pending[0] == *block_roi {
        if let Some(part) = parts.pop() {
            return part.into_buffer();
        }
    }
    let mut data = match base {
        Some(data) => data,
        None => Buffer::zeros(dtype, &block_roi.shape())?,
    };
    for (region, part) in pending.iter().zip(&parts) {
        data.assign_region(&region.relative_to(block_roi.start()), part.as_buffer()?)?;
    }
    Ok(data)
}

/// Resolve the outer block shape: an explicit shape (0 meaning the whole
/// axis), else the upstream's ideal block hint, else a default of about
/// `target_bytes` per block.
fn resolve_block_shape(meta: &Meta, explicit: Option<&[usize]>, target_bytes: usize) -> Result<Vec<usize>> {
    let ndim = meta.shape.len();
    let clamp = |shape: &[usize]| -> Vec<usize> {
        shape
            .iter()
            .zip(&meta.shape)
            .map(|(&b, &n)| (if b == 0 { n } else { b.min(n) }).max(1))
            .collect()
    };
    if let Some(shape) = explicit {
        if shape.len() != ndim {
            return Err(LazyflowError::incompatible(
                "OpBlockedArrayCache.BlockShape",
                format!("block shape {shape:?} does not match data shape {:?}", meta.shape),
            ));
        }
        return Ok(clamp(shape));
    }
    if let Some(ideal) = meta.block_hints.ideal.as_ref().filter(|s| s.len() == ndim) {
        return Ok(clamp(ideal));
    }
    Ok(default_block_shape(meta, target_bytes))
}

/// Channel axis whole, time axis 1, spatial axes near-isometric.
fn default_block_shape(meta: &Meta, target_bytes: usize) -> Vec<usize> {
    let mut block: Vec<usize> = meta.shape.iter().map(|&n| n.max(1)).collect();
    let mut elements = (target_bytes / meta.dtype.size_of().max(1)).max(1);
    let mut spatial = Vec::new();
    for (i, axis) in meta.axes.iter().enumerate() {
        match axis {
            Axis::C => elements = (elements / meta.shape[i].max(1)).max(1),
            Axis::T | Axis::Index => block[i] = 1,
            Axis::Z | Axis::Y | Axis::X => spatial.push(i),
        }
    }
    let max_shape: Vec<usize> = spatial.iter().map(|&i| meta.shape[i]).collect();
    for (&i, size) in spatial
        .iter()
        .zip(roi::determine_block_shape(&max_shape, elements))
    {
        block[i] = size.max(1);
    }
    block
}

/// Caches its input in blocks.
///
/// Inputs: `Input` (array), `BlockShape` (optional shape), `InnerBlockShape`
/// (optional shape), `FixAtCurrent` (bool, default `false`). Outputs:
/// `Output` (the cached data) and `CleanBlocks` (ROIs of fully valid blocks).
pub struct OpBlockedArrayCache {
    state: Arc<BlockCache>,
}

impl Default for OpBlockedArrayCache {
    fn default() -> Self {
        Self::new()
    }
}

impl OpBlockedArrayCache {
    /// Data to cache.
    pub const INPUT: InputId = InputId(0);
    /// Outer block shape.
    pub const BLOCK_SHAPE: InputId = InputId(1);
    /// Inner (validity) block shape.
    pub const INNER_BLOCK_SHAPE: InputId = InputId(2);
    /// Freeze flag.
    pub const FIX_AT_CURRENT: InputId = InputId(3);
    /// Cached data.
    pub const OUTPUT: OutputId = OutputId(0);
    /// Fully valid block ROIs.
    pub const CLEAN_BLOCKS: OutputId = OutputId(1);

    /// Create an unconfigured cache.
    pub fn new() -> Self {
        Self {
            state: Arc::new(BlockCache::new()),
        }
    }

    /// Current counters.
    pub fn stats(&self) -> CacheStats {
        self.state.stats()
    }

    /// Block shape in use, once configured.
    pub fn block_shape(&self) -> Option<Vec<usize>> {
        self.state.layout().map(|l| l.block_shape)
    }

    /// Inner block shape in use, once configured.
    pub fn inner_block_shape(&self) -> Option<Vec<usize>> {
        self.state.layout().map(|l| l.inner_shape)
    }

    fn read_blocks(&self, ctx: &OperatorContext<'_>, region: &Roi, result: &mut Buffer) -> Result<()> {
        let layout = self
            .state
            .layout()
            .ok_or_else(|| LazyflowError::not_ready(ctx.output(Self::OUTPUT).qualified_name()))?;
        let input = ctx.input(Self::INPUT);
        let pool = ctx.context().pool();

        let mut ready = Vec::new();
        let mut pending = Vec::new();
        for index in roi::intersecting_blocks(region, &layout.block_shape) {
            match self.state.lookup(&index, &layout, input, pool) {
                Lookup::Ready(data) => ready.push((index, data)),
                Lookup::Zeros => {}
                Lookup::Pending(fetch) => {
                    fetch.request.submit();
                    pending.push((index, fetch));
                }
            }
        }

        let mut pending = pending.into_iter();
        let outcome = ready
            .iter()
            .try_for_each(|(index, data)| copy_overlap(&layout, index, data, region, result))
            .and_then(|()| {
                pending.by_ref().try_for_each(|(index, fetch)| {
                    self.await_block(ctx, &layout, &index, fetch, region, result)
                })
            });
        if outcome.is_err() {
            for (index, fetch) in pending {
                self.state.withdraw(&index, &fetch);
            }
        }
        outcome
    }

    /// Wait for the fetch of block `index` and copy its overlap with `region`.
    fn await_block(
        &self,
        ctx: &OperatorContext<'_>,
        layout: &Layout,
        index: &BlockIndex,
        mut fetch: Fetch,
        region: &Roi,
        result: &mut Buffer,
    ) -> Result<()> {
        loop {
            match fetch.request.wait_interruptible() {
                Ok(value) => return copy_overlap(layout, index, value.as_buffer()?, region, result),
                Err(LazyflowError::Cancelled) if request::current_cancelled() => {
                    self.state.withdraw(index, &fetch);
                    return Err(LazyflowError::Cancelled);
                }
                // Every reader of that fetch gave up before this one joined.
                Err(LazyflowError::Cancelled) => {
                    let input = ctx.input(Self::INPUT);
                    match self.state.lookup(index, layout, input, ctx.context().pool()) {
                        Lookup::Ready(data) => {
                            return copy_overlap(layout, index, &data, region, result);
                        }
                        Lookup::Zeros => return Ok(()),
                        Lookup::Pending(next) => {
                            next.request.submit();
                            fetch = next;
                        }
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn copy_overlap(
    layout: &Layout,
    index: &[usize],
    block: &Buffer,
    region: &Roi,
    result: &mut Buffer,
) -> Result<()> {
    let block_roi = layout.block_roi(index);
    let overlap = block_roi.intersect(region);
    let patch = block.extract(&overlap.relative_to(block_roi.start()))?;
    result.assign_region(&overlap.relative_to(region.start()), &patch)
}

impl Operator for OpBlockedArrayCache {
    fn name(&self) -> &'static str {
        "OpBlockedArrayCache"
    }

    fn inputs(&self) -> Vec<SlotSpec> {
        vec![
            SlotSpec::array("Input"),
            SlotSpec::value("BlockShape").optional(),
            SlotSpec::value("InnerBlockShape").optional(),
            SlotSpec::value("FixAtCurrent").with_default(false),
        ]
    }

    fn outputs(&self) -> Vec<SlotSpec> {
        vec![SlotSpec::array("Output"), SlotSpec::value("CleanBlocks")]
    }

    fn init(&mut self, ctx: &OperatorContext<'_>) -> Result<()> {
        let memory = ctx.context().memory().clone();
        let cache: Arc<dyn ManagedCache> = self.state.clone();
        memory.register(Arc::downgrade(&cache));
        self.state.inner.write().memory = Some(memory);
        Ok(())
    }

    fn setup_outputs(&mut self, ctx: &mut SetupContext<'_>) -> Result<()> {
        let meta = ctx.input_meta(Self::INPUT)?;
        let explicit = ctx.optional_value(Self::BLOCK_SHAPE)?;
        let inner = ctx.optional_value(Self::INNER_BLOCK_SHAPE)?;
        let fix = ctx.input_value(Self::FIX_AT_CURRENT)?.as_bool()?;

        let explicit = explicit.as_ref().map(Value::as_shape).transpose()?;
        let block_shape = resolve_block_shape(
            &meta,
            explicit,
            ctx.context().config().default_block_bytes,
        )?;
        let inner_shape = match inner.as_ref().map(Value::as_shape).transpose()? {
            Some(shape) if shape.len() == block_shape.len() => shape
                .iter()
                .zip(&block_shape)
                .map(|(&i, &b)| (if i == 0 { b } else { i.min(b) }).max(1))
                .collect(),
            Some(shape) => {
                return Err(LazyflowError::incompatible(
                    "OpBlockedArrayCache.InnerBlockShape",
                    format!("inner block shape {shape:?} does not match data shape {:?}", meta.shape),
                ));
            }
            None => block_shape.clone(),
        };

        self.state.configure(
            Layout {
                shape: meta.shape.clone(),
                dtype: meta.dtype,
                block_shape: block_shape.clone(),
                inner_shape,
            },
            fix,
        );

        let mut output = meta;
        output.block_hints.ideal = Some(block_shape);
        ctx.set_output_meta(Self::OUTPUT, output);
        ctx.set_output_meta(Self::CLEAN_BLOCKS, Meta::opaque());
        Ok(())
    }

    fn execute(
        &self,
        ctx: &OperatorContext<'_>,
        output: OutputId,
        region: &Roi,
        result: &mut Value,
    ) -> Result<()> {
        if output == Self::CLEAN_BLOCKS {
            *result = Value::Rois(self.state.inner.read().clean_blocks());
            return Ok(());
        }
        self.read_blocks(ctx, region, result.as_buffer_mut()?)
    }

    fn propagate_dirty(&self, ctx: &OperatorContext<'_>, input: InputId, region: &Roi) {
        match input {
            Self::INPUT => {
                if self.state.dirty(region) {
                    ctx.output(Self::OUTPUT).set_dirty(region);
                    ctx.output(Self::CLEAN_BLOCKS).set_dirty_all();
                }
            }
            Self::FIX_AT_CURRENT => {
                let fix = ctx
                    .input_value(Self::FIX_AT_CURRENT)
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                if let Some(dirty) = self.state.set_frozen(fix) {
                    ctx.output(Self::OUTPUT).set_dirty(&dirty);
                    ctx.output(Self::CLEAN_BLOCKS).set_dirty_all();
                }
            }
            // Geometry changes reset the cache in setup; the data is unchanged.
            _ => {}
        }
    }

    fn set_in_slot(
        &self,
        ctx: &OperatorContext<'_>,
        input: InputId,
        region: &Roi,
        value: &Value,
    ) -> Result<()> {
        if input != Self::INPUT {
            return Err(LazyflowError::unsupported(self.name(), "writing into parameter slots"));
        }
        self.state.write(region, value.as_buffer()?)?;
        tracing::debug!("cache_write: {region}");
        ctx.output(Self::OUTPUT).set_dirty(region);
        ctx.output(Self::CLEAN_BLOCKS).set_dirty_all();
        Ok(())
    }

    fn teardown(&mut self) {
        self.state.clear();
    }
}
