//! Sparse, user-editable label store.
//!
//! Labels are small integers painted over an image: 0 means unlabeled. Only
//! blocks that were written to are held in memory; everything else reads as
//! zero without touching upstream.

use lazyflow_core::{
    Axis, Buffer, DType, InputId, LazyflowError, Meta, OpBlockedArrayCache, Operator, OperatorContext,
    OperatorHandle, OutputId, Result, Roi, SetupContext, SlotSpec, Value,
};
use ndarray::Zip;

use crate::source::OpConstant;

/// Writable `uint8` label array following the geometry of its input.
///
/// The input only provides the shape and axes; its data is never read. The
/// output has the input's shape with the channel axis (if any) reduced to
/// one. Labels live in an inner frozen [`OpBlockedArrayCache`] over a zero
/// [`OpConstant`], so unwritten regions read as zero.
///
/// ## Writing
///
/// Data written into `Input` is merged into the stored labels:
///
/// - `0` keeps the current label
/// - the `Eraser` value (default 100) clears it
/// - any other value replaces it
///
/// ## Deleting
///
/// Setting `DeleteLabel` to `k > 0` removes label `k` everywhere and shifts
/// every label above `k` down by one, keeping the label values contiguous.
/// The slot is then reset to `-1`, so the same label can be deleted again.
///
/// ## Slot Indices
///
/// | Slot | Kind | Notes |
/// |------|------|-------|
/// | `Input` (in 0) | array | geometry source and write target |
/// | `Eraser` (in 1) | int | default 100 |
/// | `DeleteLabel` (in 2) | int | optional |
/// | `BlockShape` (in 3) | shape | optional, first value wins |
/// | `Output` (out 0) | array | forwarded from the inner cache |
/// | `NonzeroBlocks` (out 1) | roi list | blocks holding any label |
/// | `MaxLabel` (out 2) | int | largest label present |
#[derive(Debug, Default)]
pub struct OpLabelArray {
    source: Option<OperatorHandle>,
    cache: Option<OperatorHandle>,
    eraser: i64,
    block_shape: Option<Vec<usize>>,
}

impl OpLabelArray {
    /// Geometry source; writes land here.
    pub const INPUT: InputId = InputId(0);
    /// Value that clears labels when written.
    pub const ERASER: InputId = InputId(1);
    /// Label to delete.
    pub const DELETE_LABEL: InputId = InputId(2);
    /// Storage block shape.
    pub const BLOCK_SHAPE: InputId = InputId(3);
    /// The labels.
    pub const OUTPUT: OutputId = OutputId(0);
    /// ROIs of stored blocks that hold at least one label.
    pub const NONZERO_BLOCKS: OutputId = OutputId(1);
    /// Largest label value present.
    pub const MAX_LABEL: OutputId = OutputId(2);

    /// Create the composite; children are built when it joins a graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// The inner cache holding the labels.
    pub fn cache(&self) -> Option<&OperatorHandle> {
        self.cache.as_ref()
    }

    fn inner_cache(&self, ctx: &OperatorContext<'_>) -> Result<&OperatorHandle> {
        self.cache
            .as_ref()
            .ok_or_else(|| LazyflowError::not_ready(ctx.output(Self::OUTPUT).qualified_name()))
    }

    /// Stored blocks with their data, in block order.
    fn stored_blocks(&self, ctx: &OperatorContext<'_>) -> Result<Vec<(Roi, Buffer)>> {
        let cache = self.inner_cache(ctx)?;
        let rois = cache
            .output(OpBlockedArrayCache::CLEAN_BLOCKS)
            .value()?
            .as_rois()?
            .to_vec();
        let output = cache.output(OpBlockedArrayCache::OUTPUT);
        rois.into_iter()
            .map(|roi| {
                let data = output.get(&roi)?.wait()?.into_buffer()?;
                Ok((roi, data))
            })
            .collect()
    }

    /// Remove label `k`, shifting higher labels down.
    fn delete_label(&self, ctx: &OperatorContext<'_>, k: u8) -> Result<()> {
        let cache = self.inner_cache(ctx)?;
        let target = cache.input(OpBlockedArrayCache::INPUT);
        let mut rewritten = 0;
        for (roi, mut data) in self.stored_blocks(ctx)? {
            let labels = data.array_mut::<u8>()?;
            if !labels.iter().any(|&v| v >= k) {
                continue;
            }
            labels.mapv_inplace(|v| match v.cmp(&k) {
                std::cmp::Ordering::Less => v,
                std::cmp::Ordering::Equal => 0,
                std::cmp::Ordering::Greater => v - 1,
            });
            target.write(&roi, data.into())?;
            rewritten += 1;
        }
        tracing::debug!("label_delete: {k} ({rewritten} blocks rewritten)");
        ctx.output(Self::NONZERO_BLOCKS).set_dirty_all();
        ctx.output(Self::MAX_LABEL).set_dirty_all();
        Ok(())
    }
}

impl Operator for OpLabelArray {
    fn name(&self) -> &'static str {
        "OpLabelArray"
    }

    fn inputs(&self) -> Vec<SlotSpec> {
        vec![
            SlotSpec::array("Input"),
            SlotSpec::value("Eraser").with_default(100i64),
            SlotSpec::value("DeleteLabel").optional(),
            SlotSpec::value("BlockShape").optional(),
        ]
    }

    fn outputs(&self) -> Vec<SlotSpec> {
        vec![
            SlotSpec::array("Output"),
            SlotSpec::value("NonzeroBlocks"),
            SlotSpec::value("MaxLabel"),
        ]
    }

    fn init(&mut self, ctx: &OperatorContext<'_>) -> Result<()> {
        let source = ctx.add_child(OpConstant::new())?;
        let cache = ctx.add_child(OpBlockedArrayCache::new())?;
        source.input(OpConstant::DTYPE).set_value("uint8")?;
        // Frozen: missing blocks read as zeros and are never fetched.
        cache
            .input(OpBlockedArrayCache::FIX_AT_CURRENT)
            .set_value(true)?;
        cache
            .input(OpBlockedArrayCache::INPUT)
            .connect(source.output(OpConstant::OUTPUT))?;
        ctx.output(Self::OUTPUT)
            .connect(cache.output(OpBlockedArrayCache::OUTPUT))?;
        self.source = Some(source);
        self.cache = Some(cache);
        Ok(())
    }

    fn setup_outputs(&mut self, ctx: &mut SetupContext<'_>) -> Result<()> {
        let meta = ctx.input_meta(Self::INPUT)?;
        if !meta.is_array() {
            return Err(LazyflowError::incompatible(
                ctx.input(Self::INPUT).qualified_name(),
                "labels need an array to follow",
            ));
        }
        self.eraser = ctx.input_value(Self::ERASER)?.as_int()?;

        let (Some(source), Some(cache)) = (&self.source, &self.cache) else {
            return Err(LazyflowError::not_ready(ctx.name().to_string()));
        };
        let requested = ctx
            .optional_value(Self::BLOCK_SHAPE)?
            .map(|v| v.as_shape().map(<[usize]>::to_vec))
            .transpose()?;
        if let Some(shape) = requested {
            if let Some(current) = &self.block_shape {
                if *current != shape {
                    tracing::warn!(
                        "{}: block shape stays {current:?}, ignoring {shape:?}",
                        ctx.name()
                    );
                }
            } else {
                cache
                    .input(OpBlockedArrayCache::BLOCK_SHAPE)
                    .set_value(shape.clone())?;
                self.block_shape = Some(shape);
            }
        }

        let mut shape = meta.shape.clone();
        if let Some(c) = meta.axes.index_of(Axis::C) {
            shape[c] = 1;
        }
        source.input(OpConstant::SHAPE).set_value(shape)?;

        ctx.set_output_meta(Self::NONZERO_BLOCKS, Meta::opaque());
        ctx.set_output_meta(Self::MAX_LABEL, Meta::opaque());
        Ok(())
    }

    fn execute(
        &self,
        ctx: &OperatorContext<'_>,
        output: OutputId,
        _roi: &Roi,
        result: &mut Value,
    ) -> Result<()> {
        let blocks = self.stored_blocks(ctx)?;
        *result = match output {
            Self::NONZERO_BLOCKS => Value::Rois(
                blocks
                    .into_iter()
                    .filter(|(_, data)| !data.is_all_zero())
                    .map(|(roi, _)| roi)
                    .collect(),
            ),
            Self::MAX_LABEL => {
                let mut max = 0u8;
                for (_, data) in &blocks {
                    max = data.view::<u8>()?.iter().fold(max, |m, &v| m.max(v));
                }
                Value::Int(i64::from(max))
            }
            _ => {
                return Err(LazyflowError::unsupported(
                    self.name(),
                    "executing forwarded outputs",
                ));
            }
        };
        Ok(())
    }

    fn propagate_dirty(&self, ctx: &OperatorContext<'_>, input: InputId, _roi: &Roi) {
        // Upstream data changes leave the labels alone.
        if input != Self::DELETE_LABEL {
            return;
        }
        let label = ctx
            .input(Self::DELETE_LABEL)
            .value()
            .and_then(|v| v.as_int())
            .ok();
        let Some(k) = label.filter(|&k| k > 0) else {
            return;
        };
        // Labels are u8: nothing above 255 is ever stored.
        let Ok(k) = u8::try_from(k) else {
            return;
        };
        if let Err(err) = self.delete_label(ctx, k) {
            tracing::warn!("{}: deleting label {k} failed: {err}", ctx.name());
            return;
        }
        // A connected DeleteLabel is reset by whoever drives it.
        if let Err(err) = ctx.input(Self::DELETE_LABEL).reset_value(-1i64) {
            tracing::debug!("{}: DeleteLabel not reset: {err}", ctx.name());
        }
    }

    fn set_in_slot(
        &self,
        ctx: &OperatorContext<'_>,
        input: InputId,
        roi: &Roi,
        value: &Value,
    ) -> Result<()> {
        if input != Self::INPUT {
            return Err(LazyflowError::unsupported(self.name(), "writing into parameter slots"));
        }
        let cache = self.inner_cache(ctx)?;
        let output = ctx.output(Self::OUTPUT);
        output
            .meta()
            .ok_or_else(|| LazyflowError::not_ready(output.qualified_name()))?
            .check_roi(roi)?;

        let data = value.as_buffer()?;
        if matches!(data.dtype(), DType::F32 | DType::F64)
            && data.cast::<f64>().iter().any(|v| !v.is_finite())
        {
            return Err(LazyflowError::incompatible(
                ctx.input(Self::INPUT).qualified_name(),
                "label values must be finite",
            ));
        }
        let incoming = data.cast::<i64>();
        let current = output.get(roi)?.wait()?.into_buffer()?;
        let eraser = self.eraser;
        let merged = Zip::from(&incoming)
            .and(current.view::<u8>()?)
            .map_collect(|&new, &old| match new {
                0 => old,
                v if v == eraser => 0,
                v => v.clamp(0, i64::from(u8::MAX)) as u8,
            });

        cache
            .input(OpBlockedArrayCache::INPUT)
            .write(roi, Buffer::from(merged).into())?;
        tracing::debug!("label_write: {roi}");
        ctx.output(Self::NONZERO_BLOCKS).set_dirty_all();
        ctx.output(Self::MAX_LABEL).set_dirty_all();
        Ok(())
    }
}
