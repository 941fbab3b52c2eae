//! Pointwise and neighbourhood filters.
//!
//! - [`OpBoxFilter`] needs a halo: each output element depends on a
//!   neighbourhood of input elements.
//! - [`OpThreshold`] is pointwise.
//! - [`OpNormalize`] depends on the whole input through its mean.

use std::sync::atomic::{AtomicU64, Ordering};

use lazyflow_core::{
    Buffer, DType, DirtyPropagation, InputId, LazyflowError, Meta, Operator, OperatorContext,
    OutputId, Result, Roi, SetupContext, SlotSpec, Value,
};
use ndarray::{ArrayD, Axis as NdAxis};
use parking_lot::Mutex;

/// Mean over a `(2r + 1)` box along each spatial axis.
///
/// Windows are truncated at the array border, so edge elements average
/// fewer samples. Output is `float32` with the input's shape. A read of
/// region `R` fetches `R` grown by the radius on every spatial axis.
#[derive(Debug, Default)]
pub struct OpBoxFilter {
    halo: Vec<usize>,
}

impl OpBoxFilter {
    /// Source array.
    pub const INPUT: InputId = InputId(0);
    /// Box radius (default 1).
    pub const RADIUS: InputId = InputId(1);
    /// Smoothed array.
    pub const OUTPUT: OutputId = OutputId(0);

    /// Create an unconfigured filter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Per-axis margin read around each requested region.
    pub fn halo(&self) -> &[usize] {
        &self.halo
    }
}

impl Operator for OpBoxFilter {
    fn name(&self) -> &'static str {
        "OpBoxFilter"
    }

    fn inputs(&self) -> Vec<SlotSpec> {
        vec![
            SlotSpec::array("Input"),
            SlotSpec::value("Radius").with_default(1i64),
        ]
    }

    fn outputs(&self) -> Vec<SlotSpec> {
        vec![SlotSpec::array("Output")]
    }

    fn setup_outputs(&mut self, ctx: &mut SetupContext<'_>) -> Result<()> {
        let meta = ctx.input_meta(Self::INPUT)?;
        let radius = ctx.input_value(Self::RADIUS)?.as_int()?;
        let radius = usize::try_from(radius).map_err(|_| {
            LazyflowError::incompatible(
                ctx.input(Self::RADIUS).qualified_name(),
                format!("radius must not be negative, got {radius}"),
            )
        })?;
        self.halo = meta
            .axes
            .iter()
            .map(|axis| if axis.is_spatial() { radius } else { 0 })
            .collect();

        let mut output = Meta::array(meta.shape.clone(), DType::F32).with_axes(meta.axes);
        output.block_hints = meta.block_hints;
        ctx.set_output_meta(Self::OUTPUT, output);
        Ok(())
    }

    fn execute(
        &self,
        ctx: &OperatorContext<'_>,
        _output: OutputId,
        roi: &Roi,
        result: &mut Value,
    ) -> Result<()> {
        let input = ctx.input(Self::INPUT);
        let shape = input
            .meta()
            .ok_or_else(|| LazyflowError::not_ready(input.qualified_name()))?
            .shape;
        let extended = roi.extend_by_halo(&self.halo, &shape);
        let mut data = ctx.read(Self::INPUT, &extended)?.cast::<f32>();
        ctx.check_cancelled()?;

        for (axis, &radius) in self.halo.iter().enumerate() {
            if radius > 0 {
                data = box_mean_along(&data, axis, radius);
            }
        }

        let inner = roi.relative_to(extended.start());
        let smoothed = data.slice(inner.slicing().as_slice()).to_owned();
        *result = Buffer::from(smoothed).into();
        Ok(())
    }

    fn dirty_propagation(&self, input: InputId) -> DirtyPropagation {
        match input {
            Self::INPUT => DirtyPropagation::Halo(self.halo.clone()),
            _ => DirtyPropagation::WholeOutput,
        }
    }
}

/// One separable pass: each lane along `axis` is replaced by its running
/// mean over `[i - radius, i + radius]`, truncated to the lane.
fn box_mean_along(data: &ArrayD<f32>, axis: usize, radius: usize) -> ArrayD<f32> {
    let mut out = ArrayD::<f32>::zeros(data.raw_dim());
    let mut prefix = Vec::with_capacity(data.shape()[axis] + 1);
    for (src, mut dst) in data
        .lanes(NdAxis(axis))
        .into_iter()
        .zip(out.lanes_mut(NdAxis(axis)))
    {
        prefix.clear();
        prefix.push(0.0f64);
        let mut acc = 0.0f64;
        for &v in &src {
            acc += f64::from(v);
            prefix.push(acc);
        }
        let n = src.len();
        for (i, d) in dst.iter_mut().enumerate() {
            let lo = i.saturating_sub(radius);
            let hi = (i + radius + 1).min(n);
            *d = ((prefix[hi] - prefix[lo]) / (hi - lo) as f64) as f32;
        }
    }
    out
}

/// Binary mask: 1 where the input exceeds `Threshold`, else 0.
#[derive(Debug, Default)]
pub struct OpThreshold {
    threshold: f64,
}

impl OpThreshold {
    /// Source array.
    pub const INPUT: InputId = InputId(0);
    /// Cut-off (default 0.5).
    pub const THRESHOLD: InputId = InputId(1);
    /// `uint8` mask.
    pub const OUTPUT: OutputId = OutputId(0);

    /// Create an unconfigured operator.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Operator for OpThreshold {
    fn name(&self) -> &'static str {
        "OpThreshold"
    }

    fn inputs(&self) -> Vec<SlotSpec> {
        vec![
            SlotSpec::array("Input"),
            SlotSpec::value("Threshold").with_default(0.5),
        ]
    }

    fn outputs(&self) -> Vec<SlotSpec> {
        vec![SlotSpec::array("Output")]
    }

    fn setup_outputs(&mut self, ctx: &mut SetupContext<'_>) -> Result<()> {
        let meta = ctx.input_meta(Self::INPUT)?;
        self.threshold = ctx.input_value(Self::THRESHOLD)?.as_float()?;
        let mut output = meta;
        output.dtype = DType::U8;
        ctx.set_output_meta(Self::OUTPUT, output);
        Ok(())
    }

    fn execute(
        &self,
        ctx: &OperatorContext<'_>,
        _output: OutputId,
        roi: &Roi,
        result: &mut Value,
    ) -> Result<()> {
        let data = ctx.read(Self::INPUT, roi)?.cast::<f64>();
        let mask = data.mapv(|v| u8::from(v > self.threshold));
        *result = Buffer::from(mask).into();
        Ok(())
    }

    fn dirty_propagation(&self, input: InputId) -> DirtyPropagation {
        match input {
            Self::INPUT => DirtyPropagation::Identity,
            _ => DirtyPropagation::WholeOutput,
        }
    }
}

/// Subtracts the global mean of its input.
///
/// Every output element depends on every input element, so any input dirt
/// dirties the whole output. The mean is computed on first use after each
/// configuration or input change and shared by all later reads.
#[derive(Debug, Default)]
pub struct OpNormalize {
    mean: Mutex<Option<f64>>,
    computations: AtomicU64,
}

impl OpNormalize {
    /// Source array.
    pub const INPUT: InputId = InputId(0);
    /// `float64`, zero mean.
    pub const OUTPUT: OutputId = OutputId(0);

    /// Create an unconfigured operator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of times the mean was computed.
    pub fn mean_computations(&self) -> u64 {
        self.computations.load(Ordering::Relaxed)
    }

    fn mean(&self, ctx: &OperatorContext<'_>) -> Result<f64> {
        let mut mean = self.mean.lock();
        if let Some(m) = *mean {
            return Ok(m);
        }
        let input = ctx.input(Self::INPUT);
        let whole = input.value()?.into_buffer()?.cast::<f64>();
        let m = whole.mean().unwrap_or(0.0);
        self.computations.fetch_add(1, Ordering::Relaxed);
        tracing::debug!("normalize_mean: {} = {m}", input.qualified_name());
        *mean = Some(m);
        Ok(m)
    }
}

impl Operator for OpNormalize {
    fn name(&self) -> &'static str {
        "OpNormalize"
    }

    fn inputs(&self) -> Vec<SlotSpec> {
        vec![SlotSpec::array("Input")]
    }

    fn outputs(&self) -> Vec<SlotSpec> {
        vec![SlotSpec::array("Output")]
    }

    fn setup_outputs(&mut self, ctx: &mut SetupContext<'_>) -> Result<()> {
        let mut output = ctx.input_meta(Self::INPUT)?;
        output.dtype = DType::F64;
        ctx.set_output_meta(Self::OUTPUT, output);
        *self.mean.get_mut() = None;
        Ok(())
    }

    fn execute(
        &self,
        ctx: &OperatorContext<'_>,
        _output: OutputId,
        roi: &Roi,
        result: &mut Value,
    ) -> Result<()> {
        let mean = self.mean(ctx)?;
        let data = ctx.read(Self::INPUT, roi)?.cast::<f64>();
        *result = Buffer::from(data - mean).into();
        Ok(())
    }

    fn propagate_dirty(&self, ctx: &OperatorContext<'_>, _input: InputId, _roi: &Roi) {
        *self.mean.lock() = None;
        ctx.output(Self::OUTPUT).set_dirty_all();
    }
}
