//! Parameter-driven array sources.
//!
//! Neither operator has array inputs: shape and dtype come from value slots,
//! and any parameter change dirties the whole output.

use lazyflow_core::{
    ArcArrayD, Buffer, DType, DirtyPropagation, InputId, LazyflowError, Meta, Operator,
    OperatorContext, OutputId, Result, Roi, SetupContext, SlotSpec, Value,
};
use ndarray::{ArrayD, Dimension, IxDyn};

fn parse_dtype(ctx: &SetupContext<'_>, id: InputId) -> Result<DType> {
    let dtype: DType = ctx.input_value(id)?.as_text()?.parse()?;
    if dtype == DType::Object {
        return Err(LazyflowError::incompatible(
            ctx.input(id).qualified_name(),
            "sources produce numeric arrays",
        ));
    }
    Ok(dtype)
}

/// An array filled with one value.
///
/// ## Slot Indices
///
/// | Slot | Kind | Default |
/// |------|------|---------|
/// | `Shape` (in 0) | shape | required |
/// | `DType` (in 1) | text | `"uint8"` |
/// | `Fill` (in 2) | float | `0.0` |
/// | `Output` (out 0) | array | |
#[derive(Debug)]
pub struct OpConstant {
    dtype: DType,
    fill: f64,
}

impl Default for OpConstant {
    fn default() -> Self {
        Self::new()
    }
}

impl OpConstant {
    /// Array shape.
    pub const SHAPE: InputId = InputId(0);
    /// Element type name (`uint8`, `float32`, ...).
    pub const DTYPE: InputId = InputId(1);
    /// Fill value, converted to the element type.
    pub const FILL: InputId = InputId(2);
    /// The constant array.
    pub const OUTPUT: OutputId = OutputId(0);

    /// Create an unconfigured source.
    pub fn new() -> Self {
        Self {
            dtype: DType::U8,
            fill: 0.0,
        }
    }
}

impl Operator for OpConstant {
    fn name(&self) -> &'static str {
        "OpConstant"
    }

    fn inputs(&self) -> Vec<SlotSpec> {
        vec![
            SlotSpec::value("Shape"),
            SlotSpec::value("DType").with_default("uint8"),
            SlotSpec::value("Fill").with_default(0.0),
        ]
    }

    fn outputs(&self) -> Vec<SlotSpec> {
        vec![SlotSpec::array("Output")]
    }

    fn setup_outputs(&mut self, ctx: &mut SetupContext<'_>) -> Result<()> {
        let shape = ctx.input_value(Self::SHAPE)?.as_shape()?.to_vec();
        self.dtype = parse_dtype(ctx, Self::DTYPE)?;
        self.fill = ctx.input_value(Self::FILL)?.as_float()?;
        ctx.set_output_meta(Self::OUTPUT, Meta::array(shape, self.dtype));
        Ok(())
    }

    fn execute(
        &self,
        _ctx: &OperatorContext<'_>,
        _output: OutputId,
        roi: &Roi,
        result: &mut Value,
    ) -> Result<()> {
        // Results arrive zero-filled.
        if self.fill != 0.0 {
            let filled = ArcArrayD::from_elem(IxDyn(&roi.shape()), self.fill);
            *result = Buffer::from_cast(self.dtype, &filled)?.into();
        }
        Ok(())
    }

    fn dirty_propagation(&self, _input: InputId) -> DirtyPropagation {
        DirtyPropagation::WholeOutput
    }
}

/// An array whose every element holds its own flat (row-major) index.
///
/// Values beyond the range of the chosen dtype come out as zero.
#[derive(Debug)]
pub struct OpArange {
    dtype: DType,
    strides: Vec<usize>,
}

impl Default for OpArange {
    fn default() -> Self {
        Self::new()
    }
}

impl OpArange {
    /// Array shape.
    pub const SHAPE: InputId = InputId(0);
    /// Element type name, default `uint32`.
    pub const DTYPE: InputId = InputId(1);
    /// The index array.
    pub const OUTPUT: OutputId = OutputId(0);

    /// Create an unconfigured source.
    pub fn new() -> Self {
        Self {
            dtype: DType::U32,
            strides: Vec::new(),
        }
    }
}

impl Operator for OpArange {
    fn name(&self) -> &'static str {
        "OpArange"
    }

    fn inputs(&self) -> Vec<SlotSpec> {
        vec![
            SlotSpec::value("Shape"),
            SlotSpec::value("DType").with_default("uint32"),
        ]
    }

    fn outputs(&self) -> Vec<SlotSpec> {
        vec![SlotSpec::array("Output")]
    }

    fn setup_outputs(&mut self, ctx: &mut SetupContext<'_>) -> Result<()> {
        let shape = ctx.input_value(Self::SHAPE)?.as_shape()?.to_vec();
        self.dtype = parse_dtype(ctx, Self::DTYPE)?;
        let mut strides = vec![1; shape.len()];
        for i in (0..shape.len().saturating_sub(1)).rev() {
            strides[i] = strides[i + 1] * shape[i + 1];
        }
        self.strides = strides;
        ctx.set_output_meta(Self::OUTPUT, Meta::array(shape, self.dtype));
        Ok(())
    }

    fn execute(
        &self,
        _ctx: &OperatorContext<'_>,
        _output: OutputId,
        roi: &Roi,
        result: &mut Value,
    ) -> Result<()> {
        let start = roi.start();
        let flat = ArrayD::from_shape_fn(IxDyn(&roi.shape()), |index: IxDyn| {
            index
                .slice()
                .iter()
                .zip(start)
                .zip(&self.strides)
                .map(|((&i, &s), &stride)| ((i + s) * stride) as u64)
                .sum::<u64>()
        });
        *result = Buffer::from_cast(self.dtype, &flat.into_shared())?.into();
        Ok(())
    }

    fn dirty_propagation(&self, _input: InputId) -> DirtyPropagation {
        DirtyPropagation::WholeOutput
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lazyflow_core::{Graph, GraphConfig, OperatorHandle};

    fn read(op: &OperatorHandle, slicing: &str) -> Buffer {
        op.output(OutputId(0))
            .get_slicing(slicing)
            .unwrap()
            .wait()
            .unwrap()
            .into_buffer()
            .unwrap()
    }

    #[test]
    fn constant_fills_with_value() {
        let graph = Graph::new(GraphConfig::synchronous());
        let op = graph.add(OpConstant::new()).unwrap();
        op.input(OpConstant::SHAPE).set_value(vec![4, 4]).unwrap();
        op.input(OpConstant::DTYPE).set_value("float32").unwrap();
        op.input(OpConstant::FILL).set_value(2.5).unwrap();

        let out = read(&op, "[1:3,0:4]");
        assert_eq!(out.dtype(), DType::F32);
        assert!(out.view::<f32>().unwrap().iter().all(|&v| v == 2.5));
    }

    #[test]
    fn constant_defaults_to_zero_u8() {
        let graph = Graph::new(GraphConfig::synchronous());
        let op = graph.add(OpConstant::new()).unwrap();
        op.input(OpConstant::SHAPE).set_value(vec![3]).unwrap();

        let out = read(&op, "[0:3]");
        assert_eq!(out, Buffer::zeros(DType::U8, &[3]).unwrap());
    }

    #[test]
    fn unknown_dtype_leaves_output_unready() {
        let graph = Graph::new(GraphConfig::synchronous());
        let op = graph.add(OpConstant::new()).unwrap();
        op.input(OpConstant::SHAPE).set_value(vec![3]).unwrap();
        op.input(OpConstant::DTYPE).set_value("complex128").unwrap();
        assert!(!op.output(OpConstant::OUTPUT).is_ready());
    }

    #[test]
    fn arange_holds_flat_index() {
        let graph = Graph::new(GraphConfig::synchronous());
        let op = graph.add(OpArange::new()).unwrap();
        op.input(OpArange::SHAPE).set_value(vec![5, 7]).unwrap();

        let out = read(&op, "[2:4,3:6]");
        let view = out.view::<u32>().unwrap();
        assert_eq!(view[[0, 0]], 2 * 7 + 3);
        assert_eq!(view[[1, 2]], 3 * 7 + 5);
    }

    #[test]
    fn arange_shape_change_dirties_everything() {
        let graph = Graph::new(GraphConfig::synchronous());
        let op = graph.add(OpArange::new()).unwrap();
        op.input(OpArange::SHAPE).set_value(vec![2, 2]).unwrap();

        let seen = std::sync::Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = std::sync::Arc::clone(&seen);
        op.output(OpArange::OUTPUT)
            .notify_dirty(move |_, roi| sink.lock().push(roi.clone()));
        op.input(OpArange::SHAPE).set_value(vec![3, 3]).unwrap();

        assert_eq!(seen.lock().last(), Some(&Roi::from_shape(&[3, 3])));
        assert_eq!(read(&op, "[2:3,2:3]").view::<u32>().unwrap()[[0, 0]], 8);
    }
}
