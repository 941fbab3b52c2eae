//! Operators that change the geometry of their input.
//!
//! Both map output regions onto input regions before reading, and map input
//! dirt back into output coordinates instead of dirtying everything.

use lazyflow_core::{
    Axis, InputId, LazyflowError, Meta, Operator, OperatorContext, OutputId, Result, Roi,
    SetupContext, SlotSpec, Value,
};

/// A fixed box cut out of the input.
///
/// `Start` and `Stop` are shapes giving the half-open box in input
/// coordinates; the output has shape `Stop - Start`.
#[derive(Debug, Default)]
pub struct OpSubRegion {
    region: Option<Roi>,
}

impl OpSubRegion {
    /// Source array.
    pub const INPUT: InputId = InputId(0);
    /// First element of the box.
    pub const START: InputId = InputId(1);
    /// One past the last element of the box.
    pub const STOP: InputId = InputId(2);
    /// The box.
    pub const OUTPUT: OutputId = OutputId(0);

    /// Create an unconfigured operator.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Operator for OpSubRegion {
    fn name(&self) -> &'static str {
        "OpSubRegion"
    }

    fn inputs(&self) -> Vec<SlotSpec> {
        vec![
            SlotSpec::array("Input"),
            SlotSpec::value("Start"),
            SlotSpec::value("Stop"),
        ]
    }

    fn outputs(&self) -> Vec<SlotSpec> {
        vec![SlotSpec::array("Output")]
    }

    fn setup_outputs(&mut self, ctx: &mut SetupContext<'_>) -> Result<()> {
        let meta = ctx.input_meta(Self::INPUT)?;
        let start = ctx.input_value(Self::START)?.as_shape()?.to_vec();
        let stop = ctx.input_value(Self::STOP)?.as_shape()?.to_vec();
        let region = Roi::new(start, stop)?;
        if !region.fits(&meta.shape) {
            return Err(LazyflowError::incompatible(
                ctx.input(Self::STOP).qualified_name(),
                format!("region {region} lies outside input of shape {:?}", meta.shape),
            ));
        }
        let mut output = Meta::array(region.shape(), meta.dtype).with_axes(meta.axes.clone());
        output.block_hints = meta.block_hints.clone();
        ctx.set_output_meta(Self::OUTPUT, output);
        self.region = Some(region);
        Ok(())
    }

    fn execute(
        &self,
        ctx: &OperatorContext<'_>,
        _output: OutputId,
        roi: &Roi,
        result: &mut Value,
    ) -> Result<()> {
        let region = self
            .region
            .as_ref()
            .ok_or_else(|| LazyflowError::not_ready(ctx.output(Self::OUTPUT).qualified_name()))?;
        *result = ctx.read(Self::INPUT, &roi.translate(region.start()))?.into();
        Ok(())
    }

    fn propagate_dirty(&self, ctx: &OperatorContext<'_>, input: InputId, roi: &Roi) {
        let output = ctx.output(Self::OUTPUT);
        match (input, &self.region) {
            (Self::INPUT, Some(region)) if roi.ndim() == region.ndim() => {
                let overlap = roi.intersect(region);
                if !overlap.is_empty() {
                    output.set_dirty(&overlap.relative_to(region.start()));
                }
            }
            _ => output.set_dirty_all(),
        }
    }
}

/// Selects one channel, keeping the channel axis with extent 1.
///
/// The channel axis is the one tagged `c`, or the last axis if none is.
#[derive(Debug, Default)]
pub struct OpChannelSelector {
    axis: usize,
    channel: usize,
}

impl OpChannelSelector {
    /// Multi-channel source.
    pub const INPUT: InputId = InputId(0);
    /// Channel to select (default 0).
    pub const CHANNEL: InputId = InputId(1);
    /// The selected channel.
    pub const OUTPUT: OutputId = OutputId(0);

    /// Create an unconfigured operator.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Operator for OpChannelSelector {
    fn name(&self) -> &'static str {
        "OpChannelSelector"
    }

    fn inputs(&self) -> Vec<SlotSpec> {
        vec![
            SlotSpec::array("Input"),
            SlotSpec::value("Channel").with_default(0i64),
        ]
    }

    fn outputs(&self) -> Vec<SlotSpec> {
        vec![SlotSpec::array("Output")]
    }

    fn setup_outputs(&mut self, ctx: &mut SetupContext<'_>) -> Result<()> {
        let meta = ctx.input_meta(Self::INPUT)?;
        if meta.shape.is_empty() {
            return Err(LazyflowError::incompatible(
                ctx.input(Self::INPUT).qualified_name(),
                "a channel needs at least one axis",
            ));
        }
        let axis = meta
            .axes
            .index_of(Axis::C)
            .unwrap_or(meta.shape.len() - 1);
        let channel = ctx.input_value(Self::CHANNEL)?.as_int()?;
        let channel = usize::try_from(channel)
            .ok()
            .filter(|&c| c < meta.shape[axis])
            .ok_or_else(|| {
                LazyflowError::incompatible(
                    ctx.input(Self::CHANNEL).qualified_name(),
                    format!("channel {channel} outside 0..{}", meta.shape[axis]),
                )
            })?;

        let mut output = meta;
        output.shape[axis] = 1;
        if let Some(ideal) = output.block_hints.ideal.as_mut() {
            if let Some(extent) = ideal.get_mut(axis) {
                *extent = 1;
            }
        }
        output.block_hints.max = None;
        ctx.set_output_meta(Self::OUTPUT, output);
        self.axis = axis;
        self.channel = channel;
        Ok(())
    }

    fn execute(
        &self,
        ctx: &OperatorContext<'_>,
        _output: OutputId,
        roi: &Roi,
        result: &mut Value,
    ) -> Result<()> {
        let source = roi.with_axis(self.axis, self.channel..self.channel + 1);
        *result = ctx.read(Self::INPUT, &source)?.into();
        Ok(())
    }

    fn propagate_dirty(&self, ctx: &OperatorContext<'_>, input: InputId, roi: &Roi) {
        let output = ctx.output(Self::OUTPUT);
        if input != Self::INPUT || roi.ndim() <= self.axis {
            output.set_dirty_all();
            return;
        }
        let channels = roi.start()[self.axis]..roi.stop()[self.axis];
        if channels.contains(&self.channel) {
            output.set_dirty(&roi.with_axis(self.axis, 0..1));
        }
    }
}
