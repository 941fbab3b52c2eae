//! Identity operator.

use lazyflow_core::{
    InputId, Operator, OperatorContext, OutputId, Result, Roi, SetupContext, SlotSpec, Value,
};

/// Passes its input through unchanged.
///
/// Useful as an explicit junction: downstream operators connect to the
/// piper, and the piper's input can be rewired without touching them.
#[derive(Debug, Default)]
pub struct OpArrayPiper;

impl OpArrayPiper {
    /// Data to pass on.
    pub const INPUT: InputId = InputId(0);
    /// Same data.
    pub const OUTPUT: OutputId = OutputId(0);

    /// Create a piper.
    pub fn new() -> Self {
        Self
    }
}

impl Operator for OpArrayPiper {
    fn name(&self) -> &'static str {
        "OpArrayPiper"
    }

    fn inputs(&self) -> Vec<SlotSpec> {
        vec![SlotSpec::array("Input")]
    }

    fn outputs(&self) -> Vec<SlotSpec> {
        vec![SlotSpec::array("Output")]
    }

    fn setup_outputs(&mut self, ctx: &mut SetupContext<'_>) -> Result<()> {
        ctx.copy_meta(Self::INPUT, Self::OUTPUT)?;
        Ok(())
    }

    fn execute(
        &self,
        ctx: &OperatorContext<'_>,
        _output: OutputId,
        roi: &Roi,
        result: &mut Value,
    ) -> Result<()> {
        *result = ctx.read(Self::INPUT, roi)?.into();
        Ok(())
    }
}
