//! Composite operators: a box filter in front of a block cache.

use lazyflow_core::{
    DirtyPropagation, InputId, LazyflowError, OpBlockedArrayCache, Operator, OperatorContext,
    OperatorHandle, OutputId, Result, Roi, SetupContext, SlotSpec, Value,
};

use crate::filter::OpBoxFilter;

/// [`OpBoxFilter`] whose output is kept in an [`OpBlockedArrayCache`].
///
/// Every slot is forwarded to the children; the composite itself never
/// executes.
///
/// ```text
/// Input ──┐
/// Radius ─┴─▶ OpBoxFilter ──▶ OpBlockedArrayCache ──▶ Output
///                BlockShape ─┘      FixAtCurrent ─┘  └──▶ CleanBlocks
/// ```
#[derive(Debug, Default)]
pub struct OpCachedBoxFilter {
    filter: Option<OperatorHandle>,
    cache: Option<OperatorHandle>,
}

impl OpCachedBoxFilter {
    /// Source array.
    pub const INPUT: InputId = InputId(0);
    /// Box radius (default 1).
    pub const RADIUS: InputId = InputId(1);
    /// Cache block shape (optional).
    pub const BLOCK_SHAPE: InputId = InputId(2);
    /// Freeze the cache (default `false`).
    pub const FIX_AT_CURRENT: InputId = InputId(3);
    /// Smoothed, cached array.
    pub const OUTPUT: OutputId = OutputId(0);
    /// Fully valid cache blocks.
    pub const CLEAN_BLOCKS: OutputId = OutputId(1);

    /// Create the composite; children are built when it joins a graph.
    pub fn new() -> Self {
        Self::default()
    }

    /// The inner filter.
    pub fn filter(&self) -> Option<&OperatorHandle> {
        self.filter.as_ref()
    }

    /// The inner cache.
    pub fn cache(&self) -> Option<&OperatorHandle> {
        self.cache.as_ref()
    }
}

impl Operator for OpCachedBoxFilter {
    fn name(&self) -> &'static str {
        "OpCachedBoxFilter"
    }

    fn inputs(&self) -> Vec<SlotSpec> {
        vec![
            SlotSpec::array("Input"),
            SlotSpec::value("Radius").with_default(1i64),
            SlotSpec::value("BlockShape").optional(),
            SlotSpec::value("FixAtCurrent").with_default(false),
        ]
    }

    fn outputs(&self) -> Vec<SlotSpec> {
        vec![SlotSpec::array("Output"), SlotSpec::value("CleanBlocks")]
    }

    fn init(&mut self, ctx: &OperatorContext<'_>) -> Result<()> {
        let filter = ctx.add_child(OpBoxFilter::new())?;
        let cache = ctx.add_child(OpBlockedArrayCache::new())?;

        filter
            .input(OpBoxFilter::INPUT)
            .connect(ctx.input(Self::INPUT))?;
        filter
            .input(OpBoxFilter::RADIUS)
            .connect(ctx.input(Self::RADIUS))?;
        cache
            .input(OpBlockedArrayCache::INPUT)
            .connect(filter.output(OpBoxFilter::OUTPUT))?;
        cache
            .input(OpBlockedArrayCache::BLOCK_SHAPE)
            .connect(ctx.input(Self::BLOCK_SHAPE))?;
        cache
            .input(OpBlockedArrayCache::FIX_AT_CURRENT)
            .connect(ctx.input(Self::FIX_AT_CURRENT))?;

        ctx.output(Self::OUTPUT)
            .connect(cache.output(OpBlockedArrayCache::OUTPUT))?;
        ctx.output(Self::CLEAN_BLOCKS)
            .connect(cache.output(OpBlockedArrayCache::CLEAN_BLOCKS))?;

        self.filter = Some(filter);
        self.cache = Some(cache);
        Ok(())
    }

    fn setup_outputs(&mut self, _ctx: &mut SetupContext<'_>) -> Result<()> {
        Ok(())
    }

    fn execute(
        &self,
        _ctx: &OperatorContext<'_>,
        _output: OutputId,
        _roi: &Roi,
        _result: &mut Value,
    ) -> Result<()> {
        Err(LazyflowError::unsupported(self.name(), "executing forwarded outputs"))
    }

    fn dirty_propagation(&self, _input: InputId) -> DirtyPropagation {
        DirtyPropagation::Ignore
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lazyflow_core::{Buffer, CacheStats, Graph, GraphConfig};
    use ndarray::{ArrayD, IxDyn};

    fn build(graph: &Graph) -> OperatorHandle {
        let op = graph.add(OpCachedBoxFilter::new()).unwrap();
        let data: Buffer = ArrayD::from_shape_vec(IxDyn(&[12, 12]), (0..144u32).collect())
            .unwrap()
            .into();
        op.input(OpCachedBoxFilter::INPUT).set_value(data).unwrap();
        op.input(OpCachedBoxFilter::BLOCK_SHAPE)
            .set_value(vec![6, 6])
            .unwrap();
        op
    }

    fn stats(op: &OperatorHandle) -> CacheStats {
        let cache = op
            .with_op(|c: &OpCachedBoxFilter| c.cache().cloned())
            .flatten()
            .unwrap();
        cache.with_op(|c: &OpBlockedArrayCache| c.stats()).unwrap()
    }

    #[test]
    fn children_are_owned() {
        let graph = Graph::new(GraphConfig::synchronous());
        let op = build(&graph);
        let children = op.children();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].name(), "OpBoxFilter");
        assert_eq!(children[1].name(), "OpBlockedArrayCache");
        assert_eq!(children[1].parent(), Some(op.clone()));
    }

    #[test]
    fn output_is_cached() {
        let graph = Graph::new(GraphConfig::synchronous());
        let op = build(&graph);
        let output = op.output(OpCachedBoxFilter::OUTPUT);
        let meta = output.meta().unwrap();
        assert_eq!(meta.shape, vec![12, 12]);
        assert_eq!(meta.block_hints.ideal, Some(vec![6, 6]));

        let first = output.get_slicing("[0:3,0:3]").unwrap().wait().unwrap();
        let second = output.get_slicing("[1:4,1:4]").unwrap().wait().unwrap();
        assert_ne!(first, second);
        assert_eq!(stats(&op).fetches, 1);
        assert_eq!(stats(&op).hits, 1);

        let clean = op.output(OpCachedBoxFilter::CLEAN_BLOCKS).value().unwrap();
        assert_eq!(clean.as_rois().unwrap(), &["[0:6,0:6]".parse::<Roi>().unwrap()]);
    }

    #[test]
    fn radius_change_invalidates_cache() {
        let graph = Graph::new(GraphConfig::synchronous());
        let op = build(&graph);
        let output = op.output(OpCachedBoxFilter::OUTPUT);
        let before = output.get_slicing("[0:6,0:6]").unwrap().wait().unwrap();

        op.input(OpCachedBoxFilter::RADIUS).set_value(0i64).unwrap();
        let after = output
            .get_slicing("[0:6,0:6]")
            .unwrap()
            .wait()
            .unwrap()
            .into_buffer()
            .unwrap();
        assert_ne!(before, Value::Array(after.clone()));
        assert_eq!(after.view::<f32>().unwrap()[[2, 3]], 27.0);
        assert_eq!(stats(&op).fetches, 2);
    }

    #[test]
    fn frozen_cache_keeps_old_results() {
        let graph = Graph::new(GraphConfig::synchronous());
        let op = build(&graph);
        let output = op.output(OpCachedBoxFilter::OUTPUT);
        let before = output.get_slicing("[0:6,0:6]").unwrap().wait().unwrap();

        op.input(OpCachedBoxFilter::FIX_AT_CURRENT)
            .set_value(true)
            .unwrap();
        op.input(OpCachedBoxFilter::RADIUS).set_value(3i64).unwrap();
        assert_eq!(output.get_slicing("[0:6,0:6]").unwrap().wait().unwrap(), before);

        op.input(OpCachedBoxFilter::FIX_AT_CURRENT)
            .set_value(false)
            .unwrap();
        assert_ne!(output.get_slicing("[0:6,0:6]").unwrap().wait().unwrap(), before);
    }
}
