//! Integration tests for lazyflow-operators.
//!
//! Pipelines mixing sources, geometry operators, filters and caches, plus
//! the label editing workflow end to end.

use std::sync::Arc;

use lazyflow_core::{
    Buffer, CacheStats, Graph, GraphConfig, OpBlockedArrayCache, OperatorHandle, Roi, Value,
};
use lazyflow_operators::{
    OpArange, OpArrayPiper, OpCachedBoxFilter, OpChannelSelector, OpConstant, OpLabelArray,
    OpNormalize, OpSubRegion, OpThreshold, StoredBlock, export_blocks, import_blocks,
};
use ndarray::{ArrayD, IxDyn};
use parking_lot::Mutex;

fn roi(s: &str) -> Roi {
    s.parse().unwrap()
}

fn read(slot: &lazyflow_core::Slot, slicing: &str) -> Buffer {
    slot.get_slicing(slicing)
        .unwrap()
        .wait()
        .unwrap()
        .into_buffer()
        .unwrap()
}

fn arange(graph: &Graph, shape: &[usize], dtype: &str) -> OperatorHandle {
    let op = graph.add(OpArange::new()).unwrap();
    op.input(OpArange::SHAPE).set_value(shape.to_vec()).unwrap();
    op.input(OpArange::DTYPE).set_value(dtype).unwrap();
    op
}

fn cache_stats(filter: &OperatorHandle) -> CacheStats {
    let cache = filter
        .with_op(|f: &OpCachedBoxFilter| f.cache().cloned())
        .flatten()
        .unwrap();
    cache.with_op(|c: &OpBlockedArrayCache| c.stats()).unwrap()
}

// ============================================================================
// Pipelines
// ============================================================================

#[test]
fn sub_region_of_cached_filter() {
    let graph = Graph::new(GraphConfig::default().with_threads(2));
    let source = arange(&graph, &[40, 40], "float32");
    let smooth = graph.add(OpCachedBoxFilter::new()).unwrap();
    smooth
        .input(OpCachedBoxFilter::INPUT)
        .connect(source.output(OpArange::OUTPUT))
        .unwrap();
    smooth
        .input(OpCachedBoxFilter::BLOCK_SHAPE)
        .set_value(vec![16, 16])
        .unwrap();

    let cut = graph.add(OpSubRegion::new()).unwrap();
    cut.input(OpSubRegion::INPUT)
        .connect(smooth.output(OpCachedBoxFilter::OUTPUT))
        .unwrap();
    cut.input(OpSubRegion::START).set_value(vec![10, 10]).unwrap();
    cut.input(OpSubRegion::STOP).set_value(vec![20, 20]).unwrap();

    // Interior of a linear ramp: the box mean equals the centre value.
    let out = read(cut.output(OpSubRegion::OUTPUT), "[0:10,0:10]");
    let view = out.view::<f32>().unwrap();
    for i in 0..10 {
        for j in 0..10 {
            let expected = ((i + 10) * 40 + j + 10) as f32;
            assert!((view[[i, j]] - expected).abs() < 1e-2);
        }
    }
    // [10:20] touches blocks 0 and 1 on each axis.
    assert_eq!(cache_stats(&smooth).fetches, 4);

    read(cut.output(OpSubRegion::OUTPUT), "[0:10,0:10]");
    assert_eq!(cache_stats(&smooth).fetches, 4);
}

#[test]
fn dirt_travels_through_remapping_operators() {
    let graph = Graph::new(GraphConfig::synchronous());
    let image = graph.add(OpArrayPiper::new()).unwrap();
    let data: Buffer = ArrayD::from_elem(IxDyn(&[8, 8, 2]), 1.0f32).into();
    image.input(OpArrayPiper::INPUT).set_value(data).unwrap();

    let channel = graph.add(OpChannelSelector::new()).unwrap();
    channel
        .input(OpChannelSelector::INPUT)
        .connect(image.output(OpArrayPiper::OUTPUT))
        .unwrap();
    channel.input(OpChannelSelector::CHANNEL).set_value(1i64).unwrap();
    let cut = graph.add(OpSubRegion::new()).unwrap();
    cut.input(OpSubRegion::INPUT)
        .connect(channel.output(OpChannelSelector::OUTPUT))
        .unwrap();
    cut.input(OpSubRegion::START).set_value(vec![4, 0, 0]).unwrap();
    cut.input(OpSubRegion::STOP).set_value(vec![8, 4, 1]).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    cut.output(OpSubRegion::OUTPUT)
        .notify_dirty(move |_, r| sink.lock().push(r.clone()));

    let patch: Buffer = ArrayD::from_elem(IxDyn(&[2, 2, 2]), 5.0f32).into();
    image
        .input(OpArrayPiper::INPUT)
        .write(&roi("[5:7,1:3,0:2]"), patch.into())
        .unwrap();
    assert_eq!(*seen.lock(), vec![roi("[1:3,1:3,0:1]")]);
    let out = read(cut.output(OpSubRegion::OUTPUT), "[1:2,1:2,0:1]");
    assert_eq!(out.view::<f32>().unwrap()[[0, 0, 0]], 5.0);
}

#[test]
fn normalized_threshold_splits_ramp() {
    let graph = Graph::new(GraphConfig::synchronous());
    let source = arange(&graph, &[10], "float64");
    let norm = graph.add(OpNormalize::new()).unwrap();
    norm.input(OpNormalize::INPUT)
        .connect(source.output(OpArange::OUTPUT))
        .unwrap();
    let mask = graph.add(OpThreshold::new()).unwrap();
    mask.input(OpThreshold::INPUT)
        .connect(norm.output(OpNormalize::OUTPUT))
        .unwrap();
    mask.input(OpThreshold::THRESHOLD).set_value(0.0).unwrap();

    let out = read(mask.output(OpThreshold::OUTPUT), "[0:10]");
    assert_eq!(
        out.view::<u8>().unwrap().iter().copied().collect::<Vec<u8>>(),
        vec![0, 0, 0, 0, 0, 1, 1, 1, 1, 1]
    );
}

#[test]
fn constant_fill_change_reaches_cache_reader() {
    let graph = Graph::new(GraphConfig::synchronous());
    let constant = graph.add(OpConstant::new()).unwrap();
    constant.input(OpConstant::SHAPE).set_value(vec![6, 6]).unwrap();
    constant.input(OpConstant::FILL).set_value(3.0).unwrap();
    let smooth = graph.add(OpCachedBoxFilter::new()).unwrap();
    smooth
        .input(OpCachedBoxFilter::INPUT)
        .connect(constant.output(OpConstant::OUTPUT))
        .unwrap();

    let out = read(smooth.output(OpCachedBoxFilter::OUTPUT), "[0:6,0:6]");
    assert!(out.view::<f32>().unwrap().iter().all(|&v| (v - 3.0).abs() < 1e-6));

    constant.input(OpConstant::FILL).set_value(8.0).unwrap();
    let out = read(smooth.output(OpCachedBoxFilter::OUTPUT), "[0:6,0:6]");
    assert!(out.view::<f32>().unwrap().iter().all(|&v| (v - 8.0).abs() < 1e-6));
}

// ============================================================================
// Labels
// ============================================================================

fn label_array(graph: &Graph, shape: &[usize], block: &[usize]) -> OperatorHandle {
    let image = arange(graph, shape, "uint8");
    let labels = graph.add(OpLabelArray::new()).unwrap();
    labels
        .input(OpLabelArray::BLOCK_SHAPE)
        .set_value(block.to_vec())
        .unwrap();
    labels
        .input(OpLabelArray::INPUT)
        .connect(image.output(OpArange::OUTPUT))
        .unwrap();
    labels
}

fn paint(labels: &OperatorHandle, slicing: &str, values: Vec<u8>) {
    let r = roi(slicing);
    let data: Buffer = ArrayD::from_shape_vec(IxDyn(&r.shape()), values)
        .unwrap()
        .into();
    labels
        .input(OpLabelArray::INPUT)
        .write(&r, data.into())
        .unwrap();
}

fn label_rows(labels: &OperatorHandle) -> Vec<Vec<u8>> {
    let out = read(labels.output(OpLabelArray::OUTPUT), "[0:5,0:5]");
    out.view::<u8>()
        .unwrap()
        .outer_iter()
        .map(|row| row.iter().copied().collect())
        .collect()
}

#[test]
fn five_by_five_label_editing() {
    let graph = Graph::new(GraphConfig::synchronous());
    let labels = label_array(&graph, &[5, 5], &[2, 2]);

    paint(&labels, "[1:3,1:3]", vec![1, 1, 1, 1]);
    paint(&labels, "[3:4,3:5]", vec![2, 2]);
    assert_eq!(
        label_rows(&labels),
        vec![
            vec![0, 0, 0, 0, 0],
            vec![0, 1, 1, 0, 0],
            vec![0, 1, 1, 0, 0],
            vec![0, 0, 0, 2, 2],
            vec![0, 0, 0, 0, 0],
        ]
    );

    // Eraser on one pixel, zeros elsewhere keep what is there.
    paint(&labels, "[2:4,2:4]", vec![0, 100, 0, 3]);
    assert_eq!(
        label_rows(&labels),
        vec![
            vec![0, 0, 0, 0, 0],
            vec![0, 1, 1, 0, 0],
            vec![0, 1, 1, 0, 0],
            vec![0, 0, 0, 3, 2],
            vec![0, 0, 0, 0, 0],
        ]
    );

    labels.input(OpLabelArray::DELETE_LABEL).set_value(1i64).unwrap();
    assert_eq!(
        label_rows(&labels),
        vec![
            vec![0, 0, 0, 0, 0],
            vec![0, 0, 0, 0, 0],
            vec![0, 0, 0, 0, 0],
            vec![0, 0, 0, 2, 1],
            vec![0, 0, 0, 0, 0],
        ]
    );
    assert_eq!(
        labels.output(OpLabelArray::MAX_LABEL).value().unwrap(),
        Value::Int(2)
    );
    assert_eq!(
        labels
            .output(OpLabelArray::NONZERO_BLOCKS)
            .value()
            .unwrap()
            .as_rois()
            .unwrap(),
        &[roi("[2:4,2:4]"), roi("[2:4,4:5]")]
    );
}

#[test]
fn label_edits_reach_downstream_readers() {
    let graph = Graph::new(GraphConfig::synchronous());
    let labels = label_array(&graph, &[8, 8], &[4, 4]);
    let mask = graph.add(OpThreshold::new()).unwrap();
    mask.input(OpThreshold::INPUT)
        .connect(labels.output(OpLabelArray::OUTPUT))
        .unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    mask.output(OpThreshold::OUTPUT)
        .notify_dirty(move |_, r| sink.lock().push(r.clone()));

    paint(&labels, "[6:7,6:8]", vec![4, 4]);
    assert_eq!(*seen.lock(), vec![roi("[6:7,6:8]")]);
    let out = read(mask.output(OpThreshold::OUTPUT), "[6:7,5:8]");
    assert_eq!(out.view::<u8>().unwrap().iter().copied().collect::<Vec<u8>>(), vec![0, 1, 1]);
}

#[test]
fn labels_move_between_graphs_as_json() {
    let graph = Graph::new(GraphConfig::synchronous());
    let labels = label_array(&graph, &[6, 6], &[3, 3]);
    paint(&labels, "[0:1,0:2]", vec![1, 2]);
    paint(&labels, "[5:6,5:6]", vec![3]);

    let blocks = export_blocks(
        labels.output(OpLabelArray::NONZERO_BLOCKS),
        labels.output(OpLabelArray::OUTPUT),
    )
    .unwrap();
    assert_eq!(blocks.len(), 2);
    let text = serde_json::to_string(&blocks).unwrap();

    let other = Graph::new(GraphConfig::synchronous());
    let restored = label_array(&other, &[6, 6], &[3, 3]);
    let parsed: Vec<StoredBlock> = serde_json::from_str(&text).unwrap();
    let written = import_blocks(restored.input(OpLabelArray::INPUT), &parsed).unwrap();
    assert_eq!(written, 18);

    assert_eq!(
        read(restored.output(OpLabelArray::OUTPUT), "[0:6,0:6]"),
        read(labels.output(OpLabelArray::OUTPUT), "[0:6,0:6]")
    );
}
