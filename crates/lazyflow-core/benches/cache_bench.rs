//! Criterion benchmarks for lazyflow-core
//!
//! Run with: cargo bench -p lazyflow-core
#![allow(missing_docs)]

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use lazyflow_core::{
    Buffer, Graph, GraphConfig, OpBlockedArrayCache, OperatorHandle, Roi, intersecting_blocks,
};
use ndarray::{ArrayD, IxDyn};

const SHAPE: [usize; 2] = [512, 512];
const BLOCK_SIZES: &[usize] = &[32, 64, 128];

fn arange(shape: &[usize]) -> Buffer {
    let n: usize = shape.iter().product();
    ArrayD::from_shape_vec(IxDyn(shape), (0..n as u32).collect())
        .unwrap()
        .into()
}

fn cache_over(graph: &Graph, block: usize) -> OperatorHandle {
    let cache = graph.add(OpBlockedArrayCache::new()).unwrap();
    cache
        .input(OpBlockedArrayCache::BLOCK_SHAPE)
        .set_value(vec![block, block])
        .unwrap();
    cache
        .input(OpBlockedArrayCache::INPUT)
        .set_value(arange(&SHAPE))
        .unwrap();
    cache
}

fn tiles(tile: usize) -> Vec<Roi> {
    let full = Roi::from_shape(&SHAPE);
    intersecting_blocks(&full, &[tile, tile])
        .map(|i| lazyflow_core::block_roi(&i, &[tile, tile], &SHAPE))
        .collect()
}

fn bench_roi(c: &mut Criterion) {
    let mut group = c.benchmark_group("Roi");
    let roi = Roi::from_ranges(&[13..477, 50..301]).unwrap();

    for &block in BLOCK_SIZES {
        group.bench_with_input(BenchmarkId::new("intersecting_blocks", block), &block, |b, &block| {
            b.iter(|| black_box(intersecting_blocks(black_box(&roi), &[block, block]).count()));
        });
    }

    group.bench_function("parse", |b| {
        b.iter(|| black_box("[13:477,50:301]".parse::<Roi>().unwrap()));
    });

    group.finish();
}

fn bench_cache(c: &mut Criterion) {
    let mut group = c.benchmark_group("OpBlockedArrayCache");

    for &block in BLOCK_SIZES {
        // Warm cache: every block is already held.
        group.bench_with_input(BenchmarkId::new("warm_sweep", block), &block, |b, &block| {
            let graph = Graph::new(GraphConfig::synchronous());
            let cache = cache_over(&graph, block);
            let output = cache.output(OpBlockedArrayCache::OUTPUT).clone();
            output.value().unwrap();
            let tiles = tiles(48);
            b.iter(|| {
                for tile in &tiles {
                    black_box(output.get(tile).unwrap().wait().unwrap());
                }
            });
        });

        // Cold cache on a worker pool.
        group.bench_with_input(BenchmarkId::new("cold_full", block), &block, |b, &block| {
            b.iter(|| {
                let graph = Graph::new(GraphConfig::default().with_threads(4));
                let cache = cache_over(&graph, block);
                black_box(cache.output(OpBlockedArrayCache::OUTPUT).value().unwrap());
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_roi, bench_cache);
criterion_main!(benches);
