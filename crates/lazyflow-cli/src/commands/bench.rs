//! Cache benchmark: tile sweeps through a cached box filter.

use crate::commands::common::{LoadedSettings, check_shapes};
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use lazyflow_core::{
    CacheStats, Graph, OpBlockedArrayCache, OperatorHandle, Roi, block_roi, intersecting_blocks,
};
use lazyflow_operators::{OpArange, OpCachedBoxFilter};
use std::time::Instant;

#[derive(Args)]
pub struct BenchArgs {
    /// Array shape (e.g., "512,512")
    #[arg(long, value_delimiter = ',', default_value = "512,512")]
    shape: Vec<usize>,

    /// Cache block shape
    #[arg(long, value_delimiter = ',', default_value = "64,64")]
    block: Vec<usize>,

    /// Box filter radius
    #[arg(long, default_value = "2")]
    radius: i64,

    /// Edge length of the tiles requested downstream
    #[arg(long, default_value = "32")]
    tile: usize,

    /// Number of full sweeps
    #[arg(long, default_value = "2")]
    passes: usize,

    /// Worker threads (overrides the settings file)
    #[arg(long)]
    threads: Option<usize>,
}

pub fn run(args: BenchArgs, loaded: &LoadedSettings) -> anyhow::Result<()> {
    check_shapes(&args.shape, Some(&args.block))?;
    if args.tile == 0 {
        anyhow::bail!("tile edge must be > 0");
    }

    let mut config = loaded.settings.to_graph_config()?;
    if let Some(threads) = args.threads {
        config.threads = threads;
    }
    let threads = config.threads;
    let graph = Graph::new(config);
    tracing::debug!(threads, budget = ?graph.memory().budget(), "bench graph created");

    let source = graph.add(OpArange::new())?;
    source.input(OpArange::SHAPE).set_value(args.shape.clone())?;
    source.input(OpArange::DTYPE).set_value("float32")?;

    let smooth = graph.add(OpCachedBoxFilter::new())?;
    smooth
        .input(OpCachedBoxFilter::INPUT)
        .connect(source.output(OpArange::OUTPUT))?;
    smooth
        .input(OpCachedBoxFilter::RADIUS)
        .set_value(args.radius)?;
    smooth
        .input(OpCachedBoxFilter::BLOCK_SHAPE)
        .set_value(args.block.clone())?;

    let tile_shape = vec![args.tile; args.shape.len()];
    let tiles: Vec<Roi> = intersecting_blocks(&Roi::from_shape(&args.shape), &tile_shape)
        .map(|index| block_roi(&index, &tile_shape, &args.shape))
        .collect();

    println!(
        "Benchmarking {:?} float32, block {:?}, radius {}, {} tiles of {}, {} thread(s)",
        args.shape,
        args.block,
        args.radius,
        tiles.len(),
        args.tile,
        threads
    );

    let pb = ProgressBar::new((tiles.len() * args.passes) as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("[{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta})")?
            .progress_chars("##-"),
    );

    let output = smooth.output(OpCachedBoxFilter::OUTPUT);
    let mut pass_times = Vec::with_capacity(args.passes);
    for _ in 0..args.passes {
        let start = Instant::now();
        let requests = tiles
            .iter()
            .map(|roi| output.get(roi))
            .collect::<Result<Vec<_>, _>>()?;
        for request in &requests {
            request.submit();
        }
        for request in &requests {
            request.wait()?;
            pb.inc(1);
        }
        pass_times.push(start.elapsed());
    }
    pb.finish_with_message("done");

    let stats = cache_stats(&smooth)?;
    println!("\nStats:");
    for (i, elapsed) in pass_times.iter().enumerate() {
        println!("  Pass {}:       {:.2?}", i + 1, elapsed);
    }
    println!("  Fetches:      {}", stats.fetches);
    println!("  Hits:         {}", stats.hits);
    println!("  Blocks held:  {}", stats.blocks);
    println!("  Cached bytes: {}", stats.used_bytes);
    println!("  Graph bytes:  {}", graph.memory().used_memory());

    graph.finalize();
    Ok(())
}

fn cache_stats(smooth: &OperatorHandle) -> anyhow::Result<CacheStats> {
    let cache = smooth
        .with_op(|f: &OpCachedBoxFilter| f.cache().cloned())
        .flatten()
        .ok_or_else(|| anyhow::anyhow!("cached filter has no cache"))?;
    cache
        .with_op(|c: &OpBlockedArrayCache| c.stats())
        .ok_or_else(|| anyhow::anyhow!("cache operator has an unexpected type"))
}
