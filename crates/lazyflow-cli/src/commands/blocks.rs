//! Block grid inspection.

use crate::commands::common::{LoadedSettings, check_shapes, parse_roi};
use clap::Args;
use lazyflow_core::{DType, Roi, block_roi, determine_block_shape, intersecting_blocks};

#[derive(Args)]
pub struct BlocksArgs {
    /// Array shape (e.g., "25,25")
    #[arg(long, value_delimiter = ',')]
    shape: Vec<usize>,

    /// Block shape; derived from the default block size when omitted
    #[arg(long, value_delimiter = ',')]
    block: Option<Vec<usize>>,

    /// Element type used to derive the block shape
    #[arg(long, default_value = "uint8")]
    dtype: String,

    /// Region to decompose (e.g., "[3:7,3:7]"); the whole array when omitted
    #[arg(long, value_parser = parse_roi)]
    roi: Option<Roi>,
}

pub fn run(args: BlocksArgs, loaded: &LoadedSettings) -> anyhow::Result<()> {
    check_shapes(&args.shape, args.block.as_deref())?;

    let block = match args.block {
        Some(block) => block,
        None => {
            let dtype: DType = args.dtype.parse()?;
            let bytes = loaded.settings.default_block_kb * 1024;
            determine_block_shape(&args.shape, bytes / dtype.size_of().max(1))
        }
    };

    let roi = args.roi.unwrap_or_else(|| Roi::from_shape(&args.shape));
    if roi.ndim() != args.shape.len() || !roi.fits(&args.shape) {
        anyhow::bail!("region {} does not fit shape {:?}", roi, args.shape);
    }

    let blocks: Vec<_> = intersecting_blocks(&roi, &block).collect();
    println!(
        "Shape {:?}, block {:?}: {} block(s) intersect {}",
        args.shape,
        block,
        blocks.len(),
        roi
    );
    for index in &blocks {
        println!("  {:<16} {}", format!("{index:?}"), block_roi(index, &block, &args.shape));
    }
    Ok(())
}
