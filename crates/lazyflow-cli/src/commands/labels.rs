//! Label array painting, export and import.

use crate::commands::common::{LoadedSettings, check_shapes, paint};
use clap::Args;
use lazyflow_core::{Graph, OperatorHandle, Roi};
use lazyflow_operators::{OpConstant, OpLabelArray, StoredBlock, export_blocks, import_blocks};
use std::path::PathBuf;

#[derive(Args)]
pub struct LabelsArgs {
    /// Image shape, two axes (e.g., "64,64")
    #[arg(long, value_delimiter = ',', default_value = "64,64")]
    shape: Vec<usize>,

    /// Label block shape
    #[arg(long, value_delimiter = ',', default_value = "16,16")]
    block: Vec<usize>,

    /// Write the non-zero blocks as JSON
    #[arg(long, value_name = "FILE")]
    out: Option<PathBuf>,

    /// Import blocks from a JSON file instead of painting
    #[arg(long, value_name = "FILE", conflicts_with = "out")]
    input: Option<PathBuf>,
}

pub fn run(args: LabelsArgs, loaded: &LoadedSettings) -> anyhow::Result<()> {
    check_shapes(&args.shape, Some(&args.block))?;
    if args.shape.len() != 2 {
        anyhow::bail!("labels work on 2-axis images, got shape {:?}", args.shape);
    }

    let graph = Graph::new(loaded.settings.to_graph_config()?);
    let labels = label_array(&graph, &args.shape, &args.block)?;

    if let Some(path) = &args.input {
        let text = std::fs::read_to_string(path)?;
        let blocks: Vec<StoredBlock> = serde_json::from_str(&text)?;
        tracing::debug!("read {} stored blocks from {}", blocks.len(), path.display());
        let written = import_blocks(labels.input(OpLabelArray::INPUT), &blocks)?;
        println!(
            "Imported {} block(s), {} elements from {}",
            blocks.len(),
            written,
            path.display()
        );
    } else {
        paint_demo(&labels, &args.shape)?;
        println!("Painted demo strokes on {:?}", args.shape);
    }

    let max_label = labels.output(OpLabelArray::MAX_LABEL).value()?.as_int()?;
    let nonzero = labels.output(OpLabelArray::NONZERO_BLOCKS).value()?;
    let nonzero = nonzero.as_rois()?;
    println!("  Max label:       {max_label}");
    println!("  Non-zero blocks: {}", nonzero.len());
    for roi in nonzero {
        println!("    {roi}");
    }

    if let Some(path) = &args.out {
        let blocks = export_blocks(
            labels.output(OpLabelArray::NONZERO_BLOCKS),
            labels.output(OpLabelArray::OUTPUT),
        )?;
        std::fs::write(path, serde_json::to_string_pretty(&blocks)?)?;
        println!("Exported {} block(s) to {}", blocks.len(), path.display());
    }

    graph.finalize();
    Ok(())
}

fn label_array(
    graph: &Graph,
    shape: &[usize],
    block: &[usize],
) -> anyhow::Result<OperatorHandle> {
    let image = graph.add(OpConstant::new())?;
    image.input(OpConstant::SHAPE).set_value(shape.to_vec())?;

    let labels = graph.add(OpLabelArray::new())?;
    labels
        .input(OpLabelArray::BLOCK_SHAPE)
        .set_value(block.to_vec())?;
    labels
        .input(OpLabelArray::INPUT)
        .connect(image.output(OpConstant::OUTPUT))?;
    Ok(labels)
}

/// Two crossing strokes and a square, with part of the first stroke erased.
fn paint_demo(labels: &OperatorHandle, shape: &[usize]) -> anyhow::Result<()> {
    let (h, w) = (shape[0], shape[1]);
    let eraser = labels.input(OpLabelArray::ERASER).value()?.as_int()?;
    let eraser = u8::try_from(eraser)?;

    let row = h / 4;
    paint(labels, &Roi::new(vec![row, 0], vec![row + 1, w])?, 1)?;
    let col = w / 2;
    paint(labels, &Roi::new(vec![0, col], vec![h, col + 1])?, 2)?;
    let (y, x) = (h * 2 / 3, w / 8);
    let square = Roi::new(vec![y, x], vec![(y + 4).min(h), (x + 4).min(w)])?;
    paint(labels, &square, 3)?;
    paint(labels, &Roi::new(vec![row, 0], vec![row + 1, (w / 8).max(1)])?, eraser)?;
    Ok(())
}
