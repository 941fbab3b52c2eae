//! Shared CLI helpers used across multiple commands.

use lazyflow_config::{Settings, find_settings};
use lazyflow_core::{Buffer, OperatorHandle, Roi, Slot};
use lazyflow_operators::OpLabelArray;
use ndarray::{ArrayD, IxDyn};
use std::path::{Path, PathBuf};

/// Settings after file lookup and environment overrides.
pub struct LoadedSettings {
    /// Effective settings.
    pub settings: Settings,
    /// File the settings came from; `None` means built-in defaults.
    pub source: Option<PathBuf>,
}

/// Load settings from `explicit` or the user settings file, then apply the
/// environment overrides.
pub fn load_settings(explicit: Option<&Path>) -> anyhow::Result<LoadedSettings> {
    let source = find_settings(explicit);
    if let Some(path) = explicit
        && source.is_none()
    {
        anyhow::bail!("settings file '{}' not found", path.display());
    }

    let mut settings = match &source {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    settings.apply_env()?;
    settings.validate()?;
    Ok(LoadedSettings { settings, source })
}

/// Parse a region such as `[3:7,3:7]` for clap's `value_parser`.
pub fn parse_roi(s: &str) -> Result<Roi, String> {
    s.parse::<Roi>().map_err(|e| e.to_string())
}

/// Reject shapes with zero-length axes and mismatched ranks.
pub fn check_shapes(shape: &[usize], block: Option<&[usize]>) -> anyhow::Result<()> {
    if shape.is_empty() || shape.contains(&0) {
        anyhow::bail!("shape {:?} must have at least one axis and no zero extents", shape);
    }
    if let Some(block) = block {
        if block.len() != shape.len() {
            anyhow::bail!(
                "block shape {:?} has {} axes, shape {:?} has {}",
                block,
                block.len(),
                shape,
                shape.len()
            );
        }
        if block.contains(&0) {
            anyhow::bail!("block shape {:?} has a zero extent", block);
        }
    }
    Ok(())
}

/// Read `roi` from `slot` and wait for the data.
pub fn read(slot: &Slot, roi: &Roi) -> anyhow::Result<Buffer> {
    Ok(slot.get(roi)?.wait()?.into_buffer()?)
}

/// Write `label` over `roi` of a label array input.
pub fn paint(labels: &OperatorHandle, roi: &Roi, label: u8) -> anyhow::Result<()> {
    let data: Buffer = ArrayD::from_elem(IxDyn(&roi.shape()), label).into();
    labels.input(OpLabelArray::INPUT).write(roi, data.into())?;
    Ok(())
}
