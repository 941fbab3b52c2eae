//! Slot metadata.
//!
//! Metadata travels downstream ahead of any data: connecting a slot copies
//! its partner's [`Meta`], and an operator's `setup_outputs` derives output
//! metadata from input metadata. A slot is *ready* exactly when it has
//! metadata.

use std::fmt;
use std::str::FromStr;

use crate::array::{Buffer, DType};
use crate::error::{LazyflowError, Result};
use crate::roi::Roi;

/// Semantic tag of one array axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Axis {
    /// Time (`t`)
    T,
    /// Depth (`z`)
    Z,
    /// Rows (`y`)
    Y,
    /// Columns (`x`)
    X,
    /// Channels (`c`)
    C,
    /// Untagged index axis (`i`)
    Index,
}

impl Axis {
    /// Single-letter key.
    pub fn key(self) -> char {
        match self {
            Axis::T => 't',
            Axis::Z => 'z',
            Axis::Y => 'y',
            Axis::X => 'x',
            Axis::C => 'c',
            Axis::Index => 'i',
        }
    }

    /// True for `x`, `y` and `z`.
    pub fn is_spatial(self) -> bool {
        matches!(self, Axis::X | Axis::Y | Axis::Z)
    }

    fn from_key(key: char) -> Option<Self> {
        Some(match key {
            't' => Axis::T,
            'z' => Axis::Z,
            'y' => Axis::Y,
            'x' => Axis::X,
            'c' => Axis::C,
            'i' => Axis::Index,
            _ => return None,
        })
    }
}

/// Ordered axis tags of an array slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct AxisTags(Vec<Axis>);

impl AxisTags {
    /// Wrap an explicit list.
    pub fn new(axes: Vec<Axis>) -> Self {
        Self(axes)
    }

    /// Conventional tags for an `ndim`-dimensional array: `x`, `yx`, `zyx`,
    /// `zyxc`, `tzyxc`, then untagged index axes in front.
    pub fn default_for(ndim: usize) -> Self {
        const TZYXC: [Axis; 5] = [Axis::T, Axis::Z, Axis::Y, Axis::X, Axis::C];
        let axes = match ndim {
            0 => Vec::new(),
            1 => vec![Axis::X],
            2 => vec![Axis::Y, Axis::X],
            3 => vec![Axis::Z, Axis::Y, Axis::X],
            4 => vec![Axis::Z, Axis::Y, Axis::X, Axis::C],
            n => {
                let mut axes = vec![Axis::Index; n - 5];
                axes.extend_from_slice(&TZYXC);
                axes
            }
        };
        Self(axes)
    }

    /// Number of axes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True if there are no axes.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Position of `axis`, if present.
    pub fn index_of(&self, axis: Axis) -> Option<usize> {
        self.0.iter().position(|&a| a == axis)
    }

    /// Tags in order.
    pub fn iter(&self) -> impl Iterator<Item = Axis> + '_ {
        self.0.iter().copied()
    }

    /// Tag at position `i`.
    pub fn get(&self, i: usize) -> Option<Axis> {
        self.0.get(i).copied()
    }
}

impl fmt::Display for AxisTags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.iter().try_for_each(|a| write!(f, "{}", a.key()))
    }
}

impl FromStr for AxisTags {
    type Err = LazyflowError;

    fn from_str(s: &str) -> Result<Self> {
        s.chars()
            .map(|c| {
                Axis::from_key(c).ok_or_else(|| {
                    LazyflowError::incompatible("axistags", format!("unknown axis key '{c}'"))
                })
            })
            .collect::<Result<Vec<_>>>()
            .map(AxisTags)
    }
}

/// Preferred block geometry advertised by an upstream slot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockHints {
    /// Block shape the producer computes most efficiently.
    pub ideal: Option<Vec<usize>>,
    /// Largest block the producer accepts in one request.
    pub max: Option<Vec<usize>>,
}

/// Metadata of a slot.
#[derive(Debug, Clone, PartialEq)]
pub struct Meta {
    /// Array shape (`[1]` for value slots).
    pub shape: Vec<usize>,
    /// Element type ([`DType::Object`] for value slots).
    pub dtype: DType,
    /// One tag per axis.
    pub axes: AxisTags,
    /// Block geometry hints.
    pub block_hints: BlockHints,
}

impl Meta {
    /// Array metadata with default axis tags.
    pub fn array(shape: Vec<usize>, dtype: DType) -> Self {
        let axes = AxisTags::default_for(shape.len());
        Self {
            shape,
            dtype,
            axes,
            block_hints: BlockHints::default(),
        }
    }

    /// Metadata for a non-array value slot.
    pub fn opaque() -> Self {
        Self {
            shape: vec![1],
            dtype: DType::Object,
            axes: AxisTags::new(vec![Axis::Index]),
            block_hints: BlockHints::default(),
        }
    }

    /// Metadata describing `buffer`.
    pub fn for_buffer(buffer: &Buffer) -> Self {
        Self::array(buffer.shape().to_vec(), buffer.dtype())
    }

    /// Replace the axis tags.
    pub fn with_axes(mut self, axes: AxisTags) -> Self {
        self.axes = axes;
        self
    }

    /// True for array slots.
    pub fn is_array(&self) -> bool {
        self.dtype != DType::Object
    }

    /// ROI covering the whole slot.
    pub fn full_roi(&self) -> Roi {
        Roi::from_shape(&self.shape)
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    /// True if the slot has no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes of a full read.
    pub fn nbytes(&self) -> usize {
        self.len() * self.dtype.size_of()
    }

    /// Check the shape/axes invariant.
    pub fn validate(&self, slot: &str) -> Result<()> {
        if self.shape.len() != self.axes.len() {
            return Err(LazyflowError::incompatible(
                slot,
                format!(
                    "shape {:?} has {} axes but axistags '{}' has {}",
                    self.shape,
                    self.shape.len(),
                    self.axes,
                    self.axes.len()
                ),
            ));
        }
        Ok(())
    }

    /// Check that `roi` addresses this slot.
    pub fn check_roi(&self, roi: &Roi) -> Result<()> {
        if roi.fits(&self.shape) {
            Ok(())
        } else {
            Err(LazyflowError::RoiOutOfBounds {
                roi: roi.clone(),
                shape: self.shape.clone(),
            })
        }
    }
}
