//! Region-of-interest algebra.
//!
//! A [`Roi`] is a half-open N-dimensional box `[start, stop)`. Everything that
//! moves data in lazyflow is addressed by a ROI: slot reads, dirty
//! notifications, cache blocks and label writes.
//!
//! Block decomposition follows a fixed grid anchored at the origin: block
//! `b` along an axis covers `[b * size, min((b + 1) * size, extent))`, so the
//! last block of an axis may be smaller than the nominal block shape.
//!
//! # Text form
//!
//! ROIs print as slice descriptors, `[start0:stop0,start1:stop1,...]`, and
//! parse back from the same form. Persisted label blocks use this encoding.

use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use ndarray::SliceInfoElem;

use crate::error::{LazyflowError, Result};

/// Index of a block in the block grid, one entry per axis.
pub type BlockIndex = Vec<usize>;

/// A half-open N-dimensional region `[start, stop)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Roi {
    start: Vec<usize>,
    stop: Vec<usize>,
}

impl Roi {
    /// Create a ROI, checking that both corners have the same length and
    /// `start <= stop` on every axis.
    pub fn new(start: Vec<usize>, stop: Vec<usize>) -> Result<Self> {
        if start.len() != stop.len() {
            return Err(LazyflowError::InvalidRoi(format!(
                "start has {} axes but stop has {}",
                start.len(),
                stop.len()
            )));
        }
        if let Some(axis) = (0..start.len()).find(|&i| start[i] > stop[i]) {
            return Err(LazyflowError::InvalidRoi(format!(
                "start {} exceeds stop {} on axis {axis}",
                start[axis], stop[axis]
            )));
        }
        Ok(Self { start, stop })
    }

    /// The ROI covering a whole array of `shape`.
    pub fn from_shape(shape: &[usize]) -> Self {
        Self {
            start: vec![0; shape.len()],
            stop: shape.to_vec(),
        }
    }

    /// Build a ROI from one range per axis.
    pub fn from_ranges(ranges: &[Range<usize>]) -> Result<Self> {
        Self::new(
            ranges.iter().map(|r| r.start).collect(),
            ranges.iter().map(|r| r.end).collect(),
        )
    }

    /// One range per axis.
    pub fn to_ranges(&self) -> Vec<Range<usize>> {
        self.start
            .iter()
            .zip(&self.stop)
            .map(|(&a, &b)| a..b)
            .collect()
    }

    /// Inclusive lower corner.
    pub fn start(&self) -> &[usize] {
        &self.start
    }

    /// Exclusive upper corner.
    pub fn stop(&self) -> &[usize] {
        &self.stop
    }

    /// Number of axes.
    pub fn ndim(&self) -> usize {
        self.start.len()
    }

    /// Extent along each axis.
    pub fn shape(&self) -> Vec<usize> {
        self.start
            .iter()
            .zip(&self.stop)
            .map(|(&a, &b)| b - a)
            .collect()
    }

    /// Number of elements covered.
    pub fn size(&self) -> usize {
        self.shape().iter().product()
    }

    /// True if the ROI covers no elements.
    pub fn is_empty(&self) -> bool {
        self.start.iter().zip(&self.stop).any(|(a, b)| a == b)
    }

    /// True if the ROI lies inside an array of `shape`.
    pub fn fits(&self, shape: &[usize]) -> bool {
        self.ndim() == shape.len() && self.stop.iter().zip(shape).all(|(s, n)| s <= n)
    }

    /// Overlap of two ROIs. Disjoint inputs produce an empty ROI.
    pub fn intersect(&self, other: &Roi) -> Roi {
        debug_assert_eq!(self.ndim(), other.ndim());
        let start: Vec<usize> = self
            .start
            .iter()
            .zip(&other.start)
            .map(|(&a, &b)| a.max(b))
            .collect();
        let stop = self
            .stop
            .iter()
            .zip(&other.stop)
            .zip(&start)
            .map(|((&a, &b), &lo)| a.min(b).max(lo))
            .collect();
        Roi { start, stop }
    }

    /// True if the ROIs share at least one element.
    pub fn overlaps(&self, other: &Roi) -> bool {
        !self.intersect(other).is_empty()
    }

    /// True if `other` lies entirely inside `self`. An empty ROI is contained
    /// in everything.
    pub fn contains(&self, other: &Roi) -> bool {
        other.is_empty()
            || (self.ndim() == other.ndim()
                && (0..self.ndim())
                    .all(|i| self.start[i] <= other.start[i] && other.stop[i] <= self.stop[i]))
    }

    /// Grow by `halo` on both sides of each axis, clamped to `[0, bounds)`.
    pub fn extend_by_halo(&self, halo: &[usize], bounds: &[usize]) -> Roi {
        let start = self
            .start
            .iter()
            .zip(halo)
            .map(|(&s, &h)| s.saturating_sub(h))
            .collect();
        let stop = self
            .stop
            .iter()
            .zip(halo)
            .zip(bounds)
            .map(|((&s, &h), &n)| (s + h).min(n))
            .collect();
        Roi { start, stop }
    }

    /// Express this ROI in coordinates relative to `origin`.
    ///
    /// `origin` must not exceed `start` on any axis.
    pub fn relative_to(&self, origin: &[usize]) -> Roi {
        Roi {
            start: self.start.iter().zip(origin).map(|(&s, &o)| s - o).collect(),
            stop: self.stop.iter().zip(origin).map(|(&s, &o)| s - o).collect(),
        }
    }

    /// Shift by `offset` (inverse of [`relative_to`](Self::relative_to)).
    pub fn translate(&self, offset: &[usize]) -> Roi {
        Roi {
            start: self.start.iter().zip(offset).map(|(&s, &o)| s + o).collect(),
            stop: self.stop.iter().zip(offset).map(|(&s, &o)| s + o).collect(),
        }
    }

    /// Replace one axis' range.
    pub fn with_axis(&self, axis: usize, range: Range<usize>) -> Roi {
        let mut roi = self.clone();
        roi.start[axis] = range.start;
        roi.stop[axis] = range.end.max(range.start);
        roi
    }

    /// ndarray slice arguments selecting this ROI.
    pub fn slicing(&self) -> Vec<SliceInfoElem> {
        self.start
            .iter()
            .zip(&self.stop)
            .map(|(&a, &b)| SliceInfoElem::Slice {
                start: a as isize,
                end: Some(b as isize),
                step: 1,
            })
            .collect()
    }

    /// Smallest ROI containing every ROI in `rois`, or `None` if `rois` is empty.
    pub fn bounding_box<'a>(rois: impl IntoIterator<Item = &'a Roi>) -> Option<Roi> {
        let mut iter = rois.into_iter();
        let first = iter.next()?.clone();
        Some(iter.fold(first, |mut acc, roi| {
            for i in 0..acc.ndim() {
                acc.start[i] = acc.start[i].min(roi.start[i]);
                acc.stop[i] = acc.stop[i].max(roi.stop[i]);
            }
            acc
        }))
    }
}

impl fmt::Display for Roi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (i, (a, b)) in self.start.iter().zip(&self.stop).enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{a}:{b}")?;
        }
        f.write_str("]")
    }
}

impl FromStr for Roi {
    type Err = LazyflowError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || LazyflowError::InvalidRoi(format!("cannot parse slicing '{s}'"));
        let inner = s
            .trim()
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .ok_or_else(bad)?;
        if inner.trim().is_empty() {
            return Ok(Roi::from_shape(&[]));
        }
        let mut ranges = Vec::new();
        for part in inner.split(',') {
            let (a, b) = part.split_once(':').ok_or_else(bad)?;
            let a = a.trim().parse::<usize>().map_err(|_| bad())?;
            let b = b.trim().parse::<usize>().map_err(|_| bad())?;
            ranges.push(a..b);
        }
        Roi::from_ranges(&ranges)
    }
}

/// ROI of block `index` on a grid of `block_shape`, clamped to `full_shape`.
pub fn block_roi(index: &[usize], block_shape: &[usize], full_shape: &[usize]) -> Roi {
    let start: Vec<usize> = index
        .iter()
        .zip(block_shape)
        .zip(full_shape)
        .map(|((&b, &size), &n)| (b * size).min(n))
        .collect();
    let stop = index
        .iter()
        .zip(block_shape)
        .zip(full_shape)
        .map(|((&b, &size), &n)| ((b + 1) * size).min(n))
        .collect();
    Roi { start, stop }
}

/// Iterate the indices of all blocks of `block_shape` that intersect `roi`,
/// in row-major order.
pub fn intersecting_blocks(roi: &Roi, block_shape: &[usize]) -> BlockIter {
    debug_assert_eq!(roi.ndim(), block_shape.len());
    debug_assert!(block_shape.iter().all(|&b| b > 0));
    let lo: Vec<usize> = roi
        .start
        .iter()
        .zip(block_shape)
        .map(|(&s, &b)| s / b)
        .collect();
    let hi: Vec<usize> = roi
        .stop
        .iter()
        .zip(block_shape)
        .map(|(&s, &b)| s.div_ceil(b))
        .collect();
    let next = if roi.is_empty() { None } else { Some(lo.clone()) };
    BlockIter { lo, hi, next }
}

/// Row-major iterator over a rectangular range of block indices.
#[derive(Debug, Clone)]
pub struct BlockIter {
    lo: Vec<usize>,
    hi: Vec<usize>,
    next: Option<BlockIndex>,
}

impl Iterator for BlockIter {
    type Item = BlockIndex;

    fn next(&mut self) -> Option<BlockIndex> {
        let current = self.next.take()?;
        let mut advanced = current.clone();
        let mut axis = advanced.len();
        loop {
            if axis == 0 {
                break;
            }
            axis -= 1;
            advanced[axis] += 1;
            if advanced[axis] < self.hi[axis] {
                self.next = Some(advanced);
                break;
            }
            advanced[axis] = self.lo[axis];
        }
        Some(current)
    }
}

/// Choose a block shape of roughly `target_volume` elements that is as close
/// to isometric as `max_shape` allows.
///
/// Axes are filled smallest-first: an axis shorter than the isometric edge is
/// taken whole and the leftover volume is spread over the remaining axes.
pub fn determine_block_shape(max_shape: &[usize], target_volume: usize) -> Vec<usize> {
    let ndim = max_shape.len();
    let mut order: Vec<usize> = (0..ndim).collect();
    order.sort_by_key(|&i| max_shape[i]);

    let mut block = vec![1; ndim];
    let mut remaining = target_volume.max(1) as f64;
    for (k, &axis) in order.iter().enumerate() {
        let dims_left = (ndim - k) as f64;
        let mut edge = remaining.powf(1.0 / dims_left).floor().max(1.0) as usize;
        // powf rounding can land one below the exact root
        while ((edge + 1) as f64).powf(dims_left) <= remaining {
            edge += 1;
        }
        let size = edge.min(max_shape[axis]).max(1);
        block[axis] = size;
        remaining = (remaining / size as f64).max(1.0);
    }
    block
}
