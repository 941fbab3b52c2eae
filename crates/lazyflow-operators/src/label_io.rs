//! Export and import of stored label blocks.
//!
//! A block is written out as its slicing text, dtype name and flattened
//! row-major values, so any serde format can carry it:
//!
//! ```json
//! {"slicing": "[0:2,0:2]", "dtype": "uint8", "values": [1, 0, 0, 2]}
//! ```
//!
//! Integer blocks keep integer values, so 64-bit labels survive exactly.

use lazyflow_core::{ArcArrayD, Buffer, DType, Element, LazyflowError, Result, Roi, Slot};
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

/// Flattened element values, in the widest type of their dtype's family.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredValues {
    /// Unsigned integer elements.
    U64(Vec<u64>),
    /// Signed integer elements.
    I64(Vec<i64>),
    /// Floating-point elements.
    F64(Vec<f64>),
}

impl StoredValues {
    fn capture(data: &Buffer) -> Self {
        match data.dtype() {
            DType::U8 | DType::U16 | DType::U32 | DType::U64 => {
                Self::U64(data.cast::<u64>().iter().copied().collect())
            }
            DType::I32 | DType::I64 => Self::I64(data.cast::<i64>().iter().copied().collect()),
            DType::F32 | DType::F64 | DType::Object => {
                Self::F64(data.cast::<f64>().iter().copied().collect())
            }
        }
    }

    /// Number of values.
    pub fn len(&self) -> usize {
        match self {
            Self::U64(v) => v.len(),
            Self::I64(v) => v.len(),
            Self::F64(v) => v.len(),
        }
    }

    /// True if there are no values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn to_buffer(&self, dtype: DType, roi: &Roi) -> Result<Buffer> {
        match self {
            Self::U64(v) => shaped(dtype, roi, v),
            Self::I64(v) => shaped(dtype, roi, v),
            Self::F64(v) => shaped(dtype, roi, v),
        }
    }
}

fn shaped<T: Element>(dtype: DType, roi: &Roi, values: &[T]) -> Result<Buffer> {
    let values: ArcArrayD<T> = ArrayD::from_shape_vec(IxDyn(&roi.shape()), values.to_vec())
        .map_err(|e| LazyflowError::InvalidRoi(format!("block {roi}: {e}")))?
        .into_shared();
    Buffer::from_cast(dtype, &values)
}

/// One block of array data in serializable form.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredBlock {
    /// Block region as slice text, e.g. `"[0:64,128:192]"`.
    pub slicing: String,
    /// Element type name.
    pub dtype: String,
    /// Row-major element values.
    pub values: StoredValues,
}

impl StoredBlock {
    /// Capture `data`, which covers `roi`.
    pub fn capture(roi: &Roi, data: &Buffer) -> Self {
        Self {
            slicing: roi.to_string(),
            dtype: data.dtype().name().to_string(),
            values: StoredValues::capture(data),
        }
    }

    /// Rebuild the region and the typed data.
    pub fn restore(&self) -> Result<(Roi, Buffer)> {
        let roi: Roi = self.slicing.parse()?;
        let dtype: DType = self.dtype.parse()?;
        if self.values.len() != roi.size() {
            return Err(LazyflowError::InvalidRoi(format!(
                "block {roi} needs {} values, found {}",
                roi.size(),
                self.values.len()
            )));
        }
        let data = self.values.to_buffer(dtype, &roi)?;
        Ok((roi, data))
    }
}

/// Read every block listed by `blocks` (a ROI-list slot such as
/// `NonzeroBlocks` or `CleanBlocks`) from `data`.
pub fn export_blocks(blocks: &Slot, data: &Slot) -> Result<Vec<StoredBlock>> {
    let rois = blocks.value()?.as_rois()?.to_vec();
    let exported = rois
        .iter()
        .map(|roi| {
            let buffer = data.get(roi)?.wait()?.into_buffer()?;
            Ok(StoredBlock::capture(roi, &buffer))
        })
        .collect::<Result<Vec<_>>>()?;
    tracing::debug!(
        "export_blocks: {} blocks from {}",
        exported.len(),
        data.qualified_name()
    );
    Ok(exported)
}

/// Write `blocks` into `target`; returns the number of elements written.
pub fn import_blocks(target: &Slot, blocks: &[StoredBlock]) -> Result<usize> {
    let mut written = 0;
    for block in blocks {
        let (roi, data) = block.restore()?;
        target.write(&roi, data.into())?;
        written += roi.size();
    }
    tracing::debug!(
        "import_blocks: {} blocks into {}",
        blocks.len(),
        target.qualified_name()
    );
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capture_and_restore_agree() {
        let data: Buffer = ArrayD::from_shape_vec(IxDyn(&[2, 2]), vec![1u16, 0, 0, 700])
            .unwrap()
            .into();
        let roi: Roi = "[4:6,8:10]".parse().unwrap();
        let block = StoredBlock::capture(&roi, &data);
        assert_eq!(block.slicing, "[4:6,8:10]");
        assert_eq!(block.dtype, "uint16");
        assert_eq!(block.restore().unwrap(), (roi, data));
    }

    #[test]
    fn json_form_is_stable() {
        let block = StoredBlock {
            slicing: "[0:1,0:2]".into(),
            dtype: "uint8".into(),
            values: StoredValues::U64(vec![3, 0]),
        };
        let text = serde_json::to_string(&block).unwrap();
        assert_eq!(text, r#"{"slicing":"[0:1,0:2]","dtype":"uint8","values":[3,0]}"#);
        let back: StoredBlock = serde_json::from_str(&text).unwrap();
        assert_eq!(back, block);
    }

    #[test]
    fn large_integers_survive_json() {
        let big = 9_007_199_254_740_993u64;
        let data: Buffer = ArrayD::from_shape_vec(IxDyn(&[2]), vec![big, 1]).unwrap().into();
        let roi: Roi = "[0:2]".parse().unwrap();
        let text = serde_json::to_string(&StoredBlock::capture(&roi, &data)).unwrap();
        assert!(text.contains("9007199254740993"), "{text}");
        let back: StoredBlock = serde_json::from_str(&text).unwrap();
        let (_, restored) = back.restore().unwrap();
        assert_eq!(restored.view::<u64>().unwrap()[[0]], big);

        let signed: Buffer = ArrayD::from_shape_vec(IxDyn(&[2]), vec![-(1i64 << 60) - 1, 4])
            .unwrap()
            .into();
        let block = StoredBlock::capture(&roi, &signed);
        assert!(matches!(block.values, StoredValues::I64(_)));
        let text = serde_json::to_string(&block).unwrap();
        let back: StoredBlock = serde_json::from_str(&text).unwrap();
        assert_eq!(back.restore().unwrap().1, signed);
    }

    #[test]
    fn float_values_are_kept_as_floats() {
        let data: Buffer = ArrayD::from_shape_vec(IxDyn(&[2]), vec![0.5f32, -2.0])
            .unwrap()
            .into();
        let roi: Roi = "[0:2]".parse().unwrap();
        let block = StoredBlock::capture(&roi, &data);
        assert_eq!(block.values, StoredValues::F64(vec![0.5, -2.0]));
        assert_eq!(block.restore().unwrap().1, data);
    }

    #[test]
    fn value_count_must_match_region() {
        let block = StoredBlock {
            slicing: "[0:2,0:2]".into(),
            dtype: "uint8".into(),
            values: StoredValues::U64(vec![1; 3]),
        };
        assert!(matches!(block.restore(), Err(LazyflowError::InvalidRoi(_))));
    }

    #[test]
    fn unknown_dtype_is_rejected() {
        let block = StoredBlock {
            slicing: "[0:1]".into(),
            dtype: "bfloat16".into(),
            values: StoredValues::F64(vec![1.0]),
        };
        assert!(block.restore().is_err());
    }
}
