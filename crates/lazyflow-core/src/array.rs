//! Typed N-dimensional buffers.
//!
//! Array slots carry a [`Buffer`]: one `ndarray::ArcArray` behind a dtype tag.
//! `ArcArray` is reference counted with copy-on-write, so handing a cached
//! block to several readers costs a refcount bump and a later write into the
//! block never disturbs data already returned.
//!
//! Generic code reaches the concrete array through the [`Element`] trait;
//! dtype-agnostic code (copying sub-regions, zero checks) uses the methods on
//! [`Buffer`] directly.

use std::fmt;
use std::str::FromStr;

use ndarray::{ArcArray, ArrayD, ArrayViewD, IxDyn};
use num_traits::{NumCast, Zero};

use crate::error::{LazyflowError, Result};
use crate::roi::Roi;

/// Shared, copy-on-write dynamic-dimensional array.
pub type ArcArrayD<T> = ArcArray<T, IxDyn>;

/// Element type of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DType {
    /// `u8`
    U8,
    /// `u16`
    U16,
    /// `u32`
    U32,
    /// `u64`
    U64,
    /// `i32`
    I32,
    /// `i64`
    I64,
    /// `f32`
    F32,
    /// `f64`
    F64,
    /// Non-array slot value.
    Object,
}

impl DType {
    /// Size of one element in bytes (0 for [`DType::Object`]).
    pub fn size_of(self) -> usize {
        match self {
            DType::U8 => 1,
            DType::U16 => 2,
            DType::U32 | DType::I32 | DType::F32 => 4,
            DType::U64 | DType::I64 | DType::F64 => 8,
            DType::Object => 0,
        }
    }

    /// Conventional name (`uint8`, `float32`, ...).
    pub fn name(self) -> &'static str {
        match self {
            DType::U8 => "uint8",
            DType::U16 => "uint16",
            DType::U32 => "uint32",
            DType::U64 => "uint64",
            DType::I32 => "int32",
            DType::I64 => "int64",
            DType::F32 => "float32",
            DType::F64 => "float64",
            DType::Object => "object",
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for DType {
    type Err = LazyflowError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "uint8" | "u8" => DType::U8,
            "uint16" | "u16" => DType::U16,
            "uint32" | "u32" => DType::U32,
            "uint64" | "u64" => DType::U64,
            "int32" | "i32" => DType::I32,
            "int64" | "i64" => DType::I64,
            "float32" | "f32" => DType::F32,
            "float64" | "f64" => DType::F64,
            "object" => DType::Object,
            other => {
                return Err(LazyflowError::incompatible(
                    "dtype",
                    format!("unknown dtype '{other}'"),
                ));
            }
        })
    }
}

/// Scalar types a [`Buffer`] can hold.
pub trait Element:
    Copy + Default + PartialEq + PartialOrd + NumCast + Zero + Send + Sync + fmt::Debug + 'static
{
    /// Tag for this element type.
    const DTYPE: DType;

    /// Wrap a typed array.
    fn wrap(array: ArcArrayD<Self>) -> Buffer;

    /// Borrow the typed array if the dtype matches.
    fn peek(buffer: &Buffer) -> Option<&ArcArrayD<Self>>;

    /// Mutably borrow the typed array if the dtype matches.
    fn peek_mut(buffer: &mut Buffer) -> Option<&mut ArcArrayD<Self>>;
}

/// A dtype-tagged N-dimensional array.
#[derive(Debug, Clone, PartialEq)]
pub enum Buffer {
    /// `u8` data
    U8(ArcArrayD<u8>),
    /// `u16` data
    U16(ArcArrayD<u16>),
    /// `u32` data
    U32(ArcArrayD<u32>),
    /// `u64` data
    U64(ArcArrayD<u64>),
    /// `i32` data
    I32(ArcArrayD<i32>),
    /// `i64` data
    I64(ArcArrayD<i64>),
    /// `f32` data
    F32(ArcArrayD<f32>),
    /// `f64` data
    F64(ArcArrayD<f64>),
}

macro_rules! element {
    ($t:ty, $variant:ident) => {
        impl Element for $t {
            const DTYPE: DType = DType::$variant;

            fn wrap(array: ArcArrayD<Self>) -> Buffer {
                Buffer::$variant(array)
            }

            fn peek(buffer: &Buffer) -> Option<&ArcArrayD<Self>> {
                match buffer {
                    Buffer::$variant(a) => Some(a),
                    _ => None,
                }
            }

            fn peek_mut(buffer: &mut Buffer) -> Option<&mut ArcArrayD<Self>> {
                match buffer {
                    Buffer::$variant(a) => Some(a),
                    _ => None,
                }
            }
        }

        impl From<ArrayD<$t>> for Buffer {
            fn from(array: ArrayD<$t>) -> Self {
                Buffer::$variant(array.into_shared())
            }
        }

        impl From<ArcArrayD<$t>> for Buffer {
            fn from(array: ArcArrayD<$t>) -> Self {
                Buffer::$variant(array)
            }
        }
    };
}

element!(u8, U8);
element!(u16, U16);
element!(u32, U32);
element!(u64, U64);
element!(i32, I32);
element!(i64, I64);
element!(f32, F32);
element!(f64, F64);

/// Run `$body` with `$a` bound to the typed array inside `$buf`.
macro_rules! dispatch {
    ($buf:expr, $a:ident => $body:expr) => {
        match $buf {
            Buffer::U8($a) => $body,
            Buffer::U16($a) => $body,
            Buffer::U32($a) => $body,
            Buffer::U64($a) => $body,
            Buffer::I32($a) => $body,
            Buffer::I64($a) => $body,
            Buffer::F32($a) => $body,
            Buffer::F64($a) => $body,
        }
    };
}

fn zeros_of<T: Element>(shape: &[usize]) -> Buffer {
    T::wrap(ArrayD::<T>::zeros(IxDyn(shape)).into_shared())
}

fn copy_into<T: Element>(dst: &mut ArcArrayD<T>, region: &Roi, src: &Buffer) -> Result<()> {
    let src = T::peek(src).ok_or(LazyflowError::DTypeMismatch {
        expected: T::DTYPE,
        found: src.dtype(),
    })?;
    dst.slice_mut(region.slicing().as_slice()).assign(src);
    Ok(())
}

fn cast_to<S: Element, T: Element>(src: &ArcArrayD<S>) -> ArrayD<T> {
    src.mapv(|v| <T as NumCast>::from(v).unwrap_or_default())
}

fn same_storage<T: Element>(a: &ArcArrayD<T>, other: &Buffer) -> bool {
    T::peek(other).is_some_and(|b| b.as_ptr() == a.as_ptr())
}

impl Buffer {
    /// A zero-filled buffer.
    pub fn zeros(dtype: DType, shape: &[usize]) -> Result<Self> {
        Ok(match dtype {
            DType::U8 => zeros_of::<u8>(shape),
            DType::U16 => zeros_of::<u16>(shape),
            DType::U32 => zeros_of::<u32>(shape),
            DType::U64 => zeros_of::<u64>(shape),
            DType::I32 => zeros_of::<i32>(shape),
            DType::I64 => zeros_of::<i64>(shape),
            DType::F32 => zeros_of::<f32>(shape),
            DType::F64 => zeros_of::<f64>(shape),
            DType::Object => {
                return Err(LazyflowError::ValueKind {
                    expected: "array dtype",
                    found: "object",
                });
            }
        })
    }

    /// Element type.
    pub fn dtype(&self) -> DType {
        match self {
            Buffer::U8(_) => DType::U8,
            Buffer::U16(_) => DType::U16,
            Buffer::U32(_) => DType::U32,
            Buffer::U64(_) => DType::U64,
            Buffer::I32(_) => DType::I32,
            Buffer::I64(_) => DType::I64,
            Buffer::F32(_) => DType::F32,
            Buffer::F64(_) => DType::F64,
        }
    }

    /// Shape of the array.
    pub fn shape(&self) -> &[usize] {
        dispatch!(self, a => a.shape())
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        dispatch!(self, a => a.len())
    }

    /// True if the buffer holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Memory held by the elements, in bytes.
    pub fn nbytes(&self) -> usize {
        self.len() * self.dtype().size_of()
    }

    /// Copy out the sub-region `roi` (in this buffer's coordinates).
    pub fn extract(&self, roi: &Roi) -> Result<Buffer> {
        self.check_fits(roi)?;
        Ok(dispatch!(self, a => a.slice(roi.slicing().as_slice()).to_owned().into()))
    }

    /// Overwrite the sub-region `roi` with `src`, which must have the same
    /// dtype and `roi`'s shape.
    pub fn assign_region(&mut self, roi: &Roi, src: &Buffer) -> Result<()> {
        self.check_fits(roi)?;
        if src.shape() != roi.shape().as_slice() {
            return Err(LazyflowError::InvalidRoi(format!(
                "cannot write data of shape {:?} into {roi}",
                src.shape()
            )));
        }
        dispatch!(self, a => copy_into(a, roi, src))
    }

    /// Zero the sub-region `roi`.
    pub fn fill_zero(&mut self, roi: &Roi) -> Result<()> {
        self.check_fits(roi)?;
        dispatch!(self, a => a.slice_mut(roi.slicing().as_slice()).fill(Zero::zero()));
        Ok(())
    }

    /// True if every element is zero.
    pub fn is_all_zero(&self) -> bool {
        dispatch!(self, a => a.iter().all(|v| v.is_zero()))
    }

    /// Convert every element to `T` (values that do not fit become zero).
    pub fn cast<T: Element>(&self) -> ArrayD<T> {
        dispatch!(self, a => cast_to::<_, T>(a))
    }

    /// Convert an array into a buffer of `dtype`.
    pub fn from_cast<S: Element>(dtype: DType, data: &ArcArrayD<S>) -> Result<Buffer> {
        Ok(match dtype {
            DType::U8 => cast_to::<S, u8>(data).into(),
            DType::U16 => cast_to::<S, u16>(data).into(),
            DType::U32 => cast_to::<S, u32>(data).into(),
            DType::U64 => cast_to::<S, u64>(data).into(),
            DType::I32 => cast_to::<S, i32>(data).into(),
            DType::I64 => cast_to::<S, i64>(data).into(),
            DType::F32 => cast_to::<S, f32>(data).into(),
            DType::F64 => cast_to::<S, f64>(data).into(),
            DType::Object => return Buffer::zeros(dtype, data.shape()),
        })
    }

    /// Borrow as a typed array.
    pub fn array<T: Element>(&self) -> Result<&ArcArrayD<T>> {
        T::peek(self).ok_or(LazyflowError::DTypeMismatch {
            expected: T::DTYPE,
            found: self.dtype(),
        })
    }

    /// Borrow as a typed view.
    pub fn view<T: Element>(&self) -> Result<ArrayViewD<'_, T>> {
        Ok(self.array::<T>()?.view())
    }

    /// Mutably borrow as a typed array. Shared storage is copied first.
    pub fn array_mut<T: Element>(&mut self) -> Result<&mut ArcArrayD<T>> {
        let found = self.dtype();
        T::peek_mut(self).ok_or(LazyflowError::DTypeMismatch {
            expected: T::DTYPE,
            found,
        })
    }

    /// True if both buffers point at the same storage.
    pub fn shares_storage(&self, other: &Buffer) -> bool {
        self.shape() == other.shape() && dispatch!(self, a => same_storage(a, other))
    }

    fn check_fits(&self, roi: &Roi) -> Result<()> {
        if roi.fits(self.shape()) {
            Ok(())
        } else {
            Err(LazyflowError::RoiOutOfBounds {
                roi: roi.clone(),
                shape: self.shape().to_vec(),
            })
        }
    }
}
