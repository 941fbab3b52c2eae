//! Slot values.
//!
//! Every slot read produces a [`Value`]. Array slots produce
//! [`Value::Array`]; parameter slots (block shapes, flags, thresholds, block
//! enumerations) produce one of the scalar variants.

use crate::array::Buffer;
use crate::error::{LazyflowError, Result};
use crate::roi::Roi;

/// Data carried by a slot.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    /// No value (placeholder result before an execute fills it).
    #[default]
    Empty,
    /// N-dimensional array data.
    Array(Buffer),
    /// Boolean flag.
    Bool(bool),
    /// Integer parameter.
    Int(i64),
    /// Floating-point parameter.
    Float(f64),
    /// A shape (block shapes, array shapes).
    Shape(Vec<usize>),
    /// Free text.
    Text(String),
    /// A list of regions (block enumerations).
    Rois(Vec<Roi>),
}

impl Value {
    /// Short name of the variant, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Empty => "empty",
            Value::Array(_) => "array",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Shape(_) => "shape",
            Value::Text(_) => "text",
            Value::Rois(_) => "roi list",
        }
    }

    fn mismatch(&self, expected: &'static str) -> LazyflowError {
        LazyflowError::ValueKind {
            expected,
            found: self.kind(),
        }
    }

    /// Borrow the array.
    pub fn as_buffer(&self) -> Result<&Buffer> {
        match self {
            Value::Array(b) => Ok(b),
            other => Err(other.mismatch("array")),
        }
    }

    /// Mutably borrow the array.
    pub fn as_buffer_mut(&mut self) -> Result<&mut Buffer> {
        match self {
            Value::Array(b) => Ok(b),
            other => Err(other.mismatch("array")),
        }
    }

    /// Take the array.
    pub fn into_buffer(self) -> Result<Buffer> {
        match self {
            Value::Array(b) => Ok(b),
            other => Err(other.mismatch("array")),
        }
    }

    /// Read a flag.
    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Value::Bool(b) => Ok(*b),
            Value::Int(i) => Ok(*i != 0),
            other => Err(other.mismatch("bool")),
        }
    }

    /// Read an integer.
    pub fn as_int(&self) -> Result<i64> {
        match self {
            Value::Int(i) => Ok(*i),
            other => Err(other.mismatch("int")),
        }
    }

    /// Read a float (integers are widened).
    pub fn as_float(&self) -> Result<f64> {
        match self {
            Value::Float(f) => Ok(*f),
            Value::Int(i) => Ok(*i as f64),
            other => Err(other.mismatch("float")),
        }
    }

    /// Read a shape.
    pub fn as_shape(&self) -> Result<&[usize]> {
        match self {
            Value::Shape(s) => Ok(s),
            other => Err(other.mismatch("shape")),
        }
    }

    /// Read text.
    pub fn as_text(&self) -> Result<&str> {
        match self {
            Value::Text(s) => Ok(s),
            other => Err(other.mismatch("text")),
        }
    }

    /// Read a region list.
    pub fn as_rois(&self) -> Result<&[Roi]> {
        match self {
            Value::Rois(r) => Ok(r),
            other => Err(other.mismatch("roi list")),
        }
    }

    /// True if both values are known to be equal without comparing array
    /// contents (arrays compare by storage identity).
    pub fn same_as(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Array(a), Value::Array(b)) => a.shares_storage(b),
            (a, b) => a == b,
        }
    }
}

impl From<Buffer> for Value {
    fn from(buffer: Buffer) -> Self {
        Value::Array(buffer)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<Vec<usize>> for Value {
    fn from(shape: Vec<usize>) -> Self {
        Value::Shape(shape)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}
