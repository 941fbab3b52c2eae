//! Error type shared by every lazyflow component.
//!
//! A single failed computation is often observed by several waiters (all
//! readers of the same cache block share one upstream request), so
//! [`LazyflowError`] is `Clone`: foreign errors are kept behind an `Arc`.

use std::sync::Arc;

use thiserror::Error;

use crate::array::DType;
use crate::roi::Roi;

/// Result alias used throughout lazyflow.
pub type Result<T> = std::result::Result<T, LazyflowError>;

/// Errors raised by slots, operators, requests and caches.
#[derive(Debug, Clone, Error)]
pub enum LazyflowError {
    /// The slot has no metadata yet (unconnected, or its operator is not configured).
    #[error("slot '{slot}' is not ready")]
    SlotNotReady {
        /// Qualified slot name (`Operator.Slot`).
        slot: String,
    },

    /// A connection or value does not fit the slot.
    #[error("incompatible slot '{slot}': {reason}")]
    IncompatibleSlot {
        /// Qualified slot name.
        slot: String,
        /// What was wrong.
        reason: String,
    },

    /// A region of interest reaches outside the slot's shape.
    #[error("roi {roi} is out of bounds for shape {shape:?}")]
    RoiOutOfBounds {
        /// The offending region.
        roi: Roi,
        /// Shape it was checked against.
        shape: Vec<usize>,
    },

    /// A region of interest is malformed (start > stop, unparsable text, ...).
    #[error("invalid roi: {0}")]
    InvalidRoi(String),

    /// An operator's computation failed.
    #[error("computation failed in operator '{operator}': {source}")]
    Computation {
        /// Name of the operator whose execute failed.
        operator: String,
        /// Underlying error.
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync>,
    },

    /// The request was cancelled before it produced a value.
    #[error("request was cancelled")]
    Cancelled,

    /// A request waited on itself (directly or through its parents).
    #[error("request waited on itself")]
    CircularWait,

    /// Array element types do not match.
    #[error("dtype mismatch: expected {expected}, found {found}")]
    DTypeMismatch {
        /// Expected element type.
        expected: DType,
        /// Element type that was supplied.
        found: DType,
    },

    /// A slot value has the wrong kind (e.g. an array where a bool was expected).
    #[error("expected {expected} value, found {found}")]
    ValueKind {
        /// Expected kind.
        expected: &'static str,
        /// Kind that was supplied.
        found: &'static str,
    },

    /// The operator does not implement the requested operation.
    #[error("operator '{operator}' does not support {what}")]
    Unsupported {
        /// Operator name.
        operator: String,
        /// Operation that was attempted.
        what: &'static str,
    },

    /// Connecting these slots would make the operator graph cyclic.
    #[error("connecting would create a cycle")]
    CycleDetected,

    /// The operator has been torn down.
    #[error("operator '{0}' has been closed")]
    Closed(String),

    /// The graph was finalized; no further requests are accepted.
    #[error("graph has been finalized")]
    Finalized,
}

impl LazyflowError {
    /// Create a slot-not-ready error.
    pub fn not_ready(slot: impl Into<String>) -> Self {
        LazyflowError::SlotNotReady { slot: slot.into() }
    }

    /// Create an incompatible-slot error.
    pub fn incompatible(slot: impl Into<String>, reason: impl Into<String>) -> Self {
        LazyflowError::IncompatibleSlot {
            slot: slot.into(),
            reason: reason.into(),
        }
    }

    /// Wrap a foreign error raised inside an operator.
    pub fn computation(
        operator: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        LazyflowError::Computation {
            operator: operator.into(),
            source: Arc::from(source.into()),
        }
    }

    /// Create an unsupported-operation error.
    pub fn unsupported(operator: impl Into<String>, what: &'static str) -> Self {
        LazyflowError::Unsupported {
            operator: operator.into(),
            what,
        }
    }

    /// True for [`LazyflowError::Cancelled`].
    pub fn is_cancelled(&self) -> bool {
        matches!(self, LazyflowError::Cancelled)
    }
}
