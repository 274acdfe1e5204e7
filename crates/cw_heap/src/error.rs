use thiserror::Error;

use crate::types::DataTypeId;

// -----------------------------------------------------------------------------
// Error

/// Structural failures reported by [`Heap`](crate::Heap) primitives.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum HeapError {
    #[error("stale handle: the referenced cell has been swept")]
    StaleHandle,

    #[error("cell holds a {found}, not an array", found = .0.name())]
    NotAnArray(CellShape),

    #[error("cell holds a {found}, not a record", found = .0.name())]
    NotARecord(CellShape),

    #[error("cell holds a {found}, not a foreign value", found = .0.name())]
    NotForeign(CellShape),

    #[error("cell holds a {found}, not inline bits", found = .0.name())]
    NotBits(CellShape),

    #[error("array index {index} out of bounds for length {len}")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("record field {index} out of bounds for arity {arity}")]
    FieldOutOfBounds { index: usize, arity: usize },

    #[error("type id {0:?} does not describe a record")]
    NotARecordType(DataTypeId),

    #[error("record arity {found} does not match type arity {expect}")]
    ArityMismatch { expect: usize, found: usize },

    #[error("value of type id {found:?} is not assignable to slots of type id {expect:?}")]
    SlotTypeMismatch { expect: DataTypeId, found: DataTypeId },

    #[error("bits payload is {found} bytes, expected {expect}")]
    BitsSizeMismatch { expect: usize, found: usize },

    #[error("array stores inline values; reference-slot access is invalid")]
    NotRefSlots,

    #[error("cannot grow an array backed by a wrapped native buffer")]
    GrowWrapped,

    #[error("cannot grow an array of rank {0}; only rank-1 arrays grow")]
    GrowRank(u32),
}

impl HeapError {
    /// Escalates a structural failure into a runtime fault.
    ///
    /// Boundary operations whose contract makes a failure non-recoverable
    /// (vacant indirections, broken preconditions) funnel through here.
    #[cold]
    #[inline(never)]
    pub fn fault(&self) -> ! {
        panic!("{self}");
    }
}

// -----------------------------------------------------------------------------
// CellShape

/// What a cell turned out to hold, for error reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum CellShape {
    Bits,
    Foreign,
    Record,
    Array,
}

impl CellShape {
    fn name(&self) -> &'static str {
        match self {
            CellShape::Bits => "bits value",
            CellShape::Foreign => "foreign value",
            CellShape::Record => "record",
            CellShape::Array => "array",
        }
    }
}
