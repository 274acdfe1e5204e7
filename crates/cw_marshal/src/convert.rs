use alloc::boxed::Box;

use cw_heap::{CellKey, DataTypeId, Heap, HeapError};
use thiserror::Error;

use crate::mapped::HostMapped;

// -----------------------------------------------------------------------------
// Error

/// Failures while converting a host value back to a native one.
///
/// Conversion errors are recoverable and carry the position of the offending
/// field when they arise inside a record, so nested failures read like a
/// path: `field 2: field 0: expected a value of type ...`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConvertError {
    #[error("expected a value of type {expect:?}, found {found:?}")]
    TypeMismatch {
        expect: DataTypeId,
        found: DataTypeId,
    },

    #[error("record arity {found} does not match the expected arity {expect}")]
    Arity { expect: usize, found: usize },

    #[error("byte pattern is not a valid value of the target type")]
    InvalidBits,

    #[error("field {index}: {source}")]
    Field {
        index: usize,
        source: Box<ConvertError>,
    },

    #[error(transparent)]
    Heap(#[from] HeapError),
}

impl ConvertError {
    pub(crate) fn field(index: usize, source: ConvertError) -> Self {
        Self::Field {
            index,
            source: Box::new(source),
        }
    }
}

// -----------------------------------------------------------------------------
// Conversion traits

/// Converts a native value into a host cell by value.
///
/// Boxing may allocate and therefore collect; the returned key is unrooted,
/// so a caller that performs further allocations while holding it must pin
/// it first. Arrays and records of convertible values are themselves
/// convertible, recursively.
pub trait ToHost {
    fn to_host(self, heap: &Heap) -> CellKey;
}

/// Converts a host cell back into a native value by value.
///
/// Fails with [`ConvertError::TypeMismatch`] when the cell's dynamic type is
/// incompatible with `Self`. Never aliases host storage: the result is
/// always a fresh native value.
pub trait FromHost<'h>: Sized {
    fn from_host(heap: &'h Heap, cell: CellKey) -> Result<Self, ConvertError>;
}

// -----------------------------------------------------------------------------
// Primitive impls

/// Checks the cell's dynamic type against `T`'s mapping and copies out its
/// payload bytes.
fn expect_bits<T: HostMapped, const N: usize>(
    heap: &Heap,
    cell: CellKey,
) -> Result<[u8; N], ConvertError> {
    let expect = T::host_type(heap);
    let found = heap.cell_type(cell)?;
    if found != expect {
        return Err(ConvertError::TypeMismatch { expect, found });
    }
    let mut bytes = [0u8; N];
    heap.bits_copy(cell, &mut bytes)?;
    Ok(bytes)
}

macro_rules! numeric_convert {
    ($($t:ty),* $(,)?) => {$(
        impl ToHost for $t {
            #[inline]
            fn to_host(self, heap: &Heap) -> CellKey {
                let ty = <$t as HostMapped>::host_type(heap);
                heap.alloc_bits(ty, &self.to_ne_bytes())
            }
        }

        impl<'h> FromHost<'h> for $t {
            fn from_host(heap: &'h Heap, cell: CellKey) -> Result<Self, ConvertError> {
                let bytes = expect_bits::<$t, { ::core::mem::size_of::<$t>() }>(heap, cell)?;
                Ok(<$t>::from_ne_bytes(bytes))
            }
        }
    )*};
}

numeric_convert!(i8, i16, i32, i64, u8, u16, u32, u64, f32, f64);

impl ToHost for bool {
    #[inline]
    fn to_host(self, heap: &Heap) -> CellKey {
        heap.alloc_bits(DataTypeId::BOOL, &[u8::from(self)])
    }
}

impl<'h> FromHost<'h> for bool {
    fn from_host(heap: &'h Heap, cell: CellKey) -> Result<Self, ConvertError> {
        let [byte] = expect_bits::<bool, 1>(heap, cell)?;
        match byte {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(ConvertError::InvalidBits),
        }
    }
}

impl ToHost for char {
    #[inline]
    fn to_host(self, heap: &Heap) -> CellKey {
        heap.alloc_bits(DataTypeId::CHAR, &(self as u32).to_ne_bytes())
    }
}

impl<'h> FromHost<'h> for char {
    fn from_host(heap: &'h Heap, cell: CellKey) -> Result<Self, ConvertError> {
        let bytes = expect_bits::<char, 4>(heap, cell)?;
        char::from_u32(u32::from_ne_bytes(bytes)).ok_or(ConvertError::InvalidBits)
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primitive_round_trip() {
        let heap = Heap::new();
        let cell = 0x1234_5678_9abc_def0_i64.to_host(&heap);
        assert_eq!(i64::from_host(&heap, cell), Ok(0x1234_5678_9abc_def0));

        let cell = 2.5f64.to_host(&heap);
        assert_eq!(f64::from_host(&heap, cell), Ok(2.5));

        let cell = 'λ'.to_host(&heap);
        assert_eq!(char::from_host(&heap, cell), Ok('λ'));

        let cell = true.to_host(&heap);
        assert_eq!(bool::from_host(&heap, cell), Ok(true));
    }

    #[test]
    fn unboxing_checks_the_dynamic_type() {
        let heap = Heap::new();
        let cell = 1.5f64.to_host(&heap);
        assert_eq!(
            i64::from_host(&heap, cell),
            Err(ConvertError::TypeMismatch {
                expect: DataTypeId::I64,
                found: DataTypeId::F64,
            })
        );
    }

    #[test]
    fn forged_payloads_do_not_become_values() {
        let heap = Heap::new();
        let bad_bool = heap.alloc_bits(DataTypeId::BOOL, &[7]);
        assert_eq!(bool::from_host(&heap, bad_bool), Err(ConvertError::InvalidBits));

        // 0xD800 is an unpaired surrogate, not a scalar value.
        let bad_char = heap.alloc_bits(DataTypeId::CHAR, &0xD800u32.to_ne_bytes());
        assert_eq!(char::from_host(&heap, bad_char), Err(ConvertError::InvalidBits));
    }

    #[test]
    fn stale_cells_surface_the_heap_error() {
        let heap = Heap::new();
        let cell = 1i64.to_host(&heap);
        heap.collect();
        assert_eq!(
            i64::from_host(&heap, cell),
            Err(ConvertError::Heap(HeapError::StaleHandle))
        );
    }

    #[test]
    fn field_errors_carry_their_position() {
        let err = ConvertError::field(2, ConvertError::InvalidBits);
        assert_eq!(
            alloc::format!("{err}"),
            "field 2: byte pattern is not a valid value of the target type"
        );
    }
}
