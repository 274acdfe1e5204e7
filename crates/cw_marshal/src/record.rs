//! Tuple and fixed-size-array marshalling through record cells.
//!
//! A native tuple crosses into the host as a record cell: every field boxed
//! on its own, then a record type synthesized from the fields' concrete
//! dynamic types. Synthesis never consults a static description of the
//! tuple, so a field annotated with a union still produces a record over
//! the member type its value actually has.
//!
//! Unboxing is per field: each one is fetched and converted independently,
//! so a record built elsewhere unboxes as long as every field converts,
//! whatever record type it carries.
//!
//! When a record type is needed with no value in hand,
//! [`HostTuple::static_record_type`] builds one from the fields' *static*
//! resolutions instead. The two coincide for plainly mapped fields and
//! diverge for union-typed ones, where a value's dynamic type names a
//! member.

use alloc::vec::Vec;

use cw_heap::{CellKey, DataTypeId, Heap};
use cw_utils::all_arities;

use crate::convert::{ConvertError, FromHost, ToHost};
use crate::mapped::HostMapped;

/// Dynamic type of a freshly boxed, pinned field.
fn live_type(heap: &Heap, cell: CellKey) -> DataTypeId {
    heap.cell_type(cell).unwrap_or_else(|e| e.fault())
}

// -----------------------------------------------------------------------------
// HostTuple

/// Tuples whose every field has a static host resolution.
///
/// Implemented alongside [`HostMapped`] for tuples of arity 0 through 12.
pub trait HostTuple: HostMapped {
    /// Number of fields.
    const ARITY: usize;

    /// Record type over the fields' static resolutions.
    fn static_record_type(heap: &Heap) -> DataTypeId {
        Self::host_type(heap)
    }
}

// -----------------------------------------------------------------------------
// Tuples

macro_rules! tuple_to_host {
    ($n:literal: [$($idx:tt: $ty:ident),*]) => {
        impl<$($ty: ToHost),*> ToHost for ($($ty,)*) {
            #[allow(non_snake_case)]
            fn to_host(self, heap: &Heap) -> CellKey {
                let _scope = heap.root_scope();
                let ($($ty,)*) = self;
                $(
                    let $ty = $ty.to_host(heap);
                    _scope.pin($ty);
                )*
                let ty = heap.record_type(&[$(live_type(heap, $ty)),*]);
                match heap.alloc_record(ty, &[$($ty),*]) {
                    Ok(key) => key,
                    Err(e) => e.fault(),
                }
            }
        }
    };
}

macro_rules! tuple_from_host {
    ($n:literal: [$($idx:tt: $ty:ident),*]) => {
        impl<'h, $($ty: FromHost<'h>),*> FromHost<'h> for ($($ty,)*) {
            fn from_host(heap: &'h Heap, cell: CellKey) -> Result<Self, ConvertError> {
                let arity = heap.record_arity(cell)?;
                if arity != $n {
                    return Err(ConvertError::Arity { expect: $n, found: arity });
                }
                Ok(($(
                    {
                        let field = heap.record_field(cell, $idx)?;
                        $ty::from_host(heap, field).map_err(|e| ConvertError::field($idx, e))?
                    },
                )*))
            }
        }
    };
}

macro_rules! tuple_mapped {
    ($n:literal: [$($idx:tt: $ty:ident),*]) => {
        impl<$($ty: HostMapped),*> HostMapped for ($($ty,)*) {
            fn host_type(heap: &Heap) -> DataTypeId {
                heap.record_type(&[$($ty::host_type(heap)),*])
            }
        }

        impl<$($ty: HostMapped),*> HostTuple for ($($ty,)*) {
            const ARITY: usize = $n;
        }
    };
}

all_arities!(tuple_to_host);
all_arities!(tuple_from_host);
all_arities!(tuple_mapped);

// -----------------------------------------------------------------------------
// Fixed-size arrays

/// Fixed-size arrays resolve to repeat types: a record whose every field
/// is the element's resolution, compressed to one descriptor.
impl<T: HostMapped, const N: usize> HostMapped for [T; N] {
    fn host_type(heap: &Heap) -> DataTypeId {
        heap.repeat_type(T::host_type(heap), N)
    }
}

/// Fixed-size arrays become homogeneous records. The element type is known
/// statically, so the record type is a repeat over it rather than a
/// synthesis from the field values.
impl<T: ToHost + HostMapped, const N: usize> ToHost for [T; N] {
    fn to_host(self, heap: &Heap) -> CellKey {
        let scope = heap.root_scope();
        let mut fields = [CellKey::default(); N];
        for (slot, value) in fields.iter_mut().zip(self) {
            *slot = value.to_host(heap);
            scope.pin(*slot);
        }
        let ty = Self::host_type(heap);
        match heap.alloc_record(ty, &fields) {
            Ok(key) => key,
            Err(e) => e.fault(),
        }
    }
}

impl<'h, T: FromHost<'h>, const N: usize> FromHost<'h> for [T; N] {
    fn from_host(heap: &'h Heap, cell: CellKey) -> Result<Self, ConvertError> {
        let arity = heap.record_arity(cell)?;
        if arity != N {
            return Err(ConvertError::Arity {
                expect: N,
                found: arity,
            });
        }
        let mut values = Vec::with_capacity(N);
        for index in 0..N {
            let field = heap.record_field(cell, index)?;
            values.push(T::from_host(heap, field).map_err(|e| ConvertError::field(index, e))?);
        }
        match values.try_into() {
            Ok(array) => Ok(array),
            // Unreachable past the arity check; kept total.
            Err(values) => Err(ConvertError::Arity {
                expect: N,
                found: values.len(),
            }),
        }
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use alloc::string::{String, ToString};
    use alloc::vec::Vec;

    use cw_heap::DataTypeKind;
    use proptest::prelude::*;

    use super::*;
    use crate::array::HostArray;

    #[derive(Clone, Copy, Debug, PartialEq)]
    #[repr(C)]
    struct Point {
        x: f32,
        y: f32,
    }

    crate::mirror_bits!(Point);

    #[derive(Clone, Debug, PartialEq)]
    struct Owner(String);

    crate::wrap_foreign!(Owner);

    #[test]
    fn tuples_round_trip_with_mixed_fields() {
        let heap = Heap::new();
        let value = (
            42_i64,
            Point { x: 1.0, y: 2.0 },
            Owner("ada".into()),
            (true, 'x'),
        );
        let scope = heap.root_scope();
        let cell = value.clone().to_host(&heap);
        scope.pin(cell);
        let back: (i64, Point, Owner, (bool, char)) = FromHost::from_host(&heap, cell).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn record_types_come_from_field_values_not_annotations() {
        enum Number {
            I(i64),
            F(f64),
        }

        impl ToHost for Number {
            fn to_host(self, heap: &Heap) -> CellKey {
                match self {
                    Number::I(v) => v.to_host(heap),
                    Number::F(v) => v.to_host(heap),
                }
            }
        }

        let heap = Heap::new();
        let mixed = (Number::I(1), Number::F(2.0)).to_host(&heap);
        let ints = (Number::I(1), Number::I(2)).to_host(&heap);

        let mixed_ty = heap.cell_type(mixed).unwrap();
        let ints_ty = heap.cell_type(ints).unwrap();
        assert_ne!(mixed_ty, ints_ty);
        match heap.type_kind(mixed_ty) {
            DataTypeKind::Record { fields } => {
                assert_eq!(&*fields, &[DataTypeId::I64, DataTypeId::F64]);
            }
            other => panic!("expected a record type, got {other:?}"),
        }
    }

    #[test]
    fn unbox_checks_arity_then_each_field() {
        let heap = Heap::new();
        let cell = (1_i64, 2_i64).to_host(&heap);
        assert!(matches!(
            <(i64, i64, i64)>::from_host(&heap, cell),
            Err(ConvertError::Arity {
                expect: 3,
                found: 2
            })
        ));
        let err = <(i64, bool)>::from_host(&heap, cell).unwrap_err();
        assert!(matches!(err, ConvertError::Field { index: 1, .. }));
        assert!(err.to_string().starts_with("field 1:"));
    }

    #[test]
    fn the_empty_tuple_is_an_empty_record() {
        let heap = Heap::new();
        let cell = ().to_host(&heap);
        assert_eq!(heap.record_arity(cell), Ok(0));
        <()>::from_host(&heap, cell).unwrap();
        assert_eq!(heap.cell_type(cell), Ok(<()>::static_record_type(&heap)));
    }

    #[test]
    fn plainly_mapped_tuples_box_at_their_static_record_type() {
        let heap = Heap::new();
        let cell = (3_i64, true).to_host(&heap);
        assert_eq!(
            heap.cell_type(cell),
            Ok(<(i64, bool)>::static_record_type(&heap))
        );
        assert_eq!(<(i64, bool)>::ARITY, 2);
    }

    #[test]
    fn union_fields_split_static_and_dynamic_record_types() {
        #[derive(Clone, Copy)]
        enum Scalar {
            I(i64),
            F(f64),
        }

        impl ToHost for Scalar {
            fn to_host(self, heap: &Heap) -> CellKey {
                match self {
                    Scalar::I(v) => v.to_host(heap),
                    Scalar::F(v) => v.to_host(heap),
                }
            }
        }

        impl HostMapped for Scalar {
            fn host_type(heap: &Heap) -> DataTypeId {
                heap.bind_union::<Scalar>("Scalar", &[DataTypeId::I64, DataTypeId::F64])
            }
        }

        let heap = Heap::new();
        let static_ty = <(Scalar, i64)>::static_record_type(&heap);
        let cell = (Scalar::F(0.5), 1_i64).to_host(&heap);
        let dynamic_ty = heap.cell_type(cell).unwrap();
        assert_ne!(static_ty, dynamic_ty);
        match heap.type_kind(static_ty) {
            DataTypeKind::Record { fields } => {
                assert_eq!(fields[0], Scalar::host_type(&heap));
                assert_eq!(fields[1], DataTypeId::I64);
            }
            other => panic!("expected a record type, got {other:?}"),
        }
    }

    #[test]
    fn boxing_pins_fields_across_stress_collections() {
        let heap = Heap::stress();
        let scope = heap.root_scope();
        let cell = (7_i64, Owner("kept".into()), 1.5_f64).to_host(&heap);
        scope.pin(cell);
        let back: (i64, Owner, f64) = FromHost::from_host(&heap, cell).unwrap();
        assert_eq!(back, (7, Owner("kept".into()), 1.5));
    }

    #[test]
    fn fixed_arrays_are_homogeneous_records() {
        let heap = Heap::new();
        let cell = [1.5_f32, 2.5, 3.5].to_host(&heap);
        assert_eq!(heap.record_arity(cell), Ok(3));
        assert_eq!(heap.cell_type(cell), Ok(<[f32; 3]>::host_type(&heap)));
        match heap.type_kind(heap.cell_type(cell).unwrap()) {
            DataTypeKind::Repeat { elem, len } => {
                assert_eq!(elem, DataTypeId::F32);
                assert_eq!(len, 3);
            }
            other => panic!("expected a repeat type, got {other:?}"),
        }
        let back: [f32; 3] = FromHost::from_host(&heap, cell).unwrap();
        assert_eq!(back, [1.5, 2.5, 3.5]);
        assert!(matches!(
            <[f32; 4]>::from_host(&heap, cell),
            Err(ConvertError::Arity { .. })
        ));
    }

    #[test]
    fn array_handles_nest_inside_tuples() {
        let heap = Heap::new();
        let mut arr = HostArray::<i32>::new(&heap);
        arr.extend([1, 2, 3]);
        let scope = heap.root_scope();
        let cell = (Owner("bag".into()), arr).to_host(&heap);
        scope.pin(cell);
        let (owner, back): (Owner, HostArray<i32>) = FromHost::from_host(&heap, cell).unwrap();
        assert_eq!(owner, Owner("bag".into()));
        assert_eq!(back.iter().copied().collect::<Vec<_>>(), [1, 2, 3]);
    }

    #[test]
    fn nested_tuples_box_as_nested_records() {
        let heap = Heap::new();
        let scope = heap.root_scope();
        let cell = ((1_u8, 2_u16), (3_u32, (4_u64,))).to_host(&heap);
        scope.pin(cell);
        let back: ((u8, u16), (u32, (u64,))) = FromHost::from_host(&heap, cell).unwrap();
        assert_eq!(back, ((1, 2), (3, (4,))));
    }

    proptest! {
        #[test]
        fn scalar_tuples_round_trip(a in any::<i64>(), b in any::<f64>(), c in any::<bool>()) {
            let heap = Heap::new();
            let cell = (a, b, c).to_host(&heap);
            let back: (i64, f64, bool) = FromHost::from_host(&heap, cell).unwrap();
            prop_assert_eq!(back.0, a);
            prop_assert_eq!(back.1.to_ne_bytes(), b.to_ne_bytes());
            prop_assert_eq!(back.2, c);
        }
    }
}
