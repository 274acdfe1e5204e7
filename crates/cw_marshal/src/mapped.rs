use cw_heap::{DataTypeId, Heap};

// -----------------------------------------------------------------------------
// Mapping traits

/// A native type with a corresponding host-runtime datatype.
///
/// Resolution registers the native type on first use and is idempotent:
/// every call for the same `Self` on the same heap returns the same id.
pub trait HostMapped: 'static {
    fn host_type(heap: &Heap) -> DataTypeId;
}

/// Marker for native types whose host representation is bit-identical to
/// their native layout, permitting zero-copy slot access.
///
/// # Safety
///
/// Implementors guarantee that `size_of::<Self>()` equals the slot size of
/// [`host_type`](HostMapped::host_type)'s datatype and that native and host
/// agree on the meaning of every byte.
pub unsafe trait Mirrored: HostMapped {}

// -----------------------------------------------------------------------------
// Primitives

macro_rules! primitive_mapped {
    ($($t:ty => $id:ident),* $(,)?) => {$(
        impl HostMapped for $t {
            #[inline(always)]
            fn host_type(_heap: &Heap) -> DataTypeId {
                DataTypeId::$id
            }
        }

        unsafe impl Mirrored for $t {}
    )*};
}

primitive_mapped! {
    bool => BOOL,
    char => CHAR,
    i8 => I8,
    i16 => I16,
    i32 => I32,
    i64 => I64,
    u8 => U8,
    u16 => U16,
    u32 => U32,
    u64 => U64,
    f32 => F32,
    f64 => F64,
}

// -----------------------------------------------------------------------------
// Registration macros

/// Maps a native composite onto the host as a mirrored value type.
///
/// Implements [`HostMapped`], [`Mirrored`], [`ArrayElement`] (identity
/// access), [`ToHost`] and [`FromHost`] for `$t`, registering it with the
/// heap as raw bytes of `size_of::<$t>()` on first use.
///
/// # Contract
///
/// `$t` must be `Copy`, free of padding and of reference or pointer fields,
/// and valid for every bit pattern of its size. Violating this makes the
/// generated `unsafe impl`s unsound.
///
/// [`ArrayElement`]: crate::ArrayElement
/// [`ToHost`]: crate::ToHost
/// [`FromHost`]: crate::FromHost
#[macro_export]
macro_rules! mirror_bits {
    ($t:ty) => {
        const _: () = {
            assert!(
                ::core::mem::size_of::<$t>() != 0,
                "mirrored types cannot be zero-sized",
            );
        };

        impl $crate::HostMapped for $t {
            fn host_type(heap: &$crate::__rt::Heap) -> $crate::__rt::DataTypeId {
                heap.bind_bits::<$t>(::core::stringify!($t))
            }
        }

        unsafe impl $crate::Mirrored for $t {}

        unsafe impl $crate::ArrayElement for $t {
            type Slot = $t;
            type Access = $crate::Identity;
        }

        impl $crate::ToHost for $t {
            fn to_host(self, heap: &$crate::__rt::Heap) -> $crate::__rt::CellKey {
                let ty = <Self as $crate::HostMapped>::host_type(heap);
                let bytes = unsafe {
                    ::core::slice::from_raw_parts(
                        (&raw const self).cast::<u8>(),
                        ::core::mem::size_of::<$t>(),
                    )
                };
                heap.alloc_bits(ty, bytes)
            }
        }

        impl<'h> $crate::FromHost<'h> for $t {
            fn from_host(
                heap: &'h $crate::__rt::Heap,
                cell: $crate::__rt::CellKey,
            ) -> ::core::result::Result<Self, $crate::ConvertError> {
                let expect = <Self as $crate::HostMapped>::host_type(heap);
                let found = heap.cell_type(cell)?;
                if found != expect {
                    return ::core::result::Result::Err($crate::ConvertError::TypeMismatch {
                        expect,
                        found,
                    });
                }
                let mut value = ::core::mem::MaybeUninit::<$t>::uninit();
                let bytes = unsafe {
                    ::core::slice::from_raw_parts_mut(
                        value.as_mut_ptr().cast::<u8>(),
                        ::core::mem::size_of::<$t>(),
                    )
                };
                heap.bits_copy(cell, bytes)?;
                ::core::result::Result::Ok(unsafe { value.assume_init() })
            }
        }
    };
}

/// Maps a native type onto the host as an opaque wrapped type.
///
/// Implements [`HostMapped`], [`ArrayElement`] (lift access through a cell
/// reference), [`ToHost`] (moving the value into a heap-owned cell) and
/// [`FromHost`] (cloning it back out) for `$t`. `$t` must be `Clone`; the
/// host side never aliases into native records, so unboxing is always a
/// fresh value.
///
/// [`ArrayElement`]: crate::ArrayElement
/// [`ToHost`]: crate::ToHost
/// [`FromHost`]: crate::FromHost
#[macro_export]
macro_rules! wrap_foreign {
    ($t:ty) => {
        impl $crate::HostMapped for $t {
            fn host_type(heap: &$crate::__rt::Heap) -> $crate::__rt::DataTypeId {
                heap.bind_foreign::<$t>(::core::stringify!($t))
            }
        }

        unsafe impl $crate::ArrayElement for $t {
            type Slot = $crate::__rt::RefSlot;
            type Access = $crate::Lift;
        }

        impl $crate::ToHost for $t {
            fn to_host(self, heap: &$crate::__rt::Heap) -> $crate::__rt::CellKey {
                let ty = <Self as $crate::HostMapped>::host_type(heap);
                heap.alloc_foreign(ty, self)
            }
        }

        impl<'h> $crate::FromHost<'h> for $t {
            fn from_host(
                heap: &'h $crate::__rt::Heap,
                cell: $crate::__rt::CellKey,
            ) -> ::core::result::Result<Self, $crate::ConvertError> {
                let expect = <Self as $crate::HostMapped>::host_type(heap);
                let found = heap.cell_type(cell)?;
                if found != expect {
                    return ::core::result::Result::Err($crate::ConvertError::TypeMismatch {
                        expect,
                        found,
                    });
                }
                let ptr = heap.foreign_ptr(cell)?;
                ::core::result::Result::Ok(unsafe { ptr.cast::<$t>().as_ref() }.clone())
            }
        }
    };
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use cw_heap::DataTypeKind;

    use super::*;

    #[test]
    fn primitives_map_to_fixed_ids() {
        let heap = Heap::new();
        assert_eq!(i64::host_type(&heap), DataTypeId::I64);
        assert_eq!(bool::host_type(&heap), DataTypeId::BOOL);
        assert_eq!(f32::host_type(&heap), DataTypeId::F32);
        // Resolving a primitive registers nothing.
        assert_eq!(heap.stats().bindings_registered, 0);
    }

    #[derive(Clone, Copy, Debug, PartialEq)]
    #[repr(C)]
    struct Vec2 {
        x: f32,
        y: f32,
    }

    mirror_bits!(Vec2);

    #[derive(Clone, Debug, PartialEq)]
    struct Name(alloc::string::String);

    wrap_foreign!(Name);

    #[test]
    fn mirror_bits_registers_a_bits_type() {
        let heap = Heap::new();
        let ty = Vec2::host_type(&heap);
        match heap.type_kind(ty) {
            DataTypeKind::Bits { layout } => {
                assert_eq!(layout, core::alloc::Layout::new::<Vec2>());
            }
            other => panic!("expected a bits kind, got {other:?}"),
        }
        assert_eq!(heap.type_name(ty), "Vec2");
        assert!(heap.is_inline_type(ty));
    }

    #[test]
    fn wrap_foreign_registers_an_opaque_type() {
        let heap = Heap::new();
        let ty = Name::host_type(&heap);
        assert!(matches!(heap.type_kind(ty), DataTypeKind::Foreign));
        assert!(!heap.is_inline_type(ty));
    }
}
