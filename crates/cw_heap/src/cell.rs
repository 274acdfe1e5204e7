use alloc::boxed::Box;
use core::ptr::NonNull;

use slotmap::{Key as _, new_key_type};
use smallvec::SmallVec;

use crate::storage::RawStore;
use crate::types::DataTypeId;

// -----------------------------------------------------------------------------
// CellKey

new_key_type! {
    /// Generational handle to a heap cell.
    ///
    /// Keys survive cell relocation inside the arena, and a key whose cell
    /// has been swept resolves to nothing instead of to recycled memory, so
    /// a use-after-sweep surfaces as a deterministic failure.
    pub struct CellKey;
}

// -----------------------------------------------------------------------------
// RefSlot

/// One slot of reference-kind array storage.
///
/// Freshly allocated reference slots are vacant; storing through
/// [`Heap::array_set_ref`](crate::Heap::array_set_ref) makes them occupied.
/// Dereferencing a vacant slot is the null-indirection fault.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(transparent)]
pub struct RefSlot(CellKey);

impl RefSlot {
    /// The empty slot value.
    #[inline]
    pub fn vacant() -> Self {
        Self(CellKey::null())
    }

    /// A slot holding `key`.
    #[inline]
    pub fn occupied(key: CellKey) -> Self {
        Self(key)
    }

    /// The referenced cell, or `None` for a vacant slot.
    #[inline]
    pub fn key(self) -> Option<CellKey> {
        (!self.0.is_null()).then_some(self.0)
    }

    #[inline]
    pub fn is_vacant(self) -> bool {
        self.0.is_null()
    }
}

// -----------------------------------------------------------------------------
// BufferOwner

/// Who owns an array's backing buffer.
///
/// Borrowing, the third regime of the ownership model, is carried by
/// lifetimes: views and iterators borrow the heap and cannot outlive it, so
/// it never needs a runtime tag.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BufferOwner {
    /// Native code owns the buffer. The collector never frees or moves it,
    /// no matter when the array object dies.
    Native,

    /// The heap owns the buffer and reclaims it once the array object is
    /// swept.
    Host,
}

// -----------------------------------------------------------------------------
// Dropper

/// Type-erased destructor for a heap-owned foreign value.
///
/// Produced per concrete type at allocation; retakes the `Box` made in
/// [`Heap::alloc_foreign`](crate::Heap::alloc_foreign).
#[derive(Clone, Copy)]
pub(crate) struct Dropper(unsafe fn(NonNull<u8>));

impl Dropper {
    pub(crate) fn of<T: 'static>() -> Self {
        unsafe fn drop_boxed<T>(ptr: NonNull<u8>) {
            drop(unsafe { Box::from_raw(ptr.cast::<T>().as_ptr()) });
        }
        Self(drop_boxed::<T>)
    }

    /// # Safety
    /// `ptr` must be the allocation this dropper was created for, and must
    /// not be used afterwards.
    pub(crate) unsafe fn call(self, ptr: NonNull<u8>) {
        unsafe { (self.0)(ptr) }
    }
}

// -----------------------------------------------------------------------------
// Cells

/// Storage class of an array's element slots.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum ElemKind {
    /// Slots hold element values directly.
    Inline,
    /// Slots hold [`RefSlot`]s traced by the collector.
    Refs,
}

/// Header and storage of one array object.
pub(crate) struct ArrayCell {
    pub(crate) elem: DataTypeId,
    pub(crate) rank: u32,
    pub(crate) dims: SmallVec<[usize; 3]>,
    /// Logical element count over the flattened extent.
    pub(crate) len: usize,
    pub(crate) kind: ElemKind,
    pub(crate) owner: BufferOwner,
    /// Buffer was supplied by native code; such arrays never grow.
    pub(crate) wrapped: bool,
    pub(crate) store: RawStore,
}

/// Payload of a heap cell.
pub(crate) enum CellBody {
    /// Inline bytes of a boxed mirrored value.
    Bits(Box<[u8]>),

    /// A native value owned by the heap behind a type-erased destructor.
    Foreign { ptr: NonNull<u8>, dropper: Dropper },

    /// An immutable record; fields stay boxed.
    Record(Box<[CellKey]>),

    /// A dense array.
    Array(ArrayCell),
}

/// One tracked heap object.
pub(crate) struct HeapCell {
    pub(crate) ty: DataTypeId,
    pub(crate) marked: bool,
    pub(crate) body: CellBody,
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_ref_slot_is_vacant() {
        let slot = RefSlot::vacant();
        assert!(slot.is_vacant());
        assert_eq!(slot.key(), None);
    }

    #[test]
    fn ref_slot_size_matches_key() {
        assert_eq!(
            core::mem::size_of::<RefSlot>(),
            core::mem::size_of::<CellKey>()
        );
    }
}
