//! Owned and borrowed facades over heap array cells.

use core::fmt;
use core::marker::PhantomData;
use core::ptr::NonNull;

use cw_heap::{CellKey, Heap, HeapError};

use crate::convert::{ConvertError, FromHost, ToHost};
use crate::element::{ArrayElement, ExtractStrategy, InPlace, Store};
use crate::resolve::{array_type_for, element_type_for};

mod slot_iter;
pub mod view;

pub use slot_iter::{SlotIter, SlotIterMut};

use view::{ArrayView, ArrayViewMut};

// -----------------------------------------------------------------------------
// HostArray

/// A growable rank-1 host array created and managed from native code.
///
/// The element type fixes the storage form at compile time: mirrored types
/// occupy inline slots and move between native and host representations by
/// copy, wrapped types occupy reference slots and box on write. Reads go
/// through [`get`](HostArray::get) and [`iter`](HostArray::iter) without
/// consulting the dynamic element type again.
///
/// The backing cell is not rooted by the handle. Pin [`key`](HostArray::key)
/// in a [`root_scope`](Heap::root_scope) across any collection point;
/// [`push`](HostArray::push) pins it internally for the duration of the
/// call.
///
/// # Examples
///
/// ```
/// use cw_heap::Heap;
/// use cw_marshal::HostArray;
///
/// let heap = Heap::new();
/// let mut primes = HostArray::<u32>::new(&heap);
/// primes.extend([2, 3, 5, 7]);
///
/// assert_eq!(primes.len(), 4);
/// assert_eq!(primes.iter().copied().collect::<Vec<_>>(), [2, 3, 5, 7]);
/// ```
pub struct HostArray<'h, T: ArrayElement> {
    heap: &'h Heap,
    key: CellKey,
    _marker: PhantomData<fn() -> T>,
}

impl<'h, T: ArrayElement> HostArray<'h, T> {
    /// Allocates an empty array for `T` on `heap`.
    pub fn new(heap: &'h Heap) -> Self {
        Self::with_len(heap, 0)
    }

    /// Allocates an array of `len` slots in their defined initial state:
    /// zero for inline slots, vacant for reference slots. Reading a vacant
    /// reference slot faults, so wrapped-element arrays made this way must
    /// be written before they are read.
    pub fn with_len(heap: &'h Heap, len: usize) -> Self {
        let elem = element_type_for::<T>(heap);
        let key = heap.alloc_array(elem, len);
        Self {
            heap,
            key,
            _marker: PhantomData,
        }
    }

    /// Key of the backing array cell.
    #[inline]
    pub fn key(&self) -> CellKey {
        self.key
    }

    #[inline]
    pub fn heap(&self) -> &'h Heap {
        self.heap
    }

    pub fn len(&self) -> usize {
        self.heap.array_len(self.key).unwrap_or_else(|e| e.fault())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Base pointer of the current storage.
    ///
    /// Valid for reads of [`len`](HostArray::len) slots until the array next
    /// grows. Growth may relocate the buffer; the retired block stays
    /// readable until the heap is dropped, so a stale pointer reads the old
    /// contents rather than dangling. Re-fetch after any operation that can
    /// grow the array.
    pub fn data(&self) -> NonNull<T::Slot> {
        self.heap
            .array_data(self.key)
            .unwrap_or_else(|e| e.fault())
            .cast::<T::Slot>()
    }

    /// Base pointer of the current storage, for writes.
    ///
    /// Same validity as [`data`](HostArray::data). The exclusive borrow
    /// keeps the safe accessors from aliasing the written slots; reference
    /// slots must only be written through
    /// [`array_set_ref`](Heap::array_set_ref) so the store stays traced.
    pub fn data_mut(&mut self) -> NonNull<T::Slot> {
        self.data()
    }

    /// Borrows the element at `index`, or `None` past the end.
    ///
    /// The borrow is tied to `&self`, so the storage cannot be grown out
    /// from under it.
    pub fn get(&self, index: usize) -> Option<&T> {
        if index >= self.len() {
            return None;
        }
        let slot = unsafe { self.data().add(index) };
        Some(unsafe { T::Access::extract(self.heap, slot) })
    }

    pub fn last(&self) -> Option<&T> {
        self.get(self.len().checked_sub(1)?)
    }

    pub fn iter(&self) -> SlotIter<'_, T> {
        unsafe { SlotIter::new(self.heap, self.data(), self.len()) }
    }

    pub fn iter_mut(&mut self) -> SlotIterMut<'_, T>
    where
        T::Access: InPlace<T>,
    {
        unsafe { SlotIterMut::new(self.heap, self.data(), self.len()) }
    }

    /// Appends `value`, growing the storage by one slot.
    ///
    /// The array key is pinned for the duration of the call, so boxing the
    /// value or relocating the storage cannot sweep it. Previously yielded
    /// borrows are unaffected: retired storage stays readable until the
    /// heap is dropped.
    pub fn push(&mut self, value: T)
    where
        T::Access: Store<T>,
    {
        let scope = self.heap.root_scope();
        scope.pin(self.key);
        if let Err(e) = self.heap.array_grow(self.key, 1) {
            e.fault();
        }
        let index = self.len() - 1;
        // The new slot is in its defined initial state until this write.
        unsafe { T::Access::store(self.heap, self.key, index, value) };
    }

    /// Appends an already-boxed cell to a reference-slot array.
    ///
    /// Unlike [`push`](HostArray::push) this goes through the dynamic
    /// assignability check, so it can store any member of a union element
    /// type.
    pub fn push_cell(&mut self, cell: CellKey) -> Result<(), HeapError> {
        let elem = self.heap.array_elem_type(self.key)?;
        if self.heap.is_inline_type(elem) {
            // Checked before growing so a failed push leaves no extra slot.
            return Err(HeapError::NotRefSlots);
        }
        let scope = self.heap.root_scope();
        scope.pin(self.key);
        scope.pin(cell);
        self.heap.array_grow(self.key, 1)?;
        let index = self.len() - 1;
        self.heap.array_set_ref(self.key, index, cell)
    }

    /// Read-only view of the backing cell.
    pub fn as_view(&self) -> ArrayView<'_, T> {
        ArrayView::attach(self.heap, self.key)
    }

    /// Mutable view of the backing cell.
    pub fn as_view_mut(&mut self) -> ArrayViewMut<'_, T> {
        // The exclusive borrow of the owning handle is the only access path.
        unsafe { ArrayViewMut::attach_mut(self.heap, self.key) }
    }
}

impl<T: ArrayElement> Extend<T> for HostArray<'_, T>
where
    T::Access: Store<T>,
{
    fn extend<I: IntoIterator<Item = T>>(&mut self, values: I) {
        for value in values {
            self.push(value);
        }
    }
}

impl<'a, T: ArrayElement> IntoIterator for &'a HostArray<'_, T> {
    type Item = &'a T;
    type IntoIter = SlotIter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<'a, T: ArrayElement> IntoIterator for &'a mut HostArray<'_, T>
where
    T::Access: InPlace<T>,
{
    type Item = &'a mut T;
    type IntoIter = SlotIterMut<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter_mut()
    }
}

impl<T: ArrayElement> ToHost for HostArray<'_, T> {
    fn to_host(self, heap: &Heap) -> CellKey {
        debug_assert!(core::ptr::eq(self.heap, heap));
        self.key
    }
}

impl<'h, T: ArrayElement> FromHost<'h> for HostArray<'h, T> {
    /// Attaches to an existing rank-1 array cell of exactly `T`'s element
    /// type. Shape or element mismatches are recoverable errors.
    fn from_host(heap: &'h Heap, cell: CellKey) -> Result<Self, ConvertError> {
        let expect = array_type_for::<T>(heap, 1);
        let found = heap.cell_type(cell)?;
        if found != expect {
            return Err(ConvertError::TypeMismatch { expect, found });
        }
        Ok(Self {
            heap,
            key: cell,
            _marker: PhantomData,
        })
    }
}

impl<T: ArrayElement> fmt::Debug for HostArray<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostArray")
            .field("key", &self.key)
            .field("len", &self.heap.array_len(self.key).ok())
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use alloc::format;
    use alloc::string::String;
    use alloc::vec::Vec;

    use proptest::prelude::*;

    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct Label(String);

    crate::wrap_foreign!(Label);

    #[test]
    fn mirrored_push_copies_without_boxing() {
        let heap = Heap::new();
        let mut arr = HostArray::<i64>::new(&heap);
        let before = heap.stats().boxes_allocated;
        for v in 0..8 {
            arr.push(v);
        }
        assert_eq!(arr.len(), 8);
        assert_eq!(arr.last(), Some(&7));
        assert_eq!(heap.stats().boxes_allocated, before);
    }

    #[test]
    fn wrapped_push_boxes_each_element() {
        let heap = Heap::new();
        let mut arr = HostArray::<Label>::new(&heap);
        let before = heap.stats().boxes_allocated;
        arr.push(Label("a".into()));
        arr.push(Label("b".into()));
        assert_eq!(heap.stats().boxes_allocated, before + 2);
        assert_eq!(arr.get(1), Some(&Label("b".into())));
    }

    #[test]
    fn growth_preserves_existing_elements() {
        let heap = Heap::new();
        let mut arr = HostArray::<i32>::new(&heap);
        for v in 0..100 {
            arr.push(v);
        }
        let collected: Vec<i32> = arr.iter().copied().collect();
        assert_eq!(collected, (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn push_survives_stress_collection() {
        let heap = Heap::stress();
        let mut arr = HostArray::<Label>::new(&heap);
        for i in 0..10 {
            arr.push(Label(format!("v{i}")));
        }
        assert_eq!(arr.len(), 10);
        assert_eq!(arr.get(0), Some(&Label("v0".into())));
        assert_eq!(arr.get(9), Some(&Label("v9".into())));
    }

    #[test]
    fn preallocated_arrays_start_zeroed() {
        let heap = Heap::new();
        let arr = HostArray::<u32>::with_len(&heap, 3);
        assert_eq!(arr.iter().copied().collect::<Vec<_>>(), [0, 0, 0]);
    }

    #[test]
    #[should_panic(expected = "vacant reference slot")]
    fn preallocated_reference_slots_fault_until_written() {
        let heap = Heap::new();
        let arr = HostArray::<Label>::with_len(&heap, 1);
        let _ = arr.get(0);
    }

    #[test]
    fn in_place_mutation_scales_elements() {
        let heap = Heap::new();
        let mut arr = HostArray::<i64>::new(&heap);
        arr.extend([1, 2, 3]);
        for value in &mut arr {
            *value *= 2;
        }
        assert_eq!(arr.iter().copied().collect::<Vec<_>>(), [2, 4, 6]);
    }

    #[test]
    fn arrays_round_trip_through_cells() {
        let heap = Heap::new();
        let mut arr = HostArray::<f64>::new(&heap);
        arr.extend([1.5, 2.5]);
        let key = arr.to_host(&heap);
        let back = HostArray::<f64>::from_host(&heap, key).unwrap();
        assert_eq!(back.iter().copied().collect::<Vec<_>>(), [1.5, 2.5]);
        assert!(matches!(
            HostArray::<i64>::from_host(&heap, key),
            Err(ConvertError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn push_cell_stores_preboxed_values() {
        let heap = Heap::new();
        let mut arr = HostArray::<Label>::new(&heap);
        let cell = Label("boxed".into()).to_host(&heap);
        arr.push_cell(cell).unwrap();
        assert_eq!(arr.get(0), Some(&Label("boxed".into())));

        // Inline-slot arrays have no cell references to store into.
        let mut ints = HostArray::<i64>::new(&heap);
        let other = Label("x".into()).to_host(&heap);
        assert_eq!(ints.push_cell(other), Err(HeapError::NotRefSlots));
        assert!(ints.is_empty());
    }

    proptest! {
        #[test]
        fn pushes_preserve_every_element(values in proptest::collection::vec(any::<i64>(), 0..64)) {
            let heap = Heap::stress();
            let mut arr = HostArray::<i64>::new(&heap);
            for &v in &values {
                arr.push(v);
            }
            prop_assert_eq!(arr.iter().copied().collect::<Vec<_>>(), values);
        }
    }
}
