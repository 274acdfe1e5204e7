//! Borrowed views over array cells, including views of native buffers.

use core::fmt;
use core::marker::PhantomData;
use core::ops::{Index, IndexMut};
use core::ptr::NonNull;

use alloc::boxed::Box;
use alloc::vec::Vec;

use cw_heap::{BufferOwner, CellKey, Heap};

use crate::array::{HostArray, SlotIter, SlotIterMut};
use crate::checked_assert;
use crate::convert::{ConvertError, FromHost, ToHost};
use crate::element::{ArrayElement, ExtractStrategy, InPlace, Store};
use crate::resolve::{array_type_for, element_type_for};

fn slot_base<T: ArrayElement>(heap: &Heap, key: CellKey) -> NonNull<T::Slot> {
    heap.array_data(key)
        .unwrap_or_else(|e| e.fault())
        .cast::<T::Slot>()
}

fn cell_len(heap: &Heap, key: CellKey) -> usize {
    heap.array_len(key).unwrap_or_else(|e| e.fault())
}

#[cold]
#[inline(never)]
fn attach_failed(e: &ConvertError) -> ! {
    panic!("cannot attach array view: {e}");
}

#[cold]
#[inline(never)]
fn index_out_of_bounds(index: usize, len: usize) -> ! {
    panic!("index {index} out of bounds for array of length {len}");
}

// -----------------------------------------------------------------------------
// ArrayView

/// A borrowed, read-only view of an array cell of known element type and
/// rank.
///
/// Attaching checks the cell's dynamic type once; every access after that
/// is a direct slot read. Views are `Copy` and do not own or root the cell.
///
/// A view never blocks growth. Growing relocates the slot storage, but a
/// retired storage epoch stays readable until the heap is dropped, so
/// borrows and iterators taken before a growth keep reading the bytes they
/// were created over rather than dangling. Rank-1 views can
/// [`push`](ArrayView::push) because appending writes only slots no borrow
/// has ever been handed out for.
///
/// # Examples
///
/// ```
/// use cw_heap::Heap;
/// use cw_marshal::{ArrayView, HostArray};
///
/// let heap = Heap::new();
/// let mut owned = HostArray::<i64>::new(&heap);
/// owned.extend([3, 1, 4]);
///
/// let view = ArrayView::<i64>::attach(&heap, owned.key());
/// assert_eq!(view.len(), 3);
/// assert_eq!(view[2], 4);
/// ```
pub struct ArrayView<'h, T: ArrayElement, const DIM: usize = 1> {
    heap: &'h Heap,
    key: CellKey,
    _marker: PhantomData<fn() -> T>,
}

impl<T: ArrayElement, const DIM: usize> Clone for ArrayView<'_, T, DIM> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: ArrayElement, const DIM: usize> Copy for ArrayView<'_, T, DIM> {}

impl<'h, T: ArrayElement, const DIM: usize> ArrayView<'h, T, DIM> {
    /// Attaches to `key`, faulting unless the cell is a rank-`DIM` array
    /// of exactly `T`'s element type. Use [`FromHost`] for the recoverable
    /// form.
    pub fn attach(heap: &'h Heap, key: CellKey) -> Self {
        match Self::from_host(heap, key) {
            Ok(view) => view,
            Err(e) => attach_failed(&e),
        }
    }

    /// Key of the viewed cell.
    #[inline]
    pub fn key(&self) -> CellKey {
        self.key
    }

    #[inline]
    pub fn heap(&self) -> &'h Heap {
        self.heap
    }

    /// Total slot count across all dimensions.
    pub fn len(&self) -> usize {
        cell_len(self.heap, self.key)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Extent along each dimension, row-major.
    pub fn dims(&self) -> [usize; DIM] {
        let dims = self
            .heap
            .array_dims(self.key)
            .unwrap_or_else(|e| e.fault());
        let mut out = [0usize; DIM];
        out.copy_from_slice(&dims);
        out
    }

    /// Borrows the element at linear, row-major position `index`.
    pub fn get(&self, index: usize) -> Option<&T> {
        if index >= self.len() {
            return None;
        }
        let slot = unsafe { slot_base::<T>(self.heap, self.key).add(index) };
        Some(unsafe { T::Access::extract(self.heap, slot) })
    }

    /// Borrows the element at `index` without a bounds check.
    ///
    /// # Safety
    ///
    /// `index` must be less than [`len`](ArrayView::len).
    pub unsafe fn get_unchecked(&self, index: usize) -> &T {
        checked_assert!(index < self.len(), "index out of bounds");
        let slot = unsafe { slot_base::<T>(self.heap, self.key).add(index) };
        unsafe { T::Access::extract(self.heap, slot) }
    }

    pub fn first(&self) -> Option<&T> {
        self.get(0)
    }

    pub fn last(&self) -> Option<&T> {
        self.get(self.len().checked_sub(1)?)
    }

    pub fn iter(&self) -> SlotIter<'_, T> {
        unsafe { SlotIter::new(self.heap, slot_base::<T>(self.heap, self.key), self.len()) }
    }

    /// Base pointer of the current storage epoch, for reads only.
    ///
    /// Valid for [`len`](ArrayView::len) slots until the array next grows.
    /// A pointer taken before a growth keeps reading the retired epoch.
    pub fn data(&self) -> NonNull<T::Slot> {
        slot_base::<T>(self.heap, self.key)
    }
}

impl<T: ArrayElement> ArrayView<'_, T, 1> {
    /// Appends `value`, growing the cell by one slot.
    ///
    /// Only element types stored by identity can append through a view;
    /// other element types append through the owning [`HostArray`]. Faults
    /// if the cell wraps a native buffer. The cell key is pinned for the
    /// duration of the call.
    pub fn push(&mut self, value: T)
    where
        T: ArrayElement<Slot = T>,
        T::Access: Store<T>,
    {
        let scope = self.heap.root_scope();
        scope.pin(self.key);
        if let Err(e) = self.heap.array_grow(self.key, 1) {
            e.fault();
        }
        let index = self.len() - 1;
        unsafe { T::Access::store(self.heap, self.key, index, value) };
    }
}

impl<T: ArrayElement, const DIM: usize> Index<usize> for ArrayView<'_, T, DIM> {
    type Output = T;

    /// Linear, row-major position.
    fn index(&self, index: usize) -> &T {
        match self.get(index) {
            Some(value) => value,
            None => index_out_of_bounds(index, self.len()),
        }
    }
}

impl<T: ArrayElement, const DIM: usize> ToHost for ArrayView<'_, T, DIM> {
    fn to_host(self, heap: &Heap) -> CellKey {
        debug_assert!(core::ptr::eq(self.heap, heap));
        self.key
    }
}

impl<'h, T: ArrayElement, const DIM: usize> FromHost<'h> for ArrayView<'h, T, DIM> {
    fn from_host(heap: &'h Heap, cell: CellKey) -> Result<Self, ConvertError> {
        let expect = array_type_for::<T>(heap, DIM as u32);
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

impl<T: ArrayElement, const DIM: usize> fmt::Debug for ArrayView<'_, T, DIM> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrayView")
            .field("key", &self.key)
            .field("len", &self.heap.array_len(self.key).ok())
            .finish()
    }
}

// -----------------------------------------------------------------------------
// ArrayViewMut

/// A view with in-place write access to the slot storage.
///
/// Unlike [`ArrayView`] this hands out `&mut` borrows of slots, so it must
/// be the only access path to the storage while it lives. The safe ways to
/// obtain one guarantee that: borrowing the owning [`HostArray`]
/// exclusively, or wrapping a buffer the caller controls. Attaching to an
/// arbitrary key is `unsafe`.
pub struct ArrayViewMut<'h, T: ArrayElement, const DIM: usize = 1> {
    heap: &'h Heap,
    key: CellKey,
    _marker: PhantomData<fn() -> T>,
}

impl<'h, T: ArrayElement, const DIM: usize> ArrayViewMut<'h, T, DIM> {
    /// Attaches with write access, faulting unless the cell is a
    /// rank-`DIM` array of exactly `T`'s element type.
    ///
    /// # Safety
    ///
    /// For as long as the view or any borrow taken from it lives, the
    /// viewed storage must not be read or written through any other path:
    /// no other view, iterator, or raw pointer into the same cell.
    pub unsafe fn attach_mut(heap: &'h Heap, key: CellKey) -> Self {
        let view = ArrayView::<T, DIM>::attach(heap, key);
        Self {
            heap,
            key: view.key,
            _marker: PhantomData,
        }
    }

    /// Builds an array cell over a native buffer and views it.
    ///
    /// The cell's extent is `dims`, rank `DIM`, and it can never grow.
    /// With [`BufferOwner::Host`] the heap frees the buffer at teardown;
    /// with [`BufferOwner::Native`] the caller keeps ownership and the
    /// collector never touches it.
    ///
    /// # Safety
    ///
    /// `data` must point to storage valid for the product of `dims` slots
    /// of `T`, properly aligned, staying valid for every access made
    /// through the heap. For [`BufferOwner::Host`] the allocation must
    /// have come from the global allocator with exactly that layout. The
    /// exclusivity contract of [`attach_mut`](ArrayViewMut::attach_mut)
    /// applies.
    pub unsafe fn wrap(
        heap: &'h Heap,
        data: NonNull<T::Slot>,
        dims: [usize; DIM],
        owner: BufferOwner,
    ) -> Self
    where
        T::Access: InPlace<T>,
    {
        let elem = element_type_for::<T>(heap);
        let key = unsafe { heap.wrap_buffer(elem, data.cast::<u8>(), &dims, owner) };
        Self {
            heap,
            key,
            _marker: PhantomData,
        }
    }

    /// Read-only alias of this view. While the alias or any of its copies
    /// live, the mutable methods are unreachable.
    pub fn as_view(&self) -> ArrayView<'_, T, DIM> {
        ArrayView {
            heap: self.heap,
            key: self.key,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn key(&self) -> CellKey {
        self.key
    }

    pub fn len(&self) -> usize {
        cell_len(self.heap, self.key)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dims(&self) -> [usize; DIM] {
        self.as_view().dims()
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        if index >= self.len() {
            return None;
        }
        let slot = unsafe { slot_base::<T>(self.heap, self.key).add(index) };
        Some(unsafe { T::Access::extract(self.heap, slot) })
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T>
    where
        T::Access: InPlace<T>,
    {
        if index >= self.len() {
            return None;
        }
        let slot = unsafe { slot_base::<T>(self.heap, self.key).add(index) };
        Some(unsafe { T::Access::extract_mut(slot) })
    }

    /// Mutably borrows the element at `index` without a bounds check.
    ///
    /// # Safety
    ///
    /// `index` must be less than [`len`](ArrayViewMut::len).
    pub unsafe fn get_unchecked_mut(&mut self, index: usize) -> &mut T
    where
        T::Access: InPlace<T>,
    {
        checked_assert!(index < self.len(), "index out of bounds");
        let slot = unsafe { slot_base::<T>(self.heap, self.key).add(index) };
        unsafe { T::Access::extract_mut(slot) }
    }

    /// Overwrites the slot at `index` with `value`.
    ///
    /// Works for every element type: mirrored values are written in place,
    /// wrapped values are boxed and the slot's reference replaced. The
    /// cell key is pinned across any boxing.
    pub fn set(&mut self, index: usize, value: T)
    where
        T::Access: Store<T>,
    {
        let len = self.len();
        if index >= len {
            index_out_of_bounds(index, len);
        }
        let scope = self.heap.root_scope();
        scope.pin(self.key);
        unsafe { T::Access::store(self.heap, self.key, index, value) };
    }

    pub fn iter(&self) -> SlotIter<'_, T> {
        unsafe { SlotIter::new(self.heap, slot_base::<T>(self.heap, self.key), self.len()) }
    }

    pub fn iter_mut(&mut self) -> SlotIterMut<'_, T>
    where
        T::Access: InPlace<T>,
    {
        unsafe { SlotIterMut::new(self.heap, slot_base::<T>(self.heap, self.key), self.len()) }
    }

    /// Base pointer of the current storage epoch, for reads only.
    ///
    /// Same validity as [`ArrayView::data`].
    pub fn data(&self) -> NonNull<T::Slot> {
        slot_base::<T>(self.heap, self.key)
    }

    /// Base pointer of the current storage epoch, for writes.
    ///
    /// Valid for [`len`](ArrayViewMut::len) slots until the array next
    /// grows; writes must go to the current epoch, never a retired one.
    /// Reference slots must only be written through
    /// [`array_set_ref`](Heap::array_set_ref) so the store stays traced.
    pub fn data_mut(&mut self) -> NonNull<T::Slot> {
        slot_base::<T>(self.heap, self.key)
    }
}

impl<'h, T: ArrayElement> ArrayViewMut<'h, T, 1> {
    /// Moves `values` into a heap-owned array cell without copying the
    /// buffer.
    ///
    /// The vector's buffer is handed to the heap as wrapped storage, so
    /// the resulting cell cannot grow. It is freed when the heap is
    /// dropped, or at the sweep that retires the cell once nothing roots
    /// it.
    pub fn wrap_vec(heap: &'h Heap, values: Vec<T>) -> Self
    where
        T: ArrayElement<Slot = T>,
        T::Access: InPlace<T>,
    {
        let len = values.len();
        let slots: &mut [T] = Box::leak(values.into_boxed_slice());
        let data = NonNull::from(slots).cast::<T>();
        unsafe { Self::wrap(heap, data, [len], BufferOwner::Host) }
    }

    /// Appends `value`. Faults if the cell wraps a native buffer.
    pub fn push(&mut self, value: T)
    where
        T: ArrayElement<Slot = T>,
        T::Access: Store<T>,
    {
        let mut view = self.as_view();
        view.push(value);
    }
}

impl<T: ArrayElement, const DIM: usize> Index<usize> for ArrayViewMut<'_, T, DIM> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        match self.get(index) {
            Some(value) => value,
            None => index_out_of_bounds(index, self.len()),
        }
    }
}

impl<T: ArrayElement, const DIM: usize> IndexMut<usize> for ArrayViewMut<'_, T, DIM>
where
    T::Access: InPlace<T>,
{
    fn index_mut(&mut self, index: usize) -> &mut T {
        let len = self.len();
        match self.get_mut(index) {
            Some(value) => value,
            None => index_out_of_bounds(index, len),
        }
    }
}

/// Borrowing the owner exclusively is the safe route to a mutable view.
impl<'a, 'h, T: ArrayElement> From<&'a mut HostArray<'h, T>> for ArrayViewMut<'a, T> {
    fn from(array: &'a mut HostArray<'h, T>) -> Self {
        array.as_view_mut()
    }
}

/// Forgets write access, keeping the attachment.
impl<'h, T: ArrayElement, const DIM: usize> From<ArrayViewMut<'h, T, DIM>>
    for ArrayView<'h, T, DIM>
{
    fn from(view: ArrayViewMut<'h, T, DIM>) -> Self {
        Self {
            heap: view.heap,
            key: view.key,
            _marker: PhantomData,
        }
    }
}

impl<T: ArrayElement, const DIM: usize> fmt::Debug for ArrayViewMut<'_, T, DIM> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArrayViewMut")
            .field("key", &self.key)
            .field("len", &self.heap.array_len(self.key).ok())
            .finish()
    }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use alloc::string::String;
    use alloc::vec;
    use alloc::vec::Vec;

    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct Tag(String);

    crate::wrap_foreign!(Tag);

    #[test]
    fn wrapped_native_buffers_outlive_view_and_collection() {
        let heap = Heap::new();
        let mut buffer = [1.0f32, 2.0, 3.0, 4.0];
        let data = NonNull::from(&mut buffer).cast::<f32>();
        {
            let mut view =
                unsafe { ArrayViewMut::<f32>::wrap(&heap, data, [4], BufferOwner::Native) };
            view[2] = 30.0;
        }
        // The cell is unrooted; sweeping it must not touch the buffer.
        heap.collect();
        assert_eq!(buffer, [1.0, 2.0, 30.0, 4.0]);
    }

    #[test]
    fn views_share_the_owners_storage() {
        let heap = Heap::new();
        let mut arr = HostArray::<i64>::new(&heap);
        arr.extend([1, 2, 3]);
        let view = arr.as_view();
        assert_eq!(view.len(), 3);
        assert_eq!(view[1], 2);
        {
            let mut vm = arr.as_view_mut();
            vm[1] = 20;
        }
        assert_eq!(arr.get(1), Some(&20));
    }

    #[test]
    #[should_panic(expected = "cannot attach array view")]
    fn attaching_at_the_wrong_type_faults() {
        let heap = Heap::new();
        let arr = HostArray::<i64>::new(&heap);
        let _ = ArrayView::<f64>::attach(&heap, arr.key());
    }

    #[test]
    fn rank_is_part_of_the_viewed_type() {
        let heap = Heap::new();
        let mut grid = [0i32; 6];
        let data = NonNull::from(&mut grid).cast::<i32>();
        let view =
            unsafe { ArrayViewMut::<i32, 2>::wrap(&heap, data, [2, 3], BufferOwner::Native) };
        assert_eq!(view.dims(), [2, 3]);
        assert_eq!(view.len(), 6);
        let key = view.key();
        drop(view);

        assert!(matches!(
            ArrayView::<i32>::from_host(&heap, key),
            Err(ConvertError::TypeMismatch { .. })
        ));
        let again = ArrayView::<i32, 2>::attach(&heap, key);
        assert_eq!(again.dims(), [2, 3]);
    }

    #[test]
    fn pushing_through_a_view_grows_the_cell() {
        let heap = Heap::new();
        let mut arr = HostArray::<u32>::new(&heap);
        arr.extend([1, 2]);
        let mut view = arr.as_view();
        view.push(3);
        assert_eq!(arr.len(), 3);
        assert_eq!(arr.get(2), Some(&3));
    }

    #[test]
    fn iterators_keep_reading_their_storage_epoch() {
        let heap = Heap::new();
        let mut arr = HostArray::<i64>::new(&heap);
        for v in 0..4 {
            arr.push(v);
        }
        let view = arr.as_view();
        let mut iter = view.iter();
        assert_eq!(iter.next(), Some(&0));

        let mut growing = view;
        for v in 4..20 {
            growing.push(v);
        }
        // The relocated cell reads the new storage; the iterator still
        // walks the epoch it was created over.
        assert_eq!(iter.copied().collect::<Vec<_>>(), [1, 2, 3]);
        assert_eq!(view.len(), 20);
    }

    #[test]
    fn set_boxes_wrapped_elements() {
        let heap = Heap::new();
        let mut arr = HostArray::<Tag>::new(&heap);
        arr.push(Tag("a".into()));
        let mut vm = arr.as_view_mut();
        vm.set(0, Tag("b".into()));
        assert_eq!(arr.get(0), Some(&Tag("b".into())));
    }

    #[test]
    fn unchecked_access_matches_checked() {
        let heap = Heap::new();
        let mut arr = HostArray::<u8>::new(&heap);
        arr.extend([9, 8, 7]);
        let view = arr.as_view();
        assert_eq!(unsafe { view.get_unchecked(1) }, &view[1]);
    }

    #[test]
    fn wrap_vec_hands_the_buffer_to_the_heap() {
        let heap = Heap::new();
        let view = ArrayViewMut::wrap_vec(&heap, vec![10i64, 20, 30]);
        assert_eq!(view.len(), 3);
        assert_eq!(view[0], 10);
        assert_eq!(view.iter().copied().sum::<i64>(), 60);
    }

    #[test]
    #[should_panic(expected = "cannot grow an array backed by a wrapped")]
    fn wrapped_buffers_refuse_to_grow() {
        let heap = Heap::new();
        let mut view = ArrayViewMut::wrap_vec(&heap, vec![1i8]);
        view.push(2);
    }

    #[test]
    fn mutable_views_downgrade_and_convert() {
        let heap = Heap::new();
        let mut arr = HostArray::<i32>::new(&heap);
        arr.extend([4, 5]);
        let vm: ArrayViewMut<'_, i32> = (&mut arr).into();
        let view: ArrayView<'_, i32> = vm.into();
        assert_eq!(view[0], 4);
        assert_eq!(view.last(), Some(&5));
    }
}
