use core::cmp::Ordering;
use core::fmt;
use core::iter::FusedIterator;
use core::marker::PhantomData;
use core::ptr::NonNull;

use cw_heap::Heap;

use crate::checked_assert;
use crate::element::{ArrayElement, ExtractStrategy, InPlace};

// -----------------------------------------------------------------------------
// SlotIter

/// Iterator over the raw slot storage of a host array.
///
/// A pair of raw pointers bounding one storage epoch: stepping moves the
/// front pointer, dereferencing applies `T`'s extraction strategy. There are
/// no per-step bounds checks beyond the front/back comparison, matching raw
/// slice iteration; the `checked` feature adds assertions to the pointer
/// arithmetic helpers.
///
/// Position comparisons and distances are pointer comparisons, defined only
/// between iterators over the same storage epoch. The iterator is invalid
/// once the originating array's storage is resized.
pub struct SlotIter<'a, T: ArrayElement> {
    heap: &'a Heap,
    front: NonNull<T::Slot>,
    /// One past the last slot.
    back: NonNull<T::Slot>,
    _marker: PhantomData<&'a [T::Slot]>,
}

impl<'a, T: ArrayElement> SlotIter<'a, T> {
    /// # Safety
    ///
    /// `base` must point to `len` initialized slots in `T`'s storage form.
    /// Reference slots must refer to cells on `heap`. The slots must not be
    /// resized or mutated while the iterator or any reference it yielded is
    /// alive.
    pub(crate) unsafe fn new(heap: &'a Heap, base: NonNull<T::Slot>, len: usize) -> Self {
        debug_assert!(core::mem::size_of::<T::Slot>() != 0);
        Self {
            heap,
            front: base,
            back: unsafe { base.add(len) },
            _marker: PhantomData,
        }
    }

    /// Slots left to yield.
    #[inline]
    pub fn len(&self) -> usize {
        // In-bounds pointers into one allocation; slots are never
        // zero-sized.
        unsafe { self.back.as_ptr().offset_from(self.front.as_ptr()) as usize }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.front == self.back
    }

    /// Advances the front position by `n` slots, like pointer addition.
    #[inline]
    #[must_use]
    pub fn offset(mut self, n: usize) -> Self {
        checked_assert!(n <= self.len(), "offset past the end of the slot range");
        self.front = unsafe { self.front.add(n) };
        self
    }

    /// Signed slot distance from `other`'s position to this one, like
    /// pointer subtraction. Defined only for iterators over the same
    /// storage epoch.
    #[inline]
    pub fn distance_from(&self, other: &Self) -> isize {
        unsafe { self.front.as_ptr().offset_from(other.front.as_ptr()) }
    }
}

impl<'a, T: ArrayElement> Iterator for SlotIter<'a, T> {
    type Item = &'a T;

    #[inline]
    fn next(&mut self) -> Option<&'a T> {
        if self.front == self.back {
            return None;
        }
        let slot = self.front;
        self.front = unsafe { slot.add(1) };
        Some(unsafe { T::Access::extract(self.heap, slot) })
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        let len = self.len();
        (len, Some(len))
    }

    #[inline]
    fn count(self) -> usize {
        self.len()
    }

    #[inline]
    fn nth(&mut self, n: usize) -> Option<&'a T> {
        if n >= self.len() {
            self.front = self.back;
            return None;
        }
        let slot = unsafe { self.front.add(n) };
        self.front = unsafe { slot.add(1) };
        Some(unsafe { T::Access::extract(self.heap, slot) })
    }

    #[inline]
    fn last(mut self) -> Option<&'a T> {
        self.next_back()
    }
}

impl<T: ArrayElement> DoubleEndedIterator for SlotIter<'_, T> {
    #[inline]
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.front == self.back {
            return None;
        }
        self.back = unsafe { self.back.sub(1) };
        Some(unsafe { T::Access::extract(self.heap, self.back) })
    }
}

impl<T: ArrayElement> ExactSizeIterator for SlotIter<'_, T> {}
impl<T: ArrayElement> FusedIterator for SlotIter<'_, T> {}

impl<T: ArrayElement> Clone for SlotIter<'_, T> {
    fn clone(&self) -> Self {
        Self {
            heap: self.heap,
            front: self.front,
            back: self.back,
            _marker: PhantomData,
        }
    }
}

impl<T: ArrayElement> PartialEq for SlotIter<'_, T> {
    /// Position identity: same front and back pointers.
    fn eq(&self, other: &Self) -> bool {
        self.front == other.front && self.back == other.back
    }
}

impl<T: ArrayElement> Eq for SlotIter<'_, T> {}

impl<T: ArrayElement> PartialOrd for SlotIter<'_, T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T: ArrayElement> Ord for SlotIter<'_, T> {
    /// Orders by front position. Meaningful only within one storage epoch.
    fn cmp(&self, other: &Self) -> Ordering {
        self.front.cmp(&other.front)
    }
}

impl<T: ArrayElement> fmt::Debug for SlotIter<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlotIter")
            .field("front", &self.front)
            .field("len", &self.len())
            .finish()
    }
}

// -----------------------------------------------------------------------------
// SlotIterMut

/// Mutable counterpart of [`SlotIter`] for in-place element types.
///
/// Only exists where `T`'s strategy supports in-place access; elements
/// stored behind cell references cannot be mutably aliased through a view.
/// Converts into [`SlotIter`] via `From`; the reverse conversion does not
/// exist.
pub struct SlotIterMut<'a, T: ArrayElement> {
    heap: &'a Heap,
    front: NonNull<T::Slot>,
    back: NonNull<T::Slot>,
    _marker: PhantomData<&'a mut [T::Slot]>,
}

impl<'a, T: ArrayElement> SlotIterMut<'a, T>
where
    T::Access: InPlace<T>,
{
    /// # Safety
    ///
    /// Like [`SlotIter::new`], and the slot range must not be accessed
    /// through any other path while the iterator or any reference it
    /// yielded is alive.
    pub(crate) unsafe fn new(heap: &'a Heap, base: NonNull<T::Slot>, len: usize) -> Self {
        debug_assert!(core::mem::size_of::<T::Slot>() != 0);
        Self {
            heap,
            front: base,
            back: unsafe { base.add(len) },
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        unsafe { self.back.as_ptr().offset_from(self.front.as_ptr()) as usize }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.front == self.back
    }
}

impl<'a, T: ArrayElement> Iterator for SlotIterMut<'a, T>
where
    T::Access: InPlace<T>,
{
    type Item = &'a mut T;

    #[inline]
    fn next(&mut self) -> Option<&'a mut T> {
        if self.front == self.back {
            return None;
        }
        let slot = self.front;
        self.front = unsafe { slot.add(1) };
        Some(unsafe { T::Access::extract_mut(slot) })
    }

    #[inline]
    fn size_hint(&self) -> (usize, Option<usize>) {
        let len = self.len();
        (len, Some(len))
    }
}

impl<T: ArrayElement> DoubleEndedIterator for SlotIterMut<'_, T>
where
    T::Access: InPlace<T>,
{
    #[inline]
    fn next_back(&mut self) -> Option<Self::Item> {
        if self.front == self.back {
            return None;
        }
        self.back = unsafe { self.back.sub(1) };
        Some(unsafe { T::Access::extract_mut(self.back) })
    }
}

impl<T: ArrayElement> ExactSizeIterator for SlotIterMut<'_, T> where T::Access: InPlace<T> {}
impl<T: ArrayElement> FusedIterator for SlotIterMut<'_, T> where T::Access: InPlace<T> {}

/// Forgets mutability, keeping the position.
impl<'a, T: ArrayElement> From<SlotIterMut<'a, T>> for SlotIter<'a, T> {
    fn from(iter: SlotIterMut<'a, T>) -> Self {
        Self {
            heap: iter.heap,
            front: iter.front,
            back: iter.back,
            _marker: PhantomData,
        }
    }
}

// -----------------------------------------------------------------------------
// Tests
