use alloc::alloc as malloc;
use core::alloc::Layout;
use core::num::NonZeroUsize;
use core::ptr::{self, NonNull};

// -----------------------------------------------------------------------------
// RawStore

/// Raw, untyped backing storage for one array object.
///
/// The store tracks an element layout and a slot capacity; logical length
/// lives in the owning array header. Growth allocates a fresh buffer and
/// hands the previous allocation back to the caller instead of freeing it,
/// so a stale data pointer keeps reading bytes that are merely outdated.
/// The heap retires returned allocations and frees them at teardown.
pub(crate) struct RawStore {
    elem_layout: Layout,
    data: NonNull<u8>,
    cap: usize,
}

impl RawStore {
    /// A store with no allocation and zero capacity.
    pub(crate) const fn empty(elem_layout: Layout) -> Self {
        // Safety: alignments are non-zero by Layout's invariant.
        let align = unsafe { NonZeroUsize::new_unchecked(elem_layout.align()) };
        Self {
            elem_layout,
            data: NonNull::without_provenance(align),
            cap: 0,
        }
    }

    /// Allocates an uninitialized store for `cap` slots.
    pub(crate) fn alloc(elem_layout: Layout, cap: usize) -> Self {
        let mut store = Self::empty(elem_layout);
        if cap > 0 && elem_layout.size() > 0 {
            let layout = array_layout(elem_layout, cap);
            store.data = NonNull::new(unsafe { malloc::alloc(layout) })
                .unwrap_or_else(|| malloc::handle_alloc_error(layout));
            store.cap = cap;
        } else {
            store.cap = cap;
        }
        store
    }

    /// Adopts a caller-supplied buffer of `cap` slots.
    ///
    /// # Safety
    /// `ptr` must be valid for reads and writes of `cap` slots of
    /// `elem_layout`, properly aligned, and must stay valid for as long as
    /// the owning array is reachable.
    pub(crate) const unsafe fn wrap(elem_layout: Layout, ptr: NonNull<u8>, cap: usize) -> Self {
        Self {
            elem_layout,
            data: ptr,
            cap,
        }
    }

    #[inline(always)]
    pub(crate) const fn elem_layout(&self) -> Layout {
        self.elem_layout
    }

    #[inline(always)]
    pub(crate) const fn elem_size(&self) -> usize {
        self.elem_layout.size()
    }

    #[inline(always)]
    pub(crate) const fn cap(&self) -> usize {
        self.cap
    }

    #[inline(always)]
    pub(crate) const fn data(&self) -> NonNull<u8> {
        self.data
    }

    /// Pointer to the slot at `index`.
    ///
    /// # Safety
    /// `index` must be within `0..cap`.
    #[inline(always)]
    pub(crate) const unsafe fn slot(&self, index: usize) -> NonNull<u8> {
        unsafe { self.data.add(index * self.elem_layout.size()) }
    }

    /// Moves to a fresh buffer of `new_cap` slots, copying the first
    /// `live_slots` slots over.
    ///
    /// Returns the superseded allocation for the caller to retire, or
    /// `None` when there was nothing allocated.
    pub(crate) fn grow(
        &mut self,
        live_slots: usize,
        new_cap: usize,
    ) -> Option<(NonNull<u8>, Layout)> {
        debug_assert!(new_cap >= self.cap);
        debug_assert!(live_slots <= self.cap);

        if self.elem_size() == 0 {
            self.cap = new_cap;
            return None;
        }

        let new_layout = array_layout(self.elem_layout, new_cap);
        let new_data = NonNull::new(unsafe { malloc::alloc(new_layout) })
            .unwrap_or_else(|| malloc::handle_alloc_error(new_layout));

        let old = self.take_allocation();
        if let Some((old_data, _)) = old {
            unsafe {
                ptr::copy_nonoverlapping::<u8>(
                    old_data.as_ptr(),
                    new_data.as_ptr(),
                    live_slots * self.elem_size(),
                );
            }
        }
        self.data = new_data;
        self.cap = new_cap;
        old
    }

    /// Detaches the current allocation, leaving an empty store behind.
    ///
    /// Returns `None` for stores that never allocated (zero capacity,
    /// zero-sized elements). The caller becomes responsible for the
    /// allocation's lifetime.
    pub(crate) fn take_allocation(&mut self) -> Option<(NonNull<u8>, Layout)> {
        if self.cap == 0 || self.elem_size() == 0 {
            return None;
        }
        let layout = array_layout(self.elem_layout, self.cap);
        let data = self.data;
        *self = Self::empty(self.elem_layout);
        Some((data, layout))
    }
}

// -----------------------------------------------------------------------------
// alloc helper

/// Creates a layout for an array of `n` elements, checking for overflow.
#[inline]
pub(crate) const fn array_layout(layout: Layout, n: usize) -> Layout {
    #[cold]
    #[inline(never)]
    const fn invalid_size() -> ! {
        panic!("array storage size overflows the address space");
    }

    let Some(alloc_size) = layout.size().checked_mul(n) else {
        invalid_size();
    };

    if alloc_size > isize::MAX as usize {
        invalid_size();
    }

    unsafe { Layout::from_size_align_unchecked(alloc_size, layout.align()) }
}

// -----------------------------------------------------------------------------
// Tests

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grow_preserves_live_slots_and_relocates() {
        let mut store = RawStore::alloc(Layout::new::<u64>(), 2);
        unsafe {
            store.slot(0).cast::<u64>().write(7);
            store.slot(1).cast::<u64>().write(11);
        }
        let before = store.data();

        let old = store.grow(2, 8);
        assert!(old.is_some());
        assert_ne!(store.data(), before);
        assert_eq!(store.cap(), 8);
        unsafe {
            assert_eq!(store.slot(0).cast::<u64>().read(), 7);
            assert_eq!(store.slot(1).cast::<u64>().read(), 11);
        }

        // Retire both allocations by hand; no heap is involved here.
        if let Some((ptr, layout)) = old {
            unsafe { malloc::dealloc(ptr.as_ptr(), layout) };
        }
        if let Some((ptr, layout)) = store.take_allocation() {
            unsafe { malloc::dealloc(ptr.as_ptr(), layout) };
        }
    }

    #[test]
    fn empty_store_never_allocates() {
        let mut store = RawStore::alloc(Layout::new::<u64>(), 0);
        assert_eq!(store.cap(), 0);
        assert!(store.take_allocation().is_none());
    }
}
