use alloc::vec::Vec;

use smallvec::SmallVec;

use crate::cell::CellKey;
use crate::heap::Heap;

// -----------------------------------------------------------------------------
// RootFrames

/// The stack of pin frames the mark phase treats as GC roots.
///
/// Frames obey stack discipline: a [`RootGuard`] owns exactly one frame and
/// releases it on drop. Pins inside a frame keep their cells (and anything
/// reachable from them) alive across collections for the frame's lifetime.
pub(crate) struct RootFrames {
    frames: Vec<SmallVec<[CellKey; 4]>>,
}

impl RootFrames {
    pub(crate) const fn new() -> Self {
        Self { frames: Vec::new() }
    }

    /// Opens a frame, returning its index.
    pub(crate) fn push_frame(&mut self) -> usize {
        self.frames.push(SmallVec::new());
        self.frames.len() - 1
    }

    pub(crate) fn pin(&mut self, frame: usize, key: CellKey) {
        self.frames[frame].push(key);
    }

    /// Releases `frame` and anything opened above it.
    ///
    /// Out-of-order release indicates a guard outliving its enclosing
    /// scope; the frames above are dropped with it to keep the stack sound.
    pub(crate) fn release(&mut self, frame: usize) {
        if frame + 1 != self.frames.len() {
            log::warn!(
                "root scope released out of order: frame {frame} of {}",
                self.frames.len()
            );
        }
        self.frames.truncate(frame);
    }

    pub(crate) fn is_balanced(&self) -> bool {
        self.frames.is_empty()
    }

    /// Every pinned key, bottom frame first.
    pub(crate) fn pinned(&self) -> impl Iterator<Item = CellKey> + '_ {
        self.frames.iter().flat_map(|frame| frame.iter().copied())
    }
}

// -----------------------------------------------------------------------------
// RootGuard

/// Scoped root pinning.
///
/// Constructed by [`Heap::root_scope`]; every key pinned through the guard
/// stays reachable to the collector until the guard drops. Release happens
/// on every exit path, panics included.
///
/// # Examples
///
/// ```
/// use cw_heap::{DataTypeId, Heap};
///
/// let heap = Heap::new();
/// let boxed = heap.alloc_bits(DataTypeId::I64, &7_i64.to_ne_bytes());
///
/// let roots = heap.root_scope();
/// roots.pin(boxed);
/// heap.collect();
///
/// // Still reachable: the pin kept the cell alive.
/// assert_eq!(heap.cell_type(boxed), Ok(DataTypeId::I64));
/// ```
#[must_use = "dropping the guard immediately unpins everything it holds"]
pub struct RootGuard<'h> {
    heap: &'h Heap,
    frame: usize,
}

impl<'h> RootGuard<'h> {
    pub(crate) fn new(heap: &'h Heap) -> Self {
        let frame = heap.push_root_frame();
        Self { heap, frame }
    }

    /// Pins `key` for the remainder of this scope.
    pub fn pin(&self, key: CellKey) {
        self.heap.pin_in_frame(self.frame, key);
    }
}

impl Drop for RootGuard<'_> {
    fn drop(&mut self) {
        self.heap.release_root_frame(self.frame);
    }
}
