// -----------------------------------------------------------------------------
// HeapStats

/// Monotonic allocation and collection counters.
///
/// Snapshots come from [`Heap::stats`](crate::Heap::stats); deltas between
/// snapshots are how tests observe "no extra boxing happened here" or
/// "this registration ran exactly once".
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[non_exhaustive]
pub struct HeapStats {
    /// Cells of any shape allocated.
    pub cells_allocated: u64,

    /// Non-array cells allocated (boxed scalars, foreign values, records).
    pub boxes_allocated: u64,

    /// Bytes of array storage requested from the allocator, including
    /// growth copies.
    pub array_bytes_allocated: u64,

    /// Collection passes run.
    pub collections: u64,

    /// Cells reclaimed by sweeps.
    pub cells_swept: u64,

    /// Datatype descriptors interned, primitives included.
    pub types_interned: u64,

    /// Native types bound to host descriptors.
    pub bindings_registered: u64,
}
