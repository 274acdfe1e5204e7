//! Heap configuration parameters.

// -----------------------------------------------------------------------------
// CollectMode

/// When the heap runs a collection pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CollectMode {
    /// Collect only on explicit [`Heap::collect`](crate::Heap::collect) calls.
    #[default]
    Manual,

    /// Collect before every cell allocation and type synthesis.
    ///
    /// Under this mode any handle that is live but not pinned gets swept at
    /// the next allocation, so a missing root pin fails deterministically
    /// instead of depending on collection timing. Intended for tests.
    Stress,
}

// -----------------------------------------------------------------------------
// HeapConfig

/// Configuration for a [`Heap`](crate::Heap).
///
/// All values are immutable after construction.
#[derive(Clone, Debug)]
pub struct HeapConfig {
    /// Collection trigger policy.
    pub collect: CollectMode,

    /// Cell-arena capacity reserved at construction.
    pub initial_cells: usize,
}

impl HeapConfig {
    /// Default number of cell slots reserved up front.
    pub const DEFAULT_INITIAL_CELLS: usize = 256;

    /// Creates the default configuration: manual collection.
    pub fn new() -> Self {
        Self {
            collect: CollectMode::Manual,
            initial_cells: Self::DEFAULT_INITIAL_CELLS,
        }
    }

    /// Creates a configuration with stress collection enabled.
    pub fn stress() -> Self {
        Self {
            collect: CollectMode::Stress,
            ..Self::new()
        }
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::new()
    }
}

// -----------------------------------------------------------------------------
// Tests
