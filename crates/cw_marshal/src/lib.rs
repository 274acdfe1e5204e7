#![doc = include_str!("../README.md")]
#![expect(
    unsafe_code,
    reason = "Zero-copy slot access and layout reinterpretation require raw pointers."
)]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![no_std]

// -----------------------------------------------------------------------------
// No STD Support

#[cfg(any(feature = "std", test))]
extern crate std;

extern crate alloc;

// -----------------------------------------------------------------------------
// Checked mode

/// Asserts in debug builds, and in release builds compiled with the
/// `checked` feature. Expansion site of the otherwise-unchecked access
/// contracts.
macro_rules! checked_assert {
    ($($arg:tt)*) => {
        #[cfg(any(debug_assertions, feature = "checked"))]
        {
            assert!($($arg)*);
        }
    };
}

pub(crate) use checked_assert;

// -----------------------------------------------------------------------------
// Modules

mod array;
mod convert;
mod element;
mod mapped;
mod record;
mod resolve;

// -----------------------------------------------------------------------------
// Top-level exports

pub use array::view::{ArrayView, ArrayViewMut};
pub use array::{HostArray, SlotIter, SlotIterMut};
pub use convert::{ConvertError, FromHost, ToHost};
pub use element::{ArrayElement, ExtractStrategy, Identity, InPlace, Lift, Reinterpret, Store};
pub use mapped::{HostMapped, Mirrored};
pub use record::HostTuple;
pub use resolve::{array_type_for, element_type_for};

/// Names the exported macros expand against. Not part of the public API.
#[doc(hidden)]
pub mod __rt {
    pub use cw_heap::{CellKey, DataTypeId, Heap, RefSlot};
}
