#![doc = include_str!("../README.md")]
#![expect(unsafe_code, reason = "Raw storage and type-erased cells require raw pointers.")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![no_std]

// -----------------------------------------------------------------------------
// No STD Support

#[cfg(feature = "std")]
extern crate std;

extern crate alloc;

// -----------------------------------------------------------------------------
// Modules

mod cell;
mod config;
mod error;
mod heap;
mod roots;
mod stats;
mod storage;
mod types;

// -----------------------------------------------------------------------------
// Top-level exports

pub use cell::{BufferOwner, CellKey, RefSlot};
pub use config::{CollectMode, HeapConfig};
pub use error::{CellShape, HeapError};
pub use heap::Heap;
pub use roots::RootGuard;
pub use stats::HeapStats;
pub use types::{DataType, DataTypeId, DataTypeKind};
