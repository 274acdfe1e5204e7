#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg))]
#![no_std]

pub use cw_heap as heap;
pub use cw_marshal as marshal;
pub use cw_utils as utils;
