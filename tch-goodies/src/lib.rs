//! Tensor utilities shared by the detection crates.

mod common;
pub mod boxes;
pub mod nms;
pub mod roi_align;
pub mod tensor;

pub use boxes::*;
pub use nms::*;
pub use roi_align::*;
pub use tensor::*;
