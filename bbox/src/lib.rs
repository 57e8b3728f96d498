//! Safe bounding box types and functions.

mod common;

pub use xyxy::*;
pub mod xyxy;

pub use hw::*;
pub mod hw;

pub use rescale::*;
mod rescale;
