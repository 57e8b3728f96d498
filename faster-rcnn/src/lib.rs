//! Two-stage object detection with a feature pyramid backbone.

mod common;
pub mod anchor;
pub mod box_coder;
pub mod inference;
pub mod input;
pub mod loss;
pub mod matching;
pub mod model;

pub use anchor::*;
pub use box_coder::*;
pub use inference::*;
pub use input::*;
pub use loss::*;
pub use matching::*;
pub use model::*;
