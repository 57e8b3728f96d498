//! Neural network layers and loss functions shared by the detector.

mod common;
pub mod bce_with_logits_loss;
pub mod conv_norm_2d;
pub mod cross_entropy;
pub mod frozen_batch_norm;
pub mod norm;
pub mod smooth_l1_loss;

pub use bce_with_logits_loss::*;
pub use conv_norm_2d::*;
pub use cross_entropy::*;
pub use frozen_batch_norm::*;
pub use norm::*;
pub use smooth_l1_loss::*;
