//! Hyperparameters of the Faster R-CNN detector.

mod common;
pub mod config;
pub mod sections;

pub use config::*;
pub use sections::*;
