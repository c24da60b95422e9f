//! Loss building blocks for anchor-based detection training.

mod box_loss;
mod common;
mod detection_loss;
mod focal_loss;
mod iou_loss;
mod regularize;

pub use box_loss::*;
pub use detection_loss::*;
pub use focal_loss::*;
pub use iou_loss::*;
pub use regularize::*;
