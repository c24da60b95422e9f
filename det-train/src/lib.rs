//! Training, evaluation and prediction orchestration for anchor-based
//! detection models.

mod checkpoint;
mod common;
mod config;
mod ema;
mod estimator;
mod optim;
mod schedule;

pub use checkpoint::*;
pub use config::*;
pub use ema::*;
pub use estimator::*;
pub use optim::*;
pub use schedule::*;
