//! Common imports from external crates.

pub use anyhow::{bail, ensure, format_err, Context, Error, Result};
pub use indexmap::IndexMap;
pub use itertools::Itertools;
pub use serde::{Deserialize, Serialize};
pub use std::{collections::HashMap, str::FromStr};
pub use tch::{nn, Device, IndexOp, Kind, Reduction, Tensor};
pub use tch_tensor_like::TensorLike;
