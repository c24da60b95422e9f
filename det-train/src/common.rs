//! Common imports from external crates.

pub use anyhow::{bail, ensure, format_err, Context, Error, Result};
pub use indexmap::IndexMap;
pub use itertools::Itertools;
pub use log::info;
pub use noisy_float::prelude::*;
pub use serde::{Deserialize, Serialize};
pub use std::{
    collections::HashMap,
    fmt::{self, Display, Formatter},
    path::{Path, PathBuf},
    str::FromStr,
};
pub use tch::{
    nn::{self, OptimizerConfig as _},
    Device, IndexOp, Kind, Tensor,
};
