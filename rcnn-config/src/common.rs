pub use anyhow::{ensure, Context, Result};
pub use itertools::Itertools;
pub use noisy_float::prelude::*;
pub use serde::{Deserialize, Serialize};
pub use std::path::{Path, PathBuf};
pub use tch_goodies::PoolingMethod;
pub use tch_modules::NormKind;
