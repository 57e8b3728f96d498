pub use anyhow::{bail, ensure, format_err, Error, Result};
pub use getset::Getters;
pub use itertools::Itertools;
pub use serde::{Deserialize, Serialize};
pub use std::borrow::Borrow;
pub use tch::{Device, Kind, Tensor};
pub use tch_tensor_like::TensorLike;

pub type Fallible<T> = Result<T, Error>;
