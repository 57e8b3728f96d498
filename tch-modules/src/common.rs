pub use anyhow::{ensure, Result};
pub use derivative::Derivative;
pub use serde::{Deserialize, Serialize};
pub use std::borrow::Borrow;
pub use strum::AsRefStr;
pub use tch::{
    nn::{self, ModuleT as _},
    Device, Kind, Reduction, Tensor,
};
