pub use anyhow::{bail, ensure, format_err, Context as _, Error, Result};
pub use bbox::{Rescale, Xyxy, HW};
pub use derivative::Derivative;
pub use indexmap::IndexMap;
pub use itertools::{izip, Itertools as _};
pub use log::{debug, info, warn};
pub use noisy_float::prelude::*;
pub use rcnn_config::{FasterRcnnConfig, ModeConfig};
pub use std::{
    borrow::Borrow,
    iter,
    path::{Path, PathBuf},
};
pub use tch::{
    nn::{self, ModuleT as _},
    Device, IndexOp as _, Kind, Reduction, Tensor,
};
pub use tch_goodies::{TensorExt as _, XyxyTensor};
pub use tch_tensor_like::TensorLike;
