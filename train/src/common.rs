//! Common imports from external crates.

pub use anyhow::{bail, ensure, format_err, Context, Error, Result};
pub use bbox::{Xyxy, HW};
pub use chrono::{DateTime, Local};
pub use derivative::Derivative;
pub use futures::{
    future::FutureExt,
    stream::{self, BoxStream, Stream, StreamExt, TryStreamExt},
};
pub use indexmap::IndexMap;
pub use itertools::Itertools;
pub use noisy_float::prelude::*;
pub use par_stream::{ParStreamExt, TryParStreamExt};
pub use rand::{prelude::*, rngs::StdRng, seq::SliceRandom};
pub use serde::{Deserialize, Serialize};
pub use std::{
    borrow::{Borrow, Cow},
    collections::HashMap,
    future::Future,
    num::NonZeroUsize,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, Instant},
};
pub use tch::{
    nn::{self, OptimizerConfig as _},
    Device, Tensor,
};
pub use tfrecord::{EventWriter, EventWriterInit};
pub use tokio::sync::{broadcast, mpsc};
pub use tracing::{info, trace_span, warn, Instrument};

pub type Fallible<T> = Result<T, Error>;
