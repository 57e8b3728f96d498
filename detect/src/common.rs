pub use anyhow::{bail, ensure, format_err, Context, Error, Result};
pub use futures::{
    future::FutureExt,
    stream::{self, BoxStream, StreamExt, TryStreamExt},
};
pub use par_stream::TryParStreamExt;
pub use serde::{Deserialize, Serialize};
pub use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
pub use tch::{nn, Device};
pub use tokio::{io::AsyncWriteExt, sync::mpsc};
pub use tracing::{info, trace_span, warn, Instrument};

pub type Fallible<T> = Result<T, Error>;
