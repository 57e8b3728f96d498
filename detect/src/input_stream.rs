use crate::{common::*, config::InputConfig};
use faster_rcnn::{collate, ImageRecord, ModelInput, ResizeShortSide};

/// A resized image ready for inference.
#[derive(Debug)]
pub struct InputRecord {
    pub path: PathBuf,
    pub input: ModelInput,
}

/// Loads and resizes image files in parallel, keeping the file order.
#[derive(Debug)]
pub struct InputStream {
    paths: Vec<PathBuf>,
    resize: ResizeShortSide,
    worker_buf_size: Option<usize>,
}

impl InputStream {
    pub fn new(config: &InputConfig, resize: ResizeShortSide) -> Result<Self> {
        let paths = config.image_files()?;
        if paths.is_empty() {
            warn!("no image files match '{}'", config.images);
        }

        Ok(Self {
            paths,
            resize,
            worker_buf_size: config.worker_buf_size,
        })
    }

    pub fn num_images(&self) -> usize {
        self.paths.len()
    }

    pub fn stream(&self) -> BoxStream<'static, Result<InputRecord>> {
        let resize = self.resize;

        // parallel stream config
        let par_config: par_stream::ParParams = {
            let buf_size: par_stream::BufSize = self
                .worker_buf_size
                .map(|buf_size| Some(buf_size).into())
                .unwrap_or_else(|| 2.0.into());

            Some(par_stream::ParParamsConfig::Manual {
                num_workers: par_stream::NumWorkers::Default,
                buf_size,
            })
            .into()
        };

        stream::iter(self.paths.clone())
            .map(Fallible::Ok)
            .try_par_then(par_config, move |path| {
                async move {
                    tokio::task::spawn_blocking(move || -> Result<_> {
                        let record = ImageRecord::load(&path, &[], &resize)
                            .with_context(|| format!("failed to load image {}", path.display()))?;
                        let input = ModelInput {
                            gt_boxes: None,
                            ..collate(&[record], 1)?
                        };
                        Ok(InputRecord { path, input })
                    })
                    .await?
                }
                .instrument(trace_span!("load_image"))
            })
            .boxed()
    }
}
