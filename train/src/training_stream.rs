use crate::{common::*, config::DatasetConfig, dataset::CocoDataset};
use faster_rcnn::{collate, ImageRecord, ModelInput, ResizeShortSide};
use rcnn_config::FasterRcnnConfig;

/// Asynchronous data stream for training.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct TrainingStream {
    batch_size: usize,
    max_gt_boxes: usize,
    resize: ResizeShortSide,
    hflip_prob: f64,
    worker_buf_size: Option<usize>,
    #[derivative(Debug = "ignore")]
    dataset: Arc<CocoDataset>,
}

impl TrainingStream {
    pub fn new(
        batch_size: usize,
        model_config: &FasterRcnnConfig,
        dataset_config: &DatasetConfig,
        dataset: Arc<CocoDataset>,
    ) -> Result<Self> {
        let DatasetConfig {
            hflip_prob,
            worker_buf_size,
            ..
        } = *dataset_config;
        ensure!(batch_size > 0, "batch_size must be positive");
        ensure!(
            (0.0..=1.0).contains(&hflip_prob.raw()),
            "hflip_prob must be in range [0, 1]"
        );
        ensure!(dataset.num_records() > 0, "the dataset is empty");

        Ok(Self {
            batch_size,
            max_gt_boxes: model_config.data.max_gt_boxes,
            resize: ResizeShortSide::from_mode(&model_config.mode(true)),
            hflip_prob: hflip_prob.raw(),
            worker_buf_size,
            dataset,
        })
    }

    /// Builds an endless stream of batches. Records are reshuffled on every pass
    /// over the dataset.
    pub fn train_stream(&self) -> Result<BoxStream<'static, Result<ModelInput>>> {
        let Self {
            batch_size,
            max_gt_boxes,
            resize,
            hflip_prob,
            worker_buf_size,
            ..
        } = *self;

        // parallel stream config
        let par_config: par_stream::ParParams = {
            let buf_size: par_stream::BufSize = worker_buf_size
                .map(|buf_size| Some(buf_size).into())
                .unwrap_or_else(|| 2.0.into());

            Some(par_stream::ParParamsConfig::Manual {
                num_workers: par_stream::NumWorkers::Default,
                buf_size,
            })
            .into()
        };

        // shuffle per epoch
        let stream = {
            let num_records = self.dataset.num_records();

            stream::iter(0..).flat_map(move |_epoch| {
                let mut rng = StdRng::from_entropy();
                let mut indexes = (0..num_records).collect_vec();
                indexes.shuffle(&mut rng);
                stream::iter(indexes)
            })
        };

        // load, resize and flip images
        let stream = {
            let dataset = self.dataset.clone();

            stream
                .map(Fallible::Ok)
                .try_par_then(par_config.clone(), move |index| {
                    let record = dataset.records[index].clone();

                    async move {
                        let image = tokio::task::spawn_blocking(move || -> Result<_> {
                            let image = ImageRecord::load(&record.path, &record.gt_boxes, &resize)
                                .with_context(|| {
                                    format!("failed to load image file {}", record.path.display())
                                })?;
                            let mut rng = StdRng::from_entropy();
                            let image = if rng.gen_bool(hflip_prob) {
                                image.hflip()
                            } else {
                                image
                            };
                            Ok(image)
                        })
                        .await??;
                        Fallible::Ok(image)
                    }
                    .instrument(trace_span!("load_image"))
                })
        };

        // group into batches
        let stream = stream.chunks(batch_size).map(|results| {
            let records: Vec<ImageRecord> = results.into_iter().collect::<Result<_>>()?;
            Fallible::Ok(records)
        });

        // pad and pack into model inputs
        let stream = stream.try_par_then(par_config, move |records| {
            async move {
                let input =
                    tokio::task::spawn_blocking(move || collate(&records, max_gt_boxes)).await??;
                Fallible::Ok(input)
            }
            .instrument(trace_span!("collate"))
        });

        Ok(stream.boxed())
    }
}
