//! The detection program of the Faster R-CNN detector.

mod common;
pub mod config;
pub mod input_stream;
pub mod output;

use crate::{
    common::*,
    config::{Config, ModelConfig},
    input_stream::{InputRecord, InputStream},
    output::{to_json_lines, to_records},
};
use faster_rcnn::{
    Detection, DetectionPostProcessInit, FasterRcnnInit, ModelOutput, ResizeShortSide,
};
use rcnn_config::FasterRcnnConfig;

/// The entry of detection program.
pub async fn start(config: Arc<Config>) -> Result<()> {
    let model_config = config.model.load().with_context(|| {
        format!(
            "failed to load model config '{}'",
            config.model.cfg_file.display()
        )
    })?;
    let resize = ResizeShortSide::from_mode(&model_config.mode(false));
    let vis_threshold = model_config.test.test_vis_threshold.raw();
    let category_ids = config.output.category_ids.clone();

    if let Some(ids) = &category_ids {
        ensure!(
            ids.len() == model_config.data.num_classes,
            "expect {} category ids, but get {}",
            model_config.data.num_classes,
            ids.len()
        );
    }

    let input_stream = InputStream::new(&config.input, resize)?;
    info!("detecting objects in {} images", input_stream.num_images());

    let (input_tx, input_rx) = mpsc::channel(2);
    let (output_tx, mut output_rx) = mpsc::channel(16);

    // load images
    let input_future = {
        let mut stream = input_stream.stream();

        tokio::task::spawn(async move {
            while let Some(record) = stream.next().await {
                if input_tx.send(record?).await.is_err() {
                    break;
                }
            }
            Fallible::Ok(())
        })
        .map(|result| Fallible::Ok(result??))
    };

    // run the model
    let inference_future = {
        let model = config.model.clone();

        tokio::task::spawn_blocking(move || {
            inference_worker(&model, model_config, input_rx, output_tx)
        })
        .map(|result| Fallible::Ok(result??))
    };

    // write detections
    let output_future = {
        let path = config.output.file.clone();

        tokio::task::spawn(
            async move {
                let file = tokio::fs::File::create(&path)
                    .await
                    .with_context(|| format!("unable to create '{}'", path.display()))?;
                let mut writer = tokio::io::BufWriter::new(file);
                let mut num_detections = 0;

                while let Some((image, detections)) = output_rx.recv().await {
                    let records = to_records(
                        &image,
                        &detections,
                        category_ids.as_deref(),
                        vis_threshold,
                    )?;
                    num_detections += records.len();
                    writer
                        .write_all(to_json_lines(&records)?.as_bytes())
                        .await?;
                }
                writer.flush().await?;

                info!(
                    "wrote {} detections to '{}'",
                    num_detections,
                    path.display()
                );
                Fallible::Ok(())
            }
            .instrument(trace_span!("write_output")),
        )
        .map(|result| Fallible::Ok(result??))
    };

    futures::try_join!(input_future, inference_future, output_future)?;

    Ok(())
}

fn inference_worker(
    model_config: &ModelConfig,
    config: FasterRcnnConfig,
    mut input_rx: mpsc::Receiver<InputRecord>,
    output_tx: mpsc::Sender<(PathBuf, Vec<Detection>)>,
) -> Result<()> {
    let ModelConfig {
        ref checkpoint_file,
        device,
        ..
    } = *model_config;
    info!("use device {:?}", device);

    let post_process = DetectionPostProcessInit::from_config(&config.test).build()?;
    let mut vs = nn::VarStore::new(device);
    let model = FasterRcnnInit {
        config,
        batch_size: 1,
    }
    .build(&vs.root())?;
    vs.load(checkpoint_file).with_context(|| {
        format!(
            "unable to load checkpoint '{}'",
            checkpoint_file.display()
        )
    })?;
    vs.freeze();

    while let Some(InputRecord { path, input }) = input_rx.blocking_recv() {
        let detections = tch::no_grad(|| -> Result<_> {
            let output = match model.forward_t(&input.to_device(device), false)? {
                ModelOutput::Inference(output) => output,
                ModelOutput::Train(_) => bail!("the model did not return predictions"),
            };
            post_process.forward(&output)
        })?;
        info!("{}: {} detections", path.display(), detections.len());

        if output_tx.blocking_send((path, detections)).is_err() {
            break;
        }
    }

    Ok(())
}
