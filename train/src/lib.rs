//! The training program of the Faster R-CNN detector.

pub mod common;
pub mod config;
pub mod dataset;
pub mod logging;
pub mod training_stream;
pub mod utils;
pub mod worker;

use crate::{common::*, dataset::CocoDataset, training_stream::TrainingStream};

/// The entry of training program.
pub async fn start(config: Arc<config::Config>) -> Result<()> {
    let start_time = Local::now();
    let logging_dir: Arc<Path> = {
        let dir = config
            .logging
            .dir
            .join(format!("{}", start_time.format(utils::FILE_STRFTIME)));
        dir.into_boxed_path().into()
    };
    let checkpoint_dir: Arc<Path> = logging_dir.join("checkpoints").into_boxed_path().into();

    // load model config
    let model_config = Arc::new(config.model.load().with_context(|| {
        format!(
            "failed to load model config '{}'",
            config.model.cfg_file.display()
        )
    })?);
    let batch_size = config.training.batch_size.get();

    // create dirs and save config
    {
        tokio::fs::create_dir_all(&*logging_dir).await?;
        tokio::fs::create_dir_all(&*checkpoint_dir).await?;

        let path = logging_dir.join("config.json5");
        let text = serde_json::to_string_pretty(&*config)?;
        tokio::fs::write(&path, text).await?;

        let path = logging_dir.join("model.json5");
        let text = serde_json::to_string_pretty(&*model_config)?;
        tokio::fs::write(&path, text).await?;
    }

    // create channels
    let (logging_tx, logging_rx) = broadcast::channel(2);
    let (data_tx, data_rx) = mpsc::channel(2);

    // load dataset
    info!("loading dataset");
    let dataset = {
        let dataset = CocoDataset::load(
            &config.dataset.dataset_dir,
            &model_config.data.train_dataset,
            true,
        )
        .await?;
        ensure!(
            dataset.num_classes() == model_config.data.num_classes,
            "the dataset has {} classes, but the model expects {} classes",
            dataset.num_classes(),
            model_config.data.num_classes
        );
        Arc::new(dataset)
    };
    let training_stream = TrainingStream::new(
        batch_size,
        &model_config,
        &config.dataset,
        dataset,
    )?;

    // start logger
    let logging_future = logging::logging_worker(logging_dir.clone(), logging_rx).await?;

    // feeding worker
    let training_data_future = tokio::task::spawn(async move {
        let mut train_stream = training_stream.train_stream()?;

        while let Some(result) = train_stream
            .next()
            .instrument(trace_span!("recv_next_batch"))
            .await
        {
            let input = result?;
            let result = data_tx
                .send(input)
                .instrument(trace_span!("send_batch_to_training_loop"))
                .await;

            // the training worker is done
            if result.is_err() {
                break;
            }
        }

        Fallible::Ok(())
    })
    .map(|result| Fallible::Ok(result??));

    // training worker
    let training_worker_future = {
        let config = config.clone();

        tokio::task::spawn_blocking(move || {
            worker::training_worker(config, model_config, checkpoint_dir, data_rx, logging_tx)
        })
        .map(|result| Fallible::Ok(result??))
    };

    futures::try_join!(training_data_future, training_worker_future, logging_future)?;

    Ok(())
}
