use crate::{
    common::*,
    config::{Config, LoadCheckpoint, TrainingConfig},
    logging::LoggingMessage,
    utils::{self, LrScheduler, RateCounter},
};
use faster_rcnn::{FasterRcnnInit, ModelInput, ModelOutput};
use rcnn_config::{FasterRcnnConfig, TrainConfig};

/// Start the training worker on a single device.
pub fn training_worker(
    config: Arc<Config>,
    model_config: Arc<FasterRcnnConfig>,
    checkpoint_dir: Arc<Path>,
    mut data_rx: mpsc::Receiver<ModelInput>,
    logging_tx: broadcast::Sender<LoggingMessage>,
) -> Result<()> {
    let Config {
        training:
            TrainingConfig {
                batch_size,
                device,
                override_initial_step,
                save_checkpoint_steps,
                ref load_checkpoint,
            },
        ..
    } = *config;
    let TrainConfig {
        momentum,
        weight_decay,
        log_interval,
        ..
    } = model_config.train;
    let batch_size = batch_size.get();
    let save_checkpoint_steps = save_checkpoint_steps.map(|steps| steps.get());
    let log_interval = log_interval.max(1);

    info!("use device {:?}", device);

    // init model
    info!("initializing model");

    const DUMMY_LR: f64 = 1.0;

    let mut vs = nn::VarStore::new(device);
    let root = vs.root();

    let model = FasterRcnnInit {
        config: (*model_config).clone(),
        batch_size,
    }
    .build(&root)?;
    let mut training_step_tensor = root.zeros_no_train("training_step", &[]);
    let mut optimizer = nn::Sgd {
        momentum: momentum.raw(),
        dampening: 0.0,
        wd: weight_decay.raw(),
        nesterov: false,
    }
    .build(&vs, DUMMY_LR)?;

    // load checkpoint
    let init_training_step = {
        let loaded = utils::try_load_checkpoint(&mut vs, &config.logging.dir, load_checkpoint)?;

        match (override_initial_step, loaded) {
            (Some(init_step), _) => init_step,
            (None, Some(_)) => f64::from(&training_step_tensor) as usize + 1,
            (None, None) => {
                if *load_checkpoint != LoadCheckpoint::Disabled {
                    warn!("start training from scratch");
                }
                0
            }
        }
    };

    // training
    let steps_per_epoch = model_config.steps_per_epoch(batch_size);
    let max_steps = model_config.max_steps(batch_size);
    let mut lr_scheduler = LrScheduler::new(
        &model_config.train,
        batch_size,
        steps_per_epoch,
        init_training_step,
    )?;
    let mut rate_counter = RateCounter::with_second_interval();
    let mut last_loss = None;

    info!(
        "start training from step {} to {}, {} steps per epoch",
        init_training_step, max_steps, steps_per_epoch
    );

    for training_step in init_training_step..max_steps {
        let input = data_rx
            .blocking_recv()
            .ok_or_else(|| format_err!("the data stream ended unexpectedly"))?
            .to_device(device);

        let lr = lr_scheduler.next();
        optimizer.set_lr(lr);

        // forward pass
        let losses = match model.forward_t(&input, true)? {
            ModelOutput::Train(losses) => losses,
            ModelOutput::Inference(_) => bail!("the model did not return losses in training"),
        };

        if !losses.is_finite() {
            warn!(
                "non-finite losses at step {}, the step is skipped",
                training_step
            );
            optimizer.zero_grad();
            continue;
        }

        // optimizer
        optimizer.backward_step(&losses.total_loss);
        rate_counter.add(1.0);

        // print message and send to logger
        if training_step % log_interval == 0 {
            let values = losses.to_values();
            let loss_text = values
                .iter()
                .map(|(name, value)| format!("{}: {:.4}", name, value))
                .join("\t");

            match rate_counter.rate() {
                Some(batch_rate) => info!(
                    "epoch: {}\tstep: {}/{}\tlr: {:.6}\t{}\t{:.2} batches/s",
                    training_step / steps_per_epoch,
                    training_step,
                    max_steps,
                    lr,
                    loss_text,
                    batch_rate
                ),
                None => info!(
                    "epoch: {}\tstep: {}/{}\tlr: {:.6}\t{}",
                    training_step / steps_per_epoch,
                    training_step,
                    max_steps,
                    lr,
                    loss_text
                ),
            }

            last_loss = values.get("total_loss").copied();
            let _ = logging_tx.send(LoggingMessage::new_training_step(
                "train",
                training_step,
                lr,
                values,
            ));
        }

        // save checkpoint
        if let Some(0) = save_checkpoint_steps.map(|steps| (training_step + 1) % steps) {
            let _ = training_step_tensor.fill_(training_step as f64);
            let loss = f64::from(&losses.total_loss);
            let path = utils::save_checkpoint(&vs, &checkpoint_dir, training_step, loss)?;
            info!("saved checkpoint {}", path.display());
        }
    }

    // save the final checkpoint
    if max_steps > init_training_step {
        let final_step = max_steps - 1;
        let _ = training_step_tensor.fill_(final_step as f64);
        let path = utils::save_checkpoint(
            &vs,
            &checkpoint_dir,
            final_step,
            last_loss.unwrap_or(0.0),
        )?;
        info!("training finished, saved checkpoint {}", path.display());
    } else {
        warn!(
            "the initial step {} reaches the maximum step {}, nothing to train",
            init_training_step, max_steps
        );
    }

    Ok(())
}
