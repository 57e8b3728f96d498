use crate::common::*;
use rcnn_config::TrainConfig;

/// Step-decay learning rate schedule with linear warm-up in the first epoch.
#[derive(Debug, Clone)]
pub struct LrScheduler {
    base_lr: f64,
    decay_rate: f64,
    decay_stages: Vec<usize>,
    warm_iters: usize,
    steps_per_epoch: usize,
    step: usize,
    lr_cache: f64,
}

impl LrScheduler {
    pub fn new(
        config: &TrainConfig,
        batch_size: usize,
        steps_per_epoch: usize,
        init_step: impl Into<Option<usize>>,
    ) -> Result<Self> {
        let TrainConfig {
            basic_lr,
            lr_decay_rate,
            ref lr_decay_stages,
            warm_iters,
            ..
        } = *config;
        ensure!(basic_lr > 0.0, "basic_lr must be positive");
        ensure!(lr_decay_rate > 0.0, "lr_decay_rate must be positive");
        ensure!(batch_size > 0, "batch_size must be positive");
        ensure!(steps_per_epoch > 0, "steps_per_epoch must be positive");

        let mut scheduler = Self {
            base_lr: basic_lr.raw() * batch_size as f64,
            decay_rate: lr_decay_rate.raw(),
            decay_stages: lr_decay_stages.clone(),
            warm_iters,
            steps_per_epoch,
            step: 0,
            lr_cache: 0.0,
        };
        scheduler.set_step(init_step.into().unwrap_or(0));
        Ok(scheduler)
    }

    pub fn set_step(&mut self, new_step: usize) {
        self.step = new_step;
        self.lr_cache = self.lr_at(new_step);
    }

    pub fn epoch(&self) -> usize {
        self.step / self.steps_per_epoch
    }

    /// The learning rate at a global step.
    pub fn lr_at(&self, step: usize) -> f64 {
        let epoch = step / self.steps_per_epoch;
        let num_decays = self
            .decay_stages
            .iter()
            .filter(|&&stage| stage <= epoch)
            .count();
        let lr = self.base_lr * self.decay_rate.powi(num_decays as i32);

        if epoch == 0 && step < self.warm_iters {
            lr * (step + 1) as f64 / self.warm_iters as f64
        } else {
            lr
        }
    }

    pub fn lr(&self) -> f64 {
        self.lr_cache
    }

    /// Returns the learning rate of the current step and advances one step.
    pub fn next(&mut self) -> f64 {
        let lr = self.lr_at(self.step);
        self.lr_cache = lr;
        self.step += 1;
        lr
    }
}
