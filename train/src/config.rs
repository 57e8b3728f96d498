//! Training program configuration format.

use crate::common::*;
use rcnn_config::FasterRcnnConfig;
use serde_json::Value;

/// The main training configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub model: ModelConfig,
    pub dataset: DatasetConfig,
    pub logging: LoggingConfig,
    pub training: TrainingConfig,
}

impl Config {
    pub fn open<P>(path: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let text = std::fs::read_to_string(path)?;
        let config = json5::from_str(&text)?;
        Ok(config)
    }
}

/// The detector configuration file and its overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub cfg_file: PathBuf,
    /// Fields merged into the loaded configuration. Objects are merged
    /// recursively, and other values replace the loaded ones.
    #[serde(default)]
    pub overrides: Option<Value>,
}

impl ModelConfig {
    pub fn load(&self) -> Result<FasterRcnnConfig> {
        let Self {
            cfg_file,
            overrides,
        } = self;
        let text = std::fs::read_to_string(cfg_file)
            .with_context(|| format!("unable to read model config '{}'", cfg_file.display()))?;
        let mut value: Value = json5::from_str(&text)
            .with_context(|| format!("unable to parse model config '{}'", cfg_file.display()))?;
        if let Some(overrides) = overrides {
            merge_json(&mut value, overrides.clone());
        }

        let config: FasterRcnnConfig = serde_json::from_value(value)?;
        config.validate()?;
        Ok(config)
    }
}

/// Dataset options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    /// The directory where the dataset splits of the model config are located.
    pub dataset_dir: PathBuf,
    /// The probability to apply horizontal flip.
    #[serde(default = "default_hflip_prob")]
    pub hflip_prob: R64,
    /// The maximum number of waiting records per preprocessing stage.
    #[serde(default)]
    pub worker_buf_size: Option<usize>,
}

/// Data logging options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub dir: PathBuf,
}

/// The training options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingConfig {
    /// The batch size.
    pub batch_size: NonZeroUsize,
    /// The training device.
    #[serde(with = "tch_serde::serde_device")]
    pub device: Device,
    /// If enabled, it overrides the initial training step.
    #[serde(default)]
    pub override_initial_step: Option<usize>,
    /// If set, it saves a checkpoint file per this steps.
    #[serde(default)]
    pub save_checkpoint_steps: Option<NonZeroUsize>,
    /// Checkpoint file loading method.
    pub load_checkpoint: LoadCheckpoint,
}

/// Checkpoint file loading method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum LoadCheckpoint {
    /// Disable checkpoint file loading.
    Disabled,
    /// Load the most recent checkpoint file under the logging directory.
    FromRecent,
    /// Load the checkpoint file from specified path.
    FromFile { file: PathBuf },
}

fn default_hflip_prob() -> R64 {
    r64(0.5)
}

fn merge_json(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            patch.into_iter().for_each(|(key, value)| match base.get_mut(&key) {
                Some(orig) => merge_json(orig, value),
                None => {
                    base.insert(key, value);
                }
            });
        }
        (base, patch) => *base = patch,
    }
}
