use crate::common::*;
use rcnn_config::FasterRcnnConfig;

pub use input::*;
pub use model::*;
pub use output::*;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub model: ModelConfig,
    pub input: InputConfig,
    pub output: OutputConfig,
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

mod model {
    use super::*;

    /// Model configuration.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct ModelConfig {
        pub cfg_file: PathBuf,
        pub checkpoint_file: PathBuf,
        /// The device where the model runs on.
        #[serde(with = "tch_serde::serde_device")]
        pub device: Device,
    }

    impl ModelConfig {
        pub fn load(&self) -> Result<FasterRcnnConfig> {
            FasterRcnnConfig::load(&self.cfg_file)
        }
    }
}

mod input {
    use super::*;

    /// Input images options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct InputConfig {
        /// The glob pattern of image files.
        pub images: String,
        /// The maximum number of images in preprocessing.
        #[serde(default)]
        pub worker_buf_size: Option<usize>,
    }

    impl InputConfig {
        /// Lists image files matching the pattern in sorted order.
        pub fn image_files(&self) -> Result<Vec<PathBuf>> {
            let mut paths: Vec<PathBuf> = glob::glob(&self.images)
                .with_context(|| format!("invalid glob pattern '{}'", self.images))?
                .collect::<Result<_, _>>()?;
            paths.retain(|path| path.is_file());
            paths.sort();
            Ok(paths)
        }
    }
}

mod output {
    use super::*;

    /// Detection output options.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct OutputConfig {
        /// The JSON lines file to write detections to.
        pub file: PathBuf,
        /// Dataset category ids in ascending order. Class `i` is written as
        /// `category_ids[i - 1]`. If not set, the 1-based class id is written.
        #[serde(default)]
        pub category_ids: Option<Vec<u64>>,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_detect_config() -> Result<()> {
        let text = r#"{
            model: {
                cfg_file: "model.json5",
                checkpoint_file: "model.ckpt",
                device: "cpu",
            },
            input: { images: "images/*.jpg" },
            output: { file: "detections.json", category_ids: [1, 2, 3] },
        }"#;
        let config: Config = json5::from_str(text)?;

        assert_eq!(config.model.device, Device::Cpu);
        assert_eq!(config.input.images, "images/*.jpg");
        assert_eq!(config.input.worker_buf_size, None);
        assert_eq!(config.output.category_ids, Some(vec![1, 2, 3]));
        Ok(())
    }

    #[test]
    fn list_image_files() -> Result<()> {
        let input = InputConfig {
            images: concat!(env!("CARGO_MANIFEST_DIR"), "/src/*.rs").into(),
            worker_buf_size: None,
        };
        let files = input.image_files()?;
        assert!(files.iter().any(|path| path.ends_with("config.rs")));
        assert!(files.windows(2).all(|pair| pair[0] <= pair[1]));
        Ok(())
    }
}
