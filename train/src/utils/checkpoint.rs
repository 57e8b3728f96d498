use crate::{common::*, config::LoadCheckpoint};
use regex::Regex;

pub const FILE_STRFTIME: &str = "%Y-%m-%d-%H-%M-%S.%3f%z";

const CHECKPOINT_FILENAME_PATTERN: &str =
    r"^(\d{4}-\d{2}-\d{2}-\d{2}-\d{2}-\d{2}\.\d{3}[+-]\d{4})_\d{6,}_-?\d+\.\d+\.ckpt$";

/// Save parameters to a checkpoint file.
pub fn save_checkpoint(
    vs: &nn::VarStore,
    checkpoint_dir: &Path,
    training_step: usize,
    loss: f64,
) -> Result<PathBuf> {
    let filename = format!(
        "{}_{:06}_{:08.5}.ckpt",
        Local::now().format(FILE_STRFTIME),
        training_step,
        loss
    );
    let path = checkpoint_dir.join(filename);
    vs.save(&path)
        .with_context(|| format!("unable to save checkpoint '{}'", path.display()))?;
    Ok(path)
}

/// Finds the checkpoint file to load with the specified loading method.
pub fn find_checkpoint(
    logging_dir: &Path,
    load_checkpoint: &LoadCheckpoint,
) -> Result<Option<PathBuf>> {
    let path = match load_checkpoint {
        LoadCheckpoint::Disabled => {
            info!("checkpoint loading is disabled");
            None
        }
        LoadCheckpoint::FromRecent => {
            let regex = Regex::new(CHECKPOINT_FILENAME_PATTERN)?;
            let pattern = format!("{}/*/checkpoints/*.ckpt", logging_dir.display());
            let paths: Vec<_> = glob::glob(&pattern)?.collect::<Result<_, _>>()?;

            let checkpoint_file = paths
                .into_iter()
                .filter_map(|path| {
                    let file_name = path.file_name()?.to_str()?;
                    let captures = regex.captures(file_name)?;
                    let datetime_str = captures.get(1)?.as_str();
                    let datetime = DateTime::parse_from_str(datetime_str, FILE_STRFTIME).ok()?;
                    Some((path, datetime))
                })
                .max_by_key(|(_path, datetime)| *datetime)
                .map(|(path, _datetime)| path);

            if checkpoint_file.is_none() {
                warn!("no checkpoint file found in '{}'", logging_dir.display());
            }
            checkpoint_file
        }
        LoadCheckpoint::FromFile { file } => {
            ensure!(file.is_file(), "'{}' is not a file", file.display());
            Some(file.to_owned())
        }
    };
    Ok(path)
}

/// Load parameters from a diretory with specified checkpoint loading method.
///
/// Returns the loaded file path, or `None` if nothing is loaded.
pub fn try_load_checkpoint(
    vs: &mut nn::VarStore,
    logging_dir: &Path,
    load_checkpoint: &LoadCheckpoint,
) -> Result<Option<PathBuf>> {
    let path = find_checkpoint(logging_dir, load_checkpoint)?;

    if let Some(path) = &path {
        info!("load checkpoint file {}", path.display());
        let missing = vs.load_partial(path)?;
        if !missing.is_empty() {
            warn!("variables missing in checkpoint: {}", missing.join(", "));
        }
    }

    Ok(path)
}
