use std::fs;
use std::path::{Path, PathBuf};

use glob::glob;
use log::{debug, info, warn};

use crate::error::{KelpError, Result};

const WEIGHT_EXTENSIONS: [&str; 3] = ["ckpt", "pt", "json"];

/// Locate saved weights for run `name` under `checkpoint_dir`.
///
/// The newest `last.*` file is preferred, then the newest `best*` file, then
/// the newest weights file of any name. Returns `Ok(None)` when the run has
/// no saved weights.
pub fn find_checkpoint(checkpoint_dir: impl AsRef<Path>, name: &str) -> Result<Option<PathBuf>> {
    let run_dir = checkpoint_dir.as_ref().join(name);
    if !run_dir.is_dir() {
        debug!("No run directory at {}", run_dir.display());
        return Ok(None);
    }

    let mut candidates = Vec::new();
    for ext in WEIGHT_EXTENSIONS {
        let pattern = run_dir.join("**").join(format!("*.{}", ext));
        for entry in glob(&pattern.to_string_lossy())? {
            match entry {
                Ok(path) => {
                    let modified = fs::metadata(&path)?.modified()?;
                    candidates.push((path, modified));
                }
                Err(e) => warn!("Skipping unreadable checkpoint entry: {}", e),
            }
        }
    }
    debug!("Found {} checkpoint file(s) in {}", candidates.len(), run_dir.display());

    let stem = |path: &Path| {
        path.file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    };
    let newest = |filter: &dyn Fn(&Path) -> bool| {
        candidates
            .iter()
            .filter(|(path, _)| filter(path))
            .max_by_key(|(path, modified)| (*modified, path.clone()))
            .map(|(path, _)| path.clone())
    };

    let found = newest(&|p: &Path| stem(p) == "last")
        .or_else(|| newest(&|p: &Path| stem(p).starts_with("best")))
        .or_else(|| newest(&|_: &Path| true));

    if let Some(path) = &found {
        info!("Resolved checkpoint for run '{}': {}", name, path.display());
    }
    Ok(found)
}

/// Pick the weights to load: an explicit path wins, otherwise the newest
/// checkpoint of the named run.
pub fn resolve_weights(
    explicit: Option<&Path>,
    checkpoint_dir: Option<&Path>,
    name: Option<&str>,
) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if !path.is_file() {
            return Err(KelpError::Checkpoint(format!(
                "weights file {} does not exist",
                path.display()
            )));
        }
        return Ok(path.to_path_buf());
    }

    match (checkpoint_dir, name) {
        (Some(dir), Some(name)) => find_checkpoint(dir, name)?.ok_or_else(|| {
            KelpError::Checkpoint(format!(
                "no checkpoint for run '{}' under {}",
                name,
                dir.display()
            ))
        }),
        _ => Err(KelpError::Checkpoint(
            "either a weights file or a checkpoint directory and run name is required".to_string(),
        )),
    }
}
