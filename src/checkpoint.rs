//! Step-numbered parameter snapshots in a model directory.
//!
//! Files are named `<step>.<ext>`. Stems that do not parse as an integer are ignored, so the
//! directory can hold unrelated files.

use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::error::{GiftError, Result};
use crate::params::ParamMap;

/// Requests the checkpoint with the largest step.
pub const LATEST: i64 = -1;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    pub extractor: ParamMap,
    pub embedder: ParamMap,
    pub step: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    /// No checkpoint exists; parameters keep their initial values.
    Untrained,
    Loaded { step: i64, path: PathBuf },
}

impl LoadOutcome {
    pub fn step(&self) -> i64 {
        match self {
            LoadOutcome::Untrained => 0,
            LoadOutcome::Loaded { step, .. } => *step,
        }
    }

    /// Step at which training continues.
    pub fn resume_step(&self) -> i64 {
        match self {
            LoadOutcome::Untrained => 0,
            LoadOutcome::Loaded { step, .. } => step + 1,
        }
    }

    pub fn is_trained(&self) -> bool {
        matches!(self, LoadOutcome::Loaded { .. })
    }
}

/// Step-numbered files in `dir`, sorted by step. A missing directory has no checkpoints.
pub fn checkpoint_steps(dir: &Path) -> Result<Vec<(i64, PathBuf)>> {
    if !dir.is_dir() {
        warn!("model directory {} does not exist", dir.display());
        return Ok(Vec::new());
    }
    let mut steps = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let step = path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.parse::<i64>().ok());
        if let Some(step) = step {
            steps.push((step, path));
        }
    }
    steps.sort_by_key(|(step, _)| *step);
    Ok(steps)
}

/// Path of the requested checkpoint, `None` when `step` is [`LATEST`] and the directory holds
/// no checkpoint. An explicit step that is absent is an error.
pub fn resolve_checkpoint(dir: &Path, step: i64) -> Result<Option<(i64, PathBuf)>> {
    let mut steps = checkpoint_steps(dir)?;
    if step == LATEST {
        return Ok(steps.pop());
    }
    steps
        .into_iter()
        .find(|(s, _)| *s == step)
        .map(Some)
        .ok_or_else(|| GiftError::CheckpointNotFound {
            dir: dir.to_path_buf(),
            step,
        })
}

pub fn load_checkpoint(path: &Path) -> Result<Checkpoint> {
    let data = fs::read_to_string(path)?;
    Ok(serde_json::from_str(&data)?)
}

/// Writes `<step>.json` into `dir`, creating it if needed.
pub fn save_checkpoint(dir: &Path, checkpoint: &Checkpoint) -> Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let path = dir.join(format!("{}.json", checkpoint.step));
    fs::write(&path, serde_json::to_string(checkpoint)?)?;
    info!("saved checkpoint step {} to {}", checkpoint.step, path.display());
    Ok(path)
}

/// Resolves and reads a checkpoint, handing it to `apply` when one exists.
pub fn restore(
    dir: &Path,
    step: i64,
    apply: impl FnOnce(&Checkpoint) -> Result<()>,
) -> Result<LoadOutcome> {
    let Some((_, path)) = resolve_checkpoint(dir, step)? else {
        info!("no checkpoint in {}, starting untrained", dir.display());
        return Ok(LoadOutcome::Untrained);
    };
    let checkpoint = load_checkpoint(&path)?;
    apply(&checkpoint)?;
    info!("loaded checkpoint step {} from {}", checkpoint.step, path.display());
    Ok(LoadOutcome::Loaded {
        step: checkpoint.step,
        path,
    })
}
