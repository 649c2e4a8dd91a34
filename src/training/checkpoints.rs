//! Checkpoint discovery, persistence and retention
//!
//! Checkpoints are safetensors files named `{job_name}.safetensors` for the
//! final save and `{job_name}_{step:09}.safetensors` for intermediate saves;
//! critic variants carry a `CRITIC_` prefix. Discovery picks the newest file
//! by modification time. Retention deletes the oldest intermediates once the
//! configured maximum is exceeded; the unsuffixed final file never matches
//! the intermediate pattern and is therefore never pruned.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use candle_core::{Device, Tensor};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// File name prefix distinguishing critic checkpoints from the main model's
pub const CRITIC_PREFIX: &str = "CRITIC_";

const EXTENSION: &str = ".safetensors";
const STEP_SUFFIX_DIGITS: usize = 9;

/// Persists and restores model weights plus training metadata
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    device: Device,
}

/// Build the checkpoint path for a job, `None` step meaning the final save
pub fn checkpoint_path(
    save_root: &Path,
    prefix: &str,
    job_name: &str,
    step: Option<u64>,
) -> PathBuf {
    let suffix = step.map(|s| format!("_{s:09}")).unwrap_or_default();
    save_root.join(format!("{prefix}{job_name}{suffix}{EXTENSION}"))
}

fn has_step_suffix(file_name: &str, stem: &str) -> bool {
    let rest = match file_name
        .strip_prefix(stem)
        .and_then(|r| r.strip_suffix(EXTENSION))
    {
        Some(rest) => rest,
        None => return false,
    };
    match rest.strip_prefix('_') {
        Some(digits) => {
            digits.len() == STEP_SUFFIX_DIGITS && digits.bytes().all(|b| b.is_ascii_digit())
        }
        None => false,
    }
}

fn modified_time(path: &Path) -> SystemTime {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .unwrap_or(SystemTime::UNIX_EPOCH)
}

/// List checkpoint files for `{prefix}{job_name}`, optionally restricted to
/// intermediates, sorted oldest first by modification time
fn list_checkpoints(
    job_name: &str,
    save_root: &Path,
    prefix: &str,
    intermediates_only: bool,
) -> Vec<PathBuf> {
    let stem = format!("{prefix}{job_name}");
    let entries = match fs::read_dir(save_root) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };
    let mut found: Vec<(PathBuf, SystemTime)> = entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name();
            let name = name.to_str()?;
            if !name.starts_with(&stem) || !name.ends_with(EXTENSION) {
                return None;
            }
            if intermediates_only && !has_step_suffix(name, &stem) {
                return None;
            }
            let path = entry.path();
            let mtime = modified_time(&path);
            Some((path, mtime))
        })
        .collect();
    found.sort_by_key(|(_, mtime)| *mtime);
    found.into_iter().map(|(path, _)| path).collect()
}

impl CheckpointStore {
    /// Create a store that restores tensors to `device`
    pub fn new(device: Device) -> Self {
        Self { device }
    }

    /// Newest checkpoint for a job, final or intermediate, by modification
    /// time. `None` when the directory is absent or holds no match.
    pub fn find_latest(
        &self,
        job_name: &str,
        save_root: &Path,
        prefix: &str,
    ) -> Option<PathBuf> {
        list_checkpoints(job_name, save_root, prefix, false)
            .into_iter()
            .last()
    }

    /// Newest intermediate checkpoint; the unsuffixed final file is excluded
    /// by the filename pattern
    pub fn find_latest_intermediate(
        &self,
        job_name: &str,
        save_root: &Path,
    ) -> Option<PathBuf> {
        list_checkpoints(job_name, save_root, "", true)
            .into_iter()
            .last()
    }

    /// Load weights and metadata from a checkpoint file.
    ///
    /// Any failure (unreadable file, not a safetensors container) is a
    /// [`Error::Resume`]: the operator must remove the bad file, there is no
    /// silent scratch-start fallback.
    pub fn load(
        &self,
        path: &Path,
    ) -> Result<(HashMap<String, Tensor>, HashMap<String, String>)> {
        let bytes = fs::read(path).map_err(|e| {
            Error::resume(format!("cannot read checkpoint {}: {e}", path.display()))
        })?;
        let (_, header) = safetensors::SafeTensors::read_metadata(&bytes).map_err(|e| {
            Error::resume(format!(
                "checkpoint {} is not a valid container: {e}",
                path.display()
            ))
        })?;
        let metadata = header.metadata().clone().unwrap_or_default();
        let weights =
            candle_core::safetensors::load_buffer(&bytes, &self.device).map_err(|e| {
                Error::resume(format!(
                    "cannot deserialize tensors from {}: {e}",
                    path.display()
                ))
            })?;
        debug!(path = %path.display(), tensors = weights.len(), "loaded checkpoint");
        Ok((weights, metadata))
    }

    /// Write a checkpoint.
    ///
    /// The container is serialized to a temporary sibling and renamed into
    /// place, so a partial write never overwrites a previously valid file.
    pub fn save(
        &self,
        weights: &HashMap<String, Tensor>,
        metadata: &HashMap<String, String>,
        path: &Path,
    ) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = safetensors::serialize(
            weights
                .iter()
                .map(|(name, tensor)| (name.as_str(), tensor.clone())),
            Some(metadata.clone()),
        )?;
        let tmp = path.with_extension("safetensors.tmp");
        fs::write(&tmp, &bytes)?;
        fs::rename(&tmp, path)?;
        info!(path = %path.display(), tensors = weights.len(), "saved checkpoint");
        Ok(())
    }

    /// Delete the oldest intermediate checkpoints until at most `keep_n`
    /// remain. Deletion failures are logged and non-fatal; the final
    /// unsuffixed checkpoint is never touched.
    pub fn prune(&self, job_name: &str, save_root: &Path, keep_n: usize) {
        let intermediates = list_checkpoints(job_name, save_root, "", true);
        if intermediates.len() <= keep_n {
            return;
        }
        let excess = intermediates.len() - keep_n;
        for path in intermediates.into_iter().take(excess) {
            match fs::remove_file(&path) {
                Ok(()) => info!(path = %path.display(), "removed old save"),
                Err(e) => warn!(path = %path.display(), error = %e, "failed to remove old save"),
            }
        }
    }
}
