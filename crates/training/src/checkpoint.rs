//! Last/best checkpoint artifacts.
//!
//! A checkpoint is a directory named `{kind}_model_{split}` holding the full
//! parameter set as safetensors plus a manifest carrying a format version,
//! SHA-256 file records, and the architecture descriptor. Writes build a
//! temporary sibling directory first and swap it into place, so an overwrite
//! interrupted mid-write leaves either the old checkpoint or the new one,
//! never a torn mix. Loading validates digests and refuses architecture
//! mismatches before any weight is touched.

use std::{
    collections::HashMap,
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use candle_core::safetensors::load as load_safetensors;
use hex::encode as hex_encode;
use model::{ArchDescriptor, HybridClassifier};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::TrainingError;

pub const CHECKPOINT_VERSION: u32 = 1;
const WEIGHTS_FILENAME: &str = "model.safetensors";
const MANIFEST_FILENAME: &str = "manifest.json";

/// The two concurrently maintained checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointKind {
    /// Overwritten unconditionally at the end of every epoch.
    Last,
    /// Overwritten only when validation accuracy strictly improves.
    Best,
}

impl CheckpointKind {
    fn prefix(self) -> &'static str {
        match self {
            CheckpointKind::Last => "last",
            CheckpointKind::Best => "best",
        }
    }

    pub fn directory_name(self, split: &str) -> String {
        format!("{}_model_{}", self.prefix(), split)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointManifest {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub arch: ArchDescriptor,
    pub weights: FileRecord,
}

pub struct LoadedCheckpoint {
    pub manifest: CheckpointManifest,
    pub weights_path: PathBuf,
}

pub fn checkpoint_path(base_dir: &Path, kind: CheckpointKind, split: &str) -> PathBuf {
    base_dir.join(kind.directory_name(split))
}

pub fn checkpoint_exists(base_dir: &Path, kind: CheckpointKind, split: &str) -> bool {
    checkpoint_path(base_dir, kind, split)
        .join(MANIFEST_FILENAME)
        .is_file()
}

/// Writes (or overwrites) the checkpoint of `kind` for `split`.
pub fn save_checkpoint(
    base_dir: &Path,
    kind: CheckpointKind,
    split: &str,
    model: &HybridClassifier,
) -> Result<PathBuf, TrainingError> {
    fs::create_dir_all(base_dir).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to create checkpoint directory {}: {err}",
            base_dir.display()
        ))
    })?;

    let target = checkpoint_path(base_dir, kind, split);
    let staging = base_dir.join(format!(".tmp-{}", kind.directory_name(split)));
    if staging.exists() {
        fs::remove_dir_all(&staging).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to clear stale staging directory {}: {err}",
                staging.display()
            ))
        })?;
    }
    fs::create_dir(&staging).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to create staging directory {}: {err}",
            staging.display()
        ))
    })?;

    let weights_path = staging.join(WEIGHTS_FILENAME);
    save_model_weights(model, &weights_path)?;
    let weights_record = file_record(&weights_path)?;

    let manifest = CheckpointManifest {
        version: CHECKPOINT_VERSION,
        created_unix_timestamp: unix_timestamp(),
        arch: model.descriptor(),
        weights: weights_record,
    };
    write_json(&staging.join(MANIFEST_FILENAME), &manifest)?;

    if target.exists() {
        fs::remove_dir_all(&target).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to remove previous checkpoint {}: {err}",
                target.display()
            ))
        })?;
    }
    fs::rename(&staging, &target).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to move checkpoint into place at {}: {err}",
            target.display()
        ))
    })?;

    Ok(target)
}

/// Opens a checkpoint, validating version, digests, and architecture.
pub fn load_checkpoint(
    base_dir: &Path,
    kind: CheckpointKind,
    split: &str,
    expected_arch: &ArchDescriptor,
) -> Result<LoadedCheckpoint, TrainingError> {
    let directory = checkpoint_path(base_dir, kind, split);
    let manifest_path = directory.join(MANIFEST_FILENAME);
    if !manifest_path.is_file() {
        return Err(TrainingError::runtime(format!(
            "checkpoint manifest not found at {}",
            manifest_path.display()
        )));
    }
    let manifest: CheckpointManifest = read_json(&manifest_path)?;

    if manifest.version != CHECKPOINT_VERSION {
        return Err(TrainingError::runtime(format!(
            "unsupported checkpoint version {} (expected {})",
            manifest.version, CHECKPOINT_VERSION
        )));
    }
    if &manifest.arch != expected_arch {
        return Err(TrainingError::initialization(format!(
            "checkpoint at {} was written for a different architecture",
            directory.display()
        )));
    }

    let weights_path = directory.join(&manifest.weights.filename);
    validate_file(&weights_path, &manifest.weights.sha256)?;

    Ok(LoadedCheckpoint {
        manifest,
        weights_path,
    })
}

/// Copies checkpointed weights into the model's parameter registry.
pub fn apply_weights(
    model: &HybridClassifier,
    weights_path: &Path,
) -> Result<(), TrainingError> {
    let device = model.config().device.clone();
    let tensors = load_safetensors(weights_path, &device).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to read weights {}: {err}",
            weights_path.display()
        ))
    })?;
    let mut by_name: HashMap<_, _> = tensors.into_iter().collect();

    for (name, var) in model.parameters() {
        let tensor = by_name.remove(&name).ok_or_else(|| {
            TrainingError::runtime(format!("checkpoint missing parameter {name}"))
        })?;
        let tensor = if tensor.dtype() == var.as_tensor().dtype() {
            tensor
        } else {
            tensor
                .to_dtype(var.as_tensor().dtype())
                .map_err(|err| TrainingError::runtime(err.to_string()))?
        };
        var.set(&tensor)
            .map_err(|err| TrainingError::runtime(err.to_string()))?;
    }

    if !by_name.is_empty() {
        let extra = by_name.keys().cloned().collect::<Vec<_>>().join(", ");
        return Err(TrainingError::runtime(format!(
            "checkpoint contains unused parameters: {extra}"
        )));
    }

    Ok(())
}

fn save_model_weights(model: &HybridClassifier, path: &Path) -> Result<(), TrainingError> {
    let named_parameters = model.parameters();
    if named_parameters.is_empty() {
        return Err(TrainingError::runtime(
            "model contains no parameters to checkpoint",
        ));
    }
    let mut tensors = HashMap::with_capacity(named_parameters.len());
    for (name, var) in named_parameters {
        tensors.insert(name, var.as_tensor().clone());
    }
    candle_core::safetensors::save(&tensors, path).map_err(|err| {
        TrainingError::runtime(format!(
            "failed to serialize model weights to {}: {err}",
            path.display()
        ))
    })
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let sha256 = sha256_file(path)?;
    let bytes = path
        .metadata()
        .map_err(|err| {
            TrainingError::runtime(format!(
                "failed to stat checkpoint file {}: {err}",
                path.display()
            ))
        })?
        .len();
    let filename = path
        .file_name()
        .and_then(|name| name.to_str())
        .ok_or_else(|| {
            TrainingError::runtime(format!(
                "checkpoint file name is not valid UTF-8: {}",
                path.display()
            ))
        })?
        .to_string();
    Ok(FileRecord {
        filename,
        sha256,
        bytes,
    })
}

fn validate_file(path: &Path, expected_sha: &str) -> Result<(), TrainingError> {
    let actual = sha256_file(path)?;
    if actual != expected_sha {
        return Err(TrainingError::runtime(format!(
            "checkpoint file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(())
}

fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to read {}: {err}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let mut file = File::create(path).map_err(|err| {
        TrainingError::runtime(format!("failed to create {}: {err}", path.display()))
    })?;
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::runtime(format!("failed to serialize JSON: {err}")))?;
    file.write_all(&data).map_err(|err| {
        TrainingError::runtime(format!("failed to write {}: {err}", path.display()))
    })?;
    file.write_all(b"\n")
        .map_err(|err| TrainingError::runtime(format!("failed to write {}: {err}", path.display())))
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(file).map_err(|err| {
        TrainingError::runtime(format!("failed to parse JSON {}: {err}", path.display()))
    })
}
