//! Content-addressed checkpoint storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::error::TrialError;
use crate::persistence;

const MANIFEST_FILE: &str = "checkpoints.json";
const METADATA_FILE: &str = "metadata.json";

/// Facts recorded with a stored checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub steps_completed: u64,
    pub framework: String,
    pub format: String,
    pub trialrun_version: String,
}

impl CheckpointMetadata {
    pub fn new(steps_completed: u64) -> Self {
        Self {
            steps_completed,
            framework: crate::training::checkpoint::FRAMEWORK.to_string(),
            format: "json".to_string(),
            trialrun_version: crate::VERSION.to_string(),
        }
    }
}

/// Where checkpoints are committed. Only the chief writes.
pub trait CheckpointStorage: Send {
    /// Run `write` against a fresh directory, commit its contents and return
    /// the storage id.
    fn store(
        &mut self,
        metadata: &CheckpointMetadata,
        write: &mut dyn FnMut(&Path) -> Result<(), TrialError>,
    ) -> Result<String, TrialError>;

    /// Local directory holding the checkpoint with the given id.
    fn restore_path(&self, storage_id: &str) -> Result<PathBuf, TrialError>;
}

/// One stored checkpoint in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub storage_id: String,
    pub steps_completed: u64,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

/// Checkpoints in a directory on a filesystem every worker can read. The
/// storage id is the SHA-256 of the checkpoint's files.
#[derive(Debug, Clone)]
pub struct SharedFsStorage {
    base_dir: PathBuf,
}

impl SharedFsStorage {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Manifest entries, oldest first.
    pub fn list(&self) -> Result<Vec<CheckpointEntry>, TrialError> {
        let path = self.base_dir.join(MANIFEST_FILE);
        Ok(persistence::load_json(&path)?.unwrap_or_default())
    }

    /// The checkpoint with the most completed steps.
    pub fn latest(&self) -> Result<Option<CheckpointEntry>, TrialError> {
        Ok(self
            .list()?
            .into_iter()
            .max_by(|a, b| {
                a.steps_completed
                    .cmp(&b.steps_completed)
                    .then(a.created_at.cmp(&b.created_at))
            }))
    }

    pub fn metadata(&self, storage_id: &str) -> Result<Option<CheckpointMetadata>, TrialError> {
        let path = self.restore_path(storage_id)?.join(METADATA_FILE);
        Ok(persistence::load_json(&path)?)
    }

    fn record(&self, entry: CheckpointEntry) -> Result<(), TrialError> {
        let mut entries = self.list()?;
        entries.retain(|e| e.storage_id != entry.storage_id);
        entries.push(entry);
        persistence::atomic_write_json(&self.base_dir.join(MANIFEST_FILE), &entries)?;
        Ok(())
    }
}

/// Hash every file under `dir`, visiting paths in sorted order so the
/// digest depends only on content and relative names.
fn content_hash(dir: &Path) -> Result<(String, u64), TrialError> {
    let mut hasher = Sha256::new();
    let mut size = 0u64;
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.map_err(|e| TrialError::storage(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(dir)
            .map_err(|e| TrialError::storage(e.to_string()))?;
        let bytes = std::fs::read(entry.path())?;
        hasher.update(rel.to_string_lossy().as_bytes());
        hasher.update((bytes.len() as u64).to_le_bytes());
        hasher.update(&bytes);
        size += bytes.len() as u64;
    }
    Ok((format!("{:x}", hasher.finalize()), size))
}

impl CheckpointStorage for SharedFsStorage {
    fn store(
        &mut self,
        metadata: &CheckpointMetadata,
        write: &mut dyn FnMut(&Path) -> Result<(), TrialError>,
    ) -> Result<String, TrialError> {
        std::fs::create_dir_all(&self.base_dir)?;
        let staging = self
            .base_dir
            .join(format!(".staging-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&staging)?;

        let committed = write(&staging).and_then(|()| {
            let (storage_id, size_bytes) = content_hash(&staging)?;
            let dest = self.base_dir.join(&storage_id);
            if dest.exists() {
                tracing::debug!(storage_id = %storage_id, "identical checkpoint already stored");
                std::fs::remove_dir_all(&staging)?;
            } else {
                std::fs::rename(&staging, &dest)?;
            }
            persistence::atomic_write_json(&dest.join(METADATA_FILE), metadata)?;
            Ok((storage_id, size_bytes))
        });

        let (storage_id, size_bytes) = match committed {
            Ok(done) => done,
            Err(e) => {
                if staging.exists() {
                    let _ = std::fs::remove_dir_all(&staging);
                }
                return Err(e);
            }
        };

        self.record(CheckpointEntry {
            storage_id: storage_id.clone(),
            steps_completed: metadata.steps_completed,
            size_bytes,
            created_at: Utc::now(),
        })?;
        tracing::info!(
            storage_id = %storage_id,
            steps_completed = metadata.steps_completed,
            size_bytes,
            "stored checkpoint"
        );
        Ok(storage_id)
    }

    fn restore_path(&self, storage_id: &str) -> Result<PathBuf, TrialError> {
        let invalid = storage_id.is_empty()
            || storage_id.starts_with('.')
            || storage_id.contains(['/', '\\']);
        if invalid {
            return Err(TrialError::storage(format!("invalid storage id '{storage_id}'")));
        }
        let path = self.base_dir.join(storage_id);
        if !path.is_dir() {
            return Err(TrialError::storage(format!(
                "checkpoint {storage_id} not found in {}",
                self.base_dir.display()
            )));
        }
        Ok(path)
    }
}
