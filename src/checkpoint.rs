use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

pub const CHECKPOINT_FILE: &str = "checkpoint.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub completed_run_ids: BTreeSet<u32>,
    pub timestamp: DateTime<Utc>,
}

/// Persistence for grid-search progress.
///
/// Within one execution the set of completed ids only grows; `append` merges
/// into whatever is already stored.
pub trait CheckpointStore {
    fn read(&self) -> Result<Option<Checkpoint>>;
    fn append(&mut self, run_ids: &BTreeSet<u32>) -> Result<()>;
    fn clear(&mut self) -> Result<()>;
}

pub struct FileCheckpointStore {
    path: PathBuf,
}

impl FileCheckpointStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn in_dir<P: AsRef<Path>>(dir: P) -> Self {
        Self::new(dir.as_ref().join(CHECKPOINT_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn read(&self) -> Result<Option<Checkpoint>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let text = fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read checkpoint {}", self.path.display()))?;
        let checkpoint: Checkpoint = serde_json::from_str(&text)
            .with_context(|| format!("Malformed checkpoint {}", self.path.display()))?;
        info!(
            "Loaded checkpoint with {} completed run(s) from {} (saved {})",
            checkpoint.completed_run_ids.len(),
            self.path.display(),
            checkpoint.timestamp.to_rfc3339()
        );
        Ok(Some(checkpoint))
    }

    fn append(&mut self, run_ids: &BTreeSet<u32>) -> Result<()> {
        let mut completed_run_ids = self
            .read()?
            .map(|checkpoint| checkpoint.completed_run_ids)
            .unwrap_or_default();
        completed_run_ids.extend(run_ids.iter().copied());
        let checkpoint = Checkpoint {
            completed_run_ids,
            timestamp: Utc::now(),
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        // Sibling temp file, then rename over the checkpoint.
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, serde_json::to_string_pretty(&checkpoint)?)
            .with_context(|| format!("Failed to write {}", tmp_path.display()))?;
        fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        debug!(
            "Checkpoint saved with {} completed run(s)",
            checkpoint.completed_run_ids.len()
        );
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        if self.path.exists() {
            fs::remove_file(&self.path)
                .with_context(|| format!("Failed to delete {}", self.path.display()))?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    checkpoint: Option<Checkpoint>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_completed(run_ids: impl IntoIterator<Item = u32>) -> Self {
        Self {
            checkpoint: Some(Checkpoint {
                completed_run_ids: run_ids.into_iter().collect(),
                timestamp: Utc::now(),
            }),
        }
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn read(&self) -> Result<Option<Checkpoint>> {
        Ok(self.checkpoint.clone())
    }

    fn append(&mut self, run_ids: &BTreeSet<u32>) -> Result<()> {
        let checkpoint = self.checkpoint.get_or_insert_with(|| Checkpoint {
            completed_run_ids: BTreeSet::new(),
            timestamp: Utc::now(),
        });
        checkpoint.completed_run_ids.extend(run_ids.iter().copied());
        checkpoint.timestamp = Utc::now();
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.checkpoint = None;
        Ok(())
    }
}
