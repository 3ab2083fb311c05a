//! Checkpoint Store
//!
//! Device identity → epoch seconds up to which logs are confirmed captured.
//! Each session exit writes its device's key once; the scheduler is the only
//! writer, so a plain lock around the map is enough. When backed by a file
//! the whole map is rewritten after every update.

use crate::domain::models::{CheckpointDecision, MacAddress};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("failed to access checkpoint file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid checkpoint file {}: {source}", path.display())]
    Format {
        path: PathBuf,
        source: serde_json::Error,
    },
}

/// Current wall-clock time in epoch seconds
pub fn epoch_now() -> i64 {
    chrono::Utc::now().timestamp()
}

#[derive(Debug, Clone, Default)]
pub struct CheckpointStore {
    entries: Arc<RwLock<HashMap<MacAddress, i64>>>,
    path: Option<PathBuf>,
}

impl CheckpointStore {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Open a file-backed store; a missing file starts empty
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CheckpointError> {
        let path = path.as_ref().to_path_buf();
        let entries = match fs::read_to_string(&path) {
            Ok(contents) => serde_json::from_str(&contents).map_err(|source| {
                CheckpointError::Format {
                    path: path.clone(),
                    source,
                }
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(source) => return Err(CheckpointError::Io { path, source }),
        };
        info!("Loaded {} checkpoints from {}", entries.len(), path.display());
        Ok(Self {
            entries: Arc::new(RwLock::new(entries)),
            path: Some(path),
        })
    }

    pub fn get(&self, mac: &MacAddress) -> Option<i64> {
        self.read().get(mac).copied()
    }

    /// Checkpoint, or the epoch for devices never seen before
    pub fn get_or_default(&self, mac: &MacAddress) -> i64 {
        self.get(mac).unwrap_or(0)
    }

    pub fn set(&self, mac: MacAddress, epoch: i64) {
        debug!(mac = %mac, epoch, "checkpoint written");
        self.write().insert(mac, epoch);
    }

    /// Apply a session's decision; returns whether the stored value changed
    pub fn record(&self, mac: MacAddress, decision: CheckpointDecision) -> bool {
        match decision {
            CheckpointDecision::Unchanged => false,
            CheckpointDecision::Set(epoch) => {
                let previous = self.get(&mac);
                self.set(mac, epoch);
                previous != Some(epoch)
            }
        }
    }

    pub fn snapshot(&self) -> HashMap<MacAddress, i64> {
        self.read().clone()
    }

    /// Write the map to the backing file, if any
    pub fn persist(&self) -> Result<(), CheckpointError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(&self.snapshot()).map_err(|source| {
            CheckpointError::Format {
                path: path.clone(),
                source,
            }
        })?;

        let io_err = |source| CheckpointError::Io {
            path: path.clone(),
            source,
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json).map_err(io_err)?;
        fs::rename(&tmp, path).map_err(io_err)?;
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HashMap<MacAddress, i64>> {
        self.entries
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<MacAddress, i64>> {
        self.entries
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
