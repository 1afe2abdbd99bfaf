// Copyright 2026 Boundless Foundation, Inc.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Durable snapshot files, the checkpoint file and the process lock.

use std::{
    fs::OpenOptions,
    io::{ErrorKind, Write},
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

use crate::errors::{impl_coded_debug, CodedError};

/// Votes and wallets, written together as one snapshot.
pub const LEDGER_TABLE: &str = "ledger";
const CHECKPOINT_FILE: &str = "checkpoint.json";
pub const LOCK_FILE: &str = "vote-auditor.lock";

#[derive(Error)]
pub enum StoreError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed snapshot {path}: {source}")]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("another run holds {path} (pid {holder:?})")]
    Locked { path: PathBuf, holder: Option<u32> },

    #[error("background write task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl_coded_debug!(StoreError);

impl CodedError for StoreError {
    fn code(&self) -> &str {
        match self {
            StoreError::Io { .. } => "[VA-STORE-001]",
            StoreError::Serialization { .. } => "[VA-STORE-002]",
            StoreError::Locked { .. } => "[VA-STORE-003]",
            StoreError::Join(_) => "[VA-STORE-004]",
        }
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> StoreError + '_ {
    move |source| StoreError::Io { path: path.to_path_buf(), source }
}

/// Last durably recorded scan height and the blocks at or below it that still need a rescan.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub height: u64,
    #[serde(default)]
    pub missed_blocks: Vec<u64>,
    pub updated_at: DateTime<Utc>,
}

/// Named JSON tables under one directory, each rewritten in full on save.
#[derive(Clone, Debug)]
pub struct SnapshotStore {
    base_path: PathBuf,
}

impl SnapshotStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        Self { base_path: base_path.into() }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn table_path(&self, name: &str) -> PathBuf {
        self.base_path.join(format!("{name}.json"))
    }

    pub fn lock_path(&self) -> PathBuf {
        self.base_path.join(LOCK_FILE)
    }

    pub async fn ensure_dir(&self) -> Result<(), StoreError> {
        tokio::fs::create_dir_all(&self.base_path).await.map_err(io_err(&self.base_path))
    }

    /// Reads a table, or `None` if it was never written.
    pub async fn read_table<T: DeserializeOwned>(
        &self,
        name: &str,
    ) -> Result<Option<T>, StoreError> {
        read_json(&self.table_path(name)).await
    }

    /// Replaces a table atomically: readers see either the previous or the new snapshot.
    pub async fn write_table<T: Serialize>(&self, name: &str, table: &T) -> Result<(), StoreError> {
        let path = self.table_path(name);
        let data = serde_json::to_vec_pretty(table)
            .map_err(|source| StoreError::Serialization { path: path.clone(), source })?;
        self.ensure_dir().await?;
        write_atomic(path.clone(), data).await?;
        tracing::debug!("Wrote snapshot {}", path.display());
        Ok(())
    }

    pub async fn read_checkpoint(&self) -> Result<Option<CheckpointRecord>, StoreError> {
        read_json(&self.base_path.join(CHECKPOINT_FILE)).await
    }

    pub async fn write_checkpoint(
        &self,
        height: u64,
        missed_blocks: Vec<u64>,
    ) -> Result<(), StoreError> {
        let path = self.base_path.join(CHECKPOINT_FILE);
        let record = CheckpointRecord { height, missed_blocks, updated_at: Utc::now() };
        let data = serde_json::to_vec_pretty(&record)
            .map_err(|source| StoreError::Serialization { path: path.clone(), source })?;
        self.ensure_dir().await?;
        write_atomic(path, data).await
    }
}

async fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    let data = match tokio::fs::read(path).await {
        Ok(data) => data,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(source) => return Err(StoreError::Io { path: path.to_path_buf(), source }),
    };
    serde_json::from_slice(&data)
        .map(Some)
        .map_err(|source| StoreError::Serialization { path: path.to_path_buf(), source })
}

/// Writes to a temp file next to `path` and renames it into place.
async fn write_atomic(path: PathBuf, data: Vec<u8>) -> Result<(), StoreError> {
    tokio::task::spawn_blocking(move || {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut file = tempfile::NamedTempFile::new_in(dir).map_err(io_err(dir))?;
        file.write_all(&data).map_err(io_err(file.path()))?;
        file.as_file().sync_all().map_err(io_err(&path))?;
        file.persist(&path)
            .map_err(|err| StoreError::Io { path: path.clone(), source: err.error })?;
        Ok(())
    })
    .await?
}

/// Exclusive ownership of a data directory for the lifetime of one run.
///
/// The lock file holds the owner's PID and is removed on drop.
#[derive(Debug)]
pub struct ProcessLock {
    path: PathBuf,
}

impl ProcessLock {
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        let mut file = match OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                let holder = std::fs::read_to_string(&path)
                    .ok()
                    .and_then(|pid| pid.trim().parse().ok());
                return Err(StoreError::Locked { path, holder });
            }
            Err(source) => return Err(StoreError::Io { path, source }),
        };
        write!(file, "{}", std::process::id()).map_err(io_err(&path))?;
        tracing::debug!("Acquired process lock {}", path.display());
        Ok(Self { path })
    }

    /// Removes a lock left behind by a run that did not exit cleanly.
    pub fn force_unlock(path: &Path) -> Result<bool, StoreError> {
        match std::fs::remove_file(path) {
            Ok(()) => {
                tracing::warn!("Removed stale lock {}", path.display());
                Ok(true)
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(StoreError::Io { path: path.to_path_buf(), source }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            tracing::warn!("Failed to release lock {}: {err}", self.path.display());
        }
    }
}
