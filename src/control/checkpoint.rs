//! # Checkpoints
//!
//! ## Responsibility
//! Persist the production controller's field and agent state so a restart
//! resumes where it stopped.
//!
//! ## Guarantees
//! - Atomic: written to a sibling temp file and renamed over the target, so
//!   a reader sees either the old or the new checkpoint, never a torn one
//! - Off the hot path: [`CheckpointWriter`] does file I/O on a blocking
//!   thread; the control loop only hands it a value
//! - Latest wins: when the writer falls behind, older pending checkpoints
//!   are dropped in favour of the newest
//!
//! The atomic JSON helpers ([`write_json`], [`read_json`]) also back the
//! adoption gate's ledger.
//!
//! ## NOT Responsible For
//! - Baseline history contents (see `self_tune::gate::GateLedger`)

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::agents::AgentSetSnapshot;
use crate::field::{ComponentId, FieldState, ThresholdConfig};

/// Errors produced while saving or loading checkpoints.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// File system failure.
    #[error("checkpoint I/O error at {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not a valid checkpoint.
    #[error("checkpoint decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Everything the production loop needs to resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Last completed tick.
    pub tick: u64,
    /// Baseline version in force at that tick.
    pub baseline_version: u64,
    /// Thresholds in force at that tick.
    pub thresholds: ThresholdConfig,
    /// Per-component fields.
    pub fields: Vec<(ComponentId, FieldState)>,
    /// Agent and plant state.
    pub agents: AgentSetSnapshot,
    /// Wall-clock time of capture.
    pub saved_at: DateTime<Utc>,
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write `checkpoint` to `path` atomically.
///
/// # Errors
/// [`CheckpointError::Io`] on any file system failure.
pub fn save(path: &Path, checkpoint: &Checkpoint) -> Result<(), CheckpointError> {
    write_json(path, checkpoint)
}

/// Load the checkpoint at `path`. A missing file is `Ok(None)`.
///
/// # Errors
/// [`CheckpointError::Io`] if the file exists but cannot be read,
/// [`CheckpointError::Decode`] if it is not a checkpoint.
pub fn load(path: &Path) -> Result<Option<Checkpoint>, CheckpointError> {
    read_json(path)
}

/// Serialize `value` as JSON into `path` through a sibling temp file.
///
/// # Errors
/// [`CheckpointError::Io`] on any file system failure.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), CheckpointError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = temp_path(path);
    std::fs::write(&tmp, bytes).map_err(|source| CheckpointError::Io {
        path: tmp.clone(),
        source,
    })?;
    std::fs::rename(&tmp, path).map_err(|source| CheckpointError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Read JSON written by [`write_json`]. A missing file is `Ok(None)`.
///
/// # Errors
/// [`CheckpointError::Io`] if the file exists but cannot be read,
/// [`CheckpointError::Decode`] if it does not decode as `T`.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, CheckpointError> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

/// Background task that persists checkpoints handed to it.
#[derive(Debug)]
pub struct CheckpointWriter {
    tx: mpsc::Sender<Checkpoint>,
    task: JoinHandle<()>,
}

impl CheckpointWriter {
    /// Spawn a writer for `path`. Must be called inside a Tokio runtime.
    pub fn spawn(path: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::channel::<Checkpoint>(4);
        let task = tokio::spawn(async move {
            while let Some(mut checkpoint) = rx.recv().await {
                while let Ok(newer) = rx.try_recv() {
                    checkpoint = newer;
                }
                let path = path.clone();
                let tick = checkpoint.tick;
                match tokio::task::spawn_blocking(move || save(&path, &checkpoint)).await {
                    Ok(Ok(())) => debug!(tick, "checkpoint written"),
                    Ok(Err(e)) => warn!(tick, error = %e, "checkpoint write failed"),
                    Err(e) => warn!(tick, error = %e, "checkpoint writer task failed"),
                }
            }
        });
        Self { tx, task }
    }

    /// Hand a checkpoint to the writer without waiting. Returns `false`
    /// when the queue is full and the checkpoint was skipped.
    pub fn submit(&self, checkpoint: Checkpoint) -> bool {
        self.tx.try_send(checkpoint).is_ok()
    }

    /// Close the queue and wait for pending writes to finish.
    pub async fn close(self) {
        drop(self.tx);
        if let Err(e) = self.task.await {
            warn!(error = %e, "checkpoint writer ended abnormally");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{AgentConfig, AgentSet};

    fn checkpoint(tick: u64) -> Checkpoint {
        Checkpoint {
            tick,
            baseline_version: 3,
            thresholds: ThresholdConfig::default(),
            fields: vec![(ComponentId::new("svc-0"), FieldState::new(0.1, 0.7, 0.2))],
            agents: AgentSet::new(AgentConfig::default()).snapshot(),
            saved_at: Utc::now(),
        }
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("controller.json");
        let cp = checkpoint(42);
        save(&path, &cp).unwrap();
        assert_eq!(load(&path).unwrap(), Some(cp));
        assert!(!temp_path(&path).exists());
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(load(&dir.path().join("absent.json")).unwrap(), None);
    }

    #[test]
    fn test_corrupt_file_is_decode_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, b"{not json").unwrap();
        assert!(matches!(load(&path), Err(CheckpointError::Decode(_))));
    }

    #[tokio::test]
    async fn test_writer_persists_latest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("controller.json");
        let writer = CheckpointWriter::spawn(path.clone());
        assert!(writer.submit(checkpoint(1)));
        writer.close().await;
        assert_eq!(load(&path).unwrap().unwrap().tick, 1);
    }
}
