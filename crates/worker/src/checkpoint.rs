//! Best-loss checkpoints
//!
//! A checkpoint is written only when an epoch ends with a loss strictly below
//! the best seen so far. The file is replaced atomically.

use axonfleet_common::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// File name under the identity's working directory
pub const CHECKPOINT_FILE: &str = "model.json";

/// Persisted checkpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub epoch: u64,
    pub global_step: u64,
    pub loss: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trial_id: Option<String>,
    pub state: serde_json::Value,
}

/// Tracks the best loss and owns the checkpoint path
#[derive(Debug, Clone)]
pub struct Checkpointer {
    path: PathBuf,
    best_loss: f32,
}

impl Checkpointer {
    /// Checkpoints go to `{dir}/model.json`
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(CHECKPOINT_FILE),
            best_loss: f32::INFINITY,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn best_loss(&self) -> f32 {
        self.best_loss
    }

    /// Whether `loss` would be persisted
    pub fn improves(&self, loss: f32) -> bool {
        loss.is_finite() && loss < self.best_loss
    }

    /// Persist `checkpoint` if it improves on the best loss; returns whether
    /// it was written
    pub fn save_if_better(&mut self, checkpoint: &Checkpoint) -> Result<bool> {
        if !self.improves(checkpoint.loss) {
            return Ok(false);
        }

        let temp_path = self.path.with_extension("json.tmp");
        std::fs::write(&temp_path, serde_json::to_vec(checkpoint)?)?;
        std::fs::rename(&temp_path, &self.path)?;

        info!(
            "Saving model: epoch: {}, loss: {:.4}, path: {}",
            checkpoint.epoch,
            checkpoint.loss,
            self.path.display()
        );
        self.best_loss = checkpoint.loss;
        Ok(true)
    }

    /// Read the persisted checkpoint, if any
    pub fn load(&self) -> Result<Option<Checkpoint>> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
