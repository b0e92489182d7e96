//! Engine section: checkpointing, early stopping, scheduling and metrics

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::training::scheduler::LrScheduler;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Number of best checkpoints kept on disk
    pub n_saved: usize,
    pub dirname: PathBuf,
    pub filename_prefix: String,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            n_saved: 2,
            dirname: PathBuf::from("checkpoints"),
            filename_prefix: "best".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EarlyStoppingConfig {
    pub patience: usize,
    pub min_delta: f64,
}

impl Default for EarlyStoppingConfig {
    fn default() -> Self {
        Self {
            patience: 5,
            min_delta: 0.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Validation metric driving checkpoints and early stopping
    pub score_name: String,
    /// Epochs between evaluations; `max(max_epochs / 10, 1)` when unset
    pub log_interval: Option<usize>,
    pub checkpoint: CheckpointConfig,
    pub early_stopping: Option<EarlyStoppingConfig>,
    pub lr_scheduler: Option<LrScheduler>,
    /// Metric names logged per evaluation
    pub metrics: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            score_name: "loss".to_string(),
            log_interval: None,
            checkpoint: CheckpointConfig::default(),
            early_stopping: Some(EarlyStoppingConfig::default()),
            lr_scheduler: None,
            metrics: vec![
                "accuracy".to_string(),
                "precision".to_string(),
                "recall".to_string(),
                "f1".to_string(),
                "roc_auc".to_string(),
            ],
        }
    }
}

impl EngineConfig {
    /// -1 for loss-like scores, +1 otherwise
    pub fn score_sign(&self) -> f64 {
        if self.score_name == "loss" {
            -1.0
        } else {
            1.0
        }
    }

    pub fn log_interval(&self, max_epochs: usize) -> usize {
        self.log_interval
            .unwrap_or(max_epochs / 10)
            .max(1)
    }
}
