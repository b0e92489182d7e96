//! Model and diffusion sections

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Classifier hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub name: String,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub dropout: f64,
    pub base_filters: usize,
    /// Checkpoint to load in `evaluate` mode
    pub checkpoint: Option<PathBuf>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: "cnn".to_string(),
            learning_rate: 1e-3,
            weight_decay: 1e-4,
            dropout: 0.3,
            base_filters: 32,
            checkpoint: None,
        }
    }
}

/// Denoising diffusion training
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffusionConfig {
    pub num_train_timesteps: usize,
    pub beta_start: f64,
    pub beta_end: f64,
    pub num_inference_steps: usize,
    pub lr_warmup_steps: usize,
    pub learning_rate: f64,
    pub max_grad_norm: f32,
    pub base_channels: usize,
    pub time_embed_dim: usize,
    /// Samples per grid side; the grid holds `grid_size * grid_size` images
    pub grid_size: usize,
    /// Epochs between sample grids; `max(max_epochs / 10, 1)` when unset
    pub log_interval: Option<usize>,
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self {
            num_train_timesteps: 1000,
            beta_start: 1e-4,
            beta_end: 0.02,
            num_inference_steps: 1000,
            lr_warmup_steps: 500,
            learning_rate: 1e-4,
            max_grad_norm: 1.0,
            base_channels: 32,
            time_embed_dim: 128,
            grid_size: 4,
            log_interval: None,
        }
    }
}
