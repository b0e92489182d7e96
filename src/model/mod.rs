//! Model architectures built with Burn
//!
//! - `CxrClassifier`: CNN used by the supervised trainer
//! - `DiffusionUNet`: noise-prediction network used by diffusion training

pub mod cnn;
pub mod unet;

pub use cnn::{CxrClassifier, CxrClassifierConfig};
pub use unet::{timestep_embedding, DiffusionUNet, DiffusionUNetConfig};

use crate::config::{DiffusionConfig, ModelConfig};

/// Classifier config from the `model` section
pub fn classifier_config(model: &ModelConfig, num_classes: usize, in_channels: usize) -> CxrClassifierConfig {
    CxrClassifierConfig::new(num_classes)
        .with_in_channels(in_channels)
        .with_base_filters(model.base_filters)
        .with_dropout(model.dropout)
}

/// UNet config from the `diffusion` section
pub fn unet_config(diffusion: &DiffusionConfig, in_channels: usize) -> DiffusionUNetConfig {
    DiffusionUNetConfig::new()
        .with_in_channels(in_channels)
        .with_base_channels(diffusion.base_channels)
        .with_time_embed_dim(diffusion.time_embed_dim)
}
