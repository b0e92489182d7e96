//! Run configuration
//!
//! A run is described by a single JSON document. Every section has defaults,
//! so a config file only needs the keys it changes:
//!
//! ```json
//! {
//!   "job": { "mode": "train", "max_epochs": 20 },
//!   "datasets": { "name": "pediatrics", "scan_path": "data/chest_xray",
//!                 "encoding": { "NORMAL": 0, "PNEUMONIA": 1 } }
//! }
//! ```
//!
//! Dotted `section.key=value` overrides can be applied on top of a loaded file.

pub mod dataset;
pub mod engine;
pub mod model;

use std::path::{Path, PathBuf};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::utils::error::{CxrError, Result};
use crate::utils::logging::LogConfig;

pub use dataset::{DatasetConfig, PreprocessingConfig, SamplingMethod};
pub use engine::{CheckpointConfig, EarlyStoppingConfig, EngineConfig};
pub use model::{DiffusionConfig, ModelConfig};

/// Top-level run configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub job: JobConfig,
    pub datasets: DatasetConfig,
    pub preprocessing: PreprocessingConfig,
    pub engine: EngineConfig,
    pub model: ModelConfig,
    pub diffusion: DiffusionConfig,
    pub tracking: TrackingConfig,
    pub logging: LogConfig,
}

/// Job-level switches
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobConfig {
    /// `train` or `evaluate`
    pub mode: String,
    pub max_epochs: usize,
    /// Cap on iterations per epoch
    pub epoch_length: Option<usize>,
    #[serde(default = "default_random_state")]
    pub random_state: u64,
    /// Skip the train-split evaluation pass
    pub dry_run: bool,
    /// Apply training augmentations
    pub use_transforms: bool,
    /// Where artifacts (csv, report, samples) are written
    pub output_dir: PathBuf,
}

fn default_random_state() -> u64 {
    rand::thread_rng().gen_range(0..8192)
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            mode: "train".to_string(),
            max_epochs: 10,
            epoch_length: None,
            random_state: default_random_state(),
            dry_run: false,
            use_transforms: true,
            output_dir: PathBuf::from("artifacts"),
        }
    }
}

/// Local experiment tracking
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    pub enabled: bool,
    /// Root directory of the run store
    pub tracking_uri: PathBuf,
    pub experiment_name: String,
    /// Generated from dataset, model and timestamp when unset
    pub run_name: Option<String>,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tracking_uri: PathBuf::from("mlruns"),
            experiment_name: "default".to_string(),
            run_name: None,
        }
    }
}

impl Configuration {
    /// Load configuration from a JSON file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(CxrError::PathNotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| CxrError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Save configuration to a JSON file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply `section.key=value` overrides.
    ///
    /// Values are parsed as JSON first, so `job.max_epochs=5` sets a number
    /// and `datasets.name=nih` falls back to a string.
    pub fn apply_overrides(self, overrides: &[String]) -> Result<Self> {
        if overrides.is_empty() {
            return Ok(self);
        }
        let mut root = serde_json::to_value(&self)?;

        for entry in overrides {
            let (key, raw) = entry
                .split_once('=')
                .ok_or_else(|| CxrError::Config(format!("override '{}' is not key=value", entry)))?;
            let value = serde_json::from_str(raw)
                .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));

            let mut node = &mut root;
            let parts: Vec<&str> = key.split('.').collect();
            for (i, part) in parts.iter().enumerate() {
                let map = node
                    .as_object_mut()
                    .ok_or_else(|| CxrError::Config(format!("'{}' is not a section", key)))?;
                if i + 1 == parts.len() {
                    map.insert(part.to_string(), value.clone());
                    break;
                }
                node = map
                    .entry(part.to_string())
                    .or_insert_with(|| serde_json::Value::Object(Default::default()));
            }
        }

        serde_json::from_value(root).map_err(|e| CxrError::Config(e.to_string()))
    }

    /// Validate cross-section settings before a run starts
    pub fn validate(&self) -> Result<()> {
        if self.datasets.batch_size == 0 {
            return Err(CxrError::Config("datasets.batch_size must be > 0".to_string()));
        }
        if !(0.0..1.0).contains(&self.datasets.val_size) {
            return Err(CxrError::Config(format!(
                "datasets.val_size must be in [0, 1), got {}",
                self.datasets.val_size
            )));
        }
        if !(self.datasets.test_size > 0.0 && self.datasets.test_size < 1.0) {
            return Err(CxrError::Config(format!(
                "datasets.test_size must be in (0, 1), got {}",
                self.datasets.test_size
            )));
        }
        if self.preprocessing.use_metaclass && self.preprocessing.positive_class.is_empty() {
            return Err(CxrError::Config(
                "preprocessing.positive_class is required when use_metaclass is set".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_state_default_range() {
        for _ in 0..32 {
            assert!(JobConfig::default().random_state < 8192);
        }
    }

    #[test]
    fn test_partial_json_takes_defaults() {
        let config: Configuration =
            serde_json::from_str(r#"{"job": {"max_epochs": 3}, "datasets": {"name": "ixi"}}"#).unwrap();
        assert_eq!(config.job.max_epochs, 3);
        assert_eq!(config.job.mode, "train");
        assert_eq!(config.datasets.name, "ixi");
        assert_eq!(config.engine.score_name, "loss");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.json");
        let mut config = Configuration::default();
        config.job.random_state = 7;
        config.save(&path).unwrap();

        let loaded = Configuration::load(&path).unwrap();
        assert_eq!(loaded.job.random_state, 7);
        assert_eq!(loaded.diffusion.num_train_timesteps, 1000);
    }

    #[test]
    fn test_load_missing_file() {
        let err = Configuration::load("/definitely/not/here.json").unwrap_err();
        assert!(matches!(err, CxrError::PathNotFound(_)));
    }

    #[test]
    fn test_apply_overrides() {
        let config = Configuration::default()
            .apply_overrides(&[
                "job.max_epochs=5".to_string(),
                "datasets.name=pediatrics".to_string(),
                "preprocessing.use_sampling=true".to_string(),
            ])
            .unwrap();
        assert_eq!(config.job.max_epochs, 5);
        assert_eq!(config.datasets.name, "pediatrics");
        assert!(config.preprocessing.use_sampling);
    }

    #[test]
    fn test_bad_override() {
        assert!(Configuration::default()
            .apply_overrides(&["job.max_epochs".to_string()])
            .is_err());
        assert!(Configuration::default()
            .apply_overrides(&["job.max_epochs=\"many\"".to_string()])
            .is_err());
    }

    #[test]
    fn test_validate() {
        let mut config = Configuration::default();
        assert!(config.validate().is_ok());
        config.datasets.val_size = 1.5;
        assert!(config.validate().is_err());

        config.datasets.val_size = 0.0;
        assert!(config.validate().is_ok());
        config.datasets.test_size = 0.0;
        assert!(config.validate().is_err());
        config.datasets.test_size = 1.0;
        assert!(config.validate().is_err());
    }
}
