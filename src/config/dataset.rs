//! Dataset and preprocessing sections

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::dataset::transforms::TransformConfig;

/// Where and how a dataset is read
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatasetConfig {
    /// `nih`/`cxr14`, `mimic-cxr`, `pediatrics` or `ixi`
    pub name: String,
    /// Directory containing the scans
    pub scan_path: PathBuf,
    /// Metadata table (NIH `Data_Entry_2017.csv`, MIMIC split csv, IXI demographics)
    pub index_path: Option<PathBuf>,
    /// Directory holding the official NIH `train_val_list.txt` / `test_list.txt`
    pub scan_data: Option<PathBuf>,
    /// Metadata column holding the label
    pub target: String,
    pub extension: String,
    /// Class name to index; empty means "fit a label encoder on the data"
    pub encoding: BTreeMap<String, usize>,
    pub val_size: f64,
    pub test_size: f64,
    /// Write split metadata to `patient_data_path/patients/`
    pub save_metadata: bool,
    pub patient_data_path: PathBuf,
    pub batch_size: usize,
    pub num_workers: usize,
    /// Extra datasets merged into the splits of this one
    pub additional_datasets: Vec<DatasetConfig>,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            name: "nih".to_string(),
            scan_path: PathBuf::from("data/nih/images"),
            index_path: None,
            scan_data: None,
            target: "Finding Labels".to_string(),
            extension: ".png".to_string(),
            encoding: BTreeMap::new(),
            val_size: 0.05,
            test_size: 0.2,
            save_metadata: false,
            patient_data_path: PathBuf::from("data"),
            batch_size: 32,
            num_workers: 4,
            additional_datasets: Vec::new(),
        }
    }
}

/// How the training split is rebalanced when `use_sampling` is set
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingMethod {
    /// Per-class target count for resampling with replacement
    pub sample_to_value: usize,
    /// Directory of generated positive-class images to mix into training
    pub generated_dir: Option<PathBuf>,
}

impl Default for SamplingMethod {
    fn default() -> Self {
        Self {
            sample_to_value: 3500,
            generated_dir: None,
        }
    }
}

/// Label and split preprocessing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessingConfig {
    pub use_subset: bool,
    /// Labels kept when `use_subset` is set
    pub subset: Vec<String>,
    pub use_sampling: bool,
    pub sampling_method: SamplingMethod,
    pub positive_class: String,
    /// Defaults to `Non-{positive_class}`
    pub negative_class: Option<String>,
    /// Collapse labels to positive/negative
    pub use_metaclass: bool,
    pub transforms: TransformConfig,
}

impl Default for PreprocessingConfig {
    fn default() -> Self {
        Self {
            use_subset: false,
            subset: Vec::new(),
            use_sampling: false,
            sampling_method: SamplingMethod::default(),
            positive_class: "Pneumonia".to_string(),
            negative_class: None,
            use_metaclass: false,
            transforms: TransformConfig::default(),
        }
    }
}

impl PreprocessingConfig {
    pub fn negative_class(&self) -> String {
        self.negative_class
            .clone()
            .unwrap_or_else(|| format!("Non-{}", self.positive_class))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negative_class_default() {
        let config = PreprocessingConfig::default();
        assert_eq!(config.negative_class(), "Non-Pneumonia");

        let config = PreprocessingConfig {
            negative_class: Some("Healthy".to_string()),
            ..Default::default()
        };
        assert_eq!(config.negative_class(), "Healthy");
    }

    #[test]
    fn test_nested_additional_datasets() {
        let config: DatasetConfig = serde_json::from_str(
            r#"{"name": "pediatrics", "additional_datasets": [{"name": "nih", "val_size": 0.1}]}"#,
        )
        .unwrap();
        assert_eq!(config.additional_datasets.len(), 1);
        assert_eq!(config.additional_datasets[0].val_size, 0.1);
        assert_eq!(config.additional_datasets[0].batch_size, 32);
    }
}
