//! Dataset module for chest X-ray and MRI scan collections
//!
//! This module provides:
//! - Metadata tables read from CSV (`metadata`)
//! - Label utilities: metaclass collapsing, subsets, encoders, text prompts (`labels`)
//! - Seeded stratified splitting and class resampling (`split`)
//! - Per-dataset loaders: NIH ChestX-ray14, MIMIC-CXR, pediatric pneumonia, IXI
//! - Burn `Dataset`/`Batcher` integration and image transforms
//! - Dataloader construction and target breakdown tables (`loader`)

pub mod burn_dataset;
pub mod ixi;
pub mod labels;
pub mod loader;
pub mod metadata;
pub mod mimic;
pub mod nih;
pub mod pediatrics;
pub mod split;
pub mod text;
pub mod transforms;

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub use burn_dataset::{ScanBatch, ScanBatcher, ScanDataset, ScanItem};
pub use loader::{instantiate_image_dataset, prepare_validation_dataloaders, SplitLoaders};

/// Column name used for the image path when split metadata is written
pub const IMAGE_KEYNAME: &str = "image";
/// Column name used for the label when split metadata is written
pub const LABEL_KEYNAME: &str = "label";
/// Separator between findings in a multi-label cell
pub const LABEL_SEPARATOR: char = '|';

/// One scan with its findings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Identifier from the metadata table (image index, subject id, ...)
    pub id: String,
    pub image: PathBuf,
    pub labels: Vec<String>,
    /// Remaining metadata columns
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl Record {
    pub fn new(id: impl Into<String>, image: impl Into<PathBuf>, labels: Vec<String>) -> Self {
        Self {
            id: id.into(),
            image: image.into(),
            labels,
            attributes: BTreeMap::new(),
        }
    }

    /// Labels joined with `|`, the class key for single-label training
    pub fn label(&self) -> String {
        self.labels.join(&LABEL_SEPARATOR.to_string())
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.labels.iter().any(|l| l == label)
    }
}

/// Train/val/test records of one dataset plus its class names
#[derive(Debug, Clone, Default)]
pub struct SplitDatasets {
    pub train: Vec<Record>,
    pub val: Vec<Record>,
    pub test: Vec<Record>,
    /// Class names ordered by encoded index
    pub classes: Vec<String>,
}

impl SplitDatasets {
    pub fn len(&self) -> usize {
        self.train.len() + self.val.len() + self.test.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Splits in `(name, records)` order: train, val, test
    pub fn named(&self) -> [(&'static str, &[Record]); 3] {
        [("train", &self.train), ("val", &self.val), ("test", &self.test)]
    }

    /// Log class counts for every non-empty split
    pub fn log_class_counts(&self) {
        for (name, records) in self.named() {
            if records.is_empty() {
                continue;
            }
            let counts = class_counts(records);
            tracing::info!("{} split: {} records {:?}", name, records.len(), counts);
        }
    }
}

/// Count records per joined label
pub fn class_counts(records: &[Record]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for record in records {
        *counts.entry(record.label()).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_label_joins_findings() {
        let record = Record::new(
            "00000001_000.png",
            "/data/00000001_000.png",
            vec!["Cardiomegaly".to_string(), "Effusion".to_string()],
        );
        assert_eq!(record.label(), "Cardiomegaly|Effusion");
        assert!(record.has_label("Effusion"));
        assert!(!record.has_label("Mass"));
    }

    #[test]
    fn test_class_counts() {
        let records = vec![
            Record::new("a", "a.png", vec!["NORMAL".to_string()]),
            Record::new("b", "b.png", vec!["PNEUMONIA".to_string()]),
            Record::new("c", "c.png", vec!["PNEUMONIA".to_string()]),
        ];
        let counts = class_counts(&records);
        assert_eq!(counts["NORMAL"], 1);
        assert_eq!(counts["PNEUMONIA"], 2);
    }
}
