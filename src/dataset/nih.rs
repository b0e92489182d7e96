//! NIH ChestX-ray14 loader
//!
//! Reads `Data_Entry_2017.csv`, applies the official `train_val_list.txt` /
//! `test_list.txt` partition and carves a stratified validation split out of
//! the train/val images.

use std::collections::HashSet;
use std::path::PathBuf;

use super::labels::{create_subset, nih_get_target_counts, transform_labels_to_metaclass};
use super::metadata::{read_name_list, MetadataFrame};
use super::split::{resample_to_value, split_validation};
use super::{Record, SplitDatasets, LABEL_SEPARATOR};
use crate::config::{DatasetConfig, PreprocessingConfig};
use crate::utils::error::{CxrError, Result};

/// Column holding the image file name
pub const IMAGE_INDEX_COLUMN: &str = "Image Index";
pub const TRAIN_VAL_LIST: &str = "train_val_list.txt";
pub const TEST_LIST: &str = "test_list.txt";

/// Turn the metadata table into records rooted at `scan_path`
pub fn nih_records(frame: &MetadataFrame, target: &str, scan_path: &std::path::Path) -> Result<Vec<Record>> {
    let image_col = frame.column_index(IMAGE_INDEX_COLUMN)?;
    let target_col = frame.column_index(target)?;

    Ok(frame
        .rows
        .iter()
        .map(|row| {
            let id = row[image_col].clone();
            let labels = row[target_col]
                .split(LABEL_SEPARATOR)
                .filter(|l| !l.is_empty())
                .map(str::to_string)
                .collect();
            let mut record = Record::new(id.clone(), scan_path.join(&id), labels);
            for (i, column) in frame.columns.iter().enumerate() {
                if i != image_col && i != target_col {
                    record.attributes.insert(column.clone(), row[i].clone());
                }
            }
            record
        })
        .collect())
}

fn log_counts(split: &str, records: &[Record]) {
    let labels: Vec<String> = records.iter().map(Record::label).collect();
    let counts = nih_get_target_counts(labels.iter().map(String::as_str));
    tracing::info!("{} class counts: {:?}", split, counts);
}

/// Load the NIH splits.
///
/// With `subset_to_positive_class` only images carrying the positive finding
/// are kept (diffusion training) and resampling is skipped.
pub fn load_nih_dataset(
    dataset: &DatasetConfig,
    preprocessing: &PreprocessingConfig,
    random_state: u64,
    subset_to_positive_class: bool,
) -> Result<SplitDatasets> {
    let index_path = dataset
        .index_path
        .clone()
        .ok_or_else(|| CxrError::Config("datasets.index_path is required for nih".to_string()))?;
    let scan_data: PathBuf = dataset.scan_data.clone().unwrap_or_else(|| dataset.scan_path.clone());

    let frame = MetadataFrame::read_csv(&index_path)?;
    let mut records = nih_records(&frame, &dataset.target, &dataset.scan_path)?;
    tracing::info!("Loaded {} NIH metadata rows", records.len());

    if subset_to_positive_class {
        tracing::info!("Removing all negative classes...");
        records.retain(|r| r.has_label(&preprocessing.positive_class));
    }
    if preprocessing.use_subset {
        records = create_subset(records, &preprocessing.subset);
    }
    if preprocessing.use_metaclass {
        records = transform_labels_to_metaclass(
            records,
            &preprocessing.positive_class,
            preprocessing.negative_class.as_deref(),
            true,
        );
    }

    let train_val_ids: HashSet<String> = read_name_list(scan_data.join(TRAIN_VAL_LIST))?.into_iter().collect();
    let test_ids: HashSet<String> = read_name_list(scan_data.join(TEST_LIST))?.into_iter().collect();

    let mut train_val = Vec::new();
    let mut test = Vec::new();
    for record in records {
        if train_val_ids.contains(&record.id) {
            train_val.push(record);
        } else if test_ids.contains(&record.id) {
            test.push(record);
        }
    }

    let (mut train, val) = split_validation(train_val, dataset.val_size, random_state)?;
    if preprocessing.use_sampling && !subset_to_positive_class {
        train = resample_to_value(train, preprocessing.sampling_method.sample_to_value, random_state);
    }

    log_counts("Train", &train);
    log_counts("Validation", &val);
    log_counts("Test", &test);

    let splits = SplitDatasets {
        train,
        val,
        test,
        classes: Vec::new(),
    };

    if dataset.save_metadata {
        save_split_metadata(&splits, &dataset.patient_data_path, "nih")?;
    }
    Ok(splits)
}

/// Write `{prefix}_{split}_metadata.csv` under `root/patients/`
pub fn save_split_metadata(splits: &SplitDatasets, root: &std::path::Path, prefix: &str) -> Result<()> {
    let dir = root.join("patients");
    for (name, records) in splits.named() {
        let path = dir.join(format!("{}_{}_metadata.csv", prefix, name));
        MetadataFrame::from_records(records).write_csv(&path)?;
        tracing::info!("Saved {} metadata to {}", name, path.display());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::class_counts;
    use std::fmt::Write as _;

    fn fixture(dir: &std::path::Path) -> DatasetConfig {
        let mut csv = String::from("Image Index,Finding Labels,Patient ID\n");
        let mut train_val = String::new();
        let mut test = String::new();
        for i in 0..60 {
            let label = match i % 3 {
                0 => "No Finding",
                1 => "Pneumonia",
                _ => "Effusion|Pneumonia",
            };
            let name = format!("{:08}_000.png", i);
            writeln!(csv, "{},{},{}", name, label, i).unwrap();
            if i < 48 {
                writeln!(train_val, "{}", name).unwrap();
            } else {
                writeln!(test, "{}", name).unwrap();
            }
        }
        std::fs::write(dir.join("Data_Entry_2017.csv"), csv).unwrap();
        std::fs::write(dir.join(TRAIN_VAL_LIST), train_val).unwrap();
        std::fs::write(dir.join(TEST_LIST), test).unwrap();

        DatasetConfig {
            name: "nih".to_string(),
            scan_path: dir.join("images"),
            index_path: Some(dir.join("Data_Entry_2017.csv")),
            scan_data: Some(dir.to_path_buf()),
            val_size: 0.25,
            patient_data_path: dir.to_path_buf(),
            ..Default::default()
        }
    }

    #[test]
    fn test_official_lists_partition_records() {
        let dir = tempfile::tempdir().unwrap();
        let config = fixture(dir.path());
        let splits = load_nih_dataset(&config, &PreprocessingConfig::default(), 0, false).unwrap();

        assert_eq!(splits.test.len(), 12);
        assert_eq!(splits.train.len() + splits.val.len(), 48);
        assert_eq!(splits.val.len(), 12);
        assert!(splits.train[0].image.starts_with(dir.path().join("images")));
        assert!(splits.train[0].attributes.contains_key("Patient ID"));
    }

    #[test]
    fn test_zero_val_size() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = fixture(dir.path());
        config.val_size = 0.0;
        let splits = load_nih_dataset(&config, &PreprocessingConfig::default(), 0, false).unwrap();
        assert_eq!(splits.train.len(), 48);
        assert!(splits.val.is_empty());
    }

    #[test]
    fn test_metaclass_and_sampling() {
        let dir = tempfile::tempdir().unwrap();
        let config = fixture(dir.path());
        let mut preprocessing = PreprocessingConfig {
            use_metaclass: true,
            use_sampling: true,
            ..Default::default()
        };
        preprocessing.sampling_method.sample_to_value = 40;

        let splits = load_nih_dataset(&config, &preprocessing, 0, false).unwrap();
        let counts = class_counts(&splits.train);
        assert_eq!(counts["Pneumonia"], 40);
        assert_eq!(counts["Non-Pneumonia"], 40);
    }

    #[test]
    fn test_subset_to_positive_class_skips_sampling() {
        let dir = tempfile::tempdir().unwrap();
        let config = fixture(dir.path());
        let mut preprocessing = PreprocessingConfig {
            use_sampling: true,
            ..Default::default()
        };
        preprocessing.sampling_method.sample_to_value = 500;

        let splits = load_nih_dataset(&config, &preprocessing, 0, true).unwrap();
        assert!(splits.train.len() < 48);
        assert!(splits.test.iter().all(|r| r.has_label("Pneumonia")));
    }

    #[test]
    fn test_save_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = fixture(dir.path());
        config.save_metadata = true;
        load_nih_dataset(&config, &PreprocessingConfig::default(), 0, false).unwrap();
        for split in ["train", "val", "test"] {
            assert!(dir.path().join("patients").join(format!("nih_{}_metadata.csv", split)).exists());
        }
    }

    #[test]
    fn test_missing_index_path() {
        let config = DatasetConfig::default();
        assert!(load_nih_dataset(&config, &PreprocessingConfig::default(), 0, false).is_err());
    }
}
