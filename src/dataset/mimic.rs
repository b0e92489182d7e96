//! MIMIC-CXR loader
//!
//! The index is a CSV with a relative image `path`, a `split` column
//! (`train`/`validate`/`test`) and one CheXpert column per finding holding
//! `1.0`, `0.0`, `-1.0` or nothing. A finding is present only when its cell
//! is exactly positive; a scan without findings is labelled `No Finding`.

use super::labels::{create_subset, transform_labels_to_metaclass};
use super::metadata::{MetadataFrame, MIMIC_CLASS_NAMES};
use super::split::resample_to_value;
use super::{Record, SplitDatasets};
use crate::config::{DatasetConfig, PreprocessingConfig};
use crate::utils::error::{CxrError, Result};

pub const PATH_COLUMN: &str = "path";
pub const SPLIT_COLUMN: &str = "split";

fn is_positive(cell: &str) -> bool {
    cell.trim().parse::<f64>().map(|v| v == 1.0).unwrap_or(false)
}

/// Records with the split each row belongs to
pub fn mimic_records(frame: &MetadataFrame, scan_path: &std::path::Path) -> Result<Vec<(String, Record)>> {
    let path_col = frame.column_index(PATH_COLUMN)?;
    let split_col = frame.column_index(SPLIT_COLUMN)?;
    let label_cols: Vec<(usize, &str)> = MIMIC_CLASS_NAMES
        .iter()
        .filter_map(|name| frame.column_index(name).ok().map(|idx| (idx, *name)))
        .collect();

    if label_cols.is_empty() {
        return Err(CxrError::Metadata(
            "MIMIC index has none of the CheXpert label columns".to_string(),
        ));
    }

    Ok(frame
        .rows
        .iter()
        .map(|row| {
            let mut labels: Vec<String> = label_cols
                .iter()
                .filter(|(idx, _)| is_positive(&row[*idx]))
                .map(|(_, name)| name.to_string())
                .collect();
            if labels.is_empty() {
                labels.push("No Finding".to_string());
            }
            let rel = &row[path_col];
            let record = Record::new(rel.clone(), scan_path.join(rel), labels);
            (row[split_col].trim().to_lowercase(), record)
        })
        .collect())
}

pub fn load_mimic_dataset(
    dataset: &DatasetConfig,
    preprocessing: &PreprocessingConfig,
    random_state: u64,
) -> Result<SplitDatasets> {
    let index_path = dataset
        .index_path
        .clone()
        .ok_or_else(|| CxrError::Config("datasets.index_path is required for mimic-cxr".to_string()))?;
    let frame = MetadataFrame::read_csv(&index_path)?;

    let mut splits = SplitDatasets::default();
    for (split, record) in mimic_records(&frame, &dataset.scan_path)? {
        match split.as_str() {
            "train" => splits.train.push(record),
            "validate" | "val" => splits.val.push(record),
            "test" => splits.test.push(record),
            other => tracing::warn!("Skipping row with unknown split '{}'", other),
        }
    }

    for records in [&mut splits.train, &mut splits.val, &mut splits.test] {
        let mut taken: Vec<Record> = std::mem::take(records);
        if preprocessing.use_subset {
            taken = create_subset(taken, &preprocessing.subset);
        }
        if preprocessing.use_metaclass {
            taken = transform_labels_to_metaclass(
                taken,
                &preprocessing.positive_class,
                preprocessing.negative_class.as_deref(),
                true,
            );
        }
        *records = taken;
    }

    if preprocessing.use_sampling {
        splits.train = resample_to_value(
            std::mem::take(&mut splits.train),
            preprocessing.sampling_method.sample_to_value,
            random_state,
        );
    }

    splits.log_class_counts();
    Ok(splits)
}
