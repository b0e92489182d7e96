//! IXI brain MRI loader
//!
//! Volumes are `IXI{id}-{site}-{n}-{modality}.nii.gz` files in `scan_path`;
//! `*_mask.nii.gz` files are skipped. Labels come from a demographics CSV
//! keyed by `IXI_ID`. Splits are stratified: test first, then validation
//! out of the remaining training volumes.

use std::collections::HashMap;
use std::path::Path;

use nifti::{IntoNdArray, NiftiObject, ReaderOptions};
use walkdir::WalkDir;

use super::labels::LabelEncoder;
use super::metadata::MetadataFrame;
use super::split::{split_records, split_validation};
use super::{Record, SplitDatasets};
use crate::config::DatasetConfig;
use crate::utils::error::{CxrError, Result};
use crate::utils::is_nifti;

pub const ID_COLUMN: &str = "IXI_ID";
const MASK_SUFFIX: &str = "_mask.nii.gz";

/// Numeric subject id from a file name such as `IXI002-Guys-0828-T1.nii.gz`
pub fn subject_id(path: &Path) -> Option<u32> {
    let name = path.file_name()?.to_str()?;
    let digits: String = name
        .strip_prefix("IXI")?
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Volumes under `dir`, without segmentation masks
pub fn filter_scan_paths(dir: &Path) -> Vec<std::path::PathBuf> {
    let mut paths: Vec<_> = WalkDir::new(dir)
        .min_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.path().to_path_buf())
        .filter(|p| is_nifti(p) && !p.to_string_lossy().ends_with(MASK_SUFFIX))
        .collect();
    paths.sort();
    paths
}

pub fn load_ixi_dataset(dataset: &DatasetConfig, random_state: u64) -> Result<SplitDatasets> {
    let index_path = dataset
        .index_path
        .clone()
        .ok_or_else(|| CxrError::Config("datasets.index_path is required for ixi".to_string()))?;
    let frame = MetadataFrame::read_csv(&index_path)?;
    let id_col = frame.column_index(ID_COLUMN)?;
    let target_col = frame.column_index(&dataset.target)?;

    let targets: HashMap<u32, String> = frame
        .rows
        .iter()
        .filter_map(|row| {
            let id = row[id_col].trim().parse::<u32>().ok()?;
            let target = row[target_col].trim();
            (!target.is_empty()).then(|| (id, target.to_string()))
        })
        .collect();

    let mut records = Vec::new();
    for path in filter_scan_paths(&dataset.scan_path) {
        let Some(id) = subject_id(&path) else {
            tracing::warn!("Cannot parse subject id from {}", path.display());
            continue;
        };
        match targets.get(&id) {
            Some(target) => records.push(Record::new(format!("IXI{:03}", id), path, vec![target.clone()])),
            None => tracing::debug!("No '{}' value for subject {}", dataset.target, id),
        }
    }
    if records.is_empty() {
        return Err(CxrError::Dataset(format!(
            "no labelled volumes found in {}",
            dataset.scan_path.display()
        )));
    }

    let encoder = LabelEncoder::fit(records.iter().flat_map(|r| r.labels.iter().map(String::as_str)));
    tracing::info!("Label encoder information for target '{}': {:?}", dataset.target, encoder.classes);

    tracing::info!("Creating train/val/test splits...");
    let (train, test) = split_records(records, dataset.test_size, random_state)?;
    let (train, val) = split_validation(train, dataset.val_size, random_state)?;

    let splits = SplitDatasets {
        train,
        val,
        test,
        classes: encoder.classes,
    };
    splits.log_class_counts();
    Ok(splits)
}

/// Middle axial slice of a volume as `(width, height, pixels)`, row-major
pub fn load_middle_slice(path: &Path) -> Result<(usize, usize, Vec<f32>)> {
    let obj = ReaderOptions::new()
        .read_file(path)
        .map_err(|e| CxrError::ImageLoad(path.to_path_buf(), e.to_string()))?;
    let volume = obj
        .into_volume()
        .into_ndarray::<f32>()
        .map_err(|e| CxrError::ImageLoad(path.to_path_buf(), e.to_string()))?;

    let shape = volume.shape().to_vec();
    if shape.len() < 3 {
        return Err(CxrError::ImageLoad(
            path.to_path_buf(),
            format!("expected a 3D volume, got shape {:?}", shape),
        ));
    }
    let (width, height, depth) = (shape[0], shape[1], shape[2]);
    let z = depth / 2;

    // Volumes come back column-major: x varies fastest, then y, then z
    let raw = volume.into_raw_vec();
    let plane = width * height;
    let start = z * plane;
    let pixels = raw
        .get(start..start + plane)
        .ok_or_else(|| CxrError::ImageLoad(path.to_path_buf(), "truncated volume".to_string()))?
        .to_vec();
    Ok((width, height, pixels))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subject_id() {
        assert_eq!(subject_id(Path::new("/ixi/IXI002-Guys-0828-T1.nii.gz")), Some(2));
        assert_eq!(subject_id(Path::new("IXI651-HH-2789-T2.nii.gz")), Some(651));
        assert_eq!(subject_id(Path::new("brain.nii.gz")), None);
    }

    #[test]
    fn test_filter_scan_paths_excludes_masks() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["IXI002-Guys-0828-T1.nii.gz", "IXI002-Guys-0828-T1_mask.nii.gz", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let paths = filter_scan_paths(dir.path());
        assert_eq!(paths.len(), 1);
        assert!(paths[0].ends_with("IXI002-Guys-0828-T1.nii.gz"));
    }

    #[test]
    fn test_load_ixi_splits() {
        let dir = tempfile::tempdir().unwrap();
        let mut csv = String::from("IXI_ID,SEX_ID\n");
        for id in 1..=40u32 {
            let sex = if id % 2 == 0 { "1" } else { "2" };
            csv.push_str(&format!("{},{}\n", id, sex));
            std::fs::write(dir.path().join(format!("IXI{:03}-Guys-0001-T1.nii.gz", id)), b"").unwrap();
        }
        // subject without demographics
        std::fs::write(dir.path().join("IXI099-HH-0001-T1.nii.gz"), b"").unwrap();
        let index = dir.path().join("IXI.csv");
        std::fs::write(&index, csv).unwrap();

        let config = DatasetConfig {
            name: "ixi".to_string(),
            scan_path: dir.path().to_path_buf(),
            index_path: Some(index),
            target: "SEX_ID".to_string(),
            extension: ".nii.gz".to_string(),
            test_size: 0.2,
            val_size: 0.25,
            ..Default::default()
        };
        let splits = load_ixi_dataset(&config, 3).unwrap();
        assert_eq!(splits.classes, vec!["1", "2"]);
        assert_eq!(splits.len(), 40);
        assert_eq!(splits.test.len(), 8);
        assert_eq!(splits.val.len(), 8);
    }

    #[test]
    fn test_unreadable_volume() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("IXI001-Guys-0001-T1.nii.gz");
        std::fs::write(&path, b"not a nifti file").unwrap();
        assert!(matches!(load_middle_slice(&path), Err(CxrError::ImageLoad(_, _))));
    }
}
