//! Pediatric pneumonia loader
//!
//! Directory layout: `{train,val,test}/{CLASS}/*.jpeg`, where the class
//! directories are usually `NORMAL` and `PNEUMONIA`. Images under `train/`
//! and `val/` are pooled and re-split with a stratified validation fraction;
//! `test/` is kept as-is.
//!
//! Generated positives can be mixed into training by pointing
//! `preprocessing.sampling_method.generated_dir` at a flat image directory.

use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use super::split::{random_undersample, resample_to_value, sample_generated, split_validation};
use super::{Record, SplitDatasets};
use crate::config::{DatasetConfig, PreprocessingConfig};
use crate::utils::error::{CxrError, Result};
use crate::utils::is_image_file;

/// Collect `root/{CLASS}/*` images as records labelled with the class directory name
pub fn scan_class_dirs(root: &Path) -> Result<Vec<Record>> {
    if !root.exists() {
        return Err(CxrError::PathNotFound(root.to_path_buf()));
    }

    let mut class_dirs: Vec<PathBuf> = WalkDir::new(root)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_dir())
        .map(|e| e.path().to_path_buf())
        .collect();
    class_dirs.sort();

    let mut records = Vec::new();
    for class_dir in class_dirs {
        let class_name = class_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let mut files = list_images(&class_dir);
        files.sort();
        tracing::debug!("Class '{}': {} images", class_name, files.len());
        for path in files {
            let id = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            records.push(Record::new(id, path, vec![class_name.clone()]));
        }
    }
    Ok(records)
}

/// Image files directly inside `dir`
pub fn list_images(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.path().to_path_buf())
        .filter(|p| is_image_file(p))
        .collect()
}

/// Class directory name matching `positive_class`, ignoring case
fn resolve_positive(records: &[Record], positive_class: &str) -> String {
    records
        .iter()
        .map(|r| r.label())
        .find(|l| l.eq_ignore_ascii_case(positive_class))
        .unwrap_or_else(|| positive_class.to_string())
}

pub fn load_pediatrics_dataset(
    dataset: &DatasetConfig,
    preprocessing: &PreprocessingConfig,
    random_state: u64,
) -> Result<SplitDatasets> {
    let root = &dataset.scan_path;

    let mut pool = scan_class_dirs(&root.join("train"))?;
    let val_dir = root.join("val");
    if val_dir.exists() {
        pool.extend(scan_class_dirs(&val_dir)?);
    }
    let test = scan_class_dirs(&root.join("test"))?;

    tracing::info!("Creating 'validation' split...");
    let (mut train, val) = split_validation(pool, dataset.val_size, random_state)?;

    let method = &preprocessing.sampling_method;
    if let Some(gen_dir) = &method.generated_dir {
        tracing::info!("Loading additional generated images...");
        let positive = resolve_positive(&train, &preprocessing.positive_class);
        let mut generated = list_images(gen_dir);
        generated.sort();
        let num_positive = train.iter().filter(|r| r.label() == positive).count();
        train.extend(sample_generated(num_positive, &generated, &positive, random_state));
    }

    if preprocessing.use_sampling {
        train = if method.generated_dir.is_some() {
            random_undersample(train, random_state)
        } else {
            resample_to_value(train, method.sample_to_value, random_state)
        };
    }

    let splits = SplitDatasets {
        train,
        val,
        test,
        classes: Vec::new(),
    };
    splits.log_class_counts();
    Ok(splits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::class_counts;

    fn touch(path: PathBuf) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"").unwrap();
    }

    fn fixture(root: &Path) {
        for i in 0..20 {
            touch(root.join("train/NORMAL").join(format!("IM-{:04}.jpeg", i)));
        }
        for i in 0..40 {
            touch(root.join("train/PNEUMONIA").join(format!("person{}_virus.jpeg", i)));
        }
        touch(root.join("val/NORMAL/NORMAL2-IM-1427.jpeg"));
        touch(root.join("val/PNEUMONIA/person1946_bacteria.jpeg"));
        touch(root.join("train/NORMAL/.DS_Store"));
        for i in 0..6 {
            touch(root.join("test/NORMAL").join(format!("t{}.jpeg", i)));
            touch(root.join("test/PNEUMONIA").join(format!("t{}.jpeg", i)));
        }
    }

    fn config(root: &Path) -> DatasetConfig {
        DatasetConfig {
            name: "pediatrics".to_string(),
            scan_path: root.to_path_buf(),
            val_size: 0.1,
            extension: ".jpeg".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_scan_class_dirs_skips_non_images() {
        let dir = tempfile::tempdir().unwrap();
        fixture(dir.path());
        let records = scan_class_dirs(&dir.path().join("train")).unwrap();
        assert_eq!(records.len(), 60);
        assert_eq!(class_counts(&records)["NORMAL"], 20);
    }

    #[test]
    fn test_load_pools_train_and_val() {
        let dir = tempfile::tempdir().unwrap();
        fixture(dir.path());
        let splits = load_pediatrics_dataset(&config(dir.path()), &PreprocessingConfig::default(), 1).unwrap();
        assert_eq!(splits.train.len() + splits.val.len(), 62);
        assert_eq!(splits.test.len(), 12);
        // ceil(21 * 0.1) + ceil(41 * 0.1)
        assert_eq!(splits.val.len(), 3 + 5);
    }

    #[test]
    fn test_zero_val_size() {
        let dir = tempfile::tempdir().unwrap();
        fixture(dir.path());
        let mut config = config(dir.path());
        config.val_size = 0.0;
        let splits = load_pediatrics_dataset(&config, &PreprocessingConfig::default(), 1).unwrap();
        assert_eq!(splits.train.len(), 62);
        assert!(splits.val.is_empty());
    }

    #[test]
    fn test_resample_without_generated_dir() {
        let dir = tempfile::tempdir().unwrap();
        fixture(dir.path());
        let mut preprocessing = PreprocessingConfig {
            use_sampling: true,
            ..Default::default()
        };
        preprocessing.sampling_method.sample_to_value = 50;
        let splits = load_pediatrics_dataset(&config(dir.path()), &preprocessing, 1).unwrap();
        let counts = class_counts(&splits.train);
        assert_eq!(counts["NORMAL"], 50);
        assert_eq!(counts["PNEUMONIA"], 50);
    }

    #[test]
    fn test_generated_images_then_undersample() {
        let dir = tempfile::tempdir().unwrap();
        fixture(dir.path());
        let gen_dir = dir.path().join("generated");
        for i in 0..45 {
            touch(gen_dir.join(format!("{:04}.png", i)));
        }
        let mut preprocessing = PreprocessingConfig {
            use_sampling: false,
            ..Default::default()
        };
        preprocessing.sampling_method.generated_dir = Some(gen_dir.clone());

        let splits = load_pediatrics_dataset(&config(dir.path()), &preprocessing, 1).unwrap();
        let counts = class_counts(&splits.train);
        // 36 real positives, |36 - 45| = 9 generated
        assert_eq!(counts["PNEUMONIA"], 36 + 9);
        assert!(splits.train.iter().any(|r| r.image.starts_with(&gen_dir)));

        preprocessing.use_sampling = true;
        let splits = load_pediatrics_dataset(&config(dir.path()), &preprocessing, 1).unwrap();
        let counts = class_counts(&splits.train);
        assert_eq!(counts["PNEUMONIA"], counts["NORMAL"]);
    }

    #[test]
    fn test_missing_root() {
        let config = config(Path::new("/no/such/pediatrics"));
        assert!(load_pediatrics_dataset(&config, &PreprocessingConfig::default(), 0).is_err());
    }
}
