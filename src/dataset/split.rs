//! Split and resampling strategies
//!
//! All randomness flows through a `ChaCha8Rng` seeded from the run's
//! `random_state`, so the same seed always yields the same splits.
//!
//! - `train_test_split`: shuffled split, stratified per class when keys are given
//! - `resample_to_value`: every class drawn to a fixed size with replacement
//! - `random_undersample`: every class cut to the minority class size
//! - `sample_generated`: generated positives mixed into a training split

use std::collections::BTreeMap;
use std::path::PathBuf;

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::Record;
use crate::utils::error::{CxrError, Result};

/// Split `items` into `(train, test)`.
///
/// With `stratify`, each class contributes `ceil(n * test_size)` items to the
/// test side, capped so a class with more than one member keeps at least one
/// training item. Both sides are shuffled.
pub fn train_test_split<T: Clone>(
    items: Vec<T>,
    test_size: f64,
    stratify: Option<&[String]>,
    seed: u64,
) -> Result<(Vec<T>, Vec<T>)> {
    if !(test_size > 0.0 && test_size < 1.0) {
        return Err(CxrError::InvalidInput(format!(
            "test_size should be in (0, 1), got {}",
            test_size
        )));
    }
    if items.is_empty() {
        return Err(CxrError::Dataset("No items provided for splitting".to_string()));
    }

    let mut rng = ChaCha8Rng::seed_from_u64(seed);

    let (mut train, mut test) = match stratify {
        None => {
            let mut shuffled = items;
            shuffled.shuffle(&mut rng);
            let n_test = (shuffled.len() as f64 * test_size).ceil() as usize;
            let n_test = n_test.min(shuffled.len() - 1);
            let train = shuffled.split_off(n_test);
            (train, shuffled)
        }
        Some(keys) => {
            if keys.len() != items.len() {
                return Err(CxrError::InvalidInput(format!(
                    "stratify has {} keys for {} items",
                    keys.len(),
                    items.len()
                )));
            }

            let mut by_class: BTreeMap<&str, Vec<T>> = BTreeMap::new();
            for (item, key) in items.into_iter().zip(keys) {
                by_class.entry(key.as_str()).or_default().push(item);
            }

            let mut train = Vec::new();
            let mut test = Vec::new();
            for (_, mut class_items) in by_class {
                class_items.shuffle(&mut rng);
                let n = class_items.len();
                let n_test = ((n as f64 * test_size).ceil() as usize).min(n.saturating_sub(1));
                let rest = class_items.split_off(n_test);
                test.extend(class_items);
                train.extend(rest);
            }
            (train, test)
        }
    };

    train.shuffle(&mut rng);
    test.shuffle(&mut rng);
    Ok((train, test))
}

/// Stratified split of records on their joined label
pub fn split_records(records: Vec<Record>, test_size: f64, seed: u64) -> Result<(Vec<Record>, Vec<Record>)> {
    let keys: Vec<String> = records.iter().map(Record::label).collect();
    train_test_split(records, test_size, Some(&keys), seed)
}

/// Carve a validation split off `records`; a `val_size` of 0 leaves it empty
pub fn split_validation(records: Vec<Record>, val_size: f64, seed: u64) -> Result<(Vec<Record>, Vec<Record>)> {
    if val_size > 0.0 {
        split_records(records, val_size, seed)
    } else {
        Ok((records, Vec::new()))
    }
}

fn group_by_label(records: Vec<Record>) -> BTreeMap<String, Vec<Record>> {
    let mut groups: BTreeMap<String, Vec<Record>> = BTreeMap::new();
    for record in records {
        groups.entry(record.label()).or_default().push(record);
    }
    groups
}

/// Draw exactly `value` records per class with replacement
pub fn resample_to_value(records: Vec<Record>, value: usize, seed: u64) -> Vec<Record> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut resampled = Vec::new();
    for (label, group) in group_by_label(records) {
        tracing::debug!("Resampling '{}' from {} to {}", label, group.len(), value);
        for _ in 0..value {
            let idx = rng.gen_range(0..group.len());
            resampled.push(group[idx].clone());
        }
    }
    resampled
}

/// Cut every class down to the size of the smallest class
pub fn random_undersample(records: Vec<Record>, seed: u64) -> Vec<Record> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let groups = group_by_label(records);
    let minority = groups.values().map(Vec::len).min().unwrap_or(0);

    let mut sampled = Vec::new();
    for (_, group) in groups {
        sampled.extend(group.choose_multiple(&mut rng, minority).cloned());
    }
    sampled
}

/// Sample `|num_positive - generated.len()|` generated images as positives.
///
/// The draw is without replacement and capped at the number of generated
/// images available.
pub fn sample_generated(
    num_positive: usize,
    generated: &[PathBuf],
    positive_class: &str,
    seed: u64,
) -> Vec<Record> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let offset = num_positive.abs_diff(generated.len()).min(generated.len());

    let sampled: Vec<Record> = generated
        .choose_multiple(&mut rng, offset)
        .map(|path| {
            let id = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            Record::new(id, path.clone(), vec![positive_class.to_string()])
        })
        .collect();
    tracing::info!("Number of sampled generated images: {}", sampled.len());
    sampled
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::class_counts;

    fn records(counts: &[(&str, usize)]) -> Vec<Record> {
        let mut out = Vec::new();
        for (label, n) in counts {
            for i in 0..*n {
                out.push(Record::new(
                    format!("{}_{}", label, i),
                    format!("{}_{}.png", label, i),
                    vec![label.to_string()],
                ));
            }
        }
        out
    }

    #[test]
    fn test_stratified_split_keeps_class_ratio() {
        let data = records(&[("NORMAL", 80), ("PNEUMONIA", 20)]);
        let (train, test) = split_records(data, 0.25, 42).unwrap();

        let test_counts = class_counts(&test);
        assert_eq!(test_counts["NORMAL"], 20);
        assert_eq!(test_counts["PNEUMONIA"], 5);
        assert_eq!(train.len(), 75);
    }

    #[test]
    fn test_singleton_class_stays_in_train() {
        let data = records(&[("Hernia", 1), ("Mass", 10)]);
        let (train, test) = split_records(data, 0.05, 1).unwrap();
        assert!(class_counts(&train).contains_key("Hernia"));
        assert!(!class_counts(&test).contains_key("Hernia"));
    }

    #[test]
    fn test_split_reproducibility() {
        let data = records(&[("a", 30), ("b", 30)]);
        let (train1, test1) = split_records(data.clone(), 0.2, 7).unwrap();
        let (train2, test2) = split_records(data.clone(), 0.2, 7).unwrap();
        assert_eq!(train1, train2);
        assert_eq!(test1, test2);

        let (_, test3) = split_records(data, 0.2, 8).unwrap();
        assert_ne!(test1, test3);
    }

    #[test]
    fn test_zero_val_size_keeps_everything_in_train() {
        let data = records(&[("a", 4), ("b", 6)]);
        let (train, val) = split_validation(data, 0.0, 3).unwrap();
        assert_eq!(train.len(), 10);
        assert!(val.is_empty());
    }

    #[test]
    fn test_unstratified_split() {
        let items: Vec<usize> = (0..10).collect();
        let (train, test) = train_test_split(items, 0.3, None, 3).unwrap();
        assert_eq!(test.len(), 3);
        assert_eq!(train.len(), 7);
    }

    #[test]
    fn test_split_rejects_bad_input() {
        assert!(train_test_split(vec![1, 2, 3], 0.0, None, 0).is_err());
        assert!(train_test_split(vec![1, 2, 3], 1.0, None, 0).is_err());
        assert!(train_test_split(Vec::<u8>::new(), 0.5, None, 0).is_err());
        let keys = vec!["a".to_string()];
        assert!(train_test_split(vec![1, 2], 0.5, Some(&keys), 0).is_err());
    }

    #[test]
    fn test_resample_to_value() {
        let data = records(&[("Hernia", 3), ("No Finding", 50)]);
        let resampled = resample_to_value(data, 10, 0);
        let counts = class_counts(&resampled);
        assert_eq!(counts["Hernia"], 10);
        assert_eq!(counts["No Finding"], 10);
    }

    #[test]
    fn test_random_undersample() {
        let data = records(&[("NORMAL", 12), ("PNEUMONIA", 4)]);
        let sampled = random_undersample(data, 0);
        let counts = class_counts(&sampled);
        assert_eq!(counts["NORMAL"], 4);
        assert_eq!(counts["PNEUMONIA"], 4);
    }

    #[test]
    fn test_sample_generated() {
        let generated: Vec<PathBuf> = (0..10).map(|i| PathBuf::from(format!("gen/{}.png", i))).collect();

        let sampled = sample_generated(4, &generated, "PNEUMONIA", 0);
        assert_eq!(sampled.len(), 6);
        assert!(sampled.iter().all(|r| r.has_label("PNEUMONIA")));

        // offset larger than what exists is capped
        let sampled = sample_generated(100, &generated, "PNEUMONIA", 0);
        assert_eq!(sampled.len(), 10);
    }
}
