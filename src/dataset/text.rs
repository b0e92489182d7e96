//! Image/prompt pairs for text-conditioned generation
//!
//! Findings are binarized over the ChestX-ray14 classes and rendered as a
//! prompt such as `a photo of a lung xray depicting visible effusion and mass`.

use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::labels::{apply_label_to_text_prompt, MultiLabelBinarizer};
use super::metadata::{MIMIC_CLASS_NAMES, NIH_CLASS_NAMES};
use super::{mimic, nih, Record, SplitDatasets};
use crate::config::Configuration;
use crate::utils::error::{CxrError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextRecord {
    pub image: PathBuf,
    pub prompt: String,
    pub multi_hot: Vec<f32>,
}

#[derive(Debug, Clone, Default)]
pub struct TextSplits {
    pub train: Vec<TextRecord>,
    pub val: Vec<TextRecord>,
    pub test: Vec<TextRecord>,
    /// Column order of `multi_hot`
    pub classes: Vec<String>,
}

/// Classes of `class_names` that do not also exist in the other collection
fn non_overlapping(class_names: &[&str]) -> Vec<String> {
    let nih: BTreeSet<&str> = NIH_CLASS_NAMES.iter().copied().collect();
    let mimic: BTreeSet<&str> = MIMIC_CLASS_NAMES.iter().copied().collect();
    let overlap: BTreeSet<&str> = nih.intersection(&mimic).copied().collect();
    let dropped: Vec<String> = class_names
        .iter()
        .filter(|c| !overlap.contains(*c))
        .map(|c| c.to_string())
        .collect();
    tracing::info!("Overlapped classes: {:?}. Dropping: {:?}", overlap, dropped);
    dropped
}

fn to_text(records: &[Record], binarizer: &MultiLabelBinarizer) -> Vec<TextRecord> {
    records
        .iter()
        .map(|r| {
            let multi_hot = binarizer.transform(&r.labels);
            TextRecord {
                image: r.image.clone(),
                prompt: apply_label_to_text_prompt(binarizer.classes(), &multi_hot),
                multi_hot,
            }
        })
        .collect()
}

/// Build prompt datasets for `nih`/`cxr14` or `mimic`/`mimic-cxr`.
///
/// In `evaluate` mode, records carrying a finding that only one of the two
/// collections knows are removed. Resampling only happens in `train` mode
/// and never when subsetting to the positive class.
pub fn instantiate_text_dataset(config: &Configuration, subset_to_positive_class: bool) -> Result<TextSplits> {
    let dataset = &config.datasets;
    let evaluate = config.job.mode == "evaluate";
    let positive = config.preprocessing.positive_class.clone();

    let mut preprocessing = config.preprocessing.clone();
    preprocessing.use_metaclass = false;
    preprocessing.use_sampling = preprocessing.use_sampling && !evaluate && !subset_to_positive_class;

    let (class_names, mut splits): (&[&str], SplitDatasets) = match dataset.name.as_str() {
        "nih" | "cxr14" => (
            &NIH_CLASS_NAMES[..],
            nih::load_nih_dataset(dataset, &preprocessing, config.job.random_state, subset_to_positive_class)?,
        ),
        "mimic" | "mimic-cxr" => {
            let mut splits = mimic::load_mimic_dataset(dataset, &preprocessing, config.job.random_state)?;
            if subset_to_positive_class {
                tracing::info!("Removing all negative classes...");
                for records in [&mut splits.train, &mut splits.val, &mut splits.test] {
                    records.retain(|r| r.has_label(&positive));
                }
            }
            (&MIMIC_CLASS_NAMES[..], splits)
        }
        other => {
            return Err(CxrError::UnknownDataset(format!(
                "Text prompts are only available for 'nih'/'cxr14' and 'mimic-cxr', got '{}'",
                other
            )))
        }
    };

    if evaluate {
        let dropped = non_overlapping(class_names);
        for records in [&mut splits.train, &mut splits.val, &mut splits.test] {
            records.retain(|r| !r.labels.iter().any(|l| dropped.contains(l)));
        }
    }

    let binarizer = MultiLabelBinarizer::new(&NIH_CLASS_NAMES);
    let text = TextSplits {
        train: to_text(&splits.train, &binarizer),
        val: to_text(&splits.val, &binarizer),
        test: to_text(&splits.test, &binarizer),
        classes: binarizer.classes().to_vec(),
    };
    tracing::info!(
        "Text dataset: {} train / {} val / {} test prompts",
        text.train.len(),
        text.val.len(),
        text.test.len()
    );
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mimic_config(dir: &std::path::Path, mode: &str) -> Configuration {
        let index = dir.join("mimic.csv");
        std::fs::write(
            &index,
            "path,split,Atelectasis,Pneumonia,Fracture,No Finding\n\
             a.jpg,train,1.0,1.0,,\n\
             b.jpg,train,,,1.0,\n\
             c.jpg,validate,,,,1.0\n\
             d.jpg,test,,1.0,,\n",
        )
        .unwrap();
        let mut config = Configuration::default();
        config.job.mode = mode.to_string();
        config.datasets.name = "mimic-cxr".to_string();
        config.datasets.scan_path = dir.to_path_buf();
        config.datasets.index_path = Some(index);
        config
    }

    #[test]
    fn test_prompts_and_multi_hot() {
        let dir = tempfile::tempdir().unwrap();
        let text = instantiate_text_dataset(&mimic_config(dir.path(), "train"), false).unwrap();

        assert_eq!(text.classes.len(), NIH_CLASS_NAMES.len());
        assert_eq!(text.train.len(), 2);
        assert_eq!(
            text.train[0].prompt,
            "a photo of a lung xray depicting visible atelectasis and pneumonia"
        );
        // Fracture is not a ChestX-ray14 class
        assert_eq!(text.train[1].prompt, "a photo of a lung xray");
        assert_eq!(text.train[1].multi_hot.iter().sum::<f32>(), 0.0);
        assert_eq!(text.val[0].prompt, "a photo of a lung xray");
    }

    #[test]
    fn test_evaluate_drops_non_overlapping_findings() {
        let dir = tempfile::tempdir().unwrap();
        let text = instantiate_text_dataset(&mimic_config(dir.path(), "evaluate"), false).unwrap();
        assert_eq!(text.train.len(), 1);
        assert!(text.train[0].image.ends_with("a.jpg"));
    }

    #[test]
    fn test_subset_to_positive_class() {
        let dir = tempfile::tempdir().unwrap();
        let text = instantiate_text_dataset(&mimic_config(dir.path(), "train"), true).unwrap();
        assert_eq!(text.train.len(), 1);
        assert!(text.val.is_empty());
        assert_eq!(text.test.len(), 1);
    }

    #[test]
    fn test_subset_skips_resampling() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = mimic_config(dir.path(), "train");
        config.preprocessing.use_sampling = true;
        config.preprocessing.sampling_method.sample_to_value = 5;

        let subset = instantiate_text_dataset(&config, true).unwrap();
        // a.jpg is the only positive training row
        assert_eq!(subset.train.len(), 1);

        let resampled = instantiate_text_dataset(&config, false).unwrap();
        assert_eq!(resampled.train.len(), 10);
    }

    #[test]
    fn test_unsupported_dataset() {
        let mut config = Configuration::default();
        config.datasets.name = "pediatrics".to_string();
        assert!(matches!(
            instantiate_text_dataset(&config, false),
            Err(CxrError::UnknownDataset(_))
        ));
    }
}
