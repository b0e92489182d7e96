//! Label utilities
//!
//! Collapsing findings into a positive/negative metaclass, subsetting,
//! label encoders and the text prompts used by text-conditioned datasets.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{Record, LABEL_SEPARATOR};
use crate::utils::error::{CxrError, Result};

/// Attribute key holding the findings before a metaclass transform
pub const ORIGINAL_LABELS_KEY: &str = "original_labels";

/// Count each finding in a column of `|`-separated label cells
pub fn nih_get_target_counts<'a, I>(cells: I) -> BTreeMap<String, usize>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut counts = BTreeMap::new();
    for cell in cells {
        for finding in cell.split(LABEL_SEPARATOR).filter(|f| !f.is_empty()) {
            *counts.entry(finding.to_string()).or_insert(0) += 1;
        }
    }
    counts
}

/// Collapse every record to `[positive_class]` or `[negative_class]`.
///
/// The negative class defaults to `Non-{positive_class}`. Unless `drop` is set
/// the previous findings are kept under the `original_labels` attribute.
pub fn transform_labels_to_metaclass(
    records: Vec<Record>,
    positive_class: &str,
    negative_class: Option<&str>,
    drop: bool,
) -> Vec<Record> {
    let negative = negative_class
        .map(str::to_string)
        .unwrap_or_else(|| format!("Non-{}", positive_class));

    tracing::info!("Transforming labels to metaclass...");
    let transformed: Vec<Record> = records
        .into_iter()
        .map(|mut record| {
            let metaclass = if record.has_label(positive_class) {
                positive_class.to_string()
            } else {
                negative.clone()
            };
            if !drop {
                record
                    .attributes
                    .insert(ORIGINAL_LABELS_KEY.to_string(), record.label());
            }
            record.labels = vec![metaclass];
            record
        })
        .collect();

    tracing::info!(
        "Labels transformed. New class counts: {:?}",
        super::class_counts(&transformed)
    );
    transformed
}

/// Keep records carrying any of `labels`; empty `labels` keeps everything
pub fn create_subset(records: Vec<Record>, labels: &[String]) -> Vec<Record> {
    if labels.is_empty() {
        return records;
    }
    records
        .into_iter()
        .filter(|r| labels.iter().any(|l| r.has_label(l)))
        .collect()
}

/// Keep records whose label string is exactly one of `subset`
pub fn subset_to_class(records: Vec<Record>, subset: &[String]) -> Vec<Record> {
    if subset.is_empty() {
        return records;
    }
    let kept: Vec<Record> = records
        .into_iter()
        .filter(|r| subset.contains(&r.label()))
        .collect();
    tracing::debug!("Subset to {:?}: {} records", subset, kept.len());
    kept
}

/// Class names ordered by their encoded index
pub fn set_labels_from_encoding(encoding: &BTreeMap<String, usize>) -> Vec<String> {
    let mut pairs: Vec<(&String, &usize)> = encoding.iter().collect();
    pairs.sort_by_key(|(_, &idx)| idx);
    pairs.into_iter().map(|(name, _)| name.clone()).collect()
}

/// Maps class names to contiguous indices in sorted order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LabelEncoder {
    pub classes: Vec<String>,
}

impl LabelEncoder {
    pub fn fit<'a, I>(labels: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut classes: Vec<String> = labels.into_iter().map(str::to_string).collect();
        classes.sort();
        classes.dedup();
        Self { classes }
    }

    pub fn from_encoding(encoding: &BTreeMap<String, usize>) -> Self {
        Self {
            classes: set_labels_from_encoding(encoding),
        }
    }

    pub fn transform(&self, label: &str) -> Result<usize> {
        self.classes
            .iter()
            .position(|c| c == label)
            .ok_or_else(|| CxrError::Dataset(format!("y contains previously unseen label '{}'", label)))
    }

    pub fn inverse_transform(&self, index: usize) -> Result<&str> {
        self.classes
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| CxrError::Dataset(format!("label index {} out of range", index)))
    }

    pub fn encoding(&self) -> BTreeMap<String, usize> {
        self.classes
            .iter()
            .enumerate()
            .map(|(i, c)| (c.clone(), i))
            .collect()
    }

    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }
}

/// Multi-hot encoder over a fixed class list
#[derive(Debug, Clone)]
pub struct MultiLabelBinarizer {
    classes: Vec<String>,
}

impl MultiLabelBinarizer {
    pub fn new(classes: &[&str]) -> Self {
        Self {
            classes: classes.iter().map(|c| c.to_string()).collect(),
        }
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    /// Unknown labels are skipped with a warning
    pub fn transform(&self, labels: &[String]) -> Vec<f32> {
        let mut row = vec![0.0f32; self.classes.len()];
        for label in labels {
            match self.classes.iter().position(|c| c == label) {
                Some(idx) => row[idx] = 1.0,
                None => tracing::warn!("unknown class(es) {:?} will be ignored", label),
            }
        }
        row
    }

    /// Keep only the given columns, in this binarizer's order
    pub fn restrict_to(&self, keep: &[String]) -> Self {
        Self {
            classes: self
                .classes
                .iter()
                .filter(|c| keep.contains(c))
                .cloned()
                .collect(),
        }
    }
}

const PROMPT_BASE: &str = "A photo of a lung xray";

/// Build a text prompt from a multi-hot row over `classes`
pub fn apply_label_to_text_prompt(classes: &[String], multi_hot: &[f32]) -> String {
    let present: Vec<&str> = classes
        .iter()
        .zip(multi_hot)
        .filter(|(_, &v)| v == 1.0)
        .map(|(c, _)| c.as_str())
        .collect();

    if present.is_empty() || present.contains(&"No Finding") {
        return PROMPT_BASE.to_lowercase();
    }

    let findings = match present.as_slice() {
        [one] => one.to_string(),
        [a, b] => format!("{} and {}", a, b),
        [rest @ .., last] => format!("{}, and {}", rest.join(", "), last),
        [] => String::new(),
    };
    format!("{} depicting visible {}", PROMPT_BASE, findings).to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str, labels: &[&str]) -> Record {
        Record::new(id, format!("{}.png", id), labels.iter().map(|s| s.to_string()).collect())
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_target_counts_split_on_pipe() {
        let counts = nih_get_target_counts(vec!["Effusion|Mass", "No Finding", "Mass"]);
        assert_eq!(counts["Mass"], 2);
        assert_eq!(counts["Effusion"], 1);
        assert_eq!(counts["No Finding"], 1);
    }

    #[test]
    fn test_metaclass_default_negative() {
        let records = vec![
            record("a", &["Pneumonia", "Effusion"]),
            record("b", &["Effusion"]),
            record("c", &["No Finding"]),
        ];
        let out = transform_labels_to_metaclass(records, "Pneumonia", None, false);
        assert_eq!(out[0].labels, strings(&["Pneumonia"]));
        assert_eq!(out[1].labels, strings(&["Non-Pneumonia"]));
        assert_eq!(out[0].attributes[ORIGINAL_LABELS_KEY], "Pneumonia|Effusion");
    }

    #[test]
    fn test_metaclass_drop_and_custom_negative() {
        let out = transform_labels_to_metaclass(vec![record("a", &["Mass"])], "Hernia", Some("Other"), true);
        assert_eq!(out[0].labels, strings(&["Other"]));
        assert!(out[0].attributes.is_empty());
    }

    #[test]
    fn test_create_subset() {
        let records = vec![record("a", &["Mass", "Nodule"]), record("b", &["Edema"])];
        let subset = create_subset(records.clone(), &strings(&["Nodule"]));
        assert_eq!(subset.len(), 1);
        assert_eq!(subset[0].id, "a");
        assert_eq!(create_subset(records, &[]).len(), 2);
    }

    #[test]
    fn test_subset_to_class_matches_whole_label() {
        let records = vec![record("a", &["Mass", "Nodule"]), record("b", &["Mass"])];
        let subset = subset_to_class(records, &strings(&["Mass"]));
        assert_eq!(subset.len(), 1);
        assert_eq!(subset[0].id, "b");
    }

    #[test]
    fn test_set_labels_from_encoding() {
        let mut encoding = BTreeMap::new();
        encoding.insert("PNEUMONIA".to_string(), 1);
        encoding.insert("NORMAL".to_string(), 0);
        assert_eq!(set_labels_from_encoding(&encoding), strings(&["NORMAL", "PNEUMONIA"]));
    }

    #[test]
    fn test_label_encoder() {
        let encoder = LabelEncoder::fit(vec!["M", "F", "M"]);
        assert_eq!(encoder.classes, strings(&["F", "M"]));
        assert_eq!(encoder.transform("M").unwrap(), 1);
        assert_eq!(encoder.inverse_transform(0).unwrap(), "F");
        assert!(encoder.transform("X").is_err());
        assert!(encoder.inverse_transform(5).is_err());
    }

    #[test]
    fn test_multilabel_binarizer() {
        let binarizer = MultiLabelBinarizer::new(&["Atelectasis", "Effusion", "Mass"]);
        let row = binarizer.transform(&strings(&["Mass", "Atelectasis", "Unknown"]));
        assert_eq!(row, vec![1.0, 0.0, 1.0]);

        let restricted = binarizer.restrict_to(&strings(&["Mass", "Effusion"]));
        assert_eq!(restricted.classes(), &strings(&["Effusion", "Mass"])[..]);
    }

    #[test]
    fn test_text_prompts() {
        let classes = strings(&["Atelectasis", "Effusion", "Mass", "No Finding"]);
        assert_eq!(
            apply_label_to_text_prompt(&classes, &[0.0, 0.0, 0.0, 1.0]),
            "a photo of a lung xray"
        );
        assert_eq!(
            apply_label_to_text_prompt(&classes, &[0.0, 0.0, 0.0, 0.0]),
            "a photo of a lung xray"
        );
        assert_eq!(
            apply_label_to_text_prompt(&classes, &[0.0, 0.0, 1.0, 0.0]),
            "a photo of a lung xray depicting visible mass"
        );
        assert_eq!(
            apply_label_to_text_prompt(&classes, &[1.0, 1.0, 0.0, 0.0]),
            "a photo of a lung xray depicting visible atelectasis and effusion"
        );
        assert_eq!(
            apply_label_to_text_prompt(&classes, &[1.0, 1.0, 1.0, 0.0]),
            "a photo of a lung xray depicting visible atelectasis, effusion, and mass"
        );
    }
}
