//! Metrics Module for Model Evaluation
//!
//! - Confusion matrix (row = actual, column = predicted)
//! - Per-class precision, recall, F1 and support
//! - Accuracy, macro and weighted averages
//! - ROC AUC (binary and macro one-vs-rest)
//!
//! Reports can be exported as CSV for the per-epoch artifact logging.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::utils::error::{CxrError, Result};

/// Per-class metrics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassMetrics {
    pub class_idx: usize,
    pub class_name: String,
    pub true_positives: usize,
    pub false_positives: usize,
    pub false_negatives: usize,
    /// Precision = TP / (TP + FP)
    pub precision: f64,
    /// Recall = TP / (TP + FN)
    pub recall: f64,
    /// F1 = 2PR / (P + R)
    pub f1: f64,
    /// Number of actual samples of this class
    pub support: usize,
}

impl ClassMetrics {
    /// Calculate metrics for a class from a confusion matrix
    pub fn from_confusion_matrix(cm: &ConfusionMatrix, class_idx: usize) -> Self {
        let true_positives = cm.get(class_idx, class_idx);

        let false_positives: usize = (0..cm.num_classes)
            .filter(|&i| i != class_idx)
            .map(|i| cm.get(i, class_idx))
            .sum();

        let false_negatives: usize = (0..cm.num_classes)
            .filter(|&i| i != class_idx)
            .map(|i| cm.get(class_idx, i))
            .sum();

        let precision = ratio(true_positives, true_positives + false_positives);
        let recall = ratio(true_positives, true_positives + false_negatives);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };

        Self {
            class_idx,
            class_name: class_idx.to_string(),
            true_positives,
            false_positives,
            false_negatives,
            precision,
            recall,
            f1,
            support: true_positives + false_negatives,
        }
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.class_name = name.to_string();
        self
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den > 0 {
        num as f64 / den as f64
    } else {
        0.0
    }
}

/// Confusion Matrix for multi-class classification
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfusionMatrix {
    pub num_classes: usize,
    /// Row-major counts, row = actual, column = predicted
    pub matrix: Vec<usize>,
}

impl ConfusionMatrix {
    pub fn new(num_classes: usize) -> Self {
        Self {
            num_classes,
            matrix: vec![0; num_classes * num_classes],
        }
    }

    pub fn from_predictions(predictions: &[usize], ground_truth: &[usize], num_classes: usize) -> Self {
        let mut cm = Self::new(num_classes);
        for (&pred, &actual) in predictions.iter().zip(ground_truth.iter()) {
            cm.add(actual, pred);
        }
        cm
    }

    /// Add a single prediction; out-of-range indices are ignored
    pub fn add(&mut self, actual: usize, predicted: usize) {
        if actual < self.num_classes && predicted < self.num_classes {
            self.matrix[actual * self.num_classes + predicted] += 1;
        }
    }

    pub fn get(&self, actual: usize, predicted: usize) -> usize {
        if actual < self.num_classes && predicted < self.num_classes {
            self.matrix[actual * self.num_classes + predicted]
        } else {
            0
        }
    }

    pub fn total(&self) -> usize {
        self.matrix.iter().sum()
    }

    pub fn correct(&self) -> usize {
        (0..self.num_classes).map(|i| self.get(i, i)).sum()
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.correct(), self.total())
    }

    /// Write the matrix as CSV with class names as header and row labels
    pub fn write_csv<P: AsRef<Path>>(&self, path: P, class_names: &[String]) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        let mut header = vec![String::new()];
        header.extend(self.names(class_names));
        writer.write_record(&header)?;

        for (row, name) in self.names(class_names).into_iter().enumerate() {
            let mut record = vec![name];
            record.extend((0..self.num_classes).map(|col| self.get(row, col).to_string()));
            writer.write_record(&record)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Render as a markdown table
    pub fn to_markdown(&self, class_names: &[String]) -> String {
        let names = self.names(class_names);
        let mut out = format!("| actual \\ predicted | {} |\n", names.join(" | "));
        out.push_str(&format!("|---|{}\n", "---|".repeat(self.num_classes)));
        for (row, name) in names.iter().enumerate() {
            let cells: Vec<String> = (0..self.num_classes)
                .map(|col| self.get(row, col).to_string())
                .collect();
            out.push_str(&format!("| {} | {} |\n", name, cells.join(" | ")));
        }
        out
    }

    fn names(&self, class_names: &[String]) -> Vec<String> {
        (0..self.num_classes)
            .map(|i| class_names.get(i).cloned().unwrap_or_else(|| i.to_string()))
            .collect()
    }
}

/// Classification report over all classes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClassificationReport {
    pub total_samples: usize,
    pub accuracy: f64,
    pub macro_precision: f64,
    pub macro_recall: f64,
    pub macro_f1: f64,
    pub weighted_precision: f64,
    pub weighted_recall: f64,
    pub weighted_f1: f64,
    pub per_class: Vec<ClassMetrics>,
    pub confusion_matrix: ConfusionMatrix,
}

impl ClassificationReport {
    pub fn from_predictions(predictions: &[usize], ground_truth: &[usize], class_names: &[String]) -> Self {
        let num_classes = class_names.len();
        let confusion_matrix = ConfusionMatrix::from_predictions(predictions, ground_truth, num_classes);

        let per_class: Vec<ClassMetrics> = (0..num_classes)
            .map(|idx| ClassMetrics::from_confusion_matrix(&confusion_matrix, idx).with_name(&class_names[idx]))
            .collect();

        let n = num_classes.max(1) as f64;
        let total_support: usize = per_class.iter().map(|m| m.support).sum();
        let weighted = |f: fn(&ClassMetrics) -> f64| -> f64 {
            if total_support == 0 {
                return 0.0;
            }
            per_class.iter().map(|m| f(m) * m.support as f64).sum::<f64>() / total_support as f64
        };

        Self {
            total_samples: predictions.len(),
            accuracy: confusion_matrix.accuracy(),
            macro_precision: per_class.iter().map(|m| m.precision).sum::<f64>() / n,
            macro_recall: per_class.iter().map(|m| m.recall).sum::<f64>() / n,
            macro_f1: per_class.iter().map(|m| m.f1).sum::<f64>() / n,
            weighted_precision: weighted(|m| m.precision),
            weighted_recall: weighted(|m| m.recall),
            weighted_f1: weighted(|m| m.f1),
            per_class,
            confusion_matrix,
        }
    }

    /// Write `class,precision,recall,f1-score,support` rows followed by
    /// the accuracy, macro avg and weighted avg rows
    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(["", "precision", "recall", "f1-score", "support"])?;
        for m in &self.per_class {
            writer.write_record([
                m.class_name.clone(),
                format!("{:.4}", m.precision),
                format!("{:.4}", m.recall),
                format!("{:.4}", m.f1),
                m.support.to_string(),
            ])?;
        }
        let total = self.total_samples.to_string();
        writer.write_record([
            "accuracy".to_string(),
            String::new(),
            String::new(),
            format!("{:.4}", self.accuracy),
            total.clone(),
        ])?;
        writer.write_record([
            "macro avg".to_string(),
            format!("{:.4}", self.macro_precision),
            format!("{:.4}", self.macro_recall),
            format!("{:.4}", self.macro_f1),
            total.clone(),
        ])?;
        writer.write_record([
            "weighted avg".to_string(),
            format!("{:.4}", self.weighted_precision),
            format!("{:.4}", self.weighted_recall),
            format!("{:.4}", self.weighted_f1),
            total,
        ])?;
        writer.flush()?;
        Ok(())
    }
}

/// Binary ROC AUC via the Mann-Whitney rank statistic.
///
/// Tied scores receive their average rank.
pub fn roc_auc(scores: &[f32], positives: &[bool]) -> Result<f64> {
    if scores.len() != positives.len() {
        return Err(CxrError::InvalidInput(format!(
            "roc_auc: {} scores for {} labels",
            scores.len(),
            positives.len()
        )));
    }
    let n_pos = positives.iter().filter(|&&p| p).count();
    let n_neg = positives.len() - n_pos;
    if n_pos == 0 || n_neg == 0 {
        return Err(CxrError::InvalidInput(
            "roc_auc is undefined when only one class is present".to_string(),
        ));
    }

    let mut order: Vec<usize> = (0..scores.len()).collect();
    order.sort_by(|&a, &b| scores[a].total_cmp(&scores[b]));

    let mut ranks = vec![0.0f64; scores.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j + 1 < order.len() && scores[order[j + 1]] == scores[order[i]] {
            j += 1;
        }
        let avg_rank = (i + j) as f64 / 2.0 + 1.0;
        for k in i..=j {
            ranks[order[k]] = avg_rank;
        }
        i = j + 1;
    }

    let pos_rank_sum: f64 = ranks
        .iter()
        .zip(positives)
        .filter(|(_, &p)| p)
        .map(|(r, _)| r)
        .sum();
    let u = pos_rank_sum - (n_pos * (n_pos + 1)) as f64 / 2.0;
    Ok(u / (n_pos * n_neg) as f64)
}

/// ROC AUC from class probabilities.
///
/// Two classes use the positive-class column, more classes use the macro
/// average of one-vs-rest scores over classes that occur in `targets`.
pub fn roc_auc_ovr(probabilities: &[Vec<f32>], targets: &[usize], num_classes: usize) -> Result<f64> {
    if num_classes == 2 {
        let scores: Vec<f32> = probabilities.iter().map(|p| p[1]).collect();
        let positives: Vec<bool> = targets.iter().map(|&t| t == 1).collect();
        return roc_auc(&scores, &positives);
    }

    let mut aucs = Vec::new();
    for class in 0..num_classes {
        let positives: Vec<bool> = targets.iter().map(|&t| t == class).collect();
        if !positives.iter().any(|&p| p) || positives.iter().all(|&p| p) {
            continue;
        }
        let scores: Vec<f32> = probabilities.iter().map(|p| p[class]).collect();
        aucs.push(roc_auc(&scores, &positives)?);
    }
    if aucs.is_empty() {
        return Err(CxrError::InvalidInput(
            "roc_auc is undefined when only one class is present".to_string(),
        ));
    }
    Ok(aucs.iter().sum::<f64>() / aucs.len() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("class_{}", i)).collect()
    }

    #[test]
    fn test_confusion_matrix() {
        let predictions = vec![0, 1, 1, 0, 2];
        let ground_truth = vec![0, 1, 0, 0, 2];
        let cm = ConfusionMatrix::from_predictions(&predictions, &ground_truth, 3);

        assert_eq!(cm.get(0, 0), 2);
        assert_eq!(cm.get(0, 1), 1);
        assert_eq!(cm.get(1, 1), 1);
        assert_eq!(cm.total(), 5);
        assert!((cm.accuracy() - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_classification_report() {
        let predictions = vec![0, 0, 1, 1, 1];
        let ground_truth = vec![0, 1, 1, 1, 0];
        let report = ClassificationReport::from_predictions(&predictions, &ground_truth, &names(2));

        // class 0: tp=1 fp=1 fn=1, class 1: tp=2 fp=1 fn=1
        assert!((report.per_class[0].precision - 0.5).abs() < 1e-9);
        assert!((report.per_class[1].precision - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(report.per_class[1].support, 3);
        assert!((report.accuracy - 0.6).abs() < 1e-9);
        assert!((report.macro_recall - (0.5 + 2.0 / 3.0) / 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_roc_auc_perfect_and_inverted() {
        let positives = vec![false, false, true, true];
        assert!((roc_auc(&[0.1, 0.2, 0.8, 0.9], &positives).unwrap() - 1.0).abs() < 1e-9);
        assert!(roc_auc(&[0.9, 0.8, 0.2, 0.1], &positives).unwrap().abs() < 1e-9);
    }

    #[test]
    fn test_roc_auc_with_ties() {
        let auc = roc_auc(&[0.5, 0.5, 0.5, 0.5], &[false, true, false, true]).unwrap();
        assert!((auc - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_roc_auc_single_class_is_error() {
        assert!(roc_auc(&[0.1, 0.2], &[true, true]).is_err());
    }

    #[test]
    fn test_roc_auc_ovr_binary_uses_positive_column() {
        let probs = vec![vec![0.9, 0.1], vec![0.2, 0.8], vec![0.7, 0.3], vec![0.4, 0.6]];
        let targets = vec![0, 1, 0, 1];
        assert!((roc_auc_ovr(&probs, &targets, 2).unwrap() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_roc_auc_ovr_macro_average() {
        let probs = vec![
            vec![0.8, 0.1, 0.1],
            vec![0.3, 0.6, 0.1],
            vec![0.2, 0.2, 0.6],
            vec![0.4, 0.5, 0.1],
            vec![0.5, 0.3, 0.2],
            vec![0.1, 0.3, 0.6],
        ];
        let targets = vec![0, 1, 2, 0, 1, 2];
        // class 0: 7/8, class 1: 6.5/8 (one tie), class 2: 1
        let expected = (0.875 + 0.8125 + 1.0) / 3.0;
        assert!((roc_auc_ovr(&probs, &targets, 3).unwrap() - expected).abs() < 1e-9);
    }

    #[test]
    fn test_roc_auc_ovr_skips_absent_class() {
        let probs = vec![
            vec![0.9, 0.05, 0.05],
            vec![0.2, 0.7, 0.1],
            vec![0.6, 0.3, 0.1],
            vec![0.3, 0.25, 0.45],
        ];
        // class 2 never occurs
        let targets = vec![0, 1, 0, 1];
        let auc = roc_auc_ovr(&probs, &targets, 3).unwrap();
        assert!(auc.is_finite());
        assert!((auc - (1.0 + 0.75) / 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_report_csv_export() {
        let dir = tempfile::tempdir().unwrap();
        let report = ClassificationReport::from_predictions(&[0, 1], &[0, 1], &names(2));
        let path = dir.path().join("report.csv");
        report.write_csv(&path).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with(",precision,recall,f1-score,support"));
        assert!(content.contains("macro avg"));

        let cm_path = dir.path().join("cm.csv");
        report.confusion_matrix.write_csv(&cm_path, &names(2)).unwrap();
        let cm = std::fs::read_to_string(&cm_path).unwrap();
        assert!(cm.contains("class_0,1,0"));
    }

    #[test]
    fn test_markdown_confusion_matrix() {
        let cm = ConfusionMatrix::from_predictions(&[0, 1, 1], &[0, 1, 0], 2);
        let md = cm.to_markdown(&names(2));
        assert!(md.contains("| class_0 | 1 | 1 |"));
    }
}
