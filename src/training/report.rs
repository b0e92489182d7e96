//! Markdown run report

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::Path;

use crate::config::Configuration;
use crate::utils::error::Result;
use crate::utils::metrics::ConfusionMatrix;

/// Columns of the evaluation table, in order
const REPORT_COLUMNS: [&str; 6] = ["roc_auc", "accuracy", "loss", "precision", "recall", "f1"];

/// Test-split results of a finished run
#[derive(Debug, Clone)]
pub struct TestResults {
    pub model_name: String,
    pub metrics: BTreeMap<String, f64>,
    pub confusion_matrix: ConfusionMatrix,
    pub class_names: Vec<String>,
}

pub fn build_report(config: &Configuration, results: &TestResults) -> Result<String> {
    let mut out = String::new();
    // writing to a String cannot fail
    let _ = writeln!(out, "# Run summary\n");
    let _ = writeln!(out, "## Test results\n");

    let _ = writeln!(out, "### Evaluation metrics\n");
    let _ = writeln!(out, "| model_name | {} |", REPORT_COLUMNS.join(" | "));
    let _ = writeln!(out, "|---|{}", "---|".repeat(REPORT_COLUMNS.len()));
    let values: Vec<String> = REPORT_COLUMNS
        .iter()
        .map(|name| match results.metrics.get(*name) {
            Some(v) => format!("{:.4}", v),
            None => "n/a".to_string(),
        })
        .collect();
    let _ = writeln!(out, "| {} | {} |\n", results.model_name, values.join(" | "));

    let _ = writeln!(out, "### Confusion matrix\n");
    let _ = writeln!(out, "{}", results.confusion_matrix.to_markdown(&results.class_names));

    let _ = writeln!(out, "## Configuration\n");
    let _ = writeln!(out, "```json\n{}\n```", serde_json::to_string_pretty(config)?);
    Ok(out)
}

pub fn write_report(path: &Path, report: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, report)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn results() -> TestResults {
        TestResults {
            model_name: "cnn".to_string(),
            metrics: BTreeMap::from([
                ("accuracy".to_string(), 0.75),
                ("loss".to_string(), 0.5),
                ("f1".to_string(), 2.0 / 3.0),
            ]),
            confusion_matrix: ConfusionMatrix::from_predictions(&[0, 1, 1, 1], &[0, 1, 0, 1], 2),
            class_names: vec!["NORMAL".to_string(), "PNEUMONIA".to_string()],
        }
    }

    #[test]
    fn test_report_sections_in_order() {
        let report = build_report(&Configuration::default(), &results()).unwrap();
        let positions: Vec<usize> = [
            "# Run summary",
            "## Test results",
            "### Evaluation metrics",
            "### Confusion matrix",
            "```json",
        ]
        .iter()
        .map(|h| report.find(h).unwrap())
        .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_metrics_row() {
        let report = build_report(&Configuration::default(), &results()).unwrap();
        assert!(report.contains("| model_name | roc_auc | accuracy | loss | precision | recall | f1 |"));
        assert!(report.contains("| cnn | n/a | 0.7500 | 0.5000 | n/a | n/a | 0.6667 |"));
    }

    #[test]
    fn test_write_report() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifacts").join("report.md");
        write_report(&path, "# Run summary").unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "# Run summary");
    }
}
