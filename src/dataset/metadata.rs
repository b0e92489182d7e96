//! Metadata tables
//!
//! A small string table read from CSV with just enough operations for the
//! dataset loaders: column lookup, indexing by a key column, row filtering
//! and writing split metadata back out.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use super::{Record, IMAGE_KEYNAME, LABEL_KEYNAME};
use crate::utils::error::{CxrError, Result};

/// The 15 ChestX-ray14 finding labels
pub const NIH_CLASS_NAMES: [&str; 15] = [
    "Atelectasis",
    "Cardiomegaly",
    "Consolidation",
    "Edema",
    "Effusion",
    "Emphysema",
    "Fibrosis",
    "Hernia",
    "Infiltration",
    "Mass",
    "No Finding",
    "Nodule",
    "Pleural_Thickening",
    "Pneumonia",
    "Pneumothorax",
];

/// The 14 CheXpert labels used by MIMIC-CXR
pub const MIMIC_CLASS_NAMES: [&str; 14] = [
    "Atelectasis",
    "Cardiomegaly",
    "Consolidation",
    "Edema",
    "Enlarged Cardiomediastinum",
    "Fracture",
    "Lung Lesion",
    "Lung Opacity",
    "No Finding",
    "Pleural Effusion",
    "Pleural Other",
    "Pneumonia",
    "Pneumothorax",
    "Support Devices",
];

/// Rarest ChestX-ray14 finding and its image count
pub const NIH_MINORITY_CLASS: &str = "Hernia";
pub const NIH_MINORITY_CLASS_COUNT: usize = 227;

/// Row-oriented string table
#[derive(Debug, Clone, Default)]
pub struct MetadataFrame {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl MetadataFrame {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        Self { columns, rows }
    }

    /// Table of `id, image, label` plus every attribute seen in `records`
    pub fn from_records(records: &[Record]) -> Self {
        let attribute_keys: BTreeSet<&String> = records.iter().flat_map(|r| r.attributes.keys()).collect();

        let mut columns = vec!["id".to_string(), IMAGE_KEYNAME.to_string(), LABEL_KEYNAME.to_string()];
        columns.extend(attribute_keys.iter().map(|k| k.to_string()));

        let rows = records
            .iter()
            .map(|r| {
                let mut row = vec![r.id.clone(), r.image.to_string_lossy().to_string(), r.label()];
                row.extend(
                    attribute_keys
                        .iter()
                        .map(|k| r.attributes.get(*k).cloned().unwrap_or_default()),
                );
                row
            })
            .collect();
        Self { columns, rows }
    }

    /// Read a CSV file with a header row
    pub fn read_csv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(CxrError::PathNotFound(path.to_path_buf()));
        }
        let mut reader = csv::ReaderBuilder::new().flexible(true).from_path(path)?;
        let columns: Vec<String> = reader.headers()?.iter().map(|h| h.trim().to_string()).collect();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record?;
            let mut row: Vec<String> = record.iter().map(str::to_string).collect();
            row.resize(columns.len(), String::new());
            rows.push(row);
        }
        tracing::debug!("Read {} rows x {} columns from {}", rows.len(), columns.len(), path.display());
        Ok(Self { columns, rows })
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column_index(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| CxrError::Metadata(format!("column '{}' not found in {:?}", name, self.columns)))
    }

    /// All values of one column
    pub fn column(&self, name: &str) -> Result<Vec<&str>> {
        let idx = self.column_index(name)?;
        Ok(self.rows.iter().map(|r| r[idx].as_str()).collect())
    }

    /// Map from key column value to row index; later duplicates win
    pub fn index_by(&self, name: &str) -> Result<HashMap<String, usize>> {
        let idx = self.column_index(name)?;
        Ok(self
            .rows
            .iter()
            .enumerate()
            .map(|(i, r)| (r[idx].clone(), i))
            .collect())
    }

    /// Value of `column` in row `row`
    pub fn value(&self, row: usize, column: usize) -> &str {
        self.rows
            .get(row)
            .and_then(|r| r.get(column))
            .map(String::as_str)
            .unwrap_or("")
    }

    /// Keep rows matching the predicate
    pub fn filter<F>(&self, mut predicate: F) -> Self
    where
        F: FnMut(&[String]) -> bool,
    {
        Self {
            columns: self.columns.clone(),
            rows: self.rows.iter().filter(|r| predicate(r)).cloned().collect(),
        }
    }

    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(&self.columns)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Read a newline-separated list of file names (NIH split lists)
pub fn read_name_list<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(CxrError::PathNotFound(path.to_path_buf()));
    }
    Ok(std::fs::read_to_string(path)?
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}
