//! Dataset instantiation and batch loading
//!
//! `instantiate_image_dataset` turns the `datasets` config section into
//! `SplitDatasets`, merging any additional datasets. `prepare_validation_dataloaders`
//! wraps the splits in `ScanLoader`s that shuffle per epoch and decode each
//! batch in parallel on a rayon pool sized by `num_workers`.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::Backend;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;

use super::burn_dataset::{ScanBatch, ScanBatcher, ScanDataset, ScanItem};
use super::labels::{set_labels_from_encoding, LabelEncoder};
use super::transforms::create_transforms;
use super::{ixi, mimic, nih, pediatrics, SplitDatasets};
use crate::config::{Configuration, DatasetConfig, PreprocessingConfig};
use crate::utils::error::{CxrError, Result};

const IMAGE_EXTENSIONS: [&str; 3] = [".png", ".jpg", ".jpeg"];
const NIFTI_EXTENSION: &str = ".nii.gz";

/// Only 2D images and gzipped NIfTI volumes can be read
pub fn check_extension(extension: &str) -> Result<()> {
    let ext = extension.to_lowercase();
    if IMAGE_EXTENSIONS.contains(&ext.as_str()) || ext == NIFTI_EXTENSION {
        Ok(())
    } else {
        Err(CxrError::Dataset(format!(
            "Unsupported extension '{}'. Use one of {:?} or '{}'.",
            extension, IMAGE_EXTENSIONS, NIFTI_EXTENSION
        )))
    }
}

/// Load one dataset by name
pub fn load_named_dataset(
    dataset: &DatasetConfig,
    preprocessing: &PreprocessingConfig,
    random_state: u64,
    subset_to_positive_class: bool,
) -> Result<SplitDatasets> {
    check_extension(&dataset.extension)?;
    tracing::info!("Loading '{}' from {}", dataset.name, dataset.scan_path.display());
    match dataset.name.as_str() {
        "nih" | "cxr14" => nih::load_nih_dataset(dataset, preprocessing, random_state, subset_to_positive_class),
        "mimic" | "mimic-cxr" => mimic::load_mimic_dataset(dataset, preprocessing, random_state),
        "pediatrics" => pediatrics::load_pediatrics_dataset(dataset, preprocessing, random_state),
        "ixi" => ixi::load_ixi_dataset(dataset, random_state),
        other => Err(CxrError::UnknownDataset(format!(
            "Dataset '{}' is not recognized not supported. Please use ['nih'|'cxr14'|'pediatrics'|'ixi'|'mimic'].",
            other
        ))),
    }
}

/// Load the configured dataset plus its additional datasets.
///
/// Class names come from `datasets.encoding` when set; otherwise from the
/// loader (IXI) or a label encoder fit on every split.
pub fn instantiate_image_dataset(config: &Configuration, subset_to_positive_class: bool) -> Result<SplitDatasets> {
    tracing::info!("Instantiating image dataset...");
    let dataset_cfg = &config.datasets;
    let random_state = config.job.random_state;

    let mut splits = load_named_dataset(dataset_cfg, &config.preprocessing, random_state, subset_to_positive_class)?;

    if !dataset_cfg.additional_datasets.is_empty() {
        tracing::info!("Adding additional datasets...");
        let extra = dataset_cfg
            .additional_datasets
            .iter()
            .map(|d| load_named_dataset(d, &config.preprocessing, random_state, subset_to_positive_class))
            .collect::<Result<Vec<_>>>()?;
        splits = combine_datasets(splits, extra);
    }

    splits.classes = resolve_classes(&dataset_cfg.encoding, &splits);
    tracing::info!("Image dataset instantiated with classes {:?}", splits.classes);
    Ok(splits)
}

/// Concatenate splits; class lists are unioned in first-seen order
pub fn combine_datasets(base: SplitDatasets, extra: Vec<SplitDatasets>) -> SplitDatasets {
    extra.into_iter().fold(base, |mut acc, other| {
        acc.train.extend(other.train);
        acc.val.extend(other.val);
        acc.test.extend(other.test);
        for class in other.classes {
            if !acc.classes.contains(&class) {
                acc.classes.push(class);
            }
        }
        acc
    })
}

fn resolve_classes(encoding: &BTreeMap<String, usize>, splits: &SplitDatasets) -> Vec<String> {
    if !encoding.is_empty() {
        return set_labels_from_encoding(encoding);
    }
    if !splits.classes.is_empty() {
        return splits.classes.clone();
    }
    let labels: Vec<String> = splits
        .named()
        .iter()
        .flat_map(|(_, records)| records.iter().map(|r| r.label()))
        .collect();
    LabelEncoder::fit(labels.iter().map(String::as_str)).classes
}

/// Class index of each name in `classes`
pub fn encoding_for(classes: &[String]) -> BTreeMap<String, usize> {
    classes.iter().enumerate().map(|(i, c)| (c.clone(), i)).collect()
}

/// Per-split class counts with totals
#[derive(Debug, Clone, PartialEq)]
pub struct Breakdown {
    pub columns: Vec<String>,
    /// `(class, counts per column)`; the last row is `Total`
    pub rows: Vec<(String, Vec<usize>)>,
}

impl Breakdown {
    pub fn get(&self, class: &str, column: &str) -> Option<usize> {
        let col = self.columns.iter().position(|c| c == column)?;
        self.rows
            .iter()
            .find(|(name, _)| name == class)
            .map(|(_, counts)| counts[col])
    }
}

impl fmt::Display for Breakdown {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name_width = self.rows.iter().map(|(n, _)| n.len()).max().unwrap_or(0).max(5);
        write!(f, "{:<width$}", "", width = name_width)?;
        for column in &self.columns {
            write!(f, "  {:>12}", column)?;
        }
        writeln!(f)?;
        for (name, counts) in &self.rows {
            write!(f, "{:<width$}", name, width = name_width)?;
            for count in counts {
                write!(f, "  {:>12}", count)?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

/// Class counts per split, in encoding order. The validation column is
/// present only when the split has records.
pub fn get_target_breakdown(splits: &SplitDatasets, encoding: &BTreeMap<String, usize>) -> Breakdown {
    let classes = if encoding.is_empty() {
        splits.classes.clone()
    } else {
        set_labels_from_encoding(encoding)
    };

    let mut columns: Vec<(&str, &[super::Record])> = vec![("Train split", splits.train.as_slice())];
    if !splits.val.is_empty() {
        columns.push(("Validation split", splits.val.as_slice()));
    }
    columns.push(("Test split", splits.test.as_slice()));

    let counts: Vec<BTreeMap<String, usize>> = columns.iter().map(|(_, r)| super::class_counts(r)).collect();

    let mut rows: Vec<(String, Vec<usize>)> = classes
        .iter()
        .map(|class| {
            let mut row: Vec<usize> = counts.iter().map(|c| c.get(class).copied().unwrap_or(0)).collect();
            row.push(row.iter().sum());
            (class.clone(), row)
        })
        .collect();

    let width = columns.len() + 1;
    let totals: Vec<usize> = (0..width).map(|i| rows.iter().map(|(_, r)| r[i]).sum()).collect();
    rows.push(("Total".to_string(), totals));

    let mut names: Vec<String> = columns.iter().map(|(n, _)| n.to_string()).collect();
    names.push("Total".to_string());
    Breakdown { columns: names, rows }
}

/// Epoch-wise batch source over a `ScanDataset`
pub struct ScanLoader {
    dataset: ScanDataset,
    batcher: ScanBatcher,
    batch_size: usize,
    shuffle: bool,
    seed: u64,
    epoch: AtomicU64,
    dropped: AtomicUsize,
    pool: Option<Arc<rayon::ThreadPool>>,
}

impl fmt::Debug for ScanLoader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanLoader")
            .field("dataset", &self.dataset)
            .field("batch_size", &self.batch_size)
            .field("shuffle", &self.shuffle)
            .finish()
    }
}

impl ScanLoader {
    pub fn new(
        dataset: ScanDataset,
        batch_size: usize,
        shuffle: bool,
        seed: u64,
        pool: Option<Arc<rayon::ThreadPool>>,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(CxrError::InvalidInput("batch_size must be > 0".to_string()));
        }
        let batcher = ScanBatcher::from_transforms(dataset.transforms());
        Ok(Self {
            dataset,
            batcher,
            batch_size,
            shuffle,
            seed,
            epoch: AtomicU64::new(0),
            dropped: AtomicUsize::new(0),
            pool,
        })
    }

    /// Number of batches per full pass
    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }

    pub fn num_items(&self) -> usize {
        self.dataset.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dataset.len() == 0
    }

    pub fn dataset(&self) -> &ScanDataset {
        &self.dataset
    }

    fn epoch_indices(&self) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.dataset.len()).collect();
        if self.shuffle {
            let epoch = self.epoch.fetch_add(1, Ordering::Relaxed);
            let mut rng = ChaCha8Rng::seed_from_u64(self.seed.wrapping_add(epoch));
            indices.shuffle(&mut rng);
        }
        indices
    }

    /// Scans that failed to load during the most recent pass
    pub fn dropped_last_pass(&self) -> usize {
        self.dropped.load(Ordering::Relaxed)
    }

    fn load_items(&self, indices: &[usize]) -> Vec<ScanItem> {
        let results: Vec<Result<ScanItem>> = match &self.pool {
            Some(pool) => pool.install(|| indices.par_iter().map(|&i| self.dataset.load_item(i)).collect()),
            None => indices.iter().map(|&i| self.dataset.load_item(i)).collect(),
        };

        let mut items = Vec::with_capacity(results.len());
        for result in results {
            match result {
                Ok(item) => items.push(item),
                Err(e) => {
                    tracing::debug!("Dropping scan from batch: {}", e);
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        items
    }

    /// Batches of one pass, reshuffled on every call when shuffling.
    ///
    /// Scans that fail to load are left out of their batch and reported once
    /// when the pass ends.
    pub fn iter<B: Backend>(&self, device: &B::Device) -> BatchIter<'_, B> {
        self.dropped.store(0, Ordering::Relaxed);
        BatchIter {
            loader: self,
            indices: self.epoch_indices(),
            cursor: 0,
            device: device.clone(),
            reported: false,
        }
    }
}

pub struct BatchIter<'a, B: Backend> {
    loader: &'a ScanLoader,
    indices: Vec<usize>,
    cursor: usize,
    device: B::Device,
    reported: bool,
}

impl<B: Backend> Iterator for BatchIter<'_, B> {
    type Item = ScanBatch<B>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.cursor < self.indices.len() {
            let end = (self.cursor + self.loader.batch_size).min(self.indices.len());
            let items = self.loader.load_items(&self.indices[self.cursor..end]);
            self.cursor = end;
            if !items.is_empty() {
                return Some(self.loader.batcher.batch(items, &self.device));
            }
        }
        if !self.reported {
            self.reported = true;
            let dropped = self.loader.dropped_last_pass();
            if dropped > 0 {
                tracing::warn!("{} of {} scans failed to load this pass", dropped, self.indices.len());
            }
        }
        None
    }
}

/// Loaders for every split.
///
/// `train` augments and shuffles; `train_eval` is the same records without
/// augmentation for metric passes; `val` is shuffled; `test` keeps its order.
#[derive(Debug)]
pub struct SplitLoaders {
    pub train: ScanLoader,
    pub train_eval: ScanLoader,
    pub val: Option<ScanLoader>,
    pub test: ScanLoader,
    pub classes: Vec<String>,
}

impl SplitLoaders {
    pub fn num_classes(&self) -> usize {
        self.classes.len()
    }

    /// Loader for a split name (`train`, `val`, `test`)
    pub fn eval_loader(&self, split: &str) -> Option<&ScanLoader> {
        match split {
            "train" => Some(&self.train_eval),
            "val" => self.val.as_ref(),
            "test" => Some(&self.test),
            _ => None,
        }
    }
}

pub fn prepare_validation_dataloaders(splits: &SplitDatasets, config: &Configuration) -> Result<SplitLoaders> {
    let dataset_cfg = &config.datasets;
    let seed = config.job.random_state;
    let (train_tf, eval_tf) = create_transforms(&config.preprocessing.transforms, config.job.use_transforms)?;
    let encoding = encoding_for(&splits.classes);

    let pool = if dataset_cfg.num_workers > 0 {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(dataset_cfg.num_workers)
            .build()
            .map_err(|e| CxrError::Dataset(format!("failed to start loader workers: {}", e)))?;
        Some(Arc::new(pool))
    } else {
        None
    };
    let batch_size = dataset_cfg.batch_size;

    let train = ScanLoader::new(
        ScanDataset::from_records(&splits.train, &encoding, train_tf, seed)?,
        batch_size,
        true,
        seed,
        pool.clone(),
    )?;
    let train_eval = ScanLoader::new(
        ScanDataset::from_records(&splits.train, &encoding, eval_tf.clone(), seed)?,
        batch_size,
        false,
        seed,
        pool.clone(),
    )?;
    let val = if splits.val.is_empty() {
        None
    } else {
        Some(ScanLoader::new(
            ScanDataset::from_records(&splits.val, &encoding, eval_tf.clone(), seed)?,
            batch_size,
            true,
            seed,
            pool.clone(),
        )?)
    };
    let test = ScanLoader::new(
        ScanDataset::from_records(&splits.test, &encoding, eval_tf, seed)?,
        batch_size,
        false,
        seed,
        pool,
    )?;

    tracing::info!(
        "Dataloaders ready: train {} / val {} / test {} batches",
        train.num_batches(),
        val.as_ref().map(ScanLoader::num_batches).unwrap_or(0),
        test.num_batches()
    );

    Ok(SplitLoaders {
        train,
        train_eval,
        val,
        test,
        classes: splits.classes.clone(),
    })
}
