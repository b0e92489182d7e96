//! Burn Dataset integration for scan collections
//!
//! `ScanDataset` implements Burn's `Dataset` over `(path, label)` samples and
//! runs the split's `Transforms` when an item is fetched. Training datasets
//! draw a fresh augmentation RNG per fetch, derived from the run seed.
//! `ScanBatcher` stacks items into `[B, C, H, W]` tensors.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use burn::data::dataloader::batcher::Batcher;
use burn::data::dataset::Dataset;
use burn::prelude::*;
use indicatif::{ProgressBar, ProgressStyle};
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use super::transforms::{ScanImage, Transforms};
use super::Record;
use crate::utils::error::{CxrError, Result};

/// A single transformed scan ready for Burn
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ScanItem {
    /// Image data as flattened CHW float array
    pub image: Vec<f32>,
    /// Encoded class index
    pub label: usize,
    pub path: String,
}

/// Lazily loaded scan dataset
#[derive(Clone)]
pub struct ScanDataset {
    samples: Vec<(PathBuf, usize)>,
    transforms: Transforms,
    seed: u64,
    /// Incremented on every fetch so repeated epochs see new augmentations
    draws: Arc<AtomicU64>,
    /// Decoded [0, 1] scans, before augmentation
    cached: Option<Arc<Vec<ScanImage>>>,
}

impl std::fmt::Debug for ScanDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScanDataset")
            .field("len", &self.samples.len())
            .field("augmenting", &self.transforms.is_augmenting())
            .field("cached", &self.cached.is_some())
            .finish()
    }
}

impl ScanDataset {
    pub fn new(samples: Vec<(PathBuf, usize)>, transforms: Transforms, seed: u64) -> Self {
        Self {
            samples,
            transforms,
            seed,
            draws: Arc::new(AtomicU64::new(0)),
            cached: None,
        }
    }

    /// Encode each record's joined label with `encoding`
    pub fn from_records(
        records: &[Record],
        encoding: &BTreeMap<String, usize>,
        transforms: Transforms,
        seed: u64,
    ) -> Result<Self> {
        let samples = records
            .iter()
            .map(|r| {
                let label = r.label();
                encoding
                    .get(&label)
                    .map(|idx| (r.image.clone(), *idx))
                    .ok_or_else(|| CxrError::Dataset(format!("label '{}' is not in the class encoding", label)))
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(samples, transforms, seed))
    }

    /// Unlabelled dataset (every label is 0), used for generative training
    pub fn unlabelled(records: &[Record], transforms: Transforms, seed: u64) -> Self {
        let samples = records.iter().map(|r| (r.image.clone(), 0)).collect();
        Self::new(samples, transforms, seed)
    }

    /// Decode every scan up front in parallel; unreadable scans are dropped
    pub fn cached(self) -> Self {
        let total = self.samples.len();
        tracing::info!("Pre-loading {} scans into memory...", total);

        let pb = ProgressBar::new(total as u64);
        if let Ok(style) =
            ProgressStyle::default_bar().template("  {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({per_sec})")
        {
            pb.set_style(style.progress_chars("#>-"));
        }

        let loaded = AtomicUsize::new(0);
        let results: Vec<Option<((PathBuf, usize), ScanImage)>> = self
            .samples
            .par_iter()
            .map(|(path, label)| {
                let result = match self.transforms.load(path) {
                    Ok(img) => Some(((path.clone(), *label), img)),
                    Err(e) => {
                        tracing::warn!("Skipping {}: {}", path.display(), e);
                        None
                    }
                };
                let count = loaded.fetch_add(1, Ordering::Relaxed);
                if count % 100 == 0 {
                    pb.set_position(count as u64);
                }
                result
            })
            .collect();

        let (samples, images): (Vec<_>, Vec<_>) = results.into_iter().flatten().unzip();
        pb.finish_with_message(format!("Loaded {} scans", images.len()));

        Self {
            samples,
            cached: Some(Arc::new(images)),
            ..self
        }
    }

    pub fn labels(&self) -> Vec<usize> {
        self.samples.iter().map(|(_, label)| *label).collect()
    }

    pub fn transforms(&self) -> &Transforms {
        &self.transforms
    }

    fn rng_for(&self, index: usize) -> ChaCha8Rng {
        let draw = self.draws.fetch_add(1, Ordering::Relaxed);
        let stream = draw.wrapping_mul(0x9E37_79B9_7F4A_7C15) ^ index as u64;
        ChaCha8Rng::seed_from_u64(self.seed ^ stream)
    }

    /// Decode, augment and finish the scan at `index`
    pub(crate) fn load_item(&self, index: usize) -> Result<ScanItem> {
        let (path, label) = &self.samples[index];
        let image = match &self.cached {
            Some(cache) => cache[index].clone(),
            None => self.transforms.load(path)?,
        };
        let image = if self.transforms.is_augmenting() {
            let mut rng = self.rng_for(index);
            self.transforms.augment(image, &mut rng)
        } else {
            image
        };
        Ok(ScanItem {
            image: self.transforms.finish(image),
            label: *label,
            path: path.to_string_lossy().to_string(),
        })
    }
}

impl Dataset<ScanItem> for ScanDataset {
    fn get(&self, index: usize) -> Option<ScanItem> {
        if index >= self.samples.len() {
            return None;
        }
        match self.load_item(index) {
            Ok(item) => Some(item),
            Err(e) => {
                tracing::warn!("Failed to load sample {}: {}", index, e);
                None
            }
        }
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}

/// A batch of scans
#[derive(Clone, Debug)]
pub struct ScanBatch<B: Backend> {
    /// `[batch_size, channels, height, width]`
    pub images: Tensor<B, 4>,
    /// `[batch_size]`
    pub targets: Tensor<B, 1, Int>,
    /// Source path of each scan, in batch order
    pub paths: Vec<String>,
}

/// Stacks `ScanItem`s into a `ScanBatch`
#[derive(Clone, Debug)]
pub struct ScanBatcher {
    channels: usize,
    image_size: usize,
}

impl ScanBatcher {
    pub fn new(channels: usize, image_size: usize) -> Self {
        Self { channels, image_size }
    }

    pub fn from_transforms(transforms: &Transforms) -> Self {
        Self::new(transforms.channels(), transforms.spatial_size())
    }
}

impl<B: Backend> Batcher<B, ScanItem, ScanBatch<B>> for ScanBatcher {
    fn batch(&self, items: Vec<ScanItem>, device: &B::Device) -> ScanBatch<B> {
        let batch_size = items.len();
        let (channels, height, width) = (self.channels, self.image_size, self.image_size);

        let mut images_data = Vec::with_capacity(batch_size * channels * height * width);
        let mut targets_data = Vec::with_capacity(batch_size);
        let mut paths = Vec::with_capacity(batch_size);
        for item in items {
            images_data.extend(item.image);
            targets_data.push(item.label as i64);
            paths.push(item.path);
        }

        let images = Tensor::<B, 4>::from_floats(
            TensorData::new(images_data, [batch_size, channels, height, width]),
            device,
        );
        let targets = Tensor::<B, 1, Int>::from_data(TensorData::new(targets_data, [batch_size]), device);

        ScanBatch { images, targets, paths }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dataset::transforms::{create_transforms, TransformConfig};
    use burn_ndarray::NdArray;
    use image::GrayImage;

    type TestBackend = NdArray;

    fn write_scans(dir: &std::path::Path, n: usize) -> Vec<Record> {
        (0..n)
            .map(|i| {
                let path = dir.join(format!("{}.png", i));
                GrayImage::from_fn(12, 12, |x, y| image::Luma([((x + y + i as u32) * 9) as u8]))
                    .save(&path)
                    .unwrap();
                let label = if i % 2 == 0 { "NORMAL" } else { "PNEUMONIA" };
                Record::new(i.to_string(), path, vec![label.to_string()])
            })
            .collect()
    }

    fn encoding() -> BTreeMap<String, usize> {
        BTreeMap::from([("NORMAL".to_string(), 0), ("PNEUMONIA".to_string(), 1)])
    }

    fn transforms(augment: bool) -> Transforms {
        let config = TransformConfig {
            spatial_size: 8,
            ..Default::default()
        };
        let (train, eval) = create_transforms(&config, true).unwrap();
        if augment {
            train
        } else {
            eval
        }
    }

    #[test]
    fn test_from_records_encodes_labels() {
        let dir = tempfile::tempdir().unwrap();
        let records = write_scans(dir.path(), 4);
        let dataset = ScanDataset::from_records(&records, &encoding(), transforms(false), 0).unwrap();
        assert_eq!(dataset.len(), 4);
        assert_eq!(dataset.labels(), vec![0, 1, 0, 1]);

        let item = dataset.get(1).unwrap();
        assert_eq!(item.image.len(), 64);
        assert_eq!(item.label, 1);
        assert!(dataset.get(4).is_none());
    }

    #[test]
    fn test_unknown_label_is_an_error() {
        let records = vec![Record::new("x", "x.png", vec!["Mass".to_string()])];
        assert!(ScanDataset::from_records(&records, &encoding(), transforms(false), 0).is_err());
    }

    #[test]
    fn test_cached_skips_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let mut records = write_scans(dir.path(), 3);
        records.push(Record::new("bad", dir.path().join("missing.png"), vec!["NORMAL".to_string()]));

        let dataset = ScanDataset::from_records(&records, &encoding(), transforms(false), 0)
            .unwrap()
            .cached();
        assert_eq!(dataset.len(), 3);
        let lazy = ScanDataset::from_records(&records[..3], &encoding(), transforms(false), 0).unwrap();
        assert_eq!(dataset.get(2).unwrap().image, lazy.get(2).unwrap().image);
    }

    #[test]
    fn test_eval_items_are_stable() {
        let dir = tempfile::tempdir().unwrap();
        let records = write_scans(dir.path(), 2);
        let dataset = ScanDataset::from_records(&records, &encoding(), transforms(false), 5).unwrap();
        assert_eq!(dataset.get(0).unwrap().image, dataset.get(0).unwrap().image);
    }

    #[test]
    fn test_batcher_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let records = write_scans(dir.path(), 3);
        let dataset = ScanDataset::from_records(&records, &encoding(), transforms(true), 1).unwrap();
        let items: Vec<ScanItem> = (0..3).filter_map(|i| dataset.get(i)).collect();

        let device = Default::default();
        let batcher = ScanBatcher::from_transforms(dataset.transforms());
        let batch: ScanBatch<TestBackend> = batcher.batch(items, &device);
        assert_eq!(batch.images.dims(), [3, 1, 8, 8]);
        assert_eq!(batch.targets.dims(), [3]);
        assert_eq!(batch.paths.len(), 3);
    }
}
