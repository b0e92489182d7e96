//! Scan loading and on-the-fly augmentation
//!
//! Every scan goes through the same load pipeline: decode (2D image or the
//! middle slice of a NIfTI volume), resize to `spatial_size`, min-max scale
//! to [0, 1]. Training scans are then randomly augmented. Finally intensities
//! are mapped to the configured range and optionally normalized per channel.
//!
//! - **Training**: load, augment, finish
//! - **Validation/Test**: load, finish

use std::path::Path;

use image::imageops::{self, FilterType};
use image::{ImageBuffer, Luma};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use super::ixi::load_middle_slice;
use crate::utils::error::{CxrError, Result};
use crate::utils::is_nifti;

/// Output intensity range of a transformed scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntensityRange {
    #[default]
    ZeroOne,
    /// Used by diffusion training
    MinusOneOne,
}

/// Per-channel `(x - mean) / std`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Normalize {
    pub mean: Vec<f32>,
    pub std: Vec<f32>,
}

/// Load transforms plus the training augmentations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransformConfig {
    /// Square output size in pixels
    pub spatial_size: u32,
    /// 1 (grayscale) or 3 (replicated / RGB)
    pub channels: usize,
    pub range: IntensityRange,
    pub normalize: Option<Normalize>,
    pub augmentation: AugmentationConfig,
}

impl Default for TransformConfig {
    fn default() -> Self {
        Self {
            spatial_size: 224,
            channels: 1,
            range: IntensityRange::ZeroOne,
            normalize: None,
            augmentation: AugmentationConfig::default(),
        }
    }
}

impl TransformConfig {
    pub fn validate(&self) -> Result<()> {
        if self.channels != 1 && self.channels != 3 {
            return Err(CxrError::Config(format!(
                "transforms.channels must be 1 or 3, got {}",
                self.channels
            )));
        }
        if self.spatial_size == 0 {
            return Err(CxrError::Config("transforms.spatial_size must be positive".to_string()));
        }
        if let Some(norm) = &self.normalize {
            if norm.mean.len() != self.channels || norm.std.len() != self.channels {
                return Err(CxrError::Config(format!(
                    "transforms.normalize needs {} mean/std values",
                    self.channels
                )));
            }
            if norm.std.iter().any(|s| *s <= 0.0) {
                return Err(CxrError::Config("transforms.normalize std must be positive".to_string()));
            }
        }
        let aug = &self.augmentation;
        for (name, value) in [
            ("rotation_degrees", aug.rotation_degrees),
            ("brightness_delta", aug.brightness_delta),
            ("contrast_delta", aug.contrast_delta),
        ] {
            if value.is_nan() || value < 0.0 {
                return Err(CxrError::Config(format!(
                    "transforms.augmentation.{} must be non-negative, got {}",
                    name, value
                )));
            }
        }
        Ok(())
    }
}

/// Random training augmentations
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AugmentationConfig {
    /// Probability of applying horizontal flip (0.0 - 1.0)
    pub horizontal_flip_prob: f32,
    /// Maximum rotation angle in degrees (applies ±rotation_degrees)
    pub rotation_degrees: f32,
    pub rotation_prob: f32,
    /// Brightness shift range (±brightness_delta) on [0, 1] intensities
    pub brightness_delta: f32,
    pub brightness_prob: f32,
    /// Contrast factor range (1.0 ± contrast_delta)
    pub contrast_delta: f32,
    pub contrast_prob: f32,
}

impl Default for AugmentationConfig {
    fn default() -> Self {
        Self {
            horizontal_flip_prob: 0.5,
            rotation_degrees: 10.0,
            rotation_prob: 0.5,
            brightness_delta: 0.1,
            brightness_prob: 0.3,
            contrast_delta: 0.1,
            contrast_prob: 0.3,
        }
    }
}

impl AugmentationConfig {
    /// Disable all augmentations
    pub fn none() -> Self {
        Self {
            horizontal_flip_prob: 0.0,
            rotation_degrees: 0.0,
            rotation_prob: 0.0,
            brightness_delta: 0.0,
            brightness_prob: 0.0,
            contrast_delta: 0.0,
            contrast_prob: 0.0,
        }
    }
}

/// Planar float image, `data` laid out channel-major (CHW)
#[derive(Debug, Clone, PartialEq)]
pub struct ScanImage {
    pub channels: usize,
    pub height: usize,
    pub width: usize,
    pub data: Vec<f32>,
}

impl ScanImage {
    pub fn new(channels: usize, height: usize, width: usize, data: Vec<f32>) -> Result<Self> {
        if data.len() != channels * height * width {
            return Err(CxrError::InvalidInput(format!(
                "image buffer has {} values, expected {}x{}x{}",
                data.len(),
                channels,
                height,
                width
            )));
        }
        Ok(Self {
            channels,
            height,
            width,
            data,
        })
    }

    fn plane(&self) -> usize {
        self.height * self.width
    }

    pub fn get(&self, c: usize, y: usize, x: usize) -> f32 {
        self.data[c * self.plane() + y * self.width + x]
    }

    /// Min-max scale every value into [0, 1]; a constant image becomes zeros
    pub fn scale_intensity(&mut self) {
        let (min, max) = self
            .data
            .iter()
            .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| (lo.min(*v), hi.max(*v)));
        let span = max - min;
        if !span.is_finite() || span <= f32::EPSILON {
            self.data.iter_mut().for_each(|v| *v = 0.0);
            return;
        }
        self.data.iter_mut().for_each(|v| *v = (*v - min) / span);
    }
}

/// Decode a scan, resize it to `size`x`size` and return it with `channels` channels
pub fn load_scan(path: &Path, size: u32, channels: usize) -> Result<ScanImage> {
    let side = size as usize;
    if is_nifti(path) {
        let (width, height, pixels) = load_middle_slice(path)?;
        let buffer: ImageBuffer<Luma<f32>, Vec<f32>> =
            ImageBuffer::from_raw(width as u32, height as u32, pixels)
                .ok_or_else(|| CxrError::ImageLoad(path.to_path_buf(), "slice size mismatch".to_string()))?;
        let resized = imageops::resize(&buffer, size, size, FilterType::Triangle);
        let plane = resized.into_raw();
        let data = plane.repeat(channels);
        return ScanImage::new(channels, side, side, data);
    }

    let img = image::open(path).map_err(|e| CxrError::ImageLoad(path.to_path_buf(), e.to_string()))?;
    let img = img.resize_exact(size, size, FilterType::Triangle);

    let data = if channels == 3 {
        let rgb = img.to_rgb32f();
        let plane = side * side;
        let mut data = vec![0.0f32; 3 * plane];
        for (i, pixel) in rgb.pixels().enumerate() {
            for c in 0..3 {
                data[c * plane + i] = pixel[c];
            }
        }
        data
    } else {
        img.to_luma32f().into_raw()
    };
    ScanImage::new(channels, side, side, data)
}

/// Random augmenter over [0, 1] scans
#[derive(Debug, Clone)]
pub struct Augmenter {
    config: AugmentationConfig,
}

impl Augmenter {
    pub fn new(config: AugmentationConfig) -> Self {
        Self { config }
    }

    pub fn augment(&self, mut img: ScanImage, rng: &mut ChaCha8Rng) -> ScanImage {
        if rng.gen::<f32>() < self.config.horizontal_flip_prob {
            img = flip_horizontal(&img);
        }

        if self.config.rotation_prob > 0.0 && rng.gen::<f32>() < self.config.rotation_prob {
            let angle = rng.gen_range(-self.config.rotation_degrees..=self.config.rotation_degrees);
            img = rotate(&img, angle);
        }

        if self.config.brightness_prob > 0.0 && rng.gen::<f32>() < self.config.brightness_prob {
            let delta = rng.gen_range(-self.config.brightness_delta..=self.config.brightness_delta);
            adjust_brightness(&mut img, delta);
        }

        if self.config.contrast_prob > 0.0 && rng.gen::<f32>() < self.config.contrast_prob {
            let factor = 1.0 + rng.gen_range(-self.config.contrast_delta..=self.config.contrast_delta);
            adjust_contrast(&mut img, factor);
        }

        img
    }
}

fn flip_horizontal(img: &ScanImage) -> ScanImage {
    let mut out = img.clone();
    let plane = img.plane();
    for c in 0..img.channels {
        for y in 0..img.height {
            for x in 0..img.width {
                out.data[c * plane + y * img.width + x] = img.get(c, y, img.width - 1 - x);
            }
        }
    }
    out
}

/// Rotate around the image centre; pixels sampled from outside become 0
fn rotate(img: &ScanImage, angle_degrees: f32) -> ScanImage {
    if angle_degrees.abs() < 0.1 {
        return img.clone();
    }

    let angle = angle_degrees.to_radians();
    let (cos_a, sin_a) = (angle.cos(), angle.sin());
    let cx = img.width as f32 / 2.0;
    let cy = img.height as f32 / 2.0;

    let mut out = img.clone();
    let plane = img.plane();
    for y in 0..img.height {
        for x in 0..img.width {
            let dx = x as f32 - cx;
            let dy = y as f32 - cy;
            let src_x = cx + dx * cos_a + dy * sin_a;
            let src_y = cy - dx * sin_a + dy * cos_a;
            for c in 0..img.channels {
                out.data[c * plane + y * img.width + x] = bilinear_sample(img, c, src_x, src_y);
            }
        }
    }
    out
}

fn bilinear_sample(img: &ScanImage, c: usize, x: f32, y: f32) -> f32 {
    if x < 0.0 || y < 0.0 || x > (img.width - 1) as f32 || y > (img.height - 1) as f32 {
        return 0.0;
    }

    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    let x1 = (x0 + 1).min(img.width - 1);
    let y1 = (y0 + 1).min(img.height - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;

    img.get(c, y0, x0) * (1.0 - fx) * (1.0 - fy)
        + img.get(c, y0, x1) * fx * (1.0 - fy)
        + img.get(c, y1, x0) * (1.0 - fx) * fy
        + img.get(c, y1, x1) * fx * fy
}

fn adjust_brightness(img: &mut ScanImage, delta: f32) {
    img.data.iter_mut().for_each(|v| *v = (*v + delta).clamp(0.0, 1.0));
}

/// Scale around the mean intensity
fn adjust_contrast(img: &mut ScanImage, factor: f32) {
    if img.data.is_empty() {
        return;
    }
    let mean = img.data.iter().sum::<f32>() / img.data.len() as f32;
    img.data
        .iter_mut()
        .for_each(|v| *v = ((*v - mean) * factor + mean).clamp(0.0, 1.0));
}

/// A complete per-split pipeline
#[derive(Debug, Clone)]
pub struct Transforms {
    spatial_size: u32,
    channels: usize,
    range: IntensityRange,
    normalize: Option<Normalize>,
    augmenter: Option<Augmenter>,
}

impl Transforms {
    pub fn spatial_size(&self) -> usize {
        self.spatial_size as usize
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn is_augmenting(&self) -> bool {
        self.augmenter.is_some()
    }

    /// Decode, resize and scale to [0, 1]
    pub fn load(&self, path: &Path) -> Result<ScanImage> {
        let mut img = load_scan(path, self.spatial_size, self.channels)?;
        img.scale_intensity();
        Ok(img)
    }

    /// Random augmentations of a training pipeline; identity otherwise
    pub fn augment(&self, img: ScanImage, rng: &mut ChaCha8Rng) -> ScanImage {
        match &self.augmenter {
            Some(augmenter) => augmenter.augment(img, rng),
            None => img,
        }
    }

    /// Map [0, 1] intensities to the output range, then normalize
    pub fn finish(&self, img: ScanImage) -> Vec<f32> {
        let plane = img.plane();
        let mut data = img.data;
        if self.range == IntensityRange::MinusOneOne {
            data.iter_mut().for_each(|v| *v = *v * 2.0 - 1.0);
        }
        if let Some(norm) = &self.normalize {
            for (i, v) in data.iter_mut().enumerate() {
                let c = i / plane;
                *v = (*v - norm.mean[c]) / norm.std[c];
            }
        }
        data
    }

    /// Full pipeline; augmentations run only when this is a training pipeline and `rng` is given
    pub fn apply(&self, path: &Path, rng: Option<&mut ChaCha8Rng>) -> Result<Vec<f32>> {
        let mut img = self.load(path)?;
        if let Some(rng) = rng {
            img = self.augment(img, rng);
        }
        Ok(self.finish(img))
    }
}

/// Build `(train, eval)` pipelines. The training pipeline augments only when
/// `use_transforms` is set; the evaluation pipeline never does.
pub fn create_transforms(config: &TransformConfig, use_transforms: bool) -> Result<(Transforms, Transforms)> {
    config.validate()?;
    let eval = Transforms {
        spatial_size: config.spatial_size,
        channels: config.channels,
        range: config.range,
        normalize: config.normalize.clone(),
        augmenter: None,
    };
    let train = Transforms {
        augmenter: use_transforms.then(|| Augmenter::new(config.augmentation.clone())),
        ..eval.clone()
    };
    tracing::debug!(
        "Transforms: size {}, {} channel(s), range {:?}, augment train: {}",
        config.spatial_size,
        config.channels,
        config.range,
        use_transforms
    );
    Ok((train, eval))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, RgbImage};
    use rand::SeedableRng;

    fn gradient(width: usize, height: usize) -> ScanImage {
        let data = (0..width * height).map(|i| (i % width) as f32 / (width - 1) as f32).collect();
        ScanImage::new(1, height, width, data).unwrap()
    }

    #[test]
    fn test_scan_image_checks_length() {
        assert!(ScanImage::new(1, 2, 2, vec![0.0; 3]).is_err());
        assert!(ScanImage::new(3, 2, 2, vec![0.0; 12]).is_ok());
    }

    #[test]
    fn test_scale_intensity() {
        let mut img = ScanImage::new(1, 1, 3, vec![10.0, 20.0, 30.0]).unwrap();
        img.scale_intensity();
        assert_eq!(img.data, vec![0.0, 0.5, 1.0]);

        let mut flat = ScanImage::new(1, 1, 2, vec![7.0, 7.0]).unwrap();
        flat.scale_intensity();
        assert_eq!(flat.data, vec![0.0, 0.0]);
    }

    #[test]
    fn test_flip_horizontal() {
        let img = gradient(4, 2);
        let flipped = flip_horizontal(&img);
        assert_eq!(flipped.get(0, 0, 0), 1.0);
        assert_eq!(flipped.get(0, 1, 3), 0.0);
    }

    #[test]
    fn test_small_rotation_is_identity() {
        let img = gradient(8, 8);
        assert_eq!(rotate(&img, 0.05), img);
    }

    #[test]
    fn test_rotation_keeps_centre() {
        let mut img = ScanImage::new(1, 9, 9, vec![0.0; 81]).unwrap();
        img.data[4 * 9 + 4] = 1.0;
        let rotated = rotate(&img, 90.0);
        assert!(rotated.data.iter().all(|v| (0.0..=1.0).contains(v)));
        assert_eq!(rotated.data.len(), 81);
    }

    #[test]
    fn test_brightness_and_contrast_clamp() {
        let mut img = gradient(4, 1);
        adjust_brightness(&mut img, 0.5);
        assert!(img.data.iter().all(|v| *v <= 1.0));
        assert_eq!(img.data[3], 1.0);

        let mut img = gradient(4, 1);
        adjust_contrast(&mut img, 3.0);
        assert_eq!(img.data[0], 0.0);
        assert_eq!(img.data[3], 1.0);
    }

    #[test]
    fn test_augmenter_is_deterministic_for_seed() {
        let augmenter = Augmenter::new(AugmentationConfig {
            horizontal_flip_prob: 1.0,
            rotation_prob: 1.0,
            brightness_prob: 1.0,
            contrast_prob: 1.0,
            ..Default::default()
        });
        let img = gradient(16, 16);
        let a = augmenter.augment(img.clone(), &mut ChaCha8Rng::seed_from_u64(3));
        let b = augmenter.augment(img.clone(), &mut ChaCha8Rng::seed_from_u64(3));
        assert_eq!(a, b);
        assert_ne!(a, img);
    }

    #[test]
    fn test_load_grayscale_png() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.png");
        let img = GrayImage::from_fn(32, 32, |x, _| image::Luma([(x * 8) as u8]));
        img.save(&path).unwrap();

        let (_, eval) = create_transforms(
            &TransformConfig {
                spatial_size: 16,
                ..Default::default()
            },
            true,
        )
        .unwrap();
        let data = eval.apply(&path, None).unwrap();
        assert_eq!(data.len(), 16 * 16);
        let max = data.iter().cloned().fold(f32::MIN, f32::max);
        let min = data.iter().cloned().fold(f32::MAX, f32::min);
        assert!((max - 1.0).abs() < 1e-6);
        assert!(min.abs() < 1e-6);
    }

    #[test]
    fn test_load_rgb_minus_one_one() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scan.jpg");
        RgbImage::from_fn(20, 20, |x, y| image::Rgb([(x * 10) as u8, (y * 10) as u8, 128]))
            .save(&path)
            .unwrap();

        let config = TransformConfig {
            spatial_size: 8,
            channels: 3,
            range: IntensityRange::MinusOneOne,
            ..Default::default()
        };
        let (train, eval) = create_transforms(&config, false).unwrap();
        assert!(!train.is_augmenting());
        let data = eval.apply(&path, None).unwrap();
        assert_eq!(data.len(), 3 * 8 * 8);
        assert!(data.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn test_normalize() {
        let config = TransformConfig {
            normalize: Some(Normalize {
                mean: vec![0.5],
                std: vec![0.25],
            }),
            ..Default::default()
        };
        let (_, eval) = create_transforms(&config, false).unwrap();
        let img = ScanImage::new(1, 1, 2, vec![0.0, 1.0]).unwrap();
        assert_eq!(eval.finish(img), vec![-2.0, 2.0]);
    }

    #[test]
    fn test_invalid_config() {
        let config = TransformConfig {
            channels: 2,
            ..Default::default()
        };
        assert!(create_transforms(&config, true).is_err());

        let config = TransformConfig {
            normalize: Some(Normalize {
                mean: vec![0.5, 0.5, 0.5],
                std: vec![0.2, 0.2, 0.2],
            }),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let mut config = TransformConfig::default();
        config.augmentation.rotation_degrees = -5.0;
        assert!(create_transforms(&config, true).is_err());
        config.augmentation.rotation_degrees = 5.0;
        config.augmentation.contrast_delta = -0.1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_missing_file() {
        let (_, eval) = create_transforms(&TransformConfig::default(), false).unwrap();
        assert!(matches!(
            eval.apply(Path::new("/no/such/scan.png"), None),
            Err(CxrError::ImageLoad(_, _))
        ));
    }
}
