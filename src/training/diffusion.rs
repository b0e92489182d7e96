//! Denoising diffusion (DDPM) training
//!
//! The UNet learns to predict the Gaussian noise mixed into a scan at a
//! random timestep. Training runs on the event engine: one MSE step per
//! batch, with a per-step warmup/cosine learning rate. Every
//! `log_interval` epochs, and after the last one, a sample grid and the
//! model weights are written under the output directory.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use burn::{
    grad_clipping::GradientClippingConfig,
    module::{AutodiffModule, Module},
    nn::loss::{MseLoss, Reduction},
    optim::{AdamConfig, GradientsParams, Optimizer},
    record::CompactRecorder,
    tensor::{
        backend::{AutodiffBackend, Backend},
        Distribution, ElementConversion, Int, Tensor, TensorData,
    },
};
use image::{GrayImage, RgbImage};
use indicatif::{ProgressBar, ProgressStyle};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use super::scheduler::cosine_with_warmup;
use super::supervised::prepare_run;
use crate::config::{Configuration, DiffusionConfig};
use crate::dataset::loader::ScanLoader;
use crate::dataset::transforms::{create_transforms, IntensityRange};
use crate::dataset::{instantiate_image_dataset, ScanBatch, ScanDataset};
use crate::engine::{Engine, Event, Process, State};
use crate::model::{unet_config, DiffusionUNet};
use crate::tracking::{start_run, RunStatus, Tracker};
use crate::utils::ensure_dir;
use crate::utils::error::{CxrError, Result};
use crate::utils::logging::TrainingLogger;

/// DDPM noise schedule with linearly spaced betas
#[derive(Debug, Clone)]
pub struct NoiseScheduler {
    num_train_timesteps: usize,
    betas: Vec<f64>,
    alphas_cumprod: Vec<f64>,
    /// Descending inference timesteps set by `set_timesteps`
    timesteps: Vec<usize>,
    num_inference_steps: Option<usize>,
}

impl NoiseScheduler {
    pub fn new(num_train_timesteps: usize, beta_start: f64, beta_end: f64) -> Self {
        let n = num_train_timesteps.max(1);
        let betas: Vec<f64> = (0..n)
            .map(|i| {
                if n == 1 {
                    beta_start
                } else {
                    beta_start + (beta_end - beta_start) * i as f64 / (n - 1) as f64
                }
            })
            .collect();
        let alphas_cumprod = betas
            .iter()
            .scan(1.0, |acc, beta| {
                *acc *= 1.0 - beta;
                Some(*acc)
            })
            .collect();

        Self {
            num_train_timesteps: n,
            betas,
            alphas_cumprod,
            timesteps: (0..n).rev().collect(),
            num_inference_steps: None,
        }
    }

    pub fn from_config(config: &DiffusionConfig) -> Self {
        Self::new(config.num_train_timesteps, config.beta_start, config.beta_end)
    }

    pub fn num_train_timesteps(&self) -> usize {
        self.num_train_timesteps
    }

    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    pub fn alphas_cumprod(&self) -> &[f64] {
        &self.alphas_cumprod
    }

    pub fn timesteps(&self) -> &[usize] {
        &self.timesteps
    }

    /// `sqrt(a_t) * x0 + sqrt(1 - a_t) * noise`, one timestep per sample
    pub fn add_noise<B: Backend>(&self, original: Tensor<B, 4>, noise: Tensor<B, 4>, timesteps: &[usize]) -> Tensor<B, 4> {
        let device = original.device();
        let batch = timesteps.len();
        let coefficient = |f: fn(f64) -> f64| {
            let values: Vec<f32> = timesteps
                .iter()
                .map(|&t| f(self.alphas_cumprod[t.min(self.num_train_timesteps - 1)]) as f32)
                .collect();
            Tensor::<B, 4>::from_floats(TensorData::new(values, [batch, 1, 1, 1]), &device)
        };
        let signal = coefficient(|a| a.sqrt());
        let noise_level = coefficient(|a| (1.0 - a).sqrt());
        original * signal + noise * noise_level
    }

    /// Evenly spaced descending timesteps for sampling
    pub fn set_timesteps(&mut self, num_inference_steps: usize) {
        let steps = num_inference_steps.clamp(1, self.num_train_timesteps);
        let step_ratio = self.num_train_timesteps / steps;
        self.timesteps = (0..steps).rev().map(|i| i * step_ratio).collect();
        self.num_inference_steps = Some(steps);
    }

    fn previous_timestep(&self, timestep: usize) -> Option<usize> {
        let stride = match self.num_inference_steps {
            Some(steps) => self.num_train_timesteps / steps,
            None => 1,
        };
        timestep.checked_sub(stride)
    }

    /// `x0` implied by a noise prediction, clipped to [-1, 1]
    pub fn predict_original<B: Backend>(&self, model_output: Tensor<B, 4>, timestep: usize, sample: Tensor<B, 4>) -> Tensor<B, 4> {
        let alpha_prod_t = self.alphas_cumprod[timestep];
        (sample - model_output.mul_scalar((1.0 - alpha_prod_t).sqrt()))
            .div_scalar(alpha_prod_t.sqrt())
            .clamp(-1.0, 1.0)
    }

    /// One reverse step `x_t -> x_{t-1}`. `noise` is only used for `t > 0`.
    pub fn step<B: Backend>(
        &self,
        model_output: Tensor<B, 4>,
        timestep: usize,
        sample: Tensor<B, 4>,
        noise: Tensor<B, 4>,
    ) -> Tensor<B, 4> {
        let alpha_prod_t = self.alphas_cumprod[timestep];
        let alpha_prod_prev = self
            .previous_timestep(timestep)
            .map(|t| self.alphas_cumprod[t])
            .unwrap_or(1.0);
        let beta_prod_t = 1.0 - alpha_prod_t;
        let beta_prod_prev = 1.0 - alpha_prod_prev;
        let current_alpha = alpha_prod_t / alpha_prod_prev;
        let current_beta = 1.0 - current_alpha;

        let pred_original = self.predict_original(model_output, timestep, sample.clone());
        let original_coeff = alpha_prod_prev.sqrt() * current_beta / beta_prod_t;
        let sample_coeff = current_alpha.sqrt() * beta_prod_prev / beta_prod_t;
        let mean = pred_original.mul_scalar(original_coeff) + sample.mul_scalar(sample_coeff);

        if timestep == 0 {
            return mean;
        }
        let variance = (beta_prod_prev / beta_prod_t * current_beta).max(1e-20);
        mean + noise.mul_scalar(variance.sqrt())
    }
}

/// Run the full reverse process from pure noise: `[n, channels, size, size]` in [-1, 1]
pub fn generate_samples<B: Backend>(
    model: &DiffusionUNet<B>,
    scheduler: &NoiseScheduler,
    num_inference_steps: usize,
    shape: [usize; 4],
    device: &B::Device,
) -> Tensor<B, 4> {
    let mut scheduler = scheduler.clone();
    scheduler.set_timesteps(num_inference_steps);

    let mut sample = Tensor::<B, 4>::random(shape, Distribution::Normal(0.0, 1.0), device);
    for &t in scheduler.timesteps() {
        let timesteps = Tensor::<B, 1, Int>::from_data(TensorData::new(vec![t as i64; shape[0]], [shape[0]]), device);
        let model_output = model.forward(sample.clone(), timesteps);
        let noise = Tensor::<B, 4>::random(shape, Distribution::Normal(0.0, 1.0), device);
        sample = scheduler.step(model_output, t, sample, noise);
    }
    sample.clamp(-1.0, 1.0)
}

/// Tile `grid * grid` CHW images in [-1, 1] into one PNG
pub fn save_image_grid(data: &[f32], shape: [usize; 4], grid: usize, path: &Path) -> Result<()> {
    let [n, channels, height, width] = shape;
    if data.len() != n * channels * height * width {
        return Err(CxrError::InvalidInput(format!(
            "grid data has {} values, expected {}",
            data.len(),
            n * channels * height * width
        )));
    }
    let to_u8 = |v: f32| (((v + 1.0) / 2.0).clamp(0.0, 1.0) * 255.0).round() as u8;
    let pixel = |idx: usize, c: usize, y: usize, x: usize| {
        to_u8(data[((idx * channels + c) * height + y) * width + x])
    };
    // cell (row, col) of the grid holds image row * grid + col, if present
    let locate = |gx: u32, gy: u32| {
        let (col, x) = (gx as usize / width, gx as usize % width);
        let (row, y) = (gy as usize / height, gy as usize % height);
        let idx = row * grid + col;
        (idx < n).then_some((idx, y, x))
    };
    let (grid_w, grid_h) = ((grid * width) as u32, (grid * height) as u32);

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let result = match channels {
        1 => GrayImage::from_fn(grid_w, grid_h, |gx, gy| {
            image::Luma([locate(gx, gy).map(|(i, y, x)| pixel(i, 0, y, x)).unwrap_or(0)])
        })
        .save(path),
        3 => RgbImage::from_fn(grid_w, grid_h, |gx, gy| {
            image::Rgb(match locate(gx, gy) {
                Some((i, y, x)) => [pixel(i, 0, y, x), pixel(i, 1, y, x), pixel(i, 2, y, x)],
                None => [0, 0, 0],
            })
        })
        .save(path),
        other => {
            return Err(CxrError::InvalidInput(format!(
                "cannot render {}-channel samples",
                other
            )))
        }
    };
    result.map_err(|e| CxrError::ImageLoad(path.to_path_buf(), e.to_string()))
}

/// One noise-prediction step per batch
pub struct DiffusionProcess<B: AutodiffBackend, O> {
    model: DiffusionUNet<B>,
    optimizer: O,
    scheduler: NoiseScheduler,
    rng: ChaCha8Rng,
    device: B::Device,
    base_lr: f64,
    learning_rate: f64,
    warmup_steps: usize,
    total_steps: usize,
    tracker: Arc<dyn Tracker>,
    logger: TrainingLogger,
    progress: Option<ProgressBar>,
    epoch_loss: f64,
    epoch_batches: usize,
    batches_per_epoch: usize,
}

impl<B: AutodiffBackend, O> DiffusionProcess<B, O> {
    pub fn model(&self) -> &DiffusionUNet<B> {
        &self.model
    }

    fn begin_epoch(&mut self, epoch: usize) {
        self.logger.start_epoch(epoch);
        self.epoch_loss = 0.0;
        self.epoch_batches = 0;
        let pb = ProgressBar::new(self.batches_per_epoch as u64);
        if let Ok(style) = ProgressStyle::default_bar().template("  {spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}") {
            pb.set_style(style.progress_chars("#>-"));
        }
        self.progress = Some(pb);
    }

    fn end_epoch(&mut self, epoch: usize) -> f64 {
        if let Some(pb) = self.progress.take() {
            pb.finish_and_clear();
        }
        let avg_loss = self.epoch_loss / self.epoch_batches.max(1) as f64;
        self.logger.end_epoch(epoch, avg_loss, self.learning_rate);
        avg_loss
    }

    /// Sample a grid with the current weights and save it with the model
    fn save_artifacts(&self, epoch: usize, output_dir: &Path, config: &DiffusionConfig, channels: usize, size: usize) -> Result<(PathBuf, PathBuf)> {
        let model = self.model.valid();
        let count = config.grid_size * config.grid_size;
        let shape = [count, channels, size, size];
        let samples = generate_samples(&model, &self.scheduler, config.num_inference_steps, shape, &self.device);
        let data = samples
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(|e| CxrError::Training(format!("failed to read samples: {:?}", e)))?;

        let grid_path = output_dir.join("samples").join(format!("{:04}.png", epoch));
        save_image_grid(&data, shape, config.grid_size, &grid_path)?;
        self.tracker.log_artifact(&grid_path, Some("samples"))?;

        let model_path = PathBuf::from(format!("{}.mpk", output_dir.join(format!("{:04}-model", epoch)).display()));
        self.model
            .clone()
            .save_file(model_path.clone(), &CompactRecorder::new())
            .map_err(|e| CxrError::Model(format!("Failed to save model: {:?}", e)))?;
        tracing::info!("Saved samples to {} and model to {}", grid_path.display(), model_path.display());
        Ok((grid_path, model_path))
    }
}

impl<B, O> Process for DiffusionProcess<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<DiffusionUNet<B>, B>,
{
    type Batch = ScanBatch<B>;

    fn step(&mut self, state: &State, batch: ScanBatch<B>) -> Result<f64> {
        let global_step = state.iteration.saturating_sub(1);
        self.learning_rate = cosine_with_warmup(global_step, self.warmup_steps, self.total_steps, self.base_lr);

        let images = batch.images;
        let shape = images.dims();
        let noise = Tensor::<B, 4>::random(shape, Distribution::Normal(0.0, 1.0), &self.device);
        let timesteps: Vec<usize> = (0..shape[0])
            .map(|_| self.rng.gen_range(0..self.scheduler.num_train_timesteps()))
            .collect();
        let noisy = self.scheduler.add_noise(images, noise.clone(), &timesteps);
        let timesteps = Tensor::<B, 1, Int>::from_data(
            TensorData::new(timesteps.iter().map(|&t| t as i64).collect::<Vec<_>>(), [shape[0]]),
            &self.device,
        );

        let predicted = self.model.forward(noisy, timesteps);
        let loss = MseLoss::new().forward(predicted, noise, Reduction::Mean);
        let loss_value: f64 = loss.clone().into_scalar().elem();
        if !loss_value.is_finite() {
            return Err(CxrError::Training(format!("loss diverged to {}", loss_value)));
        }

        let grads = GradientsParams::from_grads(loss.backward(), &self.model);
        self.model = self.optimizer.step(self.learning_rate, self.model.clone(), grads);

        self.tracker.log_metric("loss", loss_value, state.iteration)?;
        self.tracker.log_metric("lr", self.learning_rate, state.iteration)?;
        self.tracker.log_metric("step", state.iteration as f64, state.iteration)?;

        self.epoch_loss += loss_value;
        self.epoch_batches += 1;
        if let Some(pb) = &self.progress {
            pb.set_message(format!("loss {:.4} lr {:.2e}", loss_value, self.learning_rate));
            pb.inc(1);
        }
        Ok(loss_value)
    }
}

/// Outcome of a diffusion run
#[derive(Debug, Clone)]
pub struct DiffusionSummary {
    pub run_id: String,
    pub epochs_run: usize,
    pub final_loss: f64,
    pub sample_grids: Vec<PathBuf>,
    pub model_path: Option<PathBuf>,
}

/// Train the UNet on the training split of the configured dataset
pub fn train_diffusion<B: AutodiffBackend>(config: &Configuration, device: &B::Device) -> Result<DiffusionSummary> {
    prepare_run(config, "train")?;
    let diffusion = &config.diffusion;
    let seed = config.job.random_state;

    let mut transforms = config.preprocessing.transforms.clone();
    transforms.range = IntensityRange::MinusOneOne;
    transforms.normalize = None;
    if transforms.spatial_size % 4 != 0 {
        return Err(CxrError::Config(format!(
            "diffusion needs a spatial_size divisible by 4, got {}",
            transforms.spatial_size
        )));
    }
    let (train_tf, _) = create_transforms(&transforms, config.job.use_transforms)?;
    let (channels, size) = (train_tf.channels(), train_tf.spatial_size());

    let splits = instantiate_image_dataset(config, true)?;
    let loader = ScanLoader::new(
        ScanDataset::unlabelled(&splits.train, train_tf, seed),
        config.datasets.batch_size,
        true,
        seed,
        None,
    )?;
    if loader.is_empty() {
        return Err(CxrError::Dataset("training split is empty".to_string()));
    }

    let max_epochs = config.job.max_epochs;
    let batches_per_epoch = match config.job.epoch_length {
        Some(len) => len.min(loader.num_batches()),
        None => loader.num_batches(),
    };
    let tracker = start_run(config)?;
    let optimizer = AdamConfig::new()
        .with_grad_clipping(Some(GradientClippingConfig::Norm(diffusion.max_grad_norm)))
        .init();

    let process = DiffusionProcess {
        model: unet_config(diffusion, channels).init::<B>(device),
        optimizer,
        scheduler: NoiseScheduler::from_config(diffusion),
        rng: ChaCha8Rng::seed_from_u64(seed),
        device: device.clone(),
        base_lr: diffusion.learning_rate,
        learning_rate: 0.0,
        warmup_steps: diffusion.lr_warmup_steps,
        total_steps: batches_per_epoch * max_epochs,
        tracker: Arc::clone(&tracker),
        logger: TrainingLogger::new(max_epochs),
        progress: None,
        epoch_loss: 0.0,
        epoch_batches: 0,
        batches_per_epoch,
    };
    tracing::info!(
        "Diffusion training: {} scans, {} steps/epoch, {} epochs, {} warmup steps",
        loader.num_items(),
        batches_per_epoch,
        max_epochs,
        diffusion.lr_warmup_steps
    );

    let result = fit_diffusion(config, process, &loader, device, channels, size);
    tracker.end_run(if result.is_ok() {
        RunStatus::Finished
    } else {
        RunStatus::Failed
    })?;
    result.map(|mut summary| {
        summary.run_id = tracker.run_id().to_string();
        summary
    })
}

fn fit_diffusion<B, O>(
    config: &Configuration,
    mut process: DiffusionProcess<B, O>,
    loader: &ScanLoader,
    device: &B::Device,
    channels: usize,
    size: usize,
) -> Result<DiffusionSummary>
where
    B: AutodiffBackend,
    O: Optimizer<DiffusionUNet<B>, B> + 'static,
{
    let max_epochs = config.job.max_epochs;
    let log_interval = config.diffusion.log_interval.unwrap_or(max_epochs / 10).max(1);
    let output_dir = config.job.output_dir.clone();
    ensure_dir(&output_dir)?;
    let diffusion = config.diffusion.clone();

    let saved: Arc<std::sync::Mutex<Vec<(PathBuf, PathBuf)>>> = Arc::default();
    let saved_handle = Arc::clone(&saved);

    let mut engine: Engine<DiffusionProcess<B, O>> = Engine::new().with_epoch_length(config.job.epoch_length);
    engine.add_event_handler(
        Event::EpochStarted,
        |state: &mut State, p: &mut DiffusionProcess<B, O>| -> Result<()> {
            p.begin_epoch(state.epoch);
            Ok(())
        },
    );
    engine.add_event_handler(
        Event::EpochCompleted,
        move |state: &mut State, p: &mut DiffusionProcess<B, O>| -> Result<()> {
            let avg_loss = p.end_epoch(state.epoch);
            state.metrics.insert("loss".to_string(), avg_loss);
            if state.epoch % log_interval == 0 || state.epoch == state.max_epochs {
                let paths = p.save_artifacts(state.epoch, &output_dir, &diffusion, channels, size)?;
                saved_handle
                    .lock()
                    .map_err(|e| CxrError::Training(e.to_string()))?
                    .push(paths);
            }
            Ok(())
        },
    );
    engine.add_event_handler(
        Event::Completed,
        |state: &mut State, p: &mut DiffusionProcess<B, O>| -> Result<()> {
            p.logger.log_complete(state.epoch);
            Ok(())
        },
    );

    let state = engine.run(&mut process, move || loader.iter::<B>(device), max_epochs)?;
    let epochs_run = state.epoch;
    let final_loss = state.metrics.get("loss").copied().unwrap_or(state.output);

    let saved = saved
        .lock()
        .map_err(|e| CxrError::Training(e.to_string()))?
        .clone();
    Ok(DiffusionSummary {
        run_id: String::new(),
        epochs_run,
        final_loss,
        sample_grids: saved.iter().map(|(grid, _)| grid.clone()).collect(),
        model_path: saved.last().map(|(_, model)| model.clone()),
    })
}
