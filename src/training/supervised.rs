//! Supervised classification on top of the event engine
//!
//! `train` wires a `SupervisedProcess` (one Adam step per batch) into an
//! `Engine` with handlers for validation, checkpointing, early stopping and
//! learning rate scheduling. Every evaluation writes per-split CSV artifacts
//! and logs `{split}_{metric}` values to the tracker. When the run completes
//! the test split is evaluated and a markdown report is written.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::sync::Arc;

use burn::{
    module::{AutodiffModule, Module},
    nn::loss::{CrossEntropyLoss, CrossEntropyLossConfig},
    optim::{decay::WeightDecayConfig, AdamConfig, GradientsParams, Optimizer},
    record::CompactRecorder,
    tensor::{activation::softmax, backend::AutodiffBackend, backend::Backend, ElementConversion},
};
use indicatif::{ProgressBar, ProgressStyle};

use super::report::{build_report, write_report, TestResults};
use crate::config::Configuration;
use crate::dataset::loader::{encoding_for, get_target_breakdown, ScanLoader};
use crate::dataset::{instantiate_image_dataset, prepare_validation_dataloaders, ScanBatch, SplitLoaders};
use crate::engine::{Checkpoint, Checkpointable, EarlyStopping, Engine, Event, Handler, LearningRate, LrSchedulerHandler, Process, State};
use crate::model::{classifier_config, CxrClassifier};
use crate::tracking::{start_run, RunStatus, Tracker};
use crate::utils::ensure_dir;
use crate::utils::error::{CxrError, Result};
use crate::utils::logging::TrainingLogger;
use crate::utils::metrics::{roc_auc_ovr, ClassificationReport, ConfusionMatrix};

/// Metric names `log_metrics` knows how to compute
pub const KNOWN_METRICS: [&str; 9] = [
    "loss",
    "accuracy",
    "precision",
    "recall",
    "f1",
    "roc_auc",
    "weighted_precision",
    "weighted_recall",
    "weighted_f1",
];

/// Model, loss, optimizer and device for a classification run
pub struct TrainerArgs<B: AutodiffBackend, O> {
    pub model: CxrClassifier<B>,
    pub loss: CrossEntropyLoss<B>,
    pub optimizer: O,
    pub device: B::Device,
}

pub fn create_default_trainer_args<B: AutodiffBackend>(
    config: &Configuration,
    num_classes: usize,
    in_channels: usize,
    device: &B::Device,
) -> TrainerArgs<B, impl Optimizer<CxrClassifier<B>, B>> {
    let model = classifier_config(&config.model, num_classes, in_channels).init::<B>(device);
    let optimizer = AdamConfig::new()
        .with_weight_decay(Some(WeightDecayConfig::new(config.model.weight_decay as f32)))
        .init();

    TrainerArgs {
        model,
        loss: CrossEntropyLossConfig::new().init(device),
        optimizer,
        device: device.clone(),
    }
}

/// Check the run mode and create the output directory
pub fn prepare_run(config: &Configuration, mode: &str) -> Result<()> {
    if !matches!(mode, "train" | "evaluate") {
        return Err(CxrError::InvalidMode(format!(
            "Invalid mode '{}'. Valid modes are 'train' and 'evaluate'.",
            mode
        )));
    }
    config.validate()?;
    ensure_dir(&config.job.output_dir)?;
    Ok(())
}

/// Host-side outputs of one pass over a split
#[derive(Debug, Clone, Default)]
pub struct EvalOutput {
    /// Sample-weighted mean cross-entropy
    pub loss: f64,
    pub predictions: Vec<usize>,
    pub targets: Vec<usize>,
    pub probabilities: Vec<Vec<f32>>,
    pub paths: Vec<String>,
}

impl EvalOutput {
    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// `path,target,prediction,prob_{class}...`
    pub fn write_predictions(&self, path: &Path, class_names: &[String]) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        let mut header = vec!["path".to_string(), "target".to_string(), "prediction".to_string()];
        header.extend(class_names.iter().map(|c| format!("prob_{}", c)));
        writer.write_record(&header)?;

        for i in 0..self.len() {
            let mut row = vec![
                self.paths.get(i).cloned().unwrap_or_default(),
                self.targets[i].to_string(),
                self.predictions[i].to_string(),
            ];
            row.extend(self.probabilities[i].iter().map(|p| format!("{:.6}", p)));
            writer.write_record(&row)?;
        }
        writer.flush()?;
        Ok(())
    }
}

fn tensor_error(e: impl std::fmt::Debug) -> CxrError {
    CxrError::Training(format!("failed to read tensor data: {:?}", e))
}

/// Run `model` over every batch of `loader`
pub fn evaluate_loader<B: Backend>(
    model: &CxrClassifier<B>,
    loader: &ScanLoader,
    device: &B::Device,
) -> Result<EvalOutput> {
    let loss_fn = CrossEntropyLossConfig::new().init(device);
    let num_classes = model.num_classes();
    let mut output = EvalOutput::default();
    let mut loss_sum = 0.0f64;

    for batch in loader.iter::<B>(device) {
        let ScanBatch { images, targets, paths } = batch;
        let logits = model.forward(images);
        let batch_loss: f64 = loss_fn
            .forward(logits.clone(), targets.clone())
            .into_scalar()
            .elem();
        loss_sum += batch_loss * paths.len() as f64;

        let probs = softmax(logits, 1)
            .into_data()
            .convert::<f32>()
            .to_vec::<f32>()
            .map_err(tensor_error)?;
        let targets = targets
            .into_data()
            .convert::<i64>()
            .to_vec::<i64>()
            .map_err(tensor_error)?;

        for (row, target) in probs.chunks(num_classes).zip(targets) {
            let prediction = row
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(i, _)| i)
                .unwrap_or(0);
            output.predictions.push(prediction);
            output.targets.push(target as usize);
            output.probabilities.push(row.to_vec());
        }
        output.paths.extend(paths);
    }

    output.loss = if output.is_empty() {
        0.0
    } else {
        loss_sum / output.len() as f64
    };
    Ok(output)
}

/// Every metric computable for `output`; `roc_auc` is absent when undefined
pub fn compute_metrics(output: &EvalOutput, report: &ClassificationReport, num_classes: usize) -> BTreeMap<String, f64> {
    let mut metrics = BTreeMap::from([
        ("loss".to_string(), output.loss),
        ("accuracy".to_string(), report.accuracy),
        ("precision".to_string(), report.macro_precision),
        ("recall".to_string(), report.macro_recall),
        ("f1".to_string(), report.macro_f1),
        ("weighted_precision".to_string(), report.weighted_precision),
        ("weighted_recall".to_string(), report.weighted_recall),
        ("weighted_f1".to_string(), report.weighted_f1),
    ]);
    match roc_auc_ovr(&output.probabilities, &output.targets, num_classes) {
        Ok(auc) => {
            metrics.insert("roc_auc".to_string(), auc);
        }
        Err(e) => tracing::debug!("roc_auc skipped: {}", e),
    }
    metrics
}

/// Writes per-split artifacts and forwards metrics to the tracker
pub struct MetricLogger {
    artifact_dir: PathBuf,
    class_names: Vec<String>,
    metric_names: Vec<String>,
    tracker: Arc<dyn Tracker>,
}

impl MetricLogger {
    pub fn new(
        artifact_dir: impl Into<PathBuf>,
        class_names: Vec<String>,
        metric_names: Vec<String>,
        tracker: Arc<dyn Tracker>,
    ) -> Self {
        Self {
            artifact_dir: artifact_dir.into(),
            class_names,
            metric_names,
            tracker,
        }
    }

    pub fn tracker(&self) -> &Arc<dyn Tracker> {
        &self.tracker
    }

    /// Write `{split}/predictions_epoch={e}.csv`, the classification report
    /// and the confusion matrix, then log `{split}_loss` and every configured
    /// metric. Returns the logged values keyed by bare metric name.
    pub fn log_metrics(&self, split: &str, epoch: usize, output: &EvalOutput) -> Result<BTreeMap<String, f64>> {
        let dir = self.artifact_dir.join(split);
        ensure_dir(&dir)?;

        output.write_predictions(&dir.join(format!("predictions_epoch={}.csv", epoch)), &self.class_names)?;
        let report = ClassificationReport::from_predictions(&output.predictions, &output.targets, &self.class_names);
        report.write_csv(dir.join(format!("classification_report_epoch={}.csv", epoch)))?;
        report
            .confusion_matrix
            .write_csv(dir.join(format!("confusion_matrix_epoch={}.csv", epoch)), &self.class_names)?;

        let computed = compute_metrics(output, &report, self.class_names.len());
        let mut logged = BTreeMap::from([("loss".to_string(), output.loss)]);
        self.tracker.log_metric(&format!("{}_loss", split), output.loss, epoch)?;

        for name in self.metric_names.iter().filter(|n| n.as_str() != "loss") {
            if !KNOWN_METRICS.contains(&name.as_str()) {
                tracing::warn!("Metric '{}' not found.", name);
                continue;
            }
            match computed.get(name) {
                Some(value) => {
                    self.tracker.log_metric(&format!("{}_{}", split, name), *value, epoch)?;
                    logged.insert(name.clone(), *value);
                }
                None => tracing::debug!("Metric '{}' is undefined for split '{}'", name, split),
            }
        }
        Ok(logged)
    }
}

/// One optimizer step per batch, plus the evaluation state handlers need
pub struct SupervisedProcess<B: AutodiffBackend, O> {
    model: CxrClassifier<B>,
    optimizer: O,
    loss: CrossEntropyLoss<B>,
    learning_rate: f64,
    device: B::Device,
    loaders: Arc<SplitLoaders>,
    metric_logger: MetricLogger,
    logger: TrainingLogger,
    progress: Option<ProgressBar>,
    epoch_loss: f64,
    epoch_batches: usize,
    test_results: Option<TestResults>,
    model_name: String,
}

impl<B: AutodiffBackend, O> SupervisedProcess<B, O> {
    pub fn new(
        args: TrainerArgs<B, O>,
        learning_rate: f64,
        loaders: Arc<SplitLoaders>,
        metric_logger: MetricLogger,
        max_epochs: usize,
        model_name: impl Into<String>,
    ) -> Self {
        Self {
            model: args.model,
            optimizer: args.optimizer,
            loss: args.loss,
            learning_rate,
            device: args.device,
            loaders,
            metric_logger,
            logger: TrainingLogger::new(max_epochs),
            progress: None,
            epoch_loss: 0.0,
            epoch_batches: 0,
            test_results: None,
            model_name: model_name.into(),
        }
    }

    pub fn model(&self) -> &CxrClassifier<B> {
        &self.model
    }

    pub fn tracker(&self) -> &Arc<dyn Tracker> {
        self.metric_logger.tracker()
    }

    fn begin_epoch(&mut self, epoch: usize) {
        self.logger.start_epoch(epoch);
        self.epoch_loss = 0.0;
        self.epoch_batches = 0;

        let pb = ProgressBar::new(self.loaders.train.num_batches() as u64);
        if let Ok(style) = ProgressStyle::default_bar().template("  {spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}") {
            pb.set_style(style.progress_chars("#>-"));
        }
        self.progress = Some(pb);
    }

    fn end_epoch(&mut self, epoch: usize) -> Result<()> {
        if let Some(pb) = self.progress.take() {
            pb.finish_and_clear();
        }
        let avg_loss = self.epoch_loss / self.epoch_batches.max(1) as f64;
        self.logger.end_epoch(epoch, avg_loss, self.learning_rate);
        self.tracker().log_metric("training_loss", avg_loss, epoch)?;
        self.tracker().log_metric("lr", self.learning_rate, epoch)
    }

    /// Evaluate a split with the current weights and log its metrics.
    /// Returns `None` when the split has no loader.
    fn evaluate_split(&self, split: &str, epoch: usize) -> Result<Option<(BTreeMap<String, f64>, EvalOutput)>> {
        let Some(loader) = self.loaders.eval_loader(split) else {
            tracing::warn!("No '{}' split to evaluate", split);
            return Ok(None);
        };
        let model = self.model.valid();
        let output = evaluate_loader::<B::InnerBackend>(&model, loader, &self.device)?;
        let metrics = self.metric_logger.log_metrics(split, epoch, &output)?;
        self.logger.log_metrics(split, epoch, &metrics);
        Ok(Some((metrics, output)))
    }

    fn evaluate_test(&mut self, epoch: usize) -> Result<()> {
        if let Some((metrics, output)) = self.evaluate_split("test", epoch)? {
            let class_names = self.loaders.classes.clone();
            self.test_results = Some(TestResults {
                model_name: self.model_name.clone(),
                metrics,
                confusion_matrix: ConfusionMatrix::from_predictions(
                    &output.predictions,
                    &output.targets,
                    class_names.len(),
                ),
                class_names,
            });
        }
        Ok(())
    }
}

impl<B, O> Process for SupervisedProcess<B, O>
where
    B: AutodiffBackend,
    O: Optimizer<CxrClassifier<B>, B>,
{
    type Batch = ScanBatch<B>;

    fn step(&mut self, _state: &State, batch: ScanBatch<B>) -> Result<f64> {
        let output = self.model.forward(batch.images);
        let loss = self.loss.forward(output, batch.targets);
        let loss_value: f64 = loss.clone().into_scalar().elem();
        if !loss_value.is_finite() {
            return Err(CxrError::Training(format!("loss diverged to {}", loss_value)));
        }

        let grads = GradientsParams::from_grads(loss.backward(), &self.model);
        self.model = self.optimizer.step(self.learning_rate, self.model.clone(), grads);

        self.epoch_loss += loss_value;
        self.epoch_batches += 1;
        if let Some(pb) = &self.progress {
            pb.set_message(format!("loss {:.4}", loss_value));
            pb.inc(1);
        }
        Ok(loss_value)
    }
}

impl<B: AutodiffBackend, O> Checkpointable for SupervisedProcess<B, O> {
    fn save_checkpoint(&self, path: &Path) -> Result<PathBuf> {
        save_model(&self.model, path)
    }
}

impl<B: AutodiffBackend, O> LearningRate for SupervisedProcess<B, O> {
    fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
    }
}

/// Model files always carry the recorder's `.mpk` extension
fn checkpoint_file(path: &Path) -> PathBuf {
    if path.extension().is_some_and(|e| e == "mpk") {
        path.to_path_buf()
    } else {
        PathBuf::from(format!("{}.mpk", path.display()))
    }
}

pub fn save_model<B: Backend>(model: &CxrClassifier<B>, path: &Path) -> Result<PathBuf> {
    let file = checkpoint_file(path);
    model
        .clone()
        .save_file(file.clone(), &CompactRecorder::new())
        .map_err(|e| CxrError::Model(format!("Failed to save model: {:?}", e)))?;
    Ok(file)
}

pub fn load_model<B: Backend>(model: CxrClassifier<B>, path: &Path, device: &B::Device) -> Result<CxrClassifier<B>> {
    let file = checkpoint_file(path);
    if !file.exists() {
        return Err(CxrError::PathNotFound(file));
    }
    model
        .load_file(file.clone(), &CompactRecorder::new(), device)
        .map_err(|e| CxrError::Model(format!("Failed to load model from {}: {:?}", file.display(), e)))
}

/// Outcome of a training run
#[derive(Debug, Clone)]
pub struct TrainingSummary {
    pub run_id: String,
    pub epochs_run: usize,
    pub best_checkpoint: Option<PathBuf>,
    pub test_metrics: BTreeMap<String, f64>,
    pub report_path: Option<PathBuf>,
}

fn write_run_report(config: &Configuration, results: &TestResults, tracker: &Arc<dyn Tracker>) -> Result<PathBuf> {
    let report = build_report(config, results)?;
    let path = config.job.output_dir.join("report.md");
    write_report(&path, &report)?;
    tracker.set_tag("note", &report)?;
    tracker.log_artifact(&path, None)?;
    tracing::info!("Report written to {}", path.display());
    Ok(path)
}

/// Train a classifier on the configured dataset
pub fn train<B: AutodiffBackend>(config: &Configuration, device: &B::Device) -> Result<TrainingSummary> {
    prepare_run(config, "train")?;

    let splits = instantiate_image_dataset(config, false)?;
    tracing::info!(
        "Target breakdown:\n{}",
        get_target_breakdown(&splits, &encoding_for(&splits.classes))
    );
    let loaders = Arc::new(prepare_validation_dataloaders(&splits, config)?);
    if loaders.train.is_empty() {
        return Err(CxrError::Dataset("training split is empty".to_string()));
    }

    let tracker = start_run(config)?;
    let args = create_default_trainer_args::<B>(
        config,
        loaders.num_classes(),
        config.preprocessing.transforms.channels,
        device,
    );
    let metric_logger = MetricLogger::new(
        &config.job.output_dir,
        loaders.classes.clone(),
        config.engine.metrics.clone(),
        Arc::clone(&tracker),
    );
    let learning_rate = config
        .engine
        .lr_scheduler
        .as_ref()
        .map(|s| s.initial_lr())
        .unwrap_or(config.model.learning_rate);
    let process = SupervisedProcess::new(
        args,
        learning_rate,
        Arc::clone(&loaders),
        metric_logger,
        config.job.max_epochs,
        &config.model.name,
    );

    fit(config, process, &loaders, device)
}

fn fit<B, O>(
    config: &Configuration,
    mut process: SupervisedProcess<B, O>,
    loaders: &SplitLoaders,
    device: &B::Device,
) -> Result<TrainingSummary>
where
    B: AutodiffBackend,
    O: Optimizer<CxrClassifier<B>, B> + 'static,
{
    let max_epochs = config.job.max_epochs;
    let log_interval = config.engine.log_interval(max_epochs);
    let dry_run = config.job.dry_run;
    let score_key = format!("val_{}", config.engine.score_name);
    let score_sign = config.engine.score_sign();

    let mut engine: Engine<SupervisedProcess<B, O>> = Engine::new().with_epoch_length(config.job.epoch_length);

    if let Some(scheduler) = &config.engine.lr_scheduler {
        tracing::info!("LR schedule: {}", scheduler.description());
        engine.add_event_handler(Event::EpochStarted, LrSchedulerHandler::new(scheduler.clone()));
    }
    engine.add_event_handler(
        Event::EpochStarted,
        |state: &mut State, p: &mut SupervisedProcess<B, O>| -> Result<()> {
            p.begin_epoch(state.epoch);
            Ok(())
        },
    );
    engine.add_event_handler(
        Event::EpochCompleted,
        |state: &mut State, p: &mut SupervisedProcess<B, O>| -> Result<()> { p.end_epoch(state.epoch) },
    );

    engine.add_event_handler_every(
        Event::EpochCompleted,
        log_interval,
        move |state: &mut State, p: &mut SupervisedProcess<B, O>| -> Result<()> {
            if !dry_run {
                p.evaluate_split("train", state.epoch)?;
            }
            if let Some((metrics, _)) = p.evaluate_split("val", state.epoch)? {
                for (name, value) in metrics {
                    state.metrics.insert(format!("val_{}", name), value);
                }
            }
            Ok(())
        },
    );

    let checkpoint = Rc::new(RefCell::new(Checkpoint::new(
        config.engine.checkpoint.dirname.clone(),
        config.engine.checkpoint.filename_prefix.clone(),
        config.engine.score_name.clone(),
        score_key.clone(),
        score_sign,
        config.engine.checkpoint.n_saved,
    )));
    let checkpoint_handle = Rc::clone(&checkpoint);
    engine.add_event_handler_every(
        Event::EpochCompleted,
        log_interval,
        move |state: &mut State, p: &mut SupervisedProcess<B, O>| -> Result<()> {
            checkpoint_handle.borrow_mut().handle(state, p)
        },
    );

    if let Some(early) = &config.engine.early_stopping {
        engine.add_event_handler_every(
            Event::EpochCompleted,
            log_interval,
            EarlyStopping::new(early.patience, early.min_delta, score_key, score_sign),
        );
    }

    engine.add_event_handler(
        Event::Completed,
        |state: &mut State, p: &mut SupervisedProcess<B, O>| -> Result<()> {
            p.logger.log_complete(state.epoch);
            p.evaluate_test(state.epoch)
        },
    );
    engine.add_event_handler(
        Event::ExceptionRaised,
        |_: &mut State, p: &mut SupervisedProcess<B, O>| -> Result<()> { p.tracker().end_run(RunStatus::Failed) },
    );

    let epochs_run = engine
        .run(&mut process, move || loaders.train.iter::<B>(device), max_epochs)?
        .epoch;

    let tracker = Arc::clone(process.tracker());
    let finish = || -> Result<TrainingSummary> {
        let report_path = match &process.test_results {
            Some(results) => Some(write_run_report(config, results, &tracker)?),
            None => None,
        };
        Ok(TrainingSummary {
            run_id: tracker.run_id().to_string(),
            epochs_run,
            best_checkpoint: checkpoint.borrow().best().map(Path::to_path_buf),
            test_metrics: process
                .test_results
                .as_ref()
                .map(|r| r.metrics.clone())
                .unwrap_or_default(),
            report_path,
        })
    };

    match finish() {
        Ok(summary) => {
            tracker.end_run(RunStatus::Finished)?;
            Ok(summary)
        }
        Err(e) => {
            tracker.end_run(RunStatus::Failed)?;
            Err(e)
        }
    }
}

/// Load `model.checkpoint` and evaluate it on the test split
pub fn evaluate<B: Backend>(config: &Configuration, device: &B::Device) -> Result<BTreeMap<String, f64>> {
    prepare_run(config, "evaluate")?;
    let checkpoint = config
        .model
        .checkpoint
        .clone()
        .ok_or_else(|| CxrError::Config("model.checkpoint is required in evaluate mode".to_string()))?;

    let splits = instantiate_image_dataset(config, false)?;
    let loaders = prepare_validation_dataloaders(&splits, config)?;
    let tracker = start_run(config)?;

    let result = (|| -> Result<BTreeMap<String, f64>> {
        let model = classifier_config(
            &config.model,
            loaders.num_classes(),
            config.preprocessing.transforms.channels,
        )
        .init::<B>(device);
        let model = load_model(model, &checkpoint, device)?;
        tracing::info!("Loaded checkpoint {}", checkpoint.display());

        let output = evaluate_loader(&model, &loaders.test, device)?;
        let logger = MetricLogger::new(
            &config.job.output_dir,
            loaders.classes.clone(),
            config.engine.metrics.clone(),
            Arc::clone(&tracker),
        );
        let metrics = logger.log_metrics("test", 0, &output)?;
        TrainingLogger::new(0).log_metrics("test", 0, &metrics);

        let results = TestResults {
            model_name: config.model.name.clone(),
            metrics: metrics.clone(),
            confusion_matrix: ConfusionMatrix::from_predictions(
                &output.predictions,
                &output.targets,
                loaders.num_classes(),
            ),
            class_names: loaders.classes.clone(),
        };
        write_run_report(config, &results, &tracker)?;
        Ok(metrics)
    })();

    let status = if result.is_ok() {
        RunStatus::Finished
    } else {
        RunStatus::Failed
    };
    tracker.end_run(status)?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::Autodiff;
    use burn_ndarray::NdArray;
    use image::GrayImage;

    type TestBackend = NdArray;
    type TestAutodiffBackend = Autodiff<NdArray>;

    fn write_pediatrics(root: &Path) {
        for (split, count) in [("train", 6), ("val", 2), ("test", 2)] {
            for (class, shade) in [("NORMAL", 40u8), ("PNEUMONIA", 200u8)] {
                let dir = root.join(split).join(class);
                std::fs::create_dir_all(&dir).unwrap();
                for i in 0..count {
                    GrayImage::from_fn(12, 12, |x, y| image::Luma([shade.wrapping_add((x * y + i) as u8)]))
                        .save(dir.join(format!("{}.jpeg", i)))
                        .unwrap();
                }
            }
        }
    }

    fn config(root: &Path) -> Configuration {
        let mut config = Configuration::default();
        config.job.max_epochs = 2;
        config.job.random_state = 3;
        config.job.output_dir = root.join("artifacts");
        config.datasets.name = "pediatrics".to_string();
        config.datasets.scan_path = root.join("data");
        config.datasets.val_size = 0.2;
        config.datasets.batch_size = 4;
        config.datasets.num_workers = 0;
        config.preprocessing.transforms.spatial_size = 16;
        config.model.base_filters = 4;
        config.engine.checkpoint.dirname = root.join("checkpoints");
        config.engine.metrics.push("sensitivity".to_string());
        config.tracking.tracking_uri = root.join("mlruns");
        config.tracking.run_name = Some("test-run".to_string());
        config
    }

    #[test]
    fn test_prepare_run_rejects_unknown_mode() {
        let dir = tempfile::tempdir().unwrap();
        let err = prepare_run(&config(dir.path()), "predict").unwrap_err();
        assert_eq!(
            err.to_string(),
            "Invalid mode 'predict'. Valid modes are 'train' and 'evaluate'."
        );
        assert!(prepare_run(&config(dir.path()), "evaluate").is_ok());
    }

    #[test]
    fn test_checkpoint_file_extension() {
        assert_eq!(
            checkpoint_file(Path::new("ckpt/best_loss=0.5000_epoch=2")),
            PathBuf::from("ckpt/best_loss=0.5000_epoch=2.mpk")
        );
        assert_eq!(checkpoint_file(Path::new("model.mpk")), PathBuf::from("model.mpk"));
    }

    #[test]
    fn test_log_metrics_writes_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let tracker: Arc<dyn Tracker> =
            Arc::new(crate::tracking::FileTracker::create(&dir.path().join("mlruns"), "exp", "run").unwrap());
        let logger = MetricLogger::new(
            dir.path().join("artifacts"),
            vec!["NORMAL".to_string(), "PNEUMONIA".to_string()],
            vec!["accuracy".to_string(), "roc_auc".to_string(), "bogus".to_string()],
            tracker,
        );
        let output = EvalOutput {
            loss: 0.4,
            predictions: vec![0, 1, 1, 0],
            targets: vec![0, 1, 0, 0],
            probabilities: vec![vec![0.9, 0.1], vec![0.2, 0.8], vec![0.4, 0.6], vec![0.7, 0.3]],
            paths: vec!["a".into(), "b".into(), "c".into(), "d".into()],
        };

        let metrics = logger.log_metrics("val", 3, &output).unwrap();
        assert_eq!(metrics["accuracy"], 0.75);
        assert_eq!(metrics["roc_auc"], 1.0);
        assert_eq!(metrics["loss"], 0.4);
        assert!(!metrics.contains_key("bogus"));

        let split_dir = dir.path().join("artifacts").join("val");
        for name in [
            "predictions_epoch=3.csv",
            "classification_report_epoch=3.csv",
            "confusion_matrix_epoch=3.csv",
        ] {
            assert!(split_dir.join(name).exists(), "{} missing", name);
        }
        let predictions = std::fs::read_to_string(split_dir.join("predictions_epoch=3.csv")).unwrap();
        assert!(predictions.starts_with("path,target,prediction,prob_NORMAL,prob_PNEUMONIA"));

        let logged = std::fs::read_to_string(dir.path().join("mlruns/exp/run/metrics.jsonl")).unwrap();
        assert!(logged.contains("\"val_loss\""));
        assert!(logged.contains("\"val_accuracy\""));
        assert!(logged.contains("\"val_roc_auc\""));
    }

    #[test]
    fn test_train_then_evaluate() {
        let dir = tempfile::tempdir().unwrap();
        write_pediatrics(&dir.path().join("data"));
        let config = config(dir.path());
        let device = Default::default();

        let summary = train::<TestAutodiffBackend>(&config, &device).unwrap();
        assert_eq!(summary.epochs_run, 2);
        assert!(summary.test_metrics.contains_key("accuracy"));
        let best = summary.best_checkpoint.clone().unwrap();
        assert!(best.exists());

        let artifacts = dir.path().join("artifacts");
        assert!(artifacts.join("val/predictions_epoch=1.csv").exists());
        assert!(artifacts.join("train/confusion_matrix_epoch=2.csv").exists());
        assert!(artifacts.join("test/classification_report_epoch=2.csv").exists());
        let report = std::fs::read_to_string(summary.report_path.unwrap()).unwrap();
        assert!(report.starts_with("# Run summary"));

        let run_dir = dir.path().join("mlruns/default/test-run");
        let meta = std::fs::read_to_string(run_dir.join("meta.json")).unwrap();
        assert!(meta.contains("FINISHED"));
        assert!(std::fs::read_to_string(run_dir.join("tags.json")).unwrap().contains("note"));

        let mut eval_config = config.clone();
        eval_config.job.mode = "evaluate".to_string();
        eval_config.model.checkpoint = Some(best);
        let metrics = evaluate::<TestBackend>(&eval_config, &device).unwrap();
        assert!(metrics.contains_key("loss"));
    }

    #[test]
    fn test_evaluate_requires_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.job.mode = "evaluate".to_string();
        assert!(matches!(evaluate::<TestBackend>(&config, &Default::default()), Err(CxrError::Config(_))));
    }
}
