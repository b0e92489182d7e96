//! Stock handlers: best-n checkpointing, early stopping and LR scheduling
//!
//! Checkpoint and early stopping read their score from `State::metrics`
//! (for example `val_loss`), so they must be registered after the handler
//! that runs validation on the same event.

use std::path::{Path, PathBuf};

use super::{Handler, State};
use crate::training::scheduler::LrScheduler;
use crate::utils::error::Result;

/// Something whose weights can be written to disk
pub trait Checkpointable {
    /// Save to `path` and return the file actually written. The stem may
    /// contain dots, so extensions must be appended rather than substituted.
    fn save_checkpoint(&self, path: &Path) -> Result<PathBuf>;
}

/// Something with an adjustable learning rate
pub trait LearningRate {
    fn learning_rate(&self) -> f64;
    fn set_learning_rate(&mut self, lr: f64);
}

/// Score as seen by handlers: `sign * metric`, so higher is always better
fn signed_score(state: &State, key: &str, sign: f64) -> Option<f64> {
    match state.metrics.get(key) {
        Some(value) => Some(sign * value),
        None => {
            tracing::warn!("Score '{}' not found in engine metrics", key);
            None
        }
    }
}

/// Keeps the `n_saved` best checkpoints by `sign * score`
#[derive(Debug)]
pub struct Checkpoint {
    dirname: PathBuf,
    filename_prefix: String,
    score_name: String,
    score_key: String,
    score_sign: f64,
    n_saved: usize,
    /// (priority, file) sorted best first
    saved: Vec<(f64, PathBuf)>,
}

impl Checkpoint {
    /// `score_key` is the metrics entry to rank by, `score_name` how it
    /// appears in file names
    pub fn new(
        dirname: impl Into<PathBuf>,
        filename_prefix: impl Into<String>,
        score_name: impl Into<String>,
        score_key: impl Into<String>,
        score_sign: f64,
        n_saved: usize,
    ) -> Self {
        Self {
            dirname: dirname.into(),
            filename_prefix: filename_prefix.into(),
            score_name: score_name.into(),
            score_key: score_key.into(),
            score_sign,
            n_saved: n_saved.max(1),
            saved: Vec::new(),
        }
    }

    /// Best checkpoint written so far
    pub fn best(&self) -> Option<&Path> {
        self.saved.first().map(|(_, path)| path.as_path())
    }

    pub fn saved(&self) -> Vec<&Path> {
        self.saved.iter().map(|(_, path)| path.as_path()).collect()
    }

    fn is_better(&self, priority: f64) -> bool {
        self.saved.len() < self.n_saved || self.saved.last().is_some_and(|(worst, _)| priority > *worst)
    }
}

impl<P: Checkpointable> Handler<P> for Checkpoint {
    fn handle(&mut self, state: &mut State, process: &mut P) -> Result<()> {
        let Some(priority) = signed_score(state, &self.score_key, self.score_sign) else {
            return Ok(());
        };
        if !self.is_better(priority) {
            return Ok(());
        }

        std::fs::create_dir_all(&self.dirname)?;
        let score = priority * self.score_sign;
        let stem = format!(
            "{}_{}={:.4}_epoch={}",
            self.filename_prefix, self.score_name, score, state.epoch
        );
        let written = process.save_checkpoint(&self.dirname.join(stem))?;
        tracing::info!("Saved checkpoint {}", written.display());

        self.saved.push((priority, written));
        self.saved.sort_by(|a, b| b.0.total_cmp(&a.0));
        while self.saved.len() > self.n_saved {
            if let Some((_, stale)) = self.saved.pop() {
                if stale.exists() {
                    std::fs::remove_file(&stale)?;
                }
                tracing::debug!("Removed checkpoint {}", stale.display());
            }
        }
        Ok(())
    }
}

/// Stops the run when the score has not improved by more than `min_delta`
/// for `patience` consecutive evaluations
#[derive(Debug)]
pub struct EarlyStopping {
    patience: usize,
    min_delta: f64,
    score_key: String,
    score_sign: f64,
    best: Option<f64>,
    counter: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize, min_delta: f64, score_key: impl Into<String>, score_sign: f64) -> Self {
        Self {
            patience: patience.max(1),
            min_delta,
            score_key: score_key.into(),
            score_sign,
            best: None,
            counter: 0,
        }
    }

    pub fn counter(&self) -> usize {
        self.counter
    }
}

impl<P> Handler<P> for EarlyStopping {
    fn handle(&mut self, state: &mut State, _process: &mut P) -> Result<()> {
        let Some(score) = signed_score(state, &self.score_key, self.score_sign) else {
            return Ok(());
        };

        match self.best {
            Some(best) if score <= best + self.min_delta => {
                self.counter += 1;
                tracing::info!("EarlyStopping: {} / {}", self.counter, self.patience);
                if self.counter >= self.patience {
                    tracing::info!("EarlyStopping: Stop training");
                    state.terminate();
                }
            }
            _ => {
                self.best = Some(score);
                self.counter = 0;
            }
        }
        Ok(())
    }
}

/// Sets the epoch's learning rate from an `LrScheduler`; fire on `EpochStarted`
#[derive(Debug, Clone)]
pub struct LrSchedulerHandler {
    scheduler: LrScheduler,
}

impl LrSchedulerHandler {
    pub fn new(scheduler: LrScheduler) -> Self {
        Self { scheduler }
    }
}

impl<P: LearningRate> Handler<P> for LrSchedulerHandler {
    fn handle(&mut self, state: &mut State, process: &mut P) -> Result<()> {
        let lr = self.scheduler.get_lr(state.epoch.saturating_sub(1));
        process.set_learning_rate(lr);
        state.metrics.insert("lr".to_string(), lr);
        Ok(())
    }
}
