//! Learning rate schedules
//!
//! `LrScheduler` is the epoch-level schedule configured under
//! `engine.lr_scheduler`. Diffusion training uses the per-step
//! `cosine_with_warmup` instead.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

/// Epoch-level learning rate schedule
///
/// ```json
/// { "type": "step_decay", "initial_lr": 0.001, "decay_factor": 0.1, "step_epochs": [10, 20] }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LrScheduler {
    Constant {
        lr: f64,
    },

    /// Multiply by `decay_factor` at each epoch in `step_epochs`
    StepDecay {
        initial_lr: f64,
        decay_factor: f64,
        step_epochs: Vec<usize>,
    },

    /// `initial_lr * decay_rate^epoch`
    Exponential {
        initial_lr: f64,
        decay_rate: f64,
    },

    CosineAnnealing {
        initial_lr: f64,
        min_lr: f64,
        total_epochs: usize,
    },

    /// Linear warmup, then cosine annealing to `min_lr`
    WarmupCosine {
        initial_lr: f64,
        min_lr: f64,
        warmup_epochs: usize,
        total_epochs: usize,
    },

    /// Linear warmup, then linear decay to zero
    LinearWarmupDecay {
        initial_lr: f64,
        warmup_epochs: usize,
        total_epochs: usize,
    },
}

impl Default for LrScheduler {
    fn default() -> Self {
        Self::Constant { lr: 1e-3 }
    }
}

/// Half-cosine factor in [0, 1] for progress in [0, 1]
fn cosine_factor(progress: f64) -> f64 {
    (1.0 + (PI * progress.clamp(0.0, 1.0)).cos()) / 2.0
}

/// Fraction of the post-warmup phase completed at `epoch`
fn decay_progress(epoch: usize, warmup_epochs: usize, total_epochs: usize) -> f64 {
    let remaining = total_epochs.saturating_sub(warmup_epochs).max(1);
    (epoch - warmup_epochs) as f64 / remaining as f64
}

impl LrScheduler {
    pub fn get_lr(&self, epoch: usize) -> f64 {
        match self {
            Self::Constant { lr } => *lr,

            Self::StepDecay {
                initial_lr,
                decay_factor,
                step_epochs,
            } => {
                let steps = step_epochs.iter().filter(|&&e| epoch >= e).count();
                initial_lr * decay_factor.powi(steps as i32)
            }

            Self::Exponential { initial_lr, decay_rate } => initial_lr * decay_rate.powi(epoch as i32),

            Self::CosineAnnealing {
                initial_lr,
                min_lr,
                total_epochs,
            } => {
                let progress = epoch as f64 / (*total_epochs).max(1) as f64;
                min_lr + (initial_lr - min_lr) * cosine_factor(progress)
            }

            Self::WarmupCosine {
                initial_lr,
                min_lr,
                warmup_epochs,
                total_epochs,
            } => {
                if epoch < *warmup_epochs {
                    initial_lr * (epoch + 1) as f64 / *warmup_epochs as f64
                } else {
                    let progress = decay_progress(epoch, *warmup_epochs, *total_epochs);
                    min_lr + (initial_lr - min_lr) * cosine_factor(progress)
                }
            }

            Self::LinearWarmupDecay {
                initial_lr,
                warmup_epochs,
                total_epochs,
            } => {
                if epoch < *warmup_epochs {
                    initial_lr * (epoch + 1) as f64 / *warmup_epochs as f64
                } else {
                    let progress = decay_progress(epoch, *warmup_epochs, *total_epochs);
                    initial_lr * (1.0 - progress).max(0.0)
                }
            }
        }
    }

    pub fn initial_lr(&self) -> f64 {
        match self {
            Self::Constant { lr } => *lr,
            Self::StepDecay { initial_lr, .. }
            | Self::Exponential { initial_lr, .. }
            | Self::CosineAnnealing { initial_lr, .. }
            | Self::WarmupCosine { initial_lr, .. }
            | Self::LinearWarmupDecay { initial_lr, .. } => *initial_lr,
        }
    }

    pub fn description(&self) -> String {
        match self {
            Self::Constant { lr } => format!("Constant LR: {:.6}", lr),
            Self::StepDecay {
                initial_lr,
                decay_factor,
                step_epochs,
            } => format!(
                "Step Decay: initial={:.6}, factor={}, steps={:?}",
                initial_lr, decay_factor, step_epochs
            ),
            Self::Exponential { initial_lr, decay_rate } => {
                format!("Exponential: initial={:.6}, decay={:.4}", initial_lr, decay_rate)
            }
            Self::CosineAnnealing {
                initial_lr,
                min_lr,
                total_epochs,
            } => format!(
                "Cosine Annealing: initial={:.6}, min={:.6}, epochs={}",
                initial_lr, min_lr, total_epochs
            ),
            Self::WarmupCosine {
                initial_lr,
                warmup_epochs,
                total_epochs,
                ..
            } => format!(
                "Warmup + Cosine: initial={:.6}, warmup={}, total={}",
                initial_lr, warmup_epochs, total_epochs
            ),
            Self::LinearWarmupDecay {
                initial_lr,
                warmup_epochs,
                total_epochs,
            } => format!(
                "Linear Warmup + Decay: initial={:.6}, warmup={}, total={}",
                initial_lr, warmup_epochs, total_epochs
            ),
        }
    }
}

/// Per-step schedule: linear warmup over `warmup_steps`, then a half cosine
/// down to zero at `total_steps`
pub fn cosine_with_warmup(step: usize, warmup_steps: usize, total_steps: usize, base_lr: f64) -> f64 {
    if step < warmup_steps {
        return base_lr * step as f64 / warmup_steps.max(1) as f64;
    }
    let progress = (step - warmup_steps) as f64 / total_steps.saturating_sub(warmup_steps).max(1) as f64;
    base_lr * cosine_factor(progress)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_scheduler() {
        let scheduler = LrScheduler::Constant { lr: 0.001 };
        assert_eq!(scheduler.get_lr(0), 0.001);
        assert_eq!(scheduler.get_lr(100), 0.001);
    }

    #[test]
    fn test_step_decay_scheduler() {
        let scheduler = LrScheduler::StepDecay {
            initial_lr: 0.1,
            decay_factor: 0.1,
            step_epochs: vec![10, 20],
        };
        assert_eq!(scheduler.get_lr(9), 0.1);
        assert!((scheduler.get_lr(10) - 0.01).abs() < 1e-12);
        assert!((scheduler.get_lr(25) - 0.001).abs() < 1e-12);
    }

    #[test]
    fn test_cosine_annealing_endpoints() {
        let scheduler = LrScheduler::CosineAnnealing {
            initial_lr: 0.1,
            min_lr: 0.001,
            total_epochs: 100,
        };
        assert!((scheduler.get_lr(0) - 0.1).abs() < 1e-12);
        assert!((scheduler.get_lr(50) - 0.0505).abs() < 1e-9);
        assert!((scheduler.get_lr(100) - 0.001).abs() < 1e-12);
        assert!((scheduler.get_lr(150) - 0.001).abs() < 1e-12);
    }

    #[test]
    fn test_warmup_schedules() {
        let cosine = LrScheduler::WarmupCosine {
            initial_lr: 0.1,
            min_lr: 0.0,
            warmup_epochs: 4,
            total_epochs: 10,
        };
        assert!((cosine.get_lr(0) - 0.025).abs() < 1e-12);
        assert!((cosine.get_lr(3) - 0.1).abs() < 1e-12);
        assert!((cosine.get_lr(4) - 0.1).abs() < 1e-12);
        assert!(cosine.get_lr(9) < cosine.get_lr(5));

        let linear = LrScheduler::LinearWarmupDecay {
            initial_lr: 0.1,
            warmup_epochs: 2,
            total_epochs: 2,
        };
        // no decay phase left: progress is measured over at least one epoch
        assert!((linear.get_lr(2) - 0.1).abs() < 1e-12);
        assert_eq!(linear.get_lr(5), 0.0);
    }

    #[test]
    fn test_serde_tagged() {
        let scheduler: LrScheduler =
            serde_json::from_str(r#"{"type": "exponential", "initial_lr": 0.01, "decay_rate": 0.5}"#).unwrap();
        assert_eq!(scheduler.get_lr(2), 0.0025);
        assert_eq!(scheduler.initial_lr(), 0.01);
        assert!(scheduler.description().starts_with("Exponential"));
    }

    #[test]
    fn test_cosine_with_warmup() {
        assert_eq!(cosine_with_warmup(0, 500, 10_000, 1e-4), 0.0);
        assert!((cosine_with_warmup(250, 500, 10_000, 1e-4) - 5e-5).abs() < 1e-12);
        assert!((cosine_with_warmup(500, 500, 10_000, 1e-4) - 1e-4).abs() < 1e-12);
        assert!(cosine_with_warmup(10_000, 500, 10_000, 1e-4).abs() < 1e-12);
        // no warmup
        assert_eq!(cosine_with_warmup(0, 0, 10, 1.0), 1.0);
    }
}
