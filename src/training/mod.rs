//! Training module
//!
//! This module provides:
//! - Supervised classifier training and evaluation on the event engine
//! - DDPM training of a noise-predicting UNet with periodic sample grids
//! - Learning rate schedules
//! - The markdown run report
//!
//! Both trainers log to the experiment tracker and end the run as
//! `FINISHED` on success or `FAILED` when an error escapes the engine.

pub mod diffusion;
pub mod report;
pub mod scheduler;
pub mod supervised;

pub use diffusion::{train_diffusion, DiffusionSummary, NoiseScheduler};
pub use report::{build_report, write_report, TestResults};
pub use scheduler::{cosine_with_warmup, LrScheduler};
pub use supervised::{evaluate, prepare_run, train, TrainingSummary};
