//! # CXR Toolkit
//!
//! Chest X-ray and MRI experiment harness built on the Burn framework.
//!
//! ## Features
//!
//! - **Dataset loaders** for NIH ChestX-ray14, MIMIC-CXR, pediatric pneumonia and IXI,
//!   with seeded stratified splits, resampling and metaclass collapsing
//! - **Supervised training** of a CNN classifier driven by an event engine with
//!   best-n checkpointing, early stopping and learning rate scheduling
//! - **Diffusion training** of a DDPM UNet producing periodic sample grids
//! - **Experiment tracking** to a local run store, plus a markdown run report
//!
//! ## Modules
//!
//! - `config`: JSON run configuration with `section.key=value` overrides
//! - `dataset`: Metadata, labels, splits, per-dataset loaders and Burn batching
//! - `engine`: Event-driven training loop and stock handlers
//! - `model`: CNN classifier and diffusion UNet
//! - `training`: Supervised and diffusion trainers, schedulers, reports
//! - `tracking`: Run parameters, metrics, tags and artifacts
//! - `utils`: Logging, metrics and error types
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use cxr_toolkit::backend::{default_device, TrainingBackend};
//! use cxr_toolkit::config::Configuration;
//!
//! let config = Configuration::load("configs/pediatrics.json")?;
//! let summary = cxr_toolkit::training::train::<TrainingBackend>(&config, &default_device())?;
//! println!("best checkpoint: {:?}", summary.best_checkpoint);
//! ```

pub mod backend;
pub mod config;
pub mod dataset;
pub mod engine;
pub mod model;
pub mod tracking;
pub mod training;
pub mod utils;

pub use config::Configuration;
pub use dataset::{instantiate_image_dataset, prepare_validation_dataloaders, Record, SplitDatasets};
pub use engine::{Engine, Event, State};
pub use model::{CxrClassifier, DiffusionUNet};
pub use training::{evaluate, train, train_diffusion};
pub use utils::error::{CxrError, Result};
pub use utils::metrics::ConfusionMatrix;
