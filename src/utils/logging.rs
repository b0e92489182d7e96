//! Logging Module
//!
//! Structured logging through `tracing`. The subscriber is configured from the
//! `logging` section of the run configuration.

use std::collections::BTreeMap;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use crate::utils::error::{CxrError, Result};
use crate::utils::format_duration;

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Minimum log level to display
    pub level: LogLevel,
    /// Whether to include target (module path)
    pub include_target: bool,
    /// Whether to include thread IDs
    pub include_thread_ids: bool,
    /// Whether to use ANSI colors
    pub ansi_colors: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            include_target: false,
            include_thread_ids: false,
            ansi_colors: true,
        }
    }
}

impl LogConfig {
    /// Verbose logging for debugging data pipelines
    pub fn verbose() -> Self {
        Self {
            level: LogLevel::Debug,
            include_target: true,
            include_thread_ids: true,
            ansi_colors: true,
        }
    }

    /// Errors only
    pub fn quiet() -> Self {
        Self {
            level: LogLevel::Error,
            include_target: false,
            include_thread_ids: false,
            ansi_colors: true,
        }
    }

    /// Apply command line flags on top of `base`.
    ///
    /// `quiet` beats `verbose`; an explicit `level` overrides either preset.
    pub fn from_flags(base: &LogConfig, verbose: bool, quiet: bool, level: Option<&str>) -> Self {
        let mut config = if quiet {
            Self::quiet()
        } else if verbose {
            Self::verbose()
        } else {
            base.clone()
        };
        if let Some(level) = level {
            config.level = LogLevel::parse(level);
        }
        config
    }
}

/// Log level enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Convert to tracing Level
    pub fn to_tracing_level(&self) -> Level {
        match self {
            LogLevel::Trace => Level::TRACE,
            LogLevel::Debug => Level::DEBUG,
            LogLevel::Info => Level::INFO,
            LogLevel::Warn => Level::WARN,
            LogLevel::Error => Level::ERROR,
        }
    }

    /// Parse a level name, falling back to `Info`
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "TRACE"),
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

/// Initialize the global subscriber
pub fn init_logging(config: &LogConfig) -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(config.level.to_tracing_level())
        .with_ansi(config.ansi_colors)
        .with_target(config.include_target)
        .with_thread_ids(config.include_thread_ids)
        .compact()
        .finish();

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| CxrError::Config(format!("Failed to initialize logging: {}", e)))
}

/// Epoch-level progress logger used by the training loops
pub struct TrainingLogger {
    total_epochs: usize,
    epoch_start: Instant,
    training_start: Instant,
}

impl TrainingLogger {
    pub fn new(total_epochs: usize) -> Self {
        Self {
            total_epochs,
            epoch_start: Instant::now(),
            training_start: Instant::now(),
        }
    }

    /// Log start of an epoch (1-based)
    pub fn start_epoch(&mut self, epoch: usize) {
        self.epoch_start = Instant::now();
        tracing::info!("Epoch {}/{} started", epoch, self.total_epochs);
    }

    /// Log end of an epoch (1-based) with the running output
    pub fn end_epoch(&self, epoch: usize, output: f64, learning_rate: f64) {
        let line = self.epoch_line(
            epoch,
            output,
            learning_rate,
            self.epoch_start.elapsed().as_secs_f64(),
            self.training_start.elapsed().as_secs_f64(),
        );
        tracing::info!("{}", line);
    }

    fn epoch_line(&self, epoch: usize, output: f64, learning_rate: f64, epoch_time: f64, total_time: f64) -> String {
        let remaining = self.total_epochs.saturating_sub(epoch);
        let eta = remaining as f64 * total_time / epoch.max(1) as f64;
        format!(
            "Epoch {}/{} completed in {} | Loss: {:.4} | LR: {:.6} | ETA: {}",
            epoch,
            self.total_epochs,
            format_duration(epoch_time),
            output,
            learning_rate,
            format_duration(eta)
        )
    }

    /// Log a set of evaluation metrics for a split
    pub fn log_metrics(&self, split: &str, epoch: usize, metrics: &BTreeMap<String, f64>) {
        let rendered: Vec<String> = metrics
            .iter()
            .map(|(k, v)| format!("{}: {:.4}", k, v))
            .collect();
        tracing::info!("[{}] epoch {} | {}", split, epoch, rendered.join(" | "));
    }

    pub fn log_complete(&self, epochs_run: usize) {
        tracing::info!(
            "Training complete! {} epochs in {}",
            epochs_run,
            format_duration(self.training_start.elapsed().as_secs_f64())
        );
    }
}
