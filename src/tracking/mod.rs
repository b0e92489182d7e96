//! Experiment tracking
//!
//! Runs are recorded on the local filesystem:
//!
//! ```text
//! {tracking_uri}/{experiment}/{run_id}/
//!     meta.json       run name, status, start/end time
//!     params.json     flattened configuration
//!     metrics.jsonl   one {"key", "value", "step", "timestamp"} per line
//!     tags.json
//!     artifacts/
//! ```
//!
//! `NullTracker` stands in when tracking is disabled.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::Local;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Configuration;
use crate::utils::error::{CxrError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RunStatus {
    Running,
    Finished,
    Failed,
    Killed,
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Running => write!(f, "RUNNING"),
            RunStatus::Finished => write!(f, "FINISHED"),
            RunStatus::Failed => write!(f, "FAILED"),
            RunStatus::Killed => write!(f, "KILLED"),
        }
    }
}

pub trait Tracker: Send + Sync {
    fn run_id(&self) -> &str;

    fn log_params(&self, params: &BTreeMap<String, String>) -> Result<()>;

    fn log_metric(&self, key: &str, value: f64, step: usize) -> Result<()>;

    fn log_metrics(&self, metrics: &BTreeMap<String, f64>, step: usize) -> Result<()> {
        for (key, value) in metrics {
            self.log_metric(key, *value, step)?;
        }
        Ok(())
    }

    fn set_tag(&self, key: &str, value: &str) -> Result<()>;

    /// Copy a file into the run's artifact store, under `artifact_path` if given
    fn log_artifact(&self, path: &Path, artifact_path: Option<&str>) -> Result<()>;

    fn end_run(&self, status: RunStatus) -> Result<()>;
}

/// `{dataset}_{model}_{timestamp}`
pub fn create_run_name(config: &Configuration) -> String {
    format!(
        "{}_{}_{}",
        config.datasets.name,
        config.model.name,
        Local::now().format("%Y%m%d_%H%M%S")
    )
}

/// Flatten a JSON document into dotted `section.key` entries
pub fn flatten_params(value: &Value) -> BTreeMap<String, String> {
    fn walk(prefix: &str, value: &Value, out: &mut BTreeMap<String, String>) {
        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    let name = if prefix.is_empty() {
                        key.clone()
                    } else {
                        format!("{}.{}", prefix, key)
                    };
                    walk(&name, child, out);
                }
            }
            Value::String(s) => {
                out.insert(prefix.to_string(), s.clone());
            }
            other => {
                out.insert(prefix.to_string(), other.to_string());
            }
        }
    }

    let mut out = BTreeMap::new();
    walk("", value, &mut out);
    out
}

/// Open a tracker for `config`, logging its parameters
pub fn start_run(config: &Configuration) -> Result<Arc<dyn Tracker>> {
    if !config.tracking.enabled {
        tracing::info!("Experiment tracking disabled");
        return Ok(Arc::new(NullTracker::default()));
    }
    let run_name = config
        .tracking
        .run_name
        .clone()
        .unwrap_or_else(|| create_run_name(config));
    let tracker = FileTracker::create(&config.tracking.tracking_uri, &config.tracking.experiment_name, &run_name)?;
    tracker.log_params(&flatten_params(&serde_json::to_value(config)?))?;
    Ok(Arc::new(tracker))
}

#[derive(Debug, Serialize, Deserialize)]
struct RunMeta {
    run_name: String,
    experiment: String,
    status: RunStatus,
    start_time: String,
    end_time: Option<String>,
}

#[derive(Serialize)]
struct MetricLine<'a> {
    key: &'a str,
    value: f64,
    step: usize,
    timestamp: i64,
}

/// Filesystem-backed run store
#[derive(Debug)]
pub struct FileTracker {
    run_id: String,
    run_dir: PathBuf,
    meta: Mutex<RunMeta>,
    tags: Mutex<BTreeMap<String, String>>,
    params: Mutex<BTreeMap<String, String>>,
}

impl FileTracker {
    /// Create a run directory; a numeric suffix is added if `run_name` is taken
    pub fn create(tracking_uri: &Path, experiment: &str, run_name: &str) -> Result<Self> {
        let experiment_dir = tracking_uri.join(experiment);
        std::fs::create_dir_all(&experiment_dir)?;

        let mut run_id = run_name.to_string();
        let mut suffix = 1;
        while experiment_dir.join(&run_id).exists() {
            run_id = format!("{}_{}", run_name, suffix);
            suffix += 1;
        }
        let run_dir = experiment_dir.join(&run_id);
        std::fs::create_dir_all(run_dir.join("artifacts"))?;

        let tracker = Self {
            run_id,
            run_dir,
            meta: Mutex::new(RunMeta {
                run_name: run_name.to_string(),
                experiment: experiment.to_string(),
                status: RunStatus::Running,
                start_time: Local::now().to_rfc3339(),
                end_time: None,
            }),
            tags: Mutex::new(BTreeMap::new()),
            params: Mutex::new(BTreeMap::new()),
        };
        tracker.write_meta()?;
        tracing::info!("Tracking run '{}' in {}", tracker.run_id, tracker.run_dir.display());
        Ok(tracker)
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn artifact_dir(&self) -> PathBuf {
        self.run_dir.join("artifacts")
    }

    fn lock<'a, T>(&self, mutex: &'a Mutex<T>) -> Result<std::sync::MutexGuard<'a, T>> {
        mutex
            .lock()
            .map_err(|e| CxrError::Tracking(format!("run state poisoned: {}", e)))
    }

    fn write_json<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        std::fs::write(self.run_dir.join(name), serde_json::to_string_pretty(value)?)?;
        Ok(())
    }

    fn write_meta(&self) -> Result<()> {
        let meta = self.lock(&self.meta)?;
        self.write_json("meta.json", &*meta)
    }
}

impl Tracker for FileTracker {
    fn run_id(&self) -> &str {
        &self.run_id
    }

    fn log_params(&self, params: &BTreeMap<String, String>) -> Result<()> {
        let mut stored = self.lock(&self.params)?;
        stored.extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.write_json("params.json", &*stored)
    }

    fn log_metric(&self, key: &str, value: f64, step: usize) -> Result<()> {
        let line = serde_json::to_string(&MetricLine {
            key,
            value,
            step,
            timestamp: Local::now().timestamp_millis(),
        })?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.run_dir.join("metrics.jsonl"))?;
        writeln!(file, "{}", line)?;
        Ok(())
    }

    fn set_tag(&self, key: &str, value: &str) -> Result<()> {
        let mut tags = self.lock(&self.tags)?;
        tags.insert(key.to_string(), value.to_string());
        self.write_json("tags.json", &*tags)
    }

    fn log_artifact(&self, path: &Path, artifact_path: Option<&str>) -> Result<()> {
        let file_name = path
            .file_name()
            .ok_or_else(|| CxrError::Tracking(format!("'{}' has no file name", path.display())))?;
        let dest_dir = match artifact_path {
            Some(sub) => self.artifact_dir().join(sub),
            None => self.artifact_dir(),
        };
        std::fs::create_dir_all(&dest_dir)?;
        std::fs::copy(path, dest_dir.join(file_name))?;
        Ok(())
    }

    fn end_run(&self, status: RunStatus) -> Result<()> {
        {
            let mut meta = self.lock(&self.meta)?;
            meta.status = status;
            meta.end_time = Some(Local::now().to_rfc3339());
        }
        self.write_meta()?;
        tracing::info!("Run '{}' ended with status {}", self.run_id, status);
        Ok(())
    }
}

/// Discards everything
#[derive(Debug, Default)]
pub struct NullTracker;

impl Tracker for NullTracker {
    fn run_id(&self) -> &str {
        "untracked"
    }

    fn log_params(&self, _params: &BTreeMap<String, String>) -> Result<()> {
        Ok(())
    }

    fn log_metric(&self, _key: &str, _value: f64, _step: usize) -> Result<()> {
        Ok(())
    }

    fn set_tag(&self, _key: &str, _value: &str) -> Result<()> {
        Ok(())
    }

    fn log_artifact(&self, _path: &Path, _artifact_path: Option<&str>) -> Result<()> {
        Ok(())
    }

    fn end_run(&self, _status: RunStatus) -> Result<()> {
        Ok(())
    }
}
