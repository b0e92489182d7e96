//! Error Handling Module
//!
//! Defines the error type shared by the dataset, engine, training and
//! tracking layers. Uses thiserror for ergonomic error definitions.

use std::path::PathBuf;

use thiserror::Error;

/// Main error type for the toolkit
#[derive(Error, Debug)]
pub enum CxrError {
    /// Error loading or decoding a scan
    #[error("Failed to load image at '{0}': {1}")]
    ImageLoad(PathBuf, String),

    /// Error building or splitting a dataset
    #[error("Dataset error: {0}")]
    Dataset(String),

    /// Malformed metadata table
    #[error("Metadata error: {0}")]
    Metadata(String),

    /// Error with model creation, saving or loading
    #[error("Model error: {0}")]
    Model(String),

    /// Error raised inside a training loop
    #[error("Training error: {0}")]
    Training(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Experiment tracking error
    #[error("Tracking error: {0}")]
    Tracking(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Path not found
    #[error("Path not found: {0}")]
    PathNotFound(PathBuf),

    /// Dataset name with no loader
    #[error("{0}")]
    UnknownDataset(String),

    /// Run mode other than train/evaluate
    #[error("{0}")]
    InvalidMode(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV read/write error
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for CxrError {
    fn from(err: serde_json::Error) -> Self {
        CxrError::Serialization(err.to_string())
    }
}

/// Convenience Result type for toolkit operations
pub type Result<T> = std::result::Result<T, CxrError>;

/// Extension trait for adding context to errors
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, msg: &str) -> Result<T>;

    /// Add context with a closure (lazy evaluation)
    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T>;
}

impl<T, E: std::fmt::Display> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, msg: &str) -> Result<T> {
        self.map_err(|e| CxrError::InvalidInput(format!("{}: {}", msg, e)))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.map_err(|e| CxrError::InvalidInput(format!("{}: {}", f(), e)))
    }
}

impl<T> ResultExt<T> for Option<T> {
    fn context(self, msg: &str) -> Result<T> {
        self.ok_or_else(|| CxrError::InvalidInput(msg.to_string()))
    }

    fn with_context<F: FnOnce() -> String>(self, f: F) -> Result<T> {
        self.ok_or_else(|| CxrError::InvalidInput(f()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CxrError::Dataset("empty split".to_string());
        assert_eq!(format!("{}", err), "Dataset error: empty split");
    }

    #[test]
    fn test_unknown_dataset_message_is_verbatim() {
        let err = CxrError::UnknownDataset("Dataset 'chexpert' is not recognized".to_string());
        assert_eq!(err.to_string(), "Dataset 'chexpert' is not recognized");
    }

    #[test]
    fn test_image_load_error() {
        let path = PathBuf::from("/data/nih/00000001_000.png");
        let err = CxrError::ImageLoad(path, "file not found".to_string());
        assert!(format!("{}", err).contains("00000001_000.png"));
    }

    #[test]
    fn test_json_error_converts() {
        let parsed: std::result::Result<u32, serde_json::Error> = serde_json::from_str("nope");
        let err: CxrError = parsed.unwrap_err().into();
        assert!(matches!(err, CxrError::Serialization(_)));
    }

    #[test]
    fn test_result_context() {
        let result: std::result::Result<i32, std::io::Error> =
            Err(std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"));

        let with_context = result.context("Failed to read metadata");
        assert!(with_context.unwrap_err().to_string().contains("Failed to read metadata"));
    }

    #[test]
    fn test_option_context() {
        let opt: Option<i32> = None;
        assert!(opt.context("Value was None").is_err());
    }
}
