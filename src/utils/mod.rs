//! Utilities module for logging, metrics, and helper functions
//!
//! This module provides:
//! - Structured logging with tracing
//! - Classification metrics (confusion matrix, report, ROC AUC)
//! - Error handling types
//! - Small filesystem and formatting helpers

pub mod error;
pub mod logging;
pub mod metrics;

use std::path::Path;

pub use error::{CxrError, Result};
pub use logging::init_logging;
pub use metrics::{ClassificationReport, ConfusionMatrix};

/// Format a duration in a human-readable way
pub fn format_duration(seconds: f64) -> String {
    if seconds < 60.0 {
        format!("{:.1}s", seconds)
    } else if seconds < 3600.0 {
        let minutes = (seconds / 60.0).floor();
        let secs = seconds % 60.0;
        format!("{}m {:.0}s", minutes as u32, secs)
    } else {
        let hours = (seconds / 3600.0).floor();
        let minutes = ((seconds % 3600.0) / 60.0).floor();
        format!("{}h {}m", hours as u32, minutes as u32)
    }
}

/// Create a directory (and parents) if missing
pub fn ensure_dir<P: AsRef<Path>>(path: P) -> Result<()> {
    std::fs::create_dir_all(path.as_ref())?;
    Ok(())
}

/// True when the path ends with `.nii.gz` or `.nii`
pub fn is_nifti(path: &Path) -> bool {
    let name = path.to_string_lossy();
    name.ends_with(".nii.gz") || name.ends_with(".nii")
}

/// True for the 2D image extensions the loaders accept
pub fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| matches!(e.to_lowercase().as_str(), "png" | "jpg" | "jpeg"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(30.5), "30.5s");
        assert_eq!(format_duration(90.0), "1m 30s");
        assert_eq!(format_duration(3661.0), "1h 1m");
    }

    #[test]
    fn test_file_kinds() {
        assert!(is_nifti(Path::new("IXI002-Guys-0828-T1.nii.gz")));
        assert!(!is_nifti(Path::new("scan.png")));
        assert!(is_image_file(Path::new("person1_virus_6.jpeg")));
        assert!(is_image_file(Path::new("00000001_000.PNG")));
        assert!(!is_image_file(Path::new("notes.txt")));
    }
}
