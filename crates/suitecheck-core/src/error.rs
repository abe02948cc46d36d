//! Core error type for the suitecheck harness.
//!
//! `HarnessError` is used throughout the core crate (lifecycle, engine
//! invocation, scenario parsing, pipeline execution). The CLI converts it to
//! a plain message at the command boundary.

use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    #[error("Installation failed for '{instance}': {reason}")]
    Install { instance: String, reason: String },

    #[error("Suite instance '{0}' is already installed")]
    Collision(String),

    #[error("Suite template not found: {}", .0.display())]
    TemplateNotFound(PathBuf),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Artifact error: {0}")]
    Artifact(String),

    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Run '{0}' was cancelled by a newer run")]
    Cancelled(String),
}

/// Result type for harness operations
pub type HarnessResult<T> = Result<T, HarnessError>;

impl HarnessError {
    /// True for the errors that make a scenario unable to reach `Installed`.
    pub fn is_installation_failure(&self) -> bool {
        matches!(
            self,
            HarnessError::Install { .. } | HarnessError::Collision(_) | HarnessError::TemplateNotFound(_)
        )
    }
}
