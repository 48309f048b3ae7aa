//! Error types shared by every phase of the workflow.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised while building, transforming, running or checking programs.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("dataset download failed: {0}")]
    Download(String),

    #[error("malformed IDX file {path:?}: {reason}")]
    Idx { path: PathBuf, reason: String },

    #[error("shape mismatch for {what}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        what: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("variable `{0}` already exists in scope")]
    DuplicateVariable(String),

    #[error("device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("invalid quantization config: {0}")]
    InvalidConfig(String),

    #[error("config parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("an optimizer factory is required when training with an activation preprocess hook")]
    MissingOptimizerFactory,

    #[error("program is not quantization-aware")]
    NotQuantAware,

    #[error("evaluation observed no batches")]
    EmptyEvaluation,

    #[error(
        "top-1 accuracy moved from {before:.4} to {after:.4} (|delta| {delta:.4} >= tolerance {tolerance})"
    )]
    AccuracyRegression {
        before: f32,
        after: f32,
        delta: f32,
        tolerance: f32,
    },
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, Error>;
