//! Top-level error taxonomy. Row- and plugin-level problems are warnings on the
//! image, never errors; only the variants here leave the pipeline.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Dump unreadable or corrupt at the byte level; no plugin was run.
    #[error("fatal input error for {}: {reason}", path.display())]
    FatalInput { path: PathBuf, reason: String },

    /// Run aborted by the caller; partial results were discarded.
    #[error("analysis cancelled")]
    Cancelled,

    #[error("unknown feature schema version {0}")]
    UnknownSchema(u16),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("feature cache error: {0}")]
    Cache(#[from] rusqlite::Error),

    #[error("classification failed: {0}")]
    Classify(#[from] crate::classify::ClassifyError),
}

impl PipelineError {
    pub fn fatal_input(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        PipelineError::FatalInput {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

pub type PipelineResult<T> = Result<T, PipelineError>;
