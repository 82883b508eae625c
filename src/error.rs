// error.rs
// Per-call backend failures are recovered inside their stage; PipelineError covers the whole run

use std::path::PathBuf;
use std::time::Duration;

/// Failure of a single call to an external embedding or generation backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// Network failure, rate limit or server error. Eligible for a bounded retry.
    #[error("transient backend error: {0}")]
    Transient(String),

    /// The call did not finish within the configured per-call timeout.
    #[error("backend call timed out after {}s", .0.as_secs())]
    Timeout(Duration),

    /// The backend answered, but not with data of the expected shape.
    #[error("malformed backend output: {0}")]
    MalformedOutput(String),

    /// The run was cancelled before this call was issued.
    #[error("call skipped: run cancelled")]
    Cancelled,
}

impl BackendError {
    /// Whether retrying the same request could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, BackendError::Transient(_) | BackendError::Timeout(_))
    }
}

/// Run-level errors.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Invalid configuration. Raised before any stage runs; no artifact is written.
    #[error("fatal configuration error: {0}")]
    FatalConfiguration(String),

    /// Too few usable comments to form any cluster. Produces an empty result.
    #[error("insufficient data: {available} usable comments, at least {required} needed")]
    InsufficientData { available: usize, required: usize },

    /// The clustering backend rejected the input.
    #[error("clustering failed: {0}")]
    Clustering(String),

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl PipelineError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        PipelineError::FatalConfiguration(message.into())
    }
}
