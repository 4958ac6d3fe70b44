//! Error types for the mdbox storage engine.

use std::io;
use thiserror::Error;

/// Errors that can occur in workspace and storage operations
#[derive(Debug, Error)]
pub enum MdError {
    /// Misconfiguration: double initialization, dimension mismatch,
    /// invalid config values, out-of-extent coordinates.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Unknown dimension name or box id.
    #[error("not found: {0}")]
    NotFound(String),

    /// Backing-file read/write failure.
    #[error("storage I/O error: {0}")]
    Storage(#[from] io::Error),

    /// Record or header encode/decode failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A single box is larger than the configured disk-buffer budget and
    /// can never be paged in under it.
    #[error("box {id} ({bytes} bytes) exceeds the disk buffer budget ({budget} bytes)")]
    BudgetExceeded { id: u64, bytes: usize, budget: usize },

    /// Lock-invariant violation. Indicates a programming defect.
    #[error("concurrency invariant violated: {0}")]
    Concurrency(String),

    /// Operator-requested abort, surfaced between event batches.
    #[error("operation cancelled")]
    Cancelled,

    /// The workspace has been closed.
    #[error("workspace is closed")]
    Closed,
}

impl MdError {
    /// Builds a fatal concurrency error, logging it with full context.
    pub fn concurrency(context: impl Into<String>) -> Self {
        let context = context.into();
        log::error!("concurrency invariant violated: {}", context);
        MdError::Concurrency(context)
    }

    /// True for failures the disk buffer may retry before escalating.
    pub fn is_retryable(&self) -> bool {
        matches!(self, MdError::Storage(_))
    }
}

/// Result type for mdbox operations
pub type MdResult<T> = Result<T, MdError>;
