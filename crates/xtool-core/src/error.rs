//! Typed errors for the core crate.

use thiserror::Error;

/// Errors raised by the table model and the chunk algorithms.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Chunking policy or value cannot produce a plan.
    #[error("invalid chunking configuration: {0}")]
    InvalidPolicy(String),

    /// Chunk outputs have structurally incompatible schemas.
    #[error("inconsistent chunk schemas: {0}")]
    SchemaInconsistency(String),

    /// The ID column of the tool output cannot be matched against row keys.
    #[error("join failed: {0}")]
    Join(String),

    /// Table construction with mismatching key and row counts.
    #[error("table has {rows} rows but {keys} row keys")]
    KeyCountMismatch { rows: usize, keys: usize },

    #[error(transparent)]
    Arrow(#[from] arrow::error::ArrowError),
}

pub type Result<T> = std::result::Result<T, CoreError>;
