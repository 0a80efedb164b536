//! Typed errors for the codecs crate.

use thiserror::Error;

/// Errors that can occur while writing or reading staged table files.
#[derive(Debug, Error)]
pub enum CodecError {
    /// No codec is registered under the requested file type id.
    #[error("unknown file type: {0}")]
    UnknownFileType(String),

    /// Codec options are invalid (e.g. a multi-byte delimiter).
    #[error("invalid file type options: {0}")]
    InvalidOptions(String),

    /// The file content does not fit the table model.
    #[error("malformed {format} data in {path}: {message}")]
    Malformed {
        format: &'static str,
        path: String,
        message: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Arrow(#[from] arrow::error::ArrowError),

    #[error(transparent)]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error(transparent)]
    Table(#[from] xtool_core::CoreError),
}

pub type Result<T> = std::result::Result<T, CodecError>;
