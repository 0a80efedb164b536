//! Typed errors for the runner crate.

use thiserror::Error;
use xtool_codecs::CodecError;
use xtool_core::CoreError;

/// Errors of data handles (staged input/output locations).
#[derive(Debug, Error)]
pub enum HandleError {
    #[error("I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("output file '{0}' was not created by the external tool")]
    Missing(String),

    #[error(transparent)]
    Codec(#[from] CodecError),
}

/// Errors of launching or supervising an external process.
///
/// A non-zero exit code is not an error at this level.
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("command line is empty")]
    EmptyCommand,

    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for external process: {0}")]
    Wait(#[source] std::io::Error),

    #[error("external process was cancelled")]
    Cancelled,

    #[error("unknown executor '{0}'")]
    UnknownExecutor(String),

    #[error("invalid executor options: {0}")]
    InvalidOptions(String),
}

/// Failure of one chunk. Recoverable as long as another chunk succeeds.
#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("Chunk {chunk}: external tool exited with code {code}{}", stderr_tail(.stderr))]
    NonZeroExit {
        chunk: usize,
        code: i32,
        stderr: Option<String>,
    },

    #[error("Chunk {chunk}: {source}")]
    Executor {
        chunk: usize,
        #[source]
        source: ExecutorError,
    },

    #[error("Chunk {chunk}: failed to read output port {port}: {source}")]
    Read {
        chunk: usize,
        port: usize,
        #[source]
        source: HandleError,
    },

    #[error("Chunk {chunk}: failed to re-key output rows: {source}")]
    Rekey {
        chunk: usize,
        #[source]
        source: CoreError,
    },

    #[error("Chunk {chunk}: cancelled")]
    Cancelled { chunk: usize },

    #[error("Chunk {chunk}: task aborted: {message}")]
    Aborted { chunk: usize, message: String },
}

fn stderr_tail(stderr: &Option<String>) -> String {
    match stderr {
        Some(line) => format!(": {}", line),
        None => String::new(),
    }
}

impl ChunkError {
    pub fn chunk(&self) -> usize {
        match self {
            ChunkError::NonZeroExit { chunk, .. }
            | ChunkError::Executor { chunk, .. }
            | ChunkError::Read { chunk, .. }
            | ChunkError::Rekey { chunk, .. }
            | ChunkError::Cancelled { chunk }
            | ChunkError::Aborted { chunk, .. } => *chunk,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            ChunkError::Cancelled { .. }
                | ChunkError::Executor {
                    source: ExecutorError::Cancelled,
                    ..
                }
        )
    }
}

/// Run-level failure of an external tool execution.
#[derive(Debug, Error)]
pub enum ToolError {
    /// Missing or invalid settings; nothing was started.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Staging inputs or allocating outputs failed; no chunk was started.
    #[error("Preparation failed: {0}")]
    Preparation(String),

    /// The cause of the (only or last) failed chunk, unchanged.
    #[error(transparent)]
    Chunk(#[from] ChunkError),

    #[error("Inconsistent output schemas across chunks: {0}")]
    SchemaInconsistency(String),

    #[error("Join failed: {0}")]
    Join(String),

    #[error("Execution cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, ToolError>;
