//! xtool Runner - chunked execution of external tools
//!
//! This crate stages keyed tables as files, runs a command-line tool over
//! them (optionally split into chunks and run in parallel), reads the tool's
//! output files back and joins them onto the input:
//! - Command templates with `%inFile%` / `%outFile%` placeholders and `$(var)` flow variables
//! - Pluggable executors (local processes built in) with bounded parallelism
//! - Data handles for staged files and their cleanup
//! - Progress reporting and cooperative cancellation
//! - Prometheus metrics

pub mod capture;
pub mod chunk;
pub mod command;
pub mod config;
pub mod error;
pub mod executor;
pub mod handles;
pub mod metrics;
pub mod orchestrator;
pub mod progress;
pub mod registry;
pub mod settings;

pub use capture::{output_channel, LineRing, OutputCapture, OutputLine, OutputSink, Stream};
pub use chunk::{ChunkOutput, ChunkReport, ChunkTask};
pub use command::{resolve, FlowVariables, ResolvedCommand};
pub use config::RunnerConfig;
pub use error::{ChunkError, ExecutorError, HandleError, ToolError};
pub use executor::{ExecutionContext, Executor, LocalExecutor};
pub use handles::{DataHandleProvider, HandleRequest, InputHandle, LocalHandleProvider, OutputHandle};
pub use metrics::RunnerMetrics;
pub use orchestrator::{ExecutionOutcome, ExternalToolRunner, FailedChunk, RunState};
pub use progress::{ProgressListener, ProgressMonitor};
pub use registry::{ExecutorFactory, ExecutorRegistry};
pub use settings::{
    CleanupPolicy, ExecutorConfig, JoinSettings, LocalExecutorOptions, PortSettings,
    SecondaryInputMode, ToolSettings,
};

// Re-export for downstream consumers
pub use xtool_codecs;
pub use xtool_core;
