//! Executors run one resolved command line per chunk.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::capture::{LineRing, OutputCapture, OutputLine, OutputSink, Stream};
use crate::command::ResolvedCommand;
use crate::config::{RunnerConfig, DEFAULT_OUTPUT_BUFFER_LINES};
use crate::error::ExecutorError;
use crate::handles::{DataHandleProvider, LocalHandleProvider};
use crate::progress::ProgressMonitor;
use crate::settings::{ExecutorConfig, LocalExecutorOptions};

/// How long output readers may lag behind the process they read from.
const DRAIN_GRACE: Duration = Duration::from_millis(500);

/// Per-invocation context handed to an executor.
pub struct ExecutionContext<'a> {
    pub chunk: usize,
    pub working_dir: Option<&'a Path>,
    pub monitor: &'a ProgressMonitor,
    pub sink: Option<&'a OutputSink>,
}

/// Runs external processes.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Registry id of this executor.
    fn id(&self) -> &str;

    /// Handle provider for one run of `tool_name`.
    fn data_handles(&self, tool_name: &str) -> Arc<dyn DataHandleProvider>;

    /// Worker pool size requested by the executor's own settings.
    fn max_threads(&self) -> Option<usize> {
        None
    }

    /// Lines retained per output stream.
    fn output_buffer_lines(&self) -> usize {
        DEFAULT_OUTPUT_BUFFER_LINES
    }

    /// Run `command` to completion and return its exit code.
    ///
    /// Output lines go to `capture` (and `ctx.sink`) also when an error is
    /// returned. A non-zero exit code is not an error. Cancelling
    /// `ctx.monitor` must terminate the process.
    async fn execute(
        &self,
        command: &ResolvedCommand,
        ctx: &ExecutionContext<'_>,
        capture: &mut OutputCapture,
    ) -> Result<i32, ExecutorError>;
}

/// Runs commands as child processes of this process.
pub struct LocalExecutor {
    tmp_root: PathBuf,
    max_threads: Option<usize>,
    output_buffer_lines: usize,
}

impl LocalExecutor {
    pub fn new(config: &RunnerConfig, options: &LocalExecutorOptions) -> Self {
        Self {
            tmp_root: config.tmp_dir.clone(),
            max_threads: options.max_threads,
            output_buffer_lines: options
                .output_buffer_lines
                .unwrap_or(config.output_buffer_lines),
        }
    }

    /// Factory used by the executor registry.
    pub fn from_config(
        config: &ExecutorConfig,
        runner: &RunnerConfig,
    ) -> Result<Arc<dyn Executor>, ExecutorError> {
        let options = match config {
            ExecutorConfig::Local(options) => options.clone(),
            ExecutorConfig::Custom { options, .. } if options.is_null() => {
                LocalExecutorOptions::default()
            }
            ExecutorConfig::Custom { options, .. } => serde_json::from_value(options.clone())
                .map_err(|e| ExecutorError::InvalidOptions(e.to_string()))?,
        };
        Ok(Arc::new(Self::new(runner, &options)))
    }
}

/// Read `reader` line by line into `ring`, forwarding each line to `sink`.
fn spawn_pump<R>(
    reader: R,
    chunk: usize,
    stream: Stream,
    ring: Arc<Mutex<LineRing>>,
    sink: Option<OutputSink>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Some(sink) = &sink {
                        // A dropped receiver only stops forwarding.
                        let _ = sink.send(OutputLine {
                            chunk,
                            stream,
                            line: line.clone(),
                        });
                    }
                    ring.lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .push(line);
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("Chunk {}: stopped reading {}: {}", chunk, stream, e);
                    break;
                }
            }
        }
    })
}

/// Wait up to `grace` for the readers to reach end of stream. Background
/// children of the tool may keep the pipes open long after it exited.
async fn settle(pumps: &mut [JoinHandle<()>], grace: Duration) {
    if tokio::time::timeout(grace, join_all(pumps.iter_mut())).await.is_err() {
        debug!("Output streams still open after {:?}, detaching", grace);
    }
}

/// Stop the readers and move their lines into `capture`.
fn collect(
    pumps: Vec<JoinHandle<()>>,
    rings: [(Stream, Arc<Mutex<LineRing>>); 2],
    capture: &mut OutputCapture,
) {
    for pump in pumps {
        pump.abort();
    }
    for (stream, ring) in rings {
        let mut guard = ring.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        *capture.stream_mut(stream) = std::mem::take(&mut *guard);
    }
}

#[cfg(unix)]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|signal| 128 + signal))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[async_trait]
impl Executor for LocalExecutor {
    fn id(&self) -> &str {
        "local"
    }

    fn data_handles(&self, tool_name: &str) -> Arc<dyn DataHandleProvider> {
        Arc::new(LocalHandleProvider::new(&self.tmp_root, tool_name))
    }

    fn max_threads(&self) -> Option<usize> {
        self.max_threads
    }

    fn output_buffer_lines(&self) -> usize {
        self.output_buffer_lines
    }

    async fn execute(
        &self,
        command: &ResolvedCommand,
        ctx: &ExecutionContext<'_>,
        capture: &mut OutputCapture,
    ) -> Result<i32, ExecutorError> {
        ctx.monitor
            .check_cancelled()
            .map_err(|_| ExecutorError::Cancelled)?;

        let mut cmd = Command::new(command.program());
        cmd.args(command.args());
        if let Some(dir) = ctx.working_dir {
            cmd.current_dir(dir);
        }
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|source| ExecutorError::Spawn {
            program: command.program().to_string(),
            source,
        })?;
        info!(
            "Chunk {}: started '{}' (pid {})",
            ctx.chunk,
            command,
            child.id().unwrap_or_default()
        );
        ctx.monitor.set_message(&format!("Chunk {}: running {}", ctx.chunk, command.program()));

        let capacity = capture.capacity();
        let rings = [
            (Stream::Stdout, Arc::new(Mutex::new(LineRing::new(capacity)))),
            (Stream::Stderr, Arc::new(Mutex::new(LineRing::new(capacity)))),
        ];
        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(spawn_pump(
                stdout,
                ctx.chunk,
                Stream::Stdout,
                rings[0].1.clone(),
                ctx.sink.cloned(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(spawn_pump(
                stderr,
                ctx.chunk,
                Stream::Stderr,
                rings[1].1.clone(),
                ctx.sink.cloned(),
            ));
        }

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            _ = ctx.monitor.cancelled() => None,
        };

        match waited {
            Some(Ok(status)) => {
                let cancelled = tokio::select! {
                    _ = settle(&mut pumps, DRAIN_GRACE) => false,
                    _ = ctx.monitor.cancelled() => true,
                };
                collect(pumps, rings, capture);
                if cancelled {
                    warn!("Chunk {}: cancelled while collecting process output", ctx.chunk);
                    return Err(ExecutorError::Cancelled);
                }
                let code = exit_code(status);
                debug!("Chunk {}: process exited with code {}", ctx.chunk, code);
                ctx.monitor.set_progress(1.0);
                Ok(code)
            }
            Some(Err(e)) => {
                let _ = child.start_kill();
                settle(&mut pumps, DRAIN_GRACE).await;
                collect(pumps, rings, capture);
                Err(ExecutorError::Wait(e))
            }
            None => {
                warn!("Chunk {}: cancelled, killing external process", ctx.chunk);
                if let Err(e) = child.start_kill() {
                    debug!("Chunk {}: kill failed: {}", ctx.chunk, e);
                }
                let _ = child.wait().await;
                settle(&mut pumps, DRAIN_GRACE).await;
                collect(pumps, rings, capture);
                Err(ExecutorError::Cancelled)
            }
        }
    }
}
