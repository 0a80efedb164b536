//! Execution of one chunk: run the tool on the chunk's staged inputs and
//! read its outputs back.

use std::path::PathBuf;
use std::sync::Arc;

use prometheus_client::metrics::gauge::Gauge;
use tracing::{debug, info, warn};
use xtool_codecs::TableCodec;
use xtool_core::{RowIdUnifier, Table};

use crate::capture::{OutputCapture, OutputSink};
use crate::command::ResolvedCommand;
use crate::error::{ChunkError, HandleError};
use crate::executor::{ExecutionContext, Executor};
use crate::handles::{InputHandle, OutputHandle};
use crate::metrics::RunnerMetrics;
use crate::progress::ProgressMonitor;

/// Share of a chunk's progress spent in the external process.
const PROCESS_WEIGHT: f64 = 0.8;
/// Share spent reading outputs back.
const READ_WEIGHT: f64 = 0.15;
/// Share spent re-keying.
const REKEY_WEIGHT: f64 = 0.05;

/// Holds the active-process gauge up until dropped, also when the
/// surrounding future is.
struct ActiveProcess(Gauge);

impl ActiveProcess {
    fn start(gauge: &Gauge) -> Self {
        gauge.inc();
        Self(gauge.clone())
    }
}

impl Drop for ActiveProcess {
    fn drop(&mut self) {
        self.0.dec();
    }
}

/// One output port of a chunk: where the tool writes, and how to decode it.
#[derive(Clone)]
pub struct ChunkOutput {
    pub handle: Arc<dyn OutputHandle>,
    pub codec: Arc<dyn TableCodec>,
}

/// Result of one chunk, with the process output retained either way.
pub struct ChunkReport {
    pub index: usize,
    pub result: Result<Vec<Table>, ChunkError>,
    pub capture: OutputCapture,
}

/// A unit of work bound to pre-written inputs and pre-allocated outputs.
pub struct ChunkTask {
    index: usize,
    inputs: Vec<Arc<dyn InputHandle>>,
    outputs: Vec<ChunkOutput>,
    command: ResolvedCommand,
    working_dir: Option<PathBuf>,
    executor: Arc<dyn Executor>,
    /// Set when the run has more than one chunk.
    unifier: Option<Arc<RowIdUnifier>>,
    metrics: RunnerMetrics,
    sink: Option<OutputSink>,
}

impl ChunkTask {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: usize,
        inputs: Vec<Arc<dyn InputHandle>>,
        outputs: Vec<ChunkOutput>,
        command: ResolvedCommand,
        working_dir: Option<PathBuf>,
        executor: Arc<dyn Executor>,
        unifier: Option<Arc<RowIdUnifier>>,
        metrics: RunnerMetrics,
    ) -> Self {
        Self {
            index,
            inputs,
            outputs,
            command,
            working_dir,
            executor,
            unifier,
            metrics,
            sink: None,
        }
    }

    pub fn with_sink(mut self, sink: Option<OutputSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn command(&self) -> &ResolvedCommand {
        &self.command
    }

    pub fn inputs(&self) -> &[Arc<dyn InputHandle>] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[ChunkOutput] {
        &self.outputs
    }

    /// Run the chunk. Never panics on tool or decode failures; they are
    /// reported in the returned [`ChunkReport`].
    pub async fn run(&self, monitor: ProgressMonitor) -> ChunkReport {
        let mut capture = OutputCapture::new(self.executor.output_buffer_lines());
        let result = self.run_inner(&monitor, &mut capture).await;
        match &result {
            Ok(tables) => {
                self.metrics.chunks_succeeded.inc();
                info!(
                    "Chunk {} finished: {} output table(s), {} row(s)",
                    self.index,
                    tables.len(),
                    tables.iter().map(Table::num_rows).sum::<usize>()
                );
            }
            Err(e) => {
                self.metrics.chunks_failed.inc();
                warn!("{}", e);
            }
        }
        ChunkReport {
            index: self.index,
            result,
            capture,
        }
    }

    async fn run_inner(
        &self,
        monitor: &ProgressMonitor,
        capture: &mut OutputCapture,
    ) -> Result<Vec<Table>, ChunkError> {
        let chunk = self.index;
        monitor
            .check_cancelled()
            .map_err(|_| ChunkError::Cancelled { chunk })?;

        self.metrics.chunks_started.inc();
        debug!("Chunk {}: {}", chunk, self.command);

        let process_monitor = monitor.sub(PROCESS_WEIGHT);
        let ctx = ExecutionContext {
            chunk,
            working_dir: self.working_dir.as_deref(),
            monitor: &process_monitor,
            sink: self.sink.as_ref(),
        };
        let executed = {
            let _active = ActiveProcess::start(&self.metrics.active_processes);
            self.executor.execute(&self.command, &ctx, capture).await
        };

        let code = executed.map_err(|source| ChunkError::Executor { chunk, source })?;
        if code != 0 {
            return Err(ChunkError::NonZeroExit {
                chunk,
                code,
                stderr: capture.stderr.last().map(str::to_string),
            });
        }
        monitor
            .check_cancelled()
            .map_err(|_| ChunkError::Cancelled { chunk })?;

        let read_monitor = monitor.sub(READ_WEIGHT);
        let port_share = 1.0 / self.outputs.len().max(1) as f64;
        let mut tables = Vec::with_capacity(self.outputs.len());
        for (port, output) in self.outputs.iter().enumerate() {
            let port_monitor = read_monitor.sub(port_share);
            let table = read_output(output.clone(), port_monitor)
                .await
                .map_err(|source| ChunkError::Read {
                    chunk,
                    port,
                    source,
                })?;
            self.metrics.rows_read.inc_by(table.num_rows() as u64);
            tables.push(table);
        }

        if let Some(unifier) = &self.unifier {
            tables = tables
                .into_iter()
                .map(|table| unifier.rekey(table))
                .collect::<Result<Vec<_>, _>>()
                .map_err(|source| ChunkError::Rekey { chunk, source })?;
        }
        monitor.sub(REKEY_WEIGHT).set_progress(1.0);

        Ok(tables)
    }
}

/// Decode one output port on a blocking thread.
async fn read_output(output: ChunkOutput, monitor: ProgressMonitor) -> Result<Table, HandleError> {
    let path = output.handle.open_read()?;
    let location = output.handle.location().to_string();
    tokio::task::spawn_blocking(move || {
        let progress = |fraction: f64| monitor.set_progress(fraction);
        output.codec.read_table(&path, &progress)
    })
    .await
    .map_err(|e| HandleError::Io {
        path: location,
        source: std::io::Error::other(e),
    })?
    .map_err(HandleError::from)
}
