//! Execution orchestrator: runs an external tool over keyed input tables.
//!
//! One run moves through `Preparing → Running → Aggregating → Joining →
//! Done` (or `Failed`):
//!
//! - **Preparing** plans the chunks, stages every input file, allocates every
//!   output location and resolves one command line per chunk. Any failure is
//!   fatal.
//! - **Running** hands the chunks to a bounded pool. With more than one
//!   chunk, failed chunks are recorded and the run goes on as long as one
//!   chunk succeeds.
//! - **Aggregating** concatenates the chunk outputs of each port under a
//!   unified schema.
//! - **Joining** outer-joins output port 0 onto input port 0.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use arrow::datatypes::SchemaRef;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};
use xtool_codecs::{CodecRegistry, FileTypeConfig, TableCodec};
use xtool_core::{
    concat_tables, join_spec, join_tables, ChunkPlan, CoreError, JoinOptions, RowIdUnifier, Table,
};

use crate::capture::{OutputCapture, OutputSink};
use crate::chunk::{ChunkOutput, ChunkReport, ChunkTask};
use crate::command;
use crate::config::RunnerConfig;
use crate::error::{ChunkError, HandleError, Result, ToolError};
use crate::handles::{DataHandleProvider, HandleRequest, InputHandle, OutputHandle};
use crate::metrics::RunnerMetrics;
use crate::progress::ProgressMonitor;
use crate::registry::ExecutorRegistry;
use crate::settings::{CleanupPolicy, PortSettings, SecondaryInputMode, ToolSettings};

const WRITE_WEIGHT: f64 = 0.1;
const EXEC_WEIGHT: f64 = 0.7;
const AGGREGATE_WEIGHT: f64 = 0.1;
const JOIN_WEIGHT: f64 = 0.1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Preparing,
    Running,
    Aggregating,
    Joining,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedChunk {
    pub index: usize,
    pub message: String,
}

/// Result of a successful run.
#[derive(Debug, Clone)]
pub struct ExecutionOutcome {
    /// One table per output port.
    pub tables: Vec<Table>,
    /// Chunks that failed while others succeeded.
    pub failed_chunks: Vec<FailedChunk>,
    pub warnings: Vec<String>,
}

impl ExecutionOutcome {
    /// All warnings as one newline-joined message.
    pub fn warning_message(&self) -> Option<String> {
        if self.warnings.is_empty() {
            None
        } else {
            Some(self.warnings.join("\n"))
        }
    }
}

#[derive(Default)]
struct ChunkArtifacts {
    inputs: Vec<Arc<dyn InputHandle>>,
    outputs: Vec<Arc<dyn OutputHandle>>,
}

impl ChunkArtifacts {
    fn clean_up(&self) {
        for handle in &self.inputs {
            handle.clean_up();
        }
        for handle in &self.outputs {
            handle.clean_up();
        }
    }
}

/// Everything a run staged on disk, tracked as soon as it is allocated.
struct RunArtifacts {
    provider: Arc<dyn DataHandleProvider>,
    chunks: Vec<ChunkArtifacts>,
    /// Inputs written once and shared by all chunks.
    shared_inputs: Vec<Arc<dyn InputHandle>>,
    failed: BTreeSet<usize>,
}

impl RunArtifacts {
    fn new(provider: Arc<dyn DataHandleProvider>) -> Self {
        Self {
            provider,
            chunks: Vec::new(),
            shared_inputs: Vec::new(),
            failed: BTreeSet::new(),
        }
    }

    fn chunk_mut(&mut self, index: usize) -> &mut ChunkArtifacts {
        if self.chunks.len() <= index {
            self.chunks.resize_with(index + 1, ChunkArtifacts::default);
        }
        &mut self.chunks[index]
    }
}

/// Runs one configured external tool. Not reentrant: one run at a time.
pub struct ExternalToolRunner {
    settings: ToolSettings,
    config: RunnerConfig,
    executors: Arc<ExecutorRegistry>,
    codecs: Arc<CodecRegistry>,
    metrics: RunnerMetrics,
    sink: Option<OutputSink>,
    state: RunState,
    last_output: BTreeMap<usize, OutputCapture>,
    artifacts: Option<RunArtifacts>,
}

impl ExternalToolRunner {
    pub fn new(
        settings: ToolSettings,
        config: RunnerConfig,
        executors: Arc<ExecutorRegistry>,
        codecs: Arc<CodecRegistry>,
    ) -> Self {
        Self {
            settings,
            config,
            executors,
            codecs,
            metrics: RunnerMetrics::new(),
            sink: None,
            state: RunState::Idle,
            last_output: BTreeMap::new(),
            artifacts: None,
        }
    }

    /// Share metrics with other runners.
    pub fn with_metrics(mut self, metrics: RunnerMetrics) -> Self {
        self.metrics = metrics;
        self
    }

    /// Forward every output line of every chunk to `sink`.
    pub fn with_output_sink(mut self, sink: OutputSink) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn settings(&self) -> &ToolSettings {
        &self.settings
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn metrics(&self) -> &RunnerMetrics {
        &self.metrics
    }

    /// Retained stdout/stderr of every chunk of the last run, failed ones included.
    pub fn last_output(&self) -> &BTreeMap<usize, OutputCapture> {
        &self.last_output
    }

    fn enter(&mut self, state: RunState) {
        debug!("Run state {:?} -> {:?}", self.state, state);
        self.state = state;
    }

    fn check_settings(&self) -> Result<()> {
        self.settings.validate().map_err(|errors| {
            ToolError::Configuration(
                errors
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; "),
            )
        })
    }

    fn port_codecs(&self, ports: &[PortSettings], kind: &str) -> Result<Vec<Arc<dyn TableCodec>>> {
        ports
            .iter()
            .enumerate()
            .map(|(port, settings)| self.port_codec(&settings.file_type, port, kind))
            .collect()
    }

    fn port_codec(
        &self,
        file_type: &FileTypeConfig,
        port: usize,
        kind: &str,
    ) -> Result<Arc<dyn TableCodec>> {
        self.codecs
            .create(file_type)
            .map_err(|e| ToolError::Configuration(format!("{} port {}: {}", kind, port, e)))
    }

    /// Output codecs, with the join ID column of the first port read as
    /// text so its values match the input row keys.
    fn output_codecs(&self) -> Result<Vec<Arc<dyn TableCodec>>> {
        self.settings
            .outputs
            .iter()
            .enumerate()
            .map(|(port, settings)| {
                if port == 0 && self.settings.join.enabled {
                    let file_type = settings
                        .file_type
                        .clone()
                        .with_text_column(&self.settings.join.id_column);
                    self.port_codec(&file_type, port, "output")
                } else {
                    self.port_codec(&settings.file_type, port, "output")
                }
            })
            .collect()
    }

    fn join_options(&self) -> JoinOptions {
        JoinOptions {
            id_column: self.settings.join.id_column.clone(),
            key_separator: self.settings.row_key_separator.clone(),
        }
    }

    /// Output schemas for the given input schemas, without running anything.
    ///
    /// Returns `None` when the output schemas are only known after a run,
    /// i.e. unless every output port names an existing file.
    pub fn configure(&self, input_schemas: &[SchemaRef]) -> Result<Option<Vec<SchemaRef>>> {
        self.check_settings()?;
        if input_schemas.len() != self.settings.inputs.len() {
            return Err(ToolError::Configuration(format!(
                "expected {} input table(s), got {}",
                self.settings.inputs.len(),
                input_schemas.len()
            )));
        }
        self.port_codecs(&self.settings.inputs, "input")?;
        let output_codecs = self.output_codecs()?;
        self.executors
            .create(&self.settings.executor, &self.config)
            .map_err(|e| ToolError::Configuration(e.to_string()))?;

        let mut schemas = Vec::with_capacity(output_codecs.len());
        for (port, (settings, codec)) in self.settings.outputs.iter().zip(&output_codecs).enumerate() {
            let Some(path) = settings.path.as_deref().filter(|p| p.is_file()) else {
                return Ok(None);
            };
            let schema = codec.read_schema(path).map_err(|e| {
                ToolError::Configuration(format!(
                    "cannot read schema of output port {} from '{}': {}",
                    port,
                    path.display(),
                    e
                ))
            })?;
            schemas.push(schema);
        }

        if self.settings.join.enabled && !input_schemas.is_empty() && !schemas.is_empty() {
            schemas[0] = join_spec(&input_schemas[0], &schemas[0], &self.settings.join.id_column)
                .map_err(join_error)?;
        }
        Ok(Some(schemas))
    }

    /// Run the tool over `inputs` (one table per input port).
    ///
    /// Staged files are cleaned up per the configured policy before this
    /// returns, also on failure.
    pub async fn execute(
        &mut self,
        inputs: &[Table],
        monitor: &ProgressMonitor,
    ) -> Result<ExecutionOutcome> {
        self.clean_up();
        self.last_output.clear();

        let mut warnings = Vec::new();
        let result = self.run(inputs, monitor, &mut warnings).await;
        warnings.extend(self.apply_cleanup());

        match result {
            Ok((tables, failed_chunks)) => {
                self.enter(RunState::Done);
                monitor.set_progress(1.0);
                Ok(ExecutionOutcome {
                    tables,
                    failed_chunks,
                    warnings,
                })
            }
            Err(e) => {
                self.enter(RunState::Failed);
                error!("External tool '{}' failed: {}", self.settings.tool_name, e);
                for warning in &warnings {
                    warn!("{}", warning);
                }
                Err(e)
            }
        }
    }

    async fn run(
        &mut self,
        inputs: &[Table],
        monitor: &ProgressMonitor,
        warnings: &mut Vec<String>,
    ) -> Result<(Vec<Table>, Vec<FailedChunk>)> {
        self.enter(RunState::Preparing);
        self.check_settings()?;
        if inputs.len() != self.settings.inputs.len() {
            return Err(ToolError::Configuration(format!(
                "expected {} input table(s), got {}",
                self.settings.inputs.len(),
                inputs.len()
            )));
        }
        let input_codecs = self.port_codecs(&self.settings.inputs, "input")?;
        let output_codecs = self.output_codecs()?;
        let executor = self
            .executors
            .create(&self.settings.executor, &self.config)
            .map_err(|e| ToolError::Configuration(e.to_string()))?;

        let row_count = inputs.first().map_or(0, Table::num_rows);
        let plan = ChunkPlan::new(row_count, self.settings.chunking)
            .map_err(|e| ToolError::Configuration(e.to_string()))?;
        info!(
            "Running '{}' over {} row(s) in {} chunk(s)",
            self.settings.tool_name, row_count, plan.chunk_count
        );

        let provider = executor.data_handles(&self.settings.tool_name);
        let artifacts = self
            .artifacts
            .insert(RunArtifacts::new(provider.clone()));

        let stage = Stage {
            settings: &self.settings,
            plan: &plan,
            provider: provider.as_ref(),
            metrics: &self.metrics,
        };
        let write_monitor = monitor.sub(WRITE_WEIGHT);
        let staged_inputs = stage
            .inputs(inputs, &input_codecs, artifacts, &write_monitor, warnings)
            .await?;
        let staged_outputs = stage.outputs(&output_codecs, artifacts, warnings)?;

        let unifier = plan.is_chunked().then(RowIdUnifier::new);
        let mut tasks = Vec::with_capacity(plan.chunk_count);
        for (chunk, (chunk_inputs, chunk_outputs)) in staged_inputs.into_iter().zip(staged_outputs).enumerate() {
            let input_locations: Vec<String> =
                chunk_inputs.iter().map(|h| h.location().to_string()).collect();
            let output_locations: Vec<String> =
                chunk_outputs.iter().map(|o| o.handle.location().to_string()).collect();
            let command = command::resolve(
                &self.settings.command,
                &self.settings.variables,
                &input_locations,
                &output_locations,
            )
            .map_err(|e| ToolError::Configuration(e.to_string()))?;

            let task = ChunkTask::new(
                chunk,
                chunk_inputs,
                chunk_outputs,
                command,
                self.settings.working_dir.clone(),
                executor.clone(),
                unifier.clone(),
                self.metrics.clone(),
            )
            .with_sink(self.sink.clone());
            tasks.push(Arc::new(task));
        }
        monitor.check_cancelled().map_err(|_| ToolError::Cancelled)?;

        self.enter(RunState::Running);
        let pool = self
            .config
            .pool_size(executor.max_threads())
            .min(plan.chunk_count);
        let reports = run_chunks(tasks, pool, &monitor.sub(EXEC_WEIGHT)).await;
        let chunk_count = reports.len();

        let mut successes = Vec::with_capacity(chunk_count);
        let mut failures = Vec::new();
        for report in reports {
            self.last_output.insert(report.index, report.capture);
            match report.result {
                Ok(tables) => successes.push(tables),
                Err(e) => {
                    if let Some(artifacts) = self.artifacts.as_mut() {
                        artifacts.failed.insert(e.chunk());
                    }
                    failures.push(e);
                }
            }
        }

        if monitor.is_cancelled() {
            return Err(ToolError::Cancelled);
        }

        let failed_chunks: Vec<FailedChunk> = failures
            .iter()
            .map(|e| FailedChunk {
                index: e.chunk(),
                message: e.to_string(),
            })
            .collect();
        if !failures.is_empty() {
            if chunk_count == 1 || successes.is_empty() {
                if chunk_count > 1 {
                    error!("All {} chunks failed", chunk_count);
                }
                return match failures.pop() {
                    Some(last) => Err(ToolError::Chunk(last)),
                    None => Err(ToolError::Cancelled),
                };
            }
            let messages: Vec<&str> = failed_chunks.iter().map(|f| f.message.as_str()).collect();
            warnings.push(format!(
                "{} of {} chunks failed:\n{}",
                failures.len(),
                chunk_count,
                messages.join("\n")
            ));
        }

        let mut tables = if chunk_count == 1 {
            successes.into_iter().next().unwrap_or_default()
        } else {
            self.enter(RunState::Aggregating);
            aggregate(successes, self.settings.outputs.len())?
        };
        monitor.sub(AGGREGATE_WEIGHT).set_progress(1.0);
        monitor.check_cancelled().map_err(|_| ToolError::Cancelled)?;

        if self.settings.join.enabled && !inputs.is_empty() && !tables.is_empty() {
            self.enter(RunState::Joining);
            tables[0] = join_tables(&inputs[0], &tables[0], &self.join_options()).map_err(join_error)?;
        }
        monitor.sub(JOIN_WEIGHT).set_progress(1.0);

        Ok((tables, failed_chunks))
    }

    /// Delete staged files of the last run per the cleanup policy. Returns
    /// warnings about files that were kept on purpose.
    fn apply_cleanup(&mut self) -> Vec<String> {
        let Some(artifacts) = self.artifacts.take() else {
            return Vec::new();
        };
        let location = artifacts
            .provider
            .working_dir()
            .map(|dir| dir.display().to_string());

        let mut warnings = Vec::new();
        match self.settings.cleanup {
            CleanupPolicy::None => {
                if let Some(dir) = location {
                    info!("Keeping temporary files in {}", dir);
                }
            }
            CleanupPolicy::All => {
                for chunk in &artifacts.chunks {
                    chunk.clean_up();
                }
                for handle in &artifacts.shared_inputs {
                    handle.clean_up();
                }
                artifacts.provider.clean_up();
            }
            CleanupPolicy::OnlyNonFailed => {
                for (index, chunk) in artifacts.chunks.iter().enumerate() {
                    if !artifacts.failed.contains(&index) {
                        chunk.clean_up();
                    }
                }
                if artifacts.failed.is_empty() {
                    for handle in &artifacts.shared_inputs {
                        handle.clean_up();
                    }
                } else {
                    let indices: Vec<String> =
                        artifacts.failed.iter().map(ToString::to_string).collect();
                    warnings.push(format!(
                        "Temporary files of failed chunk(s) {} were not deleted{}",
                        indices.join(", "),
                        location.map(|dir| format!(" (in {})", dir)).unwrap_or_default()
                    ));
                }
                artifacts.provider.clean_up();
            }
        }
        warnings
    }

    /// Delete whatever the last run left behind, per the cleanup policy.
    pub fn clean_up(&mut self) {
        for warning in self.apply_cleanup() {
            warn!("{}", warning);
        }
    }
}

impl Drop for ExternalToolRunner {
    fn drop(&mut self) {
        self.clean_up();
    }
}

fn join_error(e: CoreError) -> ToolError {
    match e {
        CoreError::Join(message) => ToolError::Join(message),
        other => ToolError::Join(other.to_string()),
    }
}

fn preparation_error(what: String, e: HandleError) -> ToolError {
    ToolError::Preparation(format!("{}: {}", what, e))
}

/// Shared state of the preparation phase.
struct Stage<'a> {
    settings: &'a ToolSettings,
    plan: &'a ChunkPlan,
    provider: &'a dyn DataHandleProvider,
    metrics: &'a RunnerMetrics,
}

impl Stage<'_> {
    /// Write every input file. Port 0 is split by the chunk plan; other ports
    /// are replicated per chunk or written once, per the settings.
    async fn inputs(
        &self,
        tables: &[Table],
        codecs: &[Arc<dyn TableCodec>],
        artifacts: &mut RunArtifacts,
        monitor: &ProgressMonitor,
        warnings: &mut Vec<String>,
    ) -> Result<Vec<Vec<Arc<dyn InputHandle>>>> {
        let chunk_count = self.plan.chunk_count;
        let port_count = tables.len();
        let shared_mode = self.settings.secondary_inputs == SecondaryInputMode::SingleChunk;
        let files = (0..port_count)
            .map(|port| if port > 0 && shared_mode { 1 } else { chunk_count })
            .sum::<usize>()
            .max(1);
        let share = 1.0 / files as f64;

        let mut staged: Vec<Vec<Arc<dyn InputHandle>>> =
            (0..chunk_count).map(|_| Vec::with_capacity(port_count)).collect();
        for (port, (table, codec)) in tables.iter().zip(codecs).enumerate() {
            let shared_port = port > 0 && shared_mode;
            let mut shared: Option<Arc<dyn InputHandle>> = None;
            for (chunk, chunk_inputs) in staged.iter_mut().enumerate() {
                monitor.check_cancelled().map_err(|_| ToolError::Cancelled)?;
                if let Some(handle) = &shared {
                    chunk_inputs.push(handle.clone());
                    continue;
                }

                let request = HandleRequest {
                    port,
                    port_count,
                    chunk,
                    extension: codec.extension(),
                    suggested: self.settings.inputs[port].path.as_deref(),
                };
                let handle = self.provider.create_input(&request).map_err(|e| {
                    preparation_error(format!("allocating input port {} of chunk {}", port, chunk), e)
                })?;
                if handle.overwrites_existing() {
                    warnings.push(format!(
                        "Existing file '{}' will be overwritten",
                        handle.location()
                    ));
                }
                if shared_port {
                    artifacts.shared_inputs.push(handle.clone());
                    shared = Some(handle.clone());
                } else {
                    artifacts.chunk_mut(chunk).inputs.push(handle.clone());
                }

                let rows = if port == 0 {
                    let range = self.plan.range(chunk);
                    table.slice(range.start, range.len())
                } else {
                    table.clone()
                };
                let written = write_input(handle.clone(), codec.clone(), rows, monitor.sub(share))
                    .await
                    .map_err(|e| {
                        preparation_error(
                            format!("writing input port {} of chunk {} to '{}'", port, chunk, handle.location()),
                            e,
                        )
                    })?;
                self.metrics.rows_written.inc_by(written);
                debug!(
                    "Staged {} row(s) of input port {} for chunk {} at {}",
                    written,
                    port,
                    chunk,
                    handle.location()
                );
                chunk_inputs.push(handle);
            }
        }
        Ok(staged)
    }

    /// Allocate every output location.
    fn outputs(
        &self,
        codecs: &[Arc<dyn TableCodec>],
        artifacts: &mut RunArtifacts,
        warnings: &mut Vec<String>,
    ) -> Result<Vec<Vec<ChunkOutput>>> {
        let port_count = codecs.len();
        let mut staged = Vec::with_capacity(self.plan.chunk_count);
        for chunk in 0..self.plan.chunk_count {
            let mut outputs = Vec::with_capacity(port_count);
            for (port, codec) in codecs.iter().enumerate() {
                let request = HandleRequest {
                    port,
                    port_count,
                    chunk,
                    extension: codec.extension(),
                    suggested: self.settings.outputs[port].path.as_deref(),
                };
                let handle = self.provider.create_output(&request).map_err(|e| {
                    preparation_error(format!("allocating output port {} of chunk {}", port, chunk), e)
                })?;
                if handle.overwrites_existing() {
                    warnings.push(format!(
                        "Existing file '{}' will be overwritten",
                        handle.location()
                    ));
                }
                handle.prepare().map_err(|e| {
                    preparation_error(format!("clearing output port {} of chunk {}", port, chunk), e)
                })?;
                artifacts.chunk_mut(chunk).outputs.push(handle.clone());
                outputs.push(ChunkOutput {
                    handle,
                    codec: codec.clone(),
                });
            }
            staged.push(outputs);
        }
        Ok(staged)
    }
}

/// Encode one input table on a blocking thread.
async fn write_input(
    handle: Arc<dyn InputHandle>,
    codec: Arc<dyn TableCodec>,
    table: Table,
    monitor: ProgressMonitor,
) -> std::result::Result<u64, HandleError> {
    let location = handle.location().to_string();
    tokio::task::spawn_blocking(move || -> std::result::Result<u64, HandleError> {
        let writer = handle.open_write()?;
        let progress = |fraction: f64| monitor.set_progress(fraction);
        Ok(codec.write_table(&table, writer, &progress)?)
    })
    .await
    .map_err(|e| HandleError::Io {
        path: location,
        source: std::io::Error::other(e),
    })?
}

/// Run every task on a pool of `pool` concurrent slots. Reports come back
/// in chunk order.
async fn run_chunks(
    tasks: Vec<Arc<ChunkTask>>,
    pool: usize,
    monitor: &ProgressMonitor,
) -> Vec<ChunkReport> {
    // Dropping the run (e.g. the caller gave up on the future) stops the chunks.
    let _stop_on_drop = monitor.token().clone().drop_guard();
    let semaphore = Arc::new(Semaphore::new(pool.max(1)));
    let share = 1.0 / tasks.len().max(1) as f64;
    debug!("Running {} chunk(s) on {} slot(s)", tasks.len(), pool);

    let handles: Vec<_> = tasks
        .iter()
        .map(|task| {
            let task = task.clone();
            let semaphore = semaphore.clone();
            let chunk_monitor = monitor.sub(share);
            tokio::spawn(async move {
                let _permit = tokio::select! {
                    permit = semaphore.acquire_owned() => permit.ok(),
                    _ = chunk_monitor.cancelled() => None,
                };
                task.run(chunk_monitor).await
            })
        })
        .collect();

    futures::future::join_all(handles)
        .await
        .into_iter()
        .zip(&tasks)
        .map(|(joined, task)| {
            joined.unwrap_or_else(|e| ChunkReport {
                index: task.index(),
                result: Err(ChunkError::Aborted {
                    chunk: task.index(),
                    message: e.to_string(),
                }),
                capture: OutputCapture::default(),
            })
        })
        .collect()
}

/// Concatenate the successful chunks' tables port by port.
fn aggregate(chunks: Vec<Vec<Table>>, port_count: usize) -> Result<Vec<Table>> {
    let mut per_port: Vec<Vec<Table>> = vec![Vec::with_capacity(chunks.len()); port_count];
    for tables in chunks {
        for (port, table) in tables.into_iter().enumerate() {
            if let Some(port_tables) = per_port.get_mut(port) {
                port_tables.push(table);
            }
        }
    }
    per_port
        .iter()
        .enumerate()
        .map(|(port, tables)| {
            concat_tables(tables).map_err(|e| {
                let detail = match e {
                    CoreError::SchemaInconsistency(message) => message,
                    other => other.to_string(),
                };
                ToolError::SchemaInconsistency(format!("output port {}: {}", port, detail))
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, RecordBatch};
    use arrow::datatypes::{DataType, Field, Schema};

    fn int_table(values: &[i64]) -> Table {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int64, true)]));
        let batch =
            RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(values.to_vec()))])
                .unwrap();
        Table::with_generated_keys(batch)
    }

    fn runner(settings: ToolSettings) -> ExternalToolRunner {
        ExternalToolRunner::new(
            settings,
            RunnerConfig::default(),
            Arc::new(ExecutorRegistry::with_defaults()),
            Arc::new(CodecRegistry::with_defaults()),
        )
    }

    #[test]
    fn test_warning_message_joins_lines() {
        let outcome = ExecutionOutcome {
            tables: Vec::new(),
            failed_chunks: Vec::new(),
            warnings: vec!["a".to_string(), "b".to_string()],
        };
        assert_eq!(outcome.warning_message().as_deref(), Some("a\nb"));
    }

    #[test]
    fn test_aggregate_unifies_per_port() {
        let merged = aggregate(
            vec![
                vec![int_table(&[1]), int_table(&[10])],
                vec![int_table(&[2]), int_table(&[20])],
            ],
            2,
        )
        .unwrap();
        assert_eq!(merged.len(), 2);
        assert_eq!(merged[0].num_rows(), 2);
        assert_eq!(merged[1].num_rows(), 2);
    }

    #[test]
    fn test_configure_without_output_files_is_unknown() {
        let settings = ToolSettings {
            command: vec!["cat".to_string(), "%inFile%".to_string()],
            ..Default::default()
        };
        let schema = int_table(&[1]).schema();
        assert!(runner(settings).configure(&[schema]).unwrap().is_none());
    }

    #[test]
    fn test_configure_reads_existing_output_and_joins() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.csv");
        std::fs::write(&out, "RowID,v,w\nRow0,1,x\n").unwrap();
        let mut settings = ToolSettings {
            command: vec!["tool".to_string()],
            ..Default::default()
        };
        settings.outputs[0].path = Some(out);

        let schema = int_table(&[1]).schema();
        let schemas = runner(settings).configure(&[schema]).unwrap().unwrap();
        let names: Vec<&str> = schemas[0]
            .fields()
            .iter()
            .map(|f| f.name().as_str())
            .collect();
        assert_eq!(names, vec!["v", "v (#1)", "w"]);
    }

    #[test]
    fn test_configure_rejects_bad_settings() {
        let settings = ToolSettings {
            command: vec!["tool".to_string(), "%inFile_1%".to_string()],
            ..Default::default()
        };
        let schema = int_table(&[1]).schema();
        let err = runner(settings).configure(&[schema]).unwrap_err();
        assert!(matches!(err, ToolError::Configuration(_)));
    }

    #[test]
    fn test_configure_rejects_unknown_executor() {
        let settings = ToolSettings {
            command: vec!["tool".to_string()],
            executor: crate::settings::ExecutorConfig::Custom {
                id: "grid".to_string(),
                options: serde_json::Value::Null,
            },
            ..Default::default()
        };
        let err = runner(settings)
            .configure(&[int_table(&[1]).schema()])
            .unwrap_err();
        assert_eq!(err.to_string(), "Configuration error: unknown executor 'grid'");
    }
}
