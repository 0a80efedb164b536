//! xtool CLI - run an external command-line tool over tabular files

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use xtool_codecs::{CodecRegistry, FileTypeConfig};
use xtool_core::{ChunkPlan, ChunkPolicy, Table};
use xtool_runner::{
    output_channel, ExecutorRegistry, ExternalToolRunner, ProgressListener, ProgressMonitor,
    RunnerConfig, ToolSettings,
};

/// Column holding row keys in files read and written by the CLI.
const ROW_KEY_COLUMN: &str = "RowID";

#[derive(Parser)]
#[command(name = "xtool")]
#[command(about = "Run an external command-line tool over tables, in parallel chunks")]
#[command(version)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    Csv,
    Parquet,
}

#[derive(Clone, Copy, ValueEnum)]
enum PolicyArg {
    #[value(name = "entire_table")]
    EntireTable,
    #[value(name = "individual_row")]
    IndividualRow,
    #[value(name = "chunks_of_size")]
    ChunksOfSize,
    #[value(name = "nr_chunks")]
    NrChunks,
}

impl PolicyArg {
    fn with_value(self, value: usize) -> ChunkPolicy {
        match self {
            Self::EntireTable => ChunkPolicy::EntireTable,
            Self::IndividualRow => ChunkPolicy::IndividualRow,
            Self::ChunksOfSize => ChunkPolicy::ChunksOfSize(value),
            Self::NrChunks => ChunkPolicy::NrChunks(value),
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    /// Run a tool described by a job file
    Run {
        /// Path to the job settings JSON file
        #[arg(short, long)]
        job: PathBuf,

        /// Input table per input port, in port order (.csv, .tsv, .parquet)
        #[arg(short, long = "input", required = true)]
        inputs: Vec<PathBuf>,

        /// Directory the joined output tables are written to
        #[arg(short, long, default_value = "./xtool-output")]
        output_dir: PathBuf,

        /// Format of the written output tables
        #[arg(short, long, value_enum, default_value = "csv")]
        format: OutputFormat,

        /// Print Prometheus metrics after the run
        #[arg(long)]
        metrics: bool,
    },

    /// Validate a job file
    Validate {
        /// Path to the job settings JSON file
        #[arg(short, long)]
        job: PathBuf,
    },

    /// Show how rows would be split into chunks
    Plan {
        /// Number of rows of the first input port
        #[arg(short, long)]
        rows: usize,

        /// Chunking policy
        #[arg(short, long, value_enum, default_value = "entire_table")]
        policy: PolicyArg,

        /// Chunk size or chunk count, depending on the policy
        #[arg(short, long, default_value_t = 1)]
        value: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            job,
            inputs,
            output_dir,
            format,
            metrics,
        } => {
            run_tool(&job, &inputs, &output_dir, format, metrics).await?;
        }
        Commands::Validate { job } => {
            validate_settings_file(&job)?;
        }
        Commands::Plan {
            rows,
            policy,
            value,
        } => {
            show_plan(rows, policy.with_value(value))?;
        }
    }

    Ok(())
}

fn load_settings(path: &Path) -> Result<ToolSettings> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read settings from {}", path.display()))?;
    ToolSettings::from_json(&content)
        .with_context(|| format!("Invalid settings file {}", path.display()))
}

fn validate_settings_file(path: &Path) -> Result<()> {
    let settings = load_settings(path)?;
    if let Err(errors) = settings.validate() {
        for error in &errors {
            eprintln!("Validation error: {}", error);
        }
        anyhow::bail!("Settings validation failed with {} errors", errors.len());
    }
    println!("Settings for '{}' are valid", settings.tool_name);
    Ok(())
}

/// Read a table, taking row keys from the key column when the file has one.
fn read_input(codecs: &CodecRegistry, path: &Path) -> Result<Table> {
    let extension = path
        .extension()
        .map(|e| e.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut file_type = FileTypeConfig::for_extension(&extension)
        .with_context(|| format!("Unsupported input file type: {}", path.display()))?;

    let schema = codecs.create(&file_type)?.read_schema(path)?;
    if schema.index_of(ROW_KEY_COLUMN).is_ok() {
        match &mut file_type {
            FileTypeConfig::Csv(options) => options.read_row_key = Some(ROW_KEY_COLUMN.to_string()),
            FileTypeConfig::Parquet(options) => {
                options.read_row_key = Some(ROW_KEY_COLUMN.to_string())
            }
            FileTypeConfig::Custom { .. } => {}
        }
    }

    let table = codecs
        .create(&file_type)?
        .read_table(path, &|_| {})
        .with_context(|| format!("Failed to read {}", path.display()))?;
    info!("Loaded {} row(s) from {}", table.num_rows(), path.display());
    Ok(table)
}

fn write_output(codecs: &CodecRegistry, table: &Table, path: &Path) -> Result<u64> {
    let file_type = FileTypeConfig::for_extension(
        &path
            .extension()
            .map(|e| e.to_string_lossy().into_owned())
            .unwrap_or_default(),
    )
    .unwrap_or_default();
    let file =
        File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    let rows = codecs
        .create(&file_type)?
        .write_table(table, Box::new(file), &|_| {})
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(rows)
}

async fn run_tool(
    settings_path: &Path,
    input_paths: &[PathBuf],
    output_dir: &Path,
    format: OutputFormat,
    print_metrics: bool,
) -> Result<()> {
    info!("Loading job from {:?}", settings_path);
    let settings = load_settings(settings_path)?;
    let config = RunnerConfig::from_env()?;
    let codecs = Arc::new(CodecRegistry::with_defaults().with_write_batch_rows(config.write_batch_rows));
    let executors = Arc::new(ExecutorRegistry::with_defaults());

    let inputs = input_paths
        .iter()
        .map(|path| read_input(&codecs, path))
        .collect::<Result<Vec<_>>>()?;

    let (sink, mut lines) = output_channel();
    let printer = tokio::spawn(async move {
        while let Some(line) = lines.recv().await {
            info!("[chunk {} {}] {}", line.chunk, line.stream, line.line);
        }
    });

    let listener: Arc<dyn ProgressListener> = Arc::new(|fraction: f64, message: Option<&str>| {
        debug!("Progress {:.0}% {}", fraction * 100.0, message.unwrap_or(""));
    });
    let monitor = ProgressMonitor::new(Some(listener));
    let token = monitor.token().clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping external tool");
            token.cancel();
        }
    });

    let mut runner = ExternalToolRunner::new(settings, config, executors, codecs.clone())
        .with_output_sink(sink);
    let result = runner.execute(&inputs, &monitor).await;
    let metrics = runner.metrics().clone();
    drop(runner);
    let _ = printer.await;
    let outcome = result?;

    if let Some(message) = outcome.warning_message() {
        eprintln!("Warning: {}", message);
    }

    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("Failed to create {}", output_dir.display()))?;
    let extension = match format {
        OutputFormat::Csv => "csv",
        OutputFormat::Parquet => "parquet",
    };
    for (port, table) in outcome.tables.iter().enumerate() {
        let path = output_dir.join(format!("port{}.{}", port, extension));
        let rows = write_output(&codecs, table, &path)?;
        println!("Output port {}: {} row(s) -> {}", port, rows, path.display());
    }

    if print_metrics {
        print!("{}", metrics.encode()?);
    }
    Ok(())
}

fn show_plan(rows: usize, policy: ChunkPolicy) -> Result<()> {
    let plan = ChunkPlan::new(rows, policy)?;
    println!(
        "{} row(s) in {} chunk(s) of up to {} row(s)",
        plan.row_count, plan.chunk_count, plan.rows_per_chunk
    );
    for (chunk, range) in plan.ranges().into_iter().enumerate() {
        println!("  chunk {}: rows {}..{}", chunk, range.start, range.end);
    }
    Ok(())
}
