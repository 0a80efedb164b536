//! Runner configuration from environment variables.

use std::path::PathBuf;

use anyhow::{Context, Result};

/// Lines of stdout/stderr retained per stream and chunk.
pub const DEFAULT_OUTPUT_BUFFER_LINES: usize = 500;

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Worker pool size override. `None` sizes the pool from the CPU count.
    pub max_threads: Option<usize>,
    /// Root of the per-run working directories.
    pub tmp_dir: PathBuf,
    pub output_buffer_lines: usize,
    /// Rows per batch handed to the staging writers.
    pub write_batch_rows: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            max_threads: None,
            tmp_dir: std::env::temp_dir(),
            output_buffer_lines: DEFAULT_OUTPUT_BUFFER_LINES,
            write_batch_rows: xtool_codecs::DEFAULT_WRITE_BATCH_ROWS,
        }
    }
}

impl RunnerConfig {
    pub fn from_env() -> Result<Self> {
        let max_threads = match std::env::var("XTOOL_MAX_THREADS") {
            Ok(value) => {
                let threads: usize = value.parse().context("Invalid XTOOL_MAX_THREADS")?;
                anyhow::ensure!(threads > 0, "XTOOL_MAX_THREADS must be at least 1");
                Some(threads)
            }
            Err(_) => None,
        };

        Ok(Self {
            max_threads,
            tmp_dir: std::env::var("XTOOL_TMP_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| std::env::temp_dir()),
            output_buffer_lines: std::env::var("XTOOL_OUTPUT_BUFFER_LINES")
                .unwrap_or_else(|_| DEFAULT_OUTPUT_BUFFER_LINES.to_string())
                .parse()
                .context("Invalid XTOOL_OUTPUT_BUFFER_LINES")?,
            write_batch_rows: std::env::var("XTOOL_WRITE_BATCH_ROWS")
                .unwrap_or_else(|_| xtool_codecs::DEFAULT_WRITE_BATCH_ROWS.to_string())
                .parse()
                .context("Invalid XTOOL_WRITE_BATCH_ROWS")?,
        })
    }

    /// Worker pool size: `job_override`, then the configured override,
    /// then a default derived from the host's CPU count.
    pub fn pool_size(&self, job_override: Option<usize>) -> usize {
        job_override
            .or(self.max_threads)
            .unwrap_or_else(|| {
                let cores = std::thread::available_parallelism()
                    .map(|n| n.get())
                    .unwrap_or(1);
                default_pool_size(cores)
            })
            .max(1)
    }
}

/// A few threads above the core count, since chunk workers mostly wait on
/// external processes.
pub fn default_pool_size(cores: usize) -> usize {
    match cores {
        0..=2 => cores + 1,
        3..=4 => cores + 2,
        _ => cores + 4,
    }
}
