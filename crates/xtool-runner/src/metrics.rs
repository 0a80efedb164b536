//! Prometheus metrics for external tool runs.

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::sync::Arc;

#[derive(Clone)]
pub struct RunnerMetrics {
    pub chunks_started: Counter,
    pub chunks_succeeded: Counter,
    pub chunks_failed: Counter,
    pub rows_written: Counter,
    pub rows_read: Counter,
    pub active_processes: Gauge,
    pub registry: Arc<Registry>,
}

impl RunnerMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let chunks_started = Counter::default();
        registry.register(
            "xtool_chunks_started",
            "Chunks handed to an executor",
            chunks_started.clone(),
        );

        let chunks_succeeded = Counter::default();
        registry.register(
            "xtool_chunks_succeeded",
            "Chunks whose outputs were read back",
            chunks_succeeded.clone(),
        );

        let chunks_failed = Counter::default();
        registry.register(
            "xtool_chunks_failed",
            "Chunks that failed or were cancelled",
            chunks_failed.clone(),
        );

        let rows_written = Counter::default();
        registry.register(
            "xtool_rows_written",
            "Rows staged to input files",
            rows_written.clone(),
        );

        let rows_read = Counter::default();
        registry.register(
            "xtool_rows_read",
            "Rows read back from output files",
            rows_read.clone(),
        );

        let active_processes = Gauge::default();
        registry.register(
            "xtool_active_processes",
            "External processes currently running",
            active_processes.clone(),
        );

        Self {
            chunks_started,
            chunks_succeeded,
            chunks_failed,
            rows_written,
            rows_read,
            active_processes,
            registry: Arc::new(registry),
        }
    }

    /// Encode all metrics as Prometheus text format.
    pub fn encode(&self) -> Result<String, std::fmt::Error> {
        let mut buf = String::new();
        encode(&mut buf, &self.registry)?;
        Ok(buf)
    }
}

impl Default for RunnerMetrics {
    fn default() -> Self {
        Self::new()
    }
}
