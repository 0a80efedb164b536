//! Parquet codec (Snappy compressed).

use std::fs::File;
use std::io::Write;
use std::path::Path;

use ::parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use ::parquet::arrow::ArrowWriter;
use ::parquet::basic::Compression;
use ::parquet::file::properties::WriterProperties;
use arrow::compute::concat_batches;
use arrow::datatypes::SchemaRef;
use serde::{Deserialize, Serialize};
use tracing::debug;
use xtool_core::Table;

use crate::error::Result;
use crate::{split_key_column, strip_key_field, with_key_column, write_in_slices, ProgressFn};
use crate::{TableCodec, DEFAULT_WRITE_BATCH_ROWS};

/// Options of the Parquet file type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParquetOptions {
    pub write_row_key: Option<String>,
    pub read_row_key: Option<String>,
}

impl Default for ParquetOptions {
    fn default() -> Self {
        Self {
            write_row_key: Some("RowID".to_string()),
            read_row_key: None,
        }
    }
}

pub struct ParquetCodec {
    options: ParquetOptions,
    batch_rows: usize,
}

impl ParquetCodec {
    pub fn new(options: ParquetOptions) -> Self {
        Self {
            options,
            batch_rows: DEFAULT_WRITE_BATCH_ROWS,
        }
    }

    pub fn with_batch_rows(mut self, batch_rows: usize) -> Self {
        self.batch_rows = batch_rows.max(1);
        self
    }
}

impl TableCodec for ParquetCodec {
    fn id(&self) -> &str {
        "parquet"
    }

    fn extension(&self) -> &str {
        "parquet"
    }

    fn write_table(
        &self,
        table: &Table,
        writer: Box<dyn Write + Send>,
        progress: ProgressFn<'_>,
    ) -> Result<u64> {
        let batch = match &self.options.write_row_key {
            Some(name) => with_key_column(table, name)?,
            None => table.batch().clone(),
        };

        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        let mut parquet_writer = ArrowWriter::try_new(writer, batch.schema(), Some(props))?;
        let rows = write_in_slices(&batch, self.batch_rows, progress, |slice| {
            parquet_writer.write(slice)?;
            Ok(())
        })?;
        parquet_writer.close()?;

        debug!("Wrote {} Parquet rows", rows);
        Ok(rows)
    }

    fn read_table(&self, path: &Path, progress: ProgressFn<'_>) -> Result<Table> {
        let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?;
        let schema = builder.schema().clone();
        let total = builder.metadata().file_metadata().num_rows().max(0) as usize;
        let reader = builder.build()?;

        let mut batches = Vec::new();
        let mut seen = 0usize;
        for batch in reader {
            let batch = batch?;
            seen += batch.num_rows();
            if total > 0 {
                progress(seen as f64 / total as f64);
            }
            batches.push(batch);
        }
        progress(1.0);

        let batch = concat_batches(&schema, &batches)?;
        debug!("Read {} Parquet rows from {}", batch.num_rows(), path.display());
        split_key_column(batch, self.options.read_row_key.as_deref(), "Parquet", path)
    }

    fn read_schema(&self, path: &Path) -> Result<SchemaRef> {
        let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?;
        Ok(strip_key_field(
            builder.schema().clone(),
            self.options.read_row_key.as_deref(),
        ))
    }
}
