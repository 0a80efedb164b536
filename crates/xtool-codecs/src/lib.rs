//! xtool Codecs - staged file formats
//!
//! This crate provides the codecs that turn a keyed table into a file the
//! external tool can consume, and turn the tool's output files back into
//! tables:
//! - CSV (Arrow CSV reader/writer, schema inferred on read)
//! - Parquet (Arrow Parquet writer, Snappy compressed)

pub mod csv;
pub mod error;
pub mod factory;
pub mod parquet;

pub use crate::csv::{CsvCodec, CsvOptions};
pub use crate::parquet::{ParquetCodec, ParquetOptions};
pub use error::CodecError;
pub use factory::{CodecConstructor, CodecRegistry, FileTypeConfig};

use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use arrow::array::{ArrayRef, StringArray};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use xtool_core::table::stringify_column;
use xtool_core::Table;

use error::Result;

/// Rows per batch handed to the underlying writer.
pub const DEFAULT_WRITE_BATCH_ROWS: usize = 1024;

/// Reports the completed fraction (0.0..=1.0) of a write or read.
pub type ProgressFn<'a> = &'a (dyn Fn(f64) + Send + Sync);

/// A file format for staging tables.
///
/// Codecs are blocking; async callers run them on a blocking thread.
pub trait TableCodec: Send + Sync {
    /// Registry id of the format (`csv`, `parquet`).
    fn id(&self) -> &str;

    /// File extension without the leading dot.
    fn extension(&self) -> &str;

    /// Write all rows of `table` to `writer`. Must accept tables without rows.
    /// Returns the number of rows written.
    fn write_table(
        &self,
        table: &Table,
        writer: Box<dyn Write + Send>,
        progress: ProgressFn<'_>,
    ) -> Result<u64>;

    /// Read a staged file back into a table.
    fn read_table(&self, path: &Path, progress: ProgressFn<'_>) -> Result<Table>;

    /// Read only the schema of a staged file (as `read_table` would produce it).
    fn read_schema(&self, path: &Path) -> Result<SchemaRef>;
}

/// Prepend the row keys as a non-null string column named `name`.
pub(crate) fn with_key_column(table: &Table, name: &str) -> Result<RecordBatch> {
    let schema = table.schema();
    let mut fields: Vec<Field> = Vec::with_capacity(schema.fields().len() + 1);
    fields.push(Field::new(name, DataType::Utf8, false));
    fields.extend(schema.fields().iter().map(|f| f.as_ref().clone()));

    let mut columns: Vec<ArrayRef> = Vec::with_capacity(fields.len());
    columns.push(Arc::new(StringArray::from_iter_values(table.keys().iter())));
    columns.extend(table.batch().columns().iter().cloned());

    let options = RecordBatchOptions::new().with_row_count(Some(table.num_rows()));
    Ok(RecordBatch::try_new_with_options(
        Arc::new(Schema::new(fields)),
        columns,
        &options,
    )?)
}

/// Turn a decoded batch into a table, taking row keys from `key_column`
/// when it is configured and present. Otherwise keys are generated.
pub(crate) fn split_key_column(
    batch: RecordBatch,
    key_column: Option<&str>,
    format: &'static str,
    path: &Path,
) -> Result<Table> {
    let Some(idx) = key_column.and_then(|name| batch.schema().index_of(name).ok()) else {
        return Ok(Table::with_generated_keys(batch));
    };

    let keys = stringify_column(batch.column(idx))?
        .into_iter()
        .enumerate()
        .map(|(row, key)| {
            key.ok_or_else(|| error::CodecError::Malformed {
                format,
                path: path.display().to_string(),
                message: format!("row {} has no row key", row),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let rest: Vec<usize> = (0..batch.num_columns()).filter(|i| *i != idx).collect();
    let data = batch.project(&rest)?;
    Ok(Table::try_new(data, keys)?)
}

/// Drop the key column from a schema read from file, mirroring `split_key_column`.
pub(crate) fn strip_key_field(schema: SchemaRef, key_column: Option<&str>) -> SchemaRef {
    match key_column.and_then(|name| schema.index_of(name).ok()) {
        Some(idx) => {
            let fields: Vec<Field> = schema
                .fields()
                .iter()
                .enumerate()
                .filter(|(i, _)| *i != idx)
                .map(|(_, f)| f.as_ref().clone())
                .collect();
            Arc::new(Schema::new(fields))
        }
        None => schema,
    }
}

/// Feed `batch` to `write` in slices of `batch_rows`, reporting progress.
/// A batch without rows is still written once so headers/schemas land on disk.
pub(crate) fn write_in_slices<F>(
    batch: &RecordBatch,
    batch_rows: usize,
    progress: ProgressFn<'_>,
    mut write: F,
) -> Result<u64>
where
    F: FnMut(&RecordBatch) -> Result<()>,
{
    let total = batch.num_rows();
    if total == 0 {
        write(batch)?;
        progress(1.0);
        return Ok(0);
    }
    let step = batch_rows.max(1);
    let mut offset = 0;
    while offset < total {
        let len = step.min(total - offset);
        write(&batch.slice(offset, len))?;
        offset += len;
        progress(offset as f64 / total as f64);
    }
    Ok(total as u64)
}
