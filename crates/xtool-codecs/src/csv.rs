//! CSV codec on top of the Arrow CSV reader/writer.

use std::fs::File;
use std::io::{BufReader, Write};
use std::path::Path;
use std::sync::Arc;

use arrow::compute::concat_batches;
use arrow::csv::reader::Format;
use arrow::csv::{ReaderBuilder, WriterBuilder};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use serde::{Deserialize, Serialize};
use tracing::debug;
use xtool_core::Table;

use crate::error::{CodecError, Result};
use crate::{split_key_column, strip_key_field, with_key_column, write_in_slices, ProgressFn};
use crate::{TableCodec, DEFAULT_WRITE_BATCH_ROWS};

/// Options of the CSV file type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CsvOptions {
    pub delimiter: char,
    pub has_header: bool,
    /// Name of the column the row keys are written to, first in each row.
    /// `None` writes cells only.
    pub write_row_key: Option<String>,
    /// Column to take row keys from when reading. `None` generates keys.
    pub read_row_key: Option<String>,
    /// Columns always read as text instead of type-inferred, in addition
    /// to the key columns.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub text_columns: Vec<String>,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            delimiter: ',',
            has_header: true,
            write_row_key: Some("RowID".to_string()),
            read_row_key: None,
            text_columns: Vec::new(),
        }
    }
}

pub struct CsvCodec {
    options: CsvOptions,
    delimiter: u8,
    batch_rows: usize,
}

impl CsvCodec {
    pub fn new(options: CsvOptions) -> Result<Self> {
        let delimiter = u8::try_from(options.delimiter)
            .ok()
            .filter(|b| b.is_ascii())
            .ok_or_else(|| {
                CodecError::InvalidOptions(format!(
                    "CSV delimiter must be a single ASCII character, got '{}'",
                    options.delimiter
                ))
            })?;
        Ok(Self {
            options,
            delimiter,
            batch_rows: DEFAULT_WRITE_BATCH_ROWS,
        })
    }

    pub fn with_batch_rows(mut self, batch_rows: usize) -> Self {
        self.batch_rows = batch_rows.max(1);
        self
    }

    fn format(&self) -> Format {
        Format::default()
            .with_header(self.options.has_header)
            .with_delimiter(self.delimiter)
    }

    /// Whether `name` is read verbatim. Key columns hold row keys such as
    /// `007`, which must not turn into the number 7.
    fn is_text_column(&self, name: &str) -> bool {
        self.options.write_row_key.as_deref() == Some(name)
            || self.options.read_row_key.as_deref() == Some(name)
            || self.options.text_columns.iter().any(|c| c == name)
    }

    /// Infer the raw file schema (key column included). `None` for an empty file.
    fn infer(&self, path: &Path, max_records: Option<usize>) -> Result<Option<SchemaRef>> {
        let file = File::open(path)?;
        if file.metadata()?.len() == 0 {
            return Ok(None);
        }
        let (schema, _) = self
            .format()
            .infer_schema(BufReader::new(file), max_records)?;
        let fields: Vec<Field> = schema
            .fields()
            .iter()
            .map(|field| {
                if self.is_text_column(field.name()) {
                    field.as_ref().clone().with_data_type(DataType::Utf8)
                } else {
                    field.as_ref().clone()
                }
            })
            .collect();
        Ok(Some(Arc::new(Schema::new(fields))))
    }
}

impl TableCodec for CsvCodec {
    fn id(&self) -> &str {
        "csv"
    }

    fn extension(&self) -> &str {
        "csv"
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

        let mut csv_writer = WriterBuilder::new()
            .with_header(self.options.has_header)
            .with_delimiter(self.delimiter)
            .build(writer);
        let rows = write_in_slices(&batch, self.batch_rows, progress, |slice| {
            csv_writer.write(slice)?;
            Ok(())
        })?;
        let mut inner = csv_writer.into_inner();
        inner.flush()?;

        debug!("Wrote {} CSV rows", rows);
        Ok(rows)
    }

    fn read_table(&self, path: &Path, progress: ProgressFn<'_>) -> Result<Table> {
        let Some(schema) = self.infer(path, None)? else {
            progress(1.0);
            return Ok(Table::empty(Arc::new(Schema::empty())));
        };

        let reader = ReaderBuilder::new(schema.clone())
            .with_format(self.format())
            .build(File::open(path)?)?;
        let batches = reader.collect::<std::result::Result<Vec<_>, _>>()?;
        let batch = concat_batches(&schema, &batches)?;
        progress(1.0);

        debug!("Read {} CSV rows from {}", batch.num_rows(), path.display());
        split_key_column(batch, self.options.read_row_key.as_deref(), "CSV", path)
    }

    fn read_schema(&self, path: &Path) -> Result<SchemaRef> {
        match self.infer(path, Some(1000))? {
            Some(schema) => Ok(strip_key_field(schema, self.options.read_row_key.as_deref())),
            None => Ok(Arc::new(Schema::empty())),
        }
    }
}
