//! Codec factory: file types resolved by id through an explicit registry.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::csv::{CsvCodec, CsvOptions};
use crate::error::{CodecError, Result};
use crate::parquet::{ParquetCodec, ParquetOptions};
use crate::{TableCodec, DEFAULT_WRITE_BATCH_ROWS};

/// File type of one port, as stored in job settings.
///
/// ```json
/// { "type": "csv", "delimiter": ";" }
/// { "type": "custom", "id": "my-format", "options": { ... } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FileTypeConfig {
    Csv(CsvOptions),
    Parquet(ParquetOptions),
    Custom {
        id: String,
        #[serde(default)]
        options: serde_json::Value,
    },
}

impl Default for FileTypeConfig {
    fn default() -> Self {
        Self::Csv(CsvOptions::default())
    }
}

impl FileTypeConfig {
    /// Registry id this config resolves to.
    pub fn id(&self) -> &str {
        match self {
            Self::Csv(_) => "csv",
            Self::Parquet(_) => "parquet",
            Self::Custom { id, .. } => id,
        }
    }

    /// The same file type with `column` read as text where the format
    /// infers column types.
    pub fn with_text_column(mut self, column: &str) -> Self {
        if let Self::Csv(options) = &mut self {
            if !options.text_columns.iter().any(|c| c == column) {
                options.text_columns.push(column.to_string());
            }
        }
        self
    }

    /// Built-in file type for a file extension (case-insensitive), with default options.
    pub fn for_extension(extension: &str) -> Option<Self> {
        match extension.to_ascii_lowercase().as_str() {
            "csv" | "tsv" | "txt" => Some(Self::Csv(CsvOptions {
                delimiter: if extension.eq_ignore_ascii_case("tsv") { '\t' } else { ',' },
                ..Default::default()
            })),
            "parquet" | "pq" => Some(Self::Parquet(ParquetOptions::default())),
            _ => None,
        }
    }
}

/// Builds a codec from its config and the writer batch size.
pub type CodecConstructor = fn(&FileTypeConfig, usize) -> Result<Arc<dyn TableCodec>>;

/// Options of a built-in type, taken from the typed variant or from the
/// free-form options of a `custom` entry naming the same id.
fn options_of<T: DeserializeOwned + Default>(config: &FileTypeConfig) -> Result<T> {
    match config {
        FileTypeConfig::Custom { id, options } => {
            if options.is_null() {
                return Ok(T::default());
            }
            serde_json::from_value(options.clone())
                .map_err(|e| CodecError::InvalidOptions(format!("{}: {}", id, e)))
        }
        other => Err(CodecError::InvalidOptions(format!(
            "unexpected config for type '{}'",
            other.id()
        ))),
    }
}

fn build_csv(config: &FileTypeConfig, batch_rows: usize) -> Result<Arc<dyn TableCodec>> {
    let options = match config {
        FileTypeConfig::Csv(options) => options.clone(),
        other => options_of::<CsvOptions>(other)?,
    };
    Ok(Arc::new(CsvCodec::new(options)?.with_batch_rows(batch_rows)))
}

fn build_parquet(config: &FileTypeConfig, batch_rows: usize) -> Result<Arc<dyn TableCodec>> {
    let options = match config {
        FileTypeConfig::Parquet(options) => options.clone(),
        other => options_of::<ParquetOptions>(other)?,
    };
    Ok(Arc::new(
        ParquetCodec::new(options).with_batch_rows(batch_rows),
    ))
}

/// Registry of file types. Constructed once and shared by reference.
#[derive(Clone)]
pub struct CodecRegistry {
    constructors: BTreeMap<String, CodecConstructor>,
    write_batch_rows: usize,
}

impl CodecRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            constructors: BTreeMap::new(),
            write_batch_rows: DEFAULT_WRITE_BATCH_ROWS,
        }
    }

    /// Registry with the built-in `csv` and `parquet` types.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("csv", build_csv);
        registry.register("parquet", build_parquet);
        registry
    }

    /// Rows per batch handed to the writers of codecs created from now on.
    pub fn with_write_batch_rows(mut self, rows: usize) -> Self {
        self.write_batch_rows = rows.max(1);
        self
    }

    /// Register (or replace) the constructor for `id`.
    pub fn register(&mut self, id: impl Into<String>, constructor: CodecConstructor) {
        let id = id.into();
        debug!("Registered file type '{}'", id);
        self.constructors.insert(id, constructor);
    }

    pub fn create(&self, config: &FileTypeConfig) -> Result<Arc<dyn TableCodec>> {
        let constructor = self
            .constructors
            .get(config.id())
            .ok_or_else(|| CodecError::UnknownFileType(config.id().to_string()))?;
        constructor(config, self.write_batch_rows)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.constructors.contains_key(id)
    }

    pub fn ids(&self) -> Vec<&str> {
        self.constructors.keys().map(String::as_str).collect()
    }
}

impl Default for CodecRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
