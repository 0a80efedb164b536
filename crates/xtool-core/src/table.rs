//! Keyed table model: an Arrow batch plus one string key per row.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arrow::array::{Array, ArrayRef};
use arrow::datatypes::SchemaRef;
use arrow::record_batch::RecordBatch;
use arrow::util::display::{ArrayFormatter, FormatOptions};

use crate::error::{CoreError, Result};

/// Prefix of generated row keys (`Row0`, `Row1`, ...).
pub const ROW_KEY_PREFIX: &str = "Row";

/// An ordered, keyed table.
///
/// Cells live in a single `RecordBatch`; a missing value is an Arrow null.
/// `keys[i]` is the identity of row `i`.
#[derive(Debug, Clone)]
pub struct Table {
    batch: RecordBatch,
    keys: Vec<String>,
}

impl Table {
    /// Create a table, checking that there is exactly one key per row.
    pub fn try_new(batch: RecordBatch, keys: Vec<String>) -> Result<Self> {
        if batch.num_rows() != keys.len() {
            return Err(CoreError::KeyCountMismatch {
                rows: batch.num_rows(),
                keys: keys.len(),
            });
        }
        Ok(Self { batch, keys })
    }

    /// Create a table whose keys are `Row0`, `Row1`, ...
    pub fn with_generated_keys(batch: RecordBatch) -> Self {
        let keys = (0..batch.num_rows())
            .map(|i| format!("{ROW_KEY_PREFIX}{i}"))
            .collect();
        Self { batch, keys }
    }

    /// A table with the given schema and no rows.
    pub fn empty(schema: SchemaRef) -> Self {
        Self {
            batch: RecordBatch::new_empty(schema),
            keys: Vec::new(),
        }
    }

    pub fn schema(&self) -> SchemaRef {
        self.batch.schema()
    }

    pub fn batch(&self) -> &RecordBatch {
        &self.batch
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn num_rows(&self) -> usize {
        self.batch.num_rows()
    }

    pub fn num_columns(&self) -> usize {
        self.batch.num_columns()
    }

    pub fn is_empty(&self) -> bool {
        self.num_rows() == 0
    }

    pub fn column(&self, idx: usize) -> &ArrayRef {
        self.batch.column(idx)
    }

    pub fn into_parts(self) -> (RecordBatch, Vec<String>) {
        (self.batch, self.keys)
    }

    /// Zero-copy view of rows `[start, start + len)`.
    pub fn slice(&self, start: usize, len: usize) -> Table {
        Table {
            batch: self.batch.slice(start, len),
            keys: self.keys[start..start + len].to_vec(),
        }
    }

    /// Replace all row keys, keeping cell content.
    pub fn with_keys(self, keys: Vec<String>) -> Result<Table> {
        Table::try_new(self.batch, keys)
    }

    /// Return the first key that occurs more than once, if any.
    pub fn duplicate_key(&self) -> Option<&str> {
        let mut seen = HashSet::with_capacity(self.keys.len());
        self.keys
            .iter()
            .find(|k| !seen.insert(k.as_str()))
            .map(|k| k.as_str())
    }

    /// Stringify every value of a column; nulls become `None`.
    pub fn column_strings(&self, idx: usize) -> Result<Vec<Option<String>>> {
        stringify_column(self.batch.column(idx))
    }
}

/// Stringify an array using Arrow's display rules.
pub fn stringify_column(array: &ArrayRef) -> Result<Vec<Option<String>>> {
    let options = FormatOptions::default();
    let formatter = ArrayFormatter::try_new(array.as_ref(), &options).map_err(|e| {
        CoreError::Join(format!(
            "values of type {} cannot be used as row identifiers: {}",
            array.data_type(),
            e
        ))
    })?;
    Ok((0..array.len())
        .map(|i| {
            if array.is_null(i) {
                None
            } else {
                Some(formatter.value(i).to_string())
            }
        })
        .collect())
}

/// Collision-free row key source shared by all chunks of one run.
///
/// Keys are drawn with a single atomic add per chunk, so concurrent chunks
/// never see the same value. No ordering between chunks is implied.
#[derive(Debug, Default)]
pub struct RowIdUnifier {
    next: AtomicU64,
}

impl RowIdUnifier {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Reserve `count` consecutive keys.
    pub fn next_keys(&self, count: usize) -> Vec<String> {
        let start = self.next.fetch_add(count as u64, Ordering::Relaxed);
        (start..start + count as u64)
            .map(|i| format!("{ROW_KEY_PREFIX}{i}"))
            .collect()
    }

    /// Re-key every row of `table` with fresh keys.
    pub fn rekey(&self, table: Table) -> Result<Table> {
        let keys = self.next_keys(table.num_rows());
        table.with_keys(keys)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};

    fn sample() -> Table {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
        ]));
        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(Int64Array::from(vec![1, 2, 3])),
                Arc::new(StringArray::from(vec![Some("a"), None, Some("c")])),
            ],
        )
        .unwrap();
        Table::with_generated_keys(batch)
    }

    #[test]
    fn test_generated_keys() {
        let table = sample();
        assert_eq!(table.keys(), &["Row0", "Row1", "Row2"]);
        assert!(table.duplicate_key().is_none());
    }

    #[test]
    fn test_key_count_mismatch() {
        let table = sample();
        let err = table.with_keys(vec!["a".to_string()]).unwrap_err();
        assert!(matches!(err, CoreError::KeyCountMismatch { rows: 3, keys: 1 }));
    }

    #[test]
    fn test_slice_keeps_keys_aligned() {
        let table = sample();
        let slice = table.slice(1, 2);
        assert_eq!(slice.num_rows(), 2);
        assert_eq!(slice.keys(), &["Row1", "Row2"]);
        let ids = slice.column_strings(0).unwrap();
        assert_eq!(ids, vec![Some("2".to_string()), Some("3".to_string())]);
    }

    #[test]
    fn test_column_strings_nulls() {
        let table = sample();
        let names = table.column_strings(1).unwrap();
        assert_eq!(names, vec![Some("a".to_string()), None, Some("c".to_string())]);
    }

    #[test]
    fn test_duplicate_key_detected() {
        let table = sample()
            .with_keys(vec!["A".into(), "B".into(), "A".into()])
            .unwrap();
        assert_eq!(table.duplicate_key(), Some("A"));
    }

    #[test]
    fn test_unifier_unique_across_threads() {
        let unifier = RowIdUnifier::new();
        let mut all: Vec<String> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let u = unifier.clone();
                    s.spawn(move || u.next_keys(100))
                })
                .collect();
            handles
                .into_iter()
                .flat_map(|h| h.join().unwrap())
                .collect()
        });
        let total = all.len();
        all.sort();
        all.dedup();
        assert_eq!(total, 800);
        assert_eq!(all.len(), 800);
    }
}
