//! Order-preserving outer join of the original input with the tool output.
//!
//! The tool is expected to echo each input row's key in an ID column and to
//! keep roughly the input order. Both sides are walked once, left to right:
//! a run of consecutive output rows whose ID equals the current input key is
//! matched to that input row. Output rows with IDs that appear out of order
//! are therefore not matched and surface as orphans at the end.

use std::collections::HashSet;
use std::sync::Arc;

use arrow::array::{ArrayRef, UInt64Array};
use arrow::compute::take;
use arrow::datatypes::{Field, Schema, SchemaRef};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::table::Table;

/// Join configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOptions {
    /// Output column holding the input row key.
    pub id_column: String,
    /// Separator used when a key has to be disambiguated (`A`, `A_1`, ...).
    pub key_separator: String,
}

impl Default for JoinOptions {
    fn default() -> Self {
        Self {
            id_column: "RowID".to_string(),
            key_separator: "_".to_string(),
        }
    }
}

/// Return `base`, or `base (#n)` with the smallest `n` not in `used`.
fn unique_column_name(base: &str, used: &HashSet<String>) -> String {
    if !used.contains(base) {
        return base.to_string();
    }
    (1..)
        .map(|n| format!("{base} (#{n})"))
        .find(|candidate| !used.contains(candidate))
        .unwrap_or_else(|| base.to_string())
}

/// Joined schema plus the output column indices that are carried over.
fn joined_layout(input: &Schema, output: &Schema, id_column: &str) -> Result<(SchemaRef, Vec<usize>)> {
    let id_idx = output.index_of(id_column).map_err(|_| {
        CoreError::Join(format!(
            "ID column '{}' not found in tool output (columns: {})",
            id_column,
            output
                .fields()
                .iter()
                .map(|f| f.name().as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    })?;

    let mut used: HashSet<String> = HashSet::new();
    let mut fields = Vec::with_capacity(input.fields().len() + output.fields().len());
    for field in input.fields() {
        let name = unique_column_name(field.name(), &used);
        used.insert(name.clone());
        fields.push(Field::new(name, field.data_type().clone(), true));
    }

    let mut kept = Vec::with_capacity(output.fields().len());
    for (idx, field) in output.fields().iter().enumerate() {
        if idx == id_idx {
            continue;
        }
        let name = unique_column_name(field.name(), &used);
        used.insert(name.clone());
        fields.push(Field::new(name, field.data_type().clone(), true));
        kept.push(idx);
    }

    Ok((Arc::new(Schema::new(fields)), kept))
}

/// Schema of the joined table: all input columns, then all output columns
/// except the ID column, renamed on collision. Every column is nullable
/// since either side may be missing.
pub fn join_spec(input: &Schema, output: &Schema, id_column: &str) -> Result<SchemaRef> {
    joined_layout(input, output, id_column).map(|(schema, _)| schema)
}

/// Hands out row keys, disambiguating collisions with `<key><sep><n>`.
struct KeyUniquifier<'a> {
    used: HashSet<String>,
    separator: &'a str,
}

impl KeyUniquifier<'_> {
    fn claim(&mut self, candidate: String) -> String {
        if self.used.insert(candidate.clone()) {
            return candidate;
        }
        let mut n = 1usize;
        loop {
            let next = format!("{}{}{}", candidate, self.separator, n);
            if self.used.insert(next.clone()) {
                return next;
            }
            n += 1;
        }
    }
}

/// `take` indices for row positions; `None` selects a null row.
fn take_indices(rows: &[Option<usize>]) -> UInt64Array {
    rows.iter().map(|row| row.map(|r| r as u64)).collect()
}

/// Outer-join `input` with the tool `output` on `output[id_column] == input key`.
///
/// Every input row appears at least once, in input order. Duplicate matches
/// get keys `A`, `A_1`, `A_2`, ... Unmatched output rows are appended with
/// a missing input side.
pub fn join_tables(input: &Table, output: &Table, options: &JoinOptions) -> Result<Table> {
    let (schema, kept) = joined_layout(&input.schema(), &output.schema(), &options.id_column)?;
    let id_idx = output
        .schema()
        .index_of(&options.id_column)
        .map_err(|e| CoreError::Join(e.to_string()))?;
    let ids = output.column_strings(id_idx)?;

    let capacity = input.num_rows().max(output.num_rows());
    let mut left: Vec<Option<usize>> = Vec::with_capacity(capacity);
    let mut right: Vec<Option<usize>> = Vec::with_capacity(capacity);
    let mut keys: Vec<String> = Vec::with_capacity(capacity);
    let mut uniquifier = KeyUniquifier {
        used: HashSet::with_capacity(capacity),
        separator: &options.key_separator,
    };

    let mut cursor = 0usize;
    let mut matched_rows = 0usize;
    for (row, key) in input.keys().iter().enumerate() {
        let mut matches = 0usize;
        while cursor < ids.len() && ids[cursor].as_deref() == Some(key.as_str()) {
            let candidate = if matches == 0 {
                key.clone()
            } else {
                format!("{}{}{}", key, options.key_separator, matches)
            };
            left.push(Some(row));
            right.push(Some(cursor));
            keys.push(uniquifier.claim(candidate));
            matches += 1;
            cursor += 1;
        }
        if matches == 0 {
            left.push(Some(row));
            right.push(None);
            keys.push(uniquifier.claim(key.clone()));
        } else {
            matched_rows += 1;
        }
    }

    let orphans = ids.len() - cursor;
    for (offset, id) in ids[cursor..].iter().enumerate() {
        let row = cursor + offset;
        let candidate = id.clone().unwrap_or_else(|| output.keys()[row].clone());
        left.push(None);
        right.push(Some(row));
        keys.push(uniquifier.claim(candidate));
    }

    let left = take_indices(&left);
    let right = take_indices(&right);
    let mut columns: Vec<ArrayRef> = Vec::with_capacity(schema.fields().len());
    for col in input.batch().columns() {
        columns.push(take(col.as_ref(), &left, None)?);
    }
    for idx in kept {
        columns.push(take(output.column(idx).as_ref(), &right, None)?);
    }

    let options = RecordBatchOptions::new().with_row_count(Some(keys.len()));
    let batch = RecordBatch::try_new_with_options(schema, columns, &options)?;
    debug!(
        "Joined {} input rows with {} output rows: {} matched, {} orphaned",
        input.num_rows(),
        output.num_rows(),
        matched_rows,
        orphans
    );
    Table::try_new(batch, keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, Int64Array, StringArray};
    use arrow::datatypes::DataType;

    fn input(keys: &[&str]) -> Table {
        let schema = Arc::new(Schema::new(vec![Field::new("name", DataType::Utf8, false)]));
        let names: Vec<String> = keys.iter().map(|k| format!("name-{k}")).collect();
        let batch = RecordBatch::try_new(schema, vec![Arc::new(StringArray::from(names))]).unwrap();
        Table::try_new(batch, keys.iter().map(|k| k.to_string()).collect()).unwrap()
    }

    fn output(rows: &[(Option<&str>, i64)]) -> Table {
        let schema = Arc::new(Schema::new(vec![
            Field::new("RowID", DataType::Utf8, true),
            Field::new("x", DataType::Int64, false),
        ]));
        let ids: Vec<Option<&str>> = rows.iter().map(|r| r.0).collect();
        let xs: Vec<i64> = rows.iter().map(|r| r.1).collect();
        let batch = RecordBatch::try_new(
            schema,
            vec![Arc::new(StringArray::from(ids)), Arc::new(Int64Array::from(xs))],
        )
        .unwrap();
        Table::with_generated_keys(batch)
    }

    fn strings(table: &Table, idx: usize) -> Vec<Option<String>> {
        table.column_strings(idx).unwrap()
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_take_indices_beyond_u32() {
        let past_u32 = u32::MAX as usize + 2;
        let indices = take_indices(&[Some(0), None, Some(past_u32)]);
        assert_eq!(indices.value(0), 0);
        assert!(indices.is_null(1));
        assert_eq!(indices.value(2), u32::MAX as u64 + 2);
    }

    #[test]
    fn test_missing_output_row_keeps_input_row() {
        let joined = join_tables(
            &input(&["A", "B", "C"]),
            &output(&[(Some("A"), 1), (Some("C"), 3)]),
            &JoinOptions::default(),
        )
        .unwrap();
        assert_eq!(joined.keys(), &["A", "B", "C"]);
        assert_eq!(joined.schema().field(1).name(), "x");
        let x = joined.column(1);
        assert!(x.is_valid(0));
        assert!(x.is_null(1));
        assert!(x.is_valid(2));
        assert_eq!(strings(&joined, 0)[1], Some("name-B".to_string()));
    }

    #[test]
    fn test_duplicate_matches_get_suffixed_keys() {
        let joined = join_tables(
            &input(&["A"]),
            &output(&[(Some("A"), 1), (Some("A"), 2)]),
            &JoinOptions::default(),
        )
        .unwrap();
        assert_eq!(joined.keys(), &["A", "A_1"]);
        assert_eq!(
            strings(&joined, 0),
            vec![Some("name-A".to_string()), Some("name-A".to_string())]
        );
        assert_eq!(
            strings(&joined, 1),
            vec![Some("1".to_string()), Some("2".to_string())]
        );
    }

    #[test]
    fn test_custom_separator() {
        let options = JoinOptions {
            key_separator: "#".to_string(),
            ..Default::default()
        };
        let joined = join_tables(
            &input(&["A"]),
            &output(&[(Some("A"), 1), (Some("A"), 2), (Some("A"), 3)]),
            &options,
        )
        .unwrap();
        assert_eq!(joined.keys(), &["A", "A#1", "A#2"]);
    }

    #[test]
    fn test_trailing_orphans_are_appended() {
        let joined = join_tables(
            &input(&["A", "B"]),
            &output(&[(Some("A"), 1), (Some("B"), 2), (Some("Z"), 9), (None, 10)]),
            &JoinOptions::default(),
        )
        .unwrap();
        assert_eq!(joined.keys(), &["A", "B", "Z", "Row3"]);
        let names = joined.column(0);
        assert!(names.is_null(2));
        assert!(names.is_null(3));
        assert!(joined.duplicate_key().is_none());
    }

    #[test]
    fn test_out_of_order_output_is_not_matched() {
        // Documented limitation of the single merge pass.
        let joined = join_tables(
            &input(&["A", "B"]),
            &output(&[(Some("B"), 2), (Some("A"), 1)]),
            &JoinOptions::default(),
        )
        .unwrap();
        assert_eq!(joined.num_rows(), 3);
        assert_eq!(joined.keys(), &["A", "B", "A_1"]);
        assert!(joined.column(1).is_null(0));
        assert!(joined.column(1).is_valid(1));
        assert!(joined.column(0).is_null(2));
    }

    #[test]
    fn test_colliding_column_names_are_renamed() {
        let in_schema = Schema::new(vec![
            Field::new("x", DataType::Int64, false),
            Field::new("x (#1)", DataType::Int64, false),
        ]);
        let out_schema = Schema::new(vec![
            Field::new("RowID", DataType::Utf8, false),
            Field::new("x", DataType::Int64, false),
            Field::new("y", DataType::Int64, false),
        ]);
        let spec = join_spec(&in_schema, &out_schema, "RowID").unwrap();
        let names: Vec<&str> = spec.fields().iter().map(|f| f.name().as_str()).collect();
        assert_eq!(names, vec!["x", "x (#1)", "x (#2)", "y"]);
        assert!(spec.fields().iter().all(|f| f.is_nullable()));
    }

    #[test]
    fn test_missing_id_column() {
        let in_schema = Schema::new(vec![Field::new("a", DataType::Int64, false)]);
        let out_schema = Schema::new(vec![Field::new("b", DataType::Int64, false)]);
        let err = join_spec(&in_schema, &out_schema, "RowID").unwrap_err();
        assert!(matches!(err, CoreError::Join(_)));
    }

    #[test]
    fn test_join_with_empty_input() {
        let joined = join_tables(
            &input(&[]),
            &output(&[(Some("A"), 1)]),
            &JoinOptions::default(),
        )
        .unwrap();
        assert_eq!(joined.keys(), &["A"]);
        assert!(joined.column(0).is_null(0));
    }
}
