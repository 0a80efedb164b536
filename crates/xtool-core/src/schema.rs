//! Schema unification across chunk outputs.
//!
//! Chunks of one run are produced by independent tool invocations, so type
//! inference on their output files may disagree (`Int64` in one chunk,
//! `Float64` in another). Column names and positions must still agree.

use std::sync::Arc;

use arrow::array::ArrayRef;
use arrow::compute::cast;
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use arrow::record_batch::RecordBatch;

use crate::error::{CoreError, Result};

fn is_integer(t: &DataType) -> bool {
    matches!(
        t,
        DataType::Int8
            | DataType::Int16
            | DataType::Int32
            | DataType::Int64
            | DataType::UInt8
            | DataType::UInt16
            | DataType::UInt32
            | DataType::UInt64
    )
}

fn is_float(t: &DataType) -> bool {
    matches!(t, DataType::Float16 | DataType::Float32 | DataType::Float64)
}

/// Least common supertype of two column types.
///
/// Numbers widen (`Int64`, then `Float64`), booleans count as numbers and
/// everything else falls back to `Utf8`.
pub fn common_supertype(a: &DataType, b: &DataType) -> DataType {
    if a == b {
        return a.clone();
    }
    match (a, b) {
        (DataType::Null, other) | (other, DataType::Null) => other.clone(),
        (x, y) if is_float(x) || is_float(y) => {
            let numeric = |t: &DataType| is_float(t) || is_integer(t) || *t == DataType::Boolean;
            if numeric(x) && numeric(y) {
                DataType::Float64
            } else {
                DataType::Utf8
            }
        }
        (x, y)
            if (is_integer(x) || *x == DataType::Boolean)
                && (is_integer(y) || *y == DataType::Boolean) =>
        {
            DataType::Int64
        }
        _ => DataType::Utf8,
    }
}

/// Unify the schemas of several chunk tables of the same output port.
///
/// Fails when column counts differ or names at the same position differ.
pub fn unify_schemas(schemas: &[SchemaRef]) -> Result<SchemaRef> {
    let Some((first, rest)) = schemas.split_first() else {
        return Err(CoreError::SchemaInconsistency(
            "no schemas to unify".to_string(),
        ));
    };

    let mut fields: Vec<Field> = first.fields().iter().map(|f| f.as_ref().clone()).collect();
    for (offset, schema) in rest.iter().enumerate() {
        let chunk = offset + 1;
        if schema.fields().len() != fields.len() {
            return Err(CoreError::SchemaInconsistency(format!(
                "table {} has {} columns, table 0 has {}",
                chunk,
                schema.fields().len(),
                fields.len()
            )));
        }
        for (pos, (current, other)) in fields.iter_mut().zip(schema.fields().iter()).enumerate() {
            if current.name() != other.name() {
                return Err(CoreError::SchemaInconsistency(format!(
                    "column {} is named '{}' in table {} but '{}' in table 0",
                    pos,
                    other.name(),
                    chunk,
                    current.name()
                )));
            }
            let data_type = common_supertype(current.data_type(), other.data_type());
            let nullable = current.is_nullable() || other.is_nullable();
            *current = Field::new(current.name(), data_type, nullable);
        }
    }

    Ok(Arc::new(Schema::new(fields)))
}

/// Cast the columns of `batch` to `target`. Columns that already have the
/// target type are shared, not copied.
pub fn adapt_batch(batch: &RecordBatch, target: &SchemaRef) -> Result<RecordBatch> {
    if batch.schema().as_ref() == target.as_ref() {
        return Ok(batch.clone());
    }
    let columns = batch
        .columns()
        .iter()
        .zip(target.fields().iter())
        .map(|(col, field)| {
            if col.data_type() == field.data_type() {
                Ok(col.clone())
            } else {
                cast(col, field.data_type())
            }
        })
        .collect::<std::result::Result<Vec<ArrayRef>, _>>()?;
    Ok(RecordBatch::try_new(target.clone(), columns)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Array, Float64Array, Int64Array};

    fn schema(cols: &[(&str, DataType)]) -> SchemaRef {
        Arc::new(Schema::new(
            cols.iter()
                .map(|(n, t)| Field::new(*n, t.clone(), true))
                .collect::<Vec<_>>(),
        ))
    }

    #[test]
    fn test_supertype_numeric() {
        assert_eq!(common_supertype(&DataType::Int64, &DataType::Float64), DataType::Float64);
        assert_eq!(common_supertype(&DataType::Int32, &DataType::Int64), DataType::Int64);
        assert_eq!(common_supertype(&DataType::Boolean, &DataType::Int64), DataType::Int64);
        assert_eq!(common_supertype(&DataType::Float32, &DataType::Boolean), DataType::Float64);
    }

    #[test]
    fn test_supertype_fallbacks() {
        assert_eq!(common_supertype(&DataType::Null, &DataType::Int64), DataType::Int64);
        assert_eq!(common_supertype(&DataType::Utf8, &DataType::Int64), DataType::Utf8);
        assert_eq!(common_supertype(&DataType::Date32, &DataType::Float64), DataType::Utf8);
        assert_eq!(common_supertype(&DataType::Utf8, &DataType::Utf8), DataType::Utf8);
    }

    #[test]
    fn test_unify_int_and_double() {
        let unified = unify_schemas(&[
            schema(&[("v", DataType::Int64)]),
            schema(&[("v", DataType::Float64)]),
        ])
        .unwrap();
        assert_eq!(unified.field(0).name(), "v");
        assert_eq!(unified.field(0).data_type(), &DataType::Float64);
    }

    #[test]
    fn test_unify_rejects_column_count() {
        let err = unify_schemas(&[
            schema(&[("a", DataType::Int64)]),
            schema(&[("a", DataType::Int64), ("b", DataType::Utf8)]),
        ])
        .unwrap_err();
        assert!(matches!(err, CoreError::SchemaInconsistency(_)));
    }

    #[test]
    fn test_unify_rejects_renamed_column() {
        let err = unify_schemas(&[
            schema(&[("a", DataType::Int64)]),
            schema(&[("b", DataType::Int64)]),
        ])
        .unwrap_err();
        assert!(err.to_string().contains("named 'b'"));
    }

    #[test]
    fn test_adapt_batch_casts_only_mismatching() {
        let source = schema(&[("v", DataType::Int64)]);
        let batch = RecordBatch::try_new(
            source,
            vec![Arc::new(Int64Array::from(vec![Some(1), None]))],
        )
        .unwrap();
        let target = schema(&[("v", DataType::Float64)]);
        let adapted = adapt_batch(&batch, &target).unwrap();
        let col = adapted
            .column(0)
            .as_any()
            .downcast_ref::<Float64Array>()
            .unwrap();
        assert_eq!(col.value(0), 1.0);
        assert!(col.is_null(1));
    }
}
