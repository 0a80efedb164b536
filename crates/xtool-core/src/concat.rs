//! Concatenation of per-chunk output tables.

use arrow::compute::concat_batches;
use tracing::debug;

use crate::error::{CoreError, Result};
use crate::schema::{adapt_batch, unify_schemas};
use crate::table::Table;

/// Concatenate chunk tables in the given order under a unified schema.
///
/// Row order inside each table and the relative order of the tables are
/// preserved. Keys are taken over unchanged; callers that need unique keys
/// across chunks re-key before calling this.
pub fn concat_tables(tables: &[Table]) -> Result<Table> {
    match tables {
        [] => Err(CoreError::SchemaInconsistency(
            "no tables to concatenate".to_string(),
        )),
        [single] => Ok(single.clone()),
        _ => {
            let schemas: Vec<_> = tables.iter().map(|t| t.schema()).collect();
            let unified = unify_schemas(&schemas)?;

            let batches = tables
                .iter()
                .map(|t| adapt_batch(t.batch(), &unified))
                .collect::<Result<Vec<_>>>()?;
            let batch = concat_batches(&unified, &batches)?;

            let keys: Vec<String> = tables
                .iter()
                .flat_map(|t| t.keys().iter().cloned())
                .collect();
            debug!(
                "Concatenated {} tables into {} rows",
                tables.len(),
                batch.num_rows()
            );
            Table::try_new(batch, keys)
        }
    }
}
