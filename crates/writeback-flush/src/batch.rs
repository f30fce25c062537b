//! Folding the sorted row sequence into batched statements.
//!
//! Maximal consecutive runs of rows sharing a table, operation, and shape
//! become one batched statement; any boundary closes the current batch.
//! Updates whose value set emptied out during merging are no-ops and are
//! dropped here.

use crate::row::{DbRow, RowKind};
use writeback_core::SchemaRegistry;

/// One batched statement: a run of same-shaped rows against one table.
///
/// The statement compiler behind the executor turns this into dialect
/// SQL; the engine itself never renders SQL text.
#[derive(Debug, Clone)]
pub struct BatchedStatement {
    /// Target table
    pub table: String,
    /// Logical data source the table belongs to
    pub destination: String,
    /// Operation kind of every row in the batch
    pub kind: RowKind,
    /// For inserts: the primary-key column the data source generates, when
    /// the table has one. Generated values come back per row in the
    /// executor's result.
    pub generated_column: Option<String>,
    /// The rows, in execution order
    pub rows: Vec<DbRow>,
}

impl BatchedStatement {
    /// Number of rows in the batch.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// Whether the batch carries no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Short human-readable description, for logs and error context.
    pub fn label(&self) -> String {
        format!("{} {} ({} rows)", self.kind.verb(), self.table, self.len())
    }
}

/// Groups consecutive compatible rows into batches.
pub struct BatchBuilder<'a> {
    schema: &'a SchemaRegistry,
    fold_empty_updates: bool,
}

impl<'a> BatchBuilder<'a> {
    pub fn new(schema: &'a SchemaRegistry, fold_empty_updates: bool) -> Self {
        Self {
            schema,
            fold_empty_updates,
        }
    }

    /// Fold the sorted rows into an ordered list of batched statements.
    pub fn build(&self, rows: Vec<DbRow>) -> Vec<BatchedStatement> {
        let mut batches: Vec<BatchedStatement> = Vec::new();
        let mut current: Option<BatchedStatement> = None;

        for row in rows {
            if self.fold_empty_updates
                && row.kind() == RowKind::Update
                && row.values().is_some_and(|v| v.is_empty())
            {
                tracing::debug!(table = row.table(), "dropping no-op update");
                continue;
            }

            match current.as_mut() {
                Some(batch) if batch.rows[0].same_batch(&row) => batch.rows.push(row),
                _ => {
                    if let Some(done) = current.take() {
                        batches.push(done);
                    }
                    current = Some(self.open_batch(row));
                }
            }
        }
        if let Some(done) = current.take() {
            batches.push(done);
        }
        batches
    }

    fn open_batch(&self, row: DbRow) -> BatchedStatement {
        let table = row.table().to_string();
        let destination = self.schema.destination(&table).to_string();
        let generated_column = if row.kind() == RowKind::Insert && row.entity().table == table {
            row.entity()
                .columns
                .iter()
                .find(|c| c.primary_key && c.generated)
                .map(|c| c.name.clone())
        } else {
            None
        };
        BatchedStatement {
            table,
            destination,
            kind: row.kind(),
            generated_column,
            rows: vec![row],
        }
    }
}
