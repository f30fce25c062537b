//! Ordering the row set for safe execution.
//!
//! Rows execute in operation phases (inserts, then updates, then deletes),
//! and within a phase in the schema's topological table order — parents
//! before children for inserts and updates, children before parents for
//! deletes. A delete aliasing a reinsert of the same identity is hoisted
//! into the insert phase immediately before its reinsert. The full sort key
//! ends with the per-flush row sequence, so the order is total and
//! reproducible for identical input regardless of input order.

use crate::row::{DbRow, RowKey, RowKind};
use std::collections::HashMap;
use writeback_core::SchemaRegistry;

/// Sorts one flush's rows; stateless and reentrant across flushes.
pub struct RowSorter<'a> {
    schema: &'a SchemaRegistry,
}

impl<'a> RowSorter<'a> {
    pub fn new(schema: &'a SchemaRegistry) -> Self {
        Self { schema }
    }

    /// Produce the execution order.
    pub fn sort(&self, rows: Vec<DbRow>) -> Vec<DbRow> {
        // Inserts by key, for reused-identity alias detection.
        let insert_seq: HashMap<RowKey, u64> = rows
            .iter()
            .filter(|row| row.kind() == RowKind::Insert)
            .map(|row| (row.key(), row.seq()))
            .collect();
        let table_count = self.schema.ordered_table_count();

        let mut decorated: Vec<(SortKey, DbRow)> = rows
            .into_iter()
            .map(|row| (self.sort_key(&row, &insert_seq, table_count), row))
            .collect();
        decorated.sort_by(|(a, _), (b, _)| a.cmp(b));
        decorated.into_iter().map(|(_, row)| row).collect()
    }

    fn sort_key(
        &self,
        row: &DbRow,
        insert_seq: &HashMap<RowKey, u64>,
        table_count: usize,
    ) -> SortKey {
        let depth = self.depth_of(row.table(), table_count);
        match row.kind() {
            RowKind::Insert => SortKey {
                phase: 0,
                depth,
                table: row.table().to_string(),
                seq: row.seq(),
                slot: 1,
            },
            RowKind::Update => SortKey {
                phase: 1,
                depth,
                table: row.table().to_string(),
                seq: row.seq(),
                slot: 1,
            },
            RowKind::Delete => {
                if let Some(&reinsert_seq) = insert_seq.get(&row.key()) {
                    // Reused identity: this delete adopts the reinsert's
                    // position and slots in immediately before it.
                    SortKey {
                        phase: 0,
                        depth,
                        table: row.table().to_string(),
                        seq: reinsert_seq,
                        slot: 0,
                    }
                } else {
                    SortKey {
                        phase: 2,
                        depth: table_count.saturating_sub(self.depth_of(row.table(), table_count)),
                        table: row.table().to_string(),
                        seq: row.seq(),
                        slot: 1,
                    }
                }
            }
        }
    }

    /// Topological depth of a table; tables the dependency analysis never
    /// saw sort after every known table.
    fn depth_of(&self, table: &str, table_count: usize) -> usize {
        let order = self.schema.order_of(table);
        if order == usize::MAX { table_count } else { order }
    }
}

// Field order is the comparison order: phase, depth, table, then the row
// sequence with the reused-key slot as the last tie-break.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct SortKey {
    phase: u8,
    depth: usize,
    table: String,
    seq: u64,
    slot: u8,
}
