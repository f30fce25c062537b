//! Collaborator contracts at the flush engine's I/O boundary.
//!
//! The engine never renders SQL or talks to a database itself; it hands
//! batched statements to a [`StatementExecutor`], asks a [`KeyGenerator`]
//! for primary keys it cannot derive, and marks the surrounding
//! [`TransactionContext`] rollback-only on any failure. All I/O is async
//! and cancel-correct through `Cx`/`Outcome`.

use crate::batch::BatchedStatement;
use asupersync::{Cx, Outcome};
use writeback_core::{Error, Value};

/// Outcome of executing one batched statement.
#[derive(Debug, Clone, Default)]
pub struct StatementResult {
    /// Total rows affected across the batch
    pub rows_affected: u64,
    /// Values the data source generated, as (row index within the batch,
    /// generated value) pairs. Only meaningful for insert batches with a
    /// generated column.
    pub generated_keys: Vec<(usize, Value)>,
}

impl StatementResult {
    /// Result reporting only an affected-row count.
    pub fn affected(rows_affected: u64) -> Self {
        Self {
            rows_affected,
            generated_keys: Vec::new(),
        }
    }

    /// Attach a generated key for one row of the batch.
    pub fn with_generated_key(mut self, row: usize, value: Value) -> Self {
        self.generated_keys.push((row, value));
        self
    }
}

/// Executes batched statements against one or more logical data sources.
///
/// The engine dispatches consecutive statements for the same destination
/// together; implementations compile each batch into dialect SQL and run it
/// on the destination's connection.
pub trait StatementExecutor: Send + Sync {
    /// Execute one batch. A failure aborts the whole flush.
    fn execute(
        &self,
        cx: &Cx,
        statement: &BatchedStatement,
    ) -> impl Future<Output = Outcome<StatementResult, Error>> + Send;
}

/// Supplies primary-key values for inserts whose key is neither
/// database-generated nor propagated from a relationship.
///
/// Called at most once per ungenerated key column per insert row; an I/O
/// failure here is fatal for the flush.
pub trait KeyGenerator: Send + Sync {
    fn generate(
        &self,
        cx: &Cx,
        table: &str,
        column: &str,
    ) -> impl Future<Output = Outcome<Value, Error>> + Send;
}

/// The surrounding transaction resource.
///
/// The engine only ever marks it rollback-only; beginning, committing, and
/// rolling back belong to the caller.
pub trait TransactionContext {
    /// Poison the transaction: nothing after this may commit.
    fn mark_rollback_only(&mut self);

    /// Whether the transaction was poisoned.
    fn is_rollback_only(&self) -> bool;
}

/// Minimal in-memory transaction flag, usable directly by callers that
/// manage the real transaction elsewhere.
#[derive(Debug, Default)]
pub struct RollbackFlag {
    rollback_only: bool,
}

impl RollbackFlag {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TransactionContext for RollbackFlag {
    fn mark_rollback_only(&mut self) {
        if !self.rollback_only {
            tracing::debug!("transaction marked rollback-only");
        }
        self.rollback_only = true;
    }

    fn is_rollback_only(&self) -> bool {
        self.rollback_only
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statement_result_builder() {
        let result = StatementResult::affected(3)
            .with_generated_key(0, Value::BigInt(10))
            .with_generated_key(1, Value::BigInt(11));
        assert_eq!(result.rows_affected, 3);
        assert_eq!(result.generated_keys.len(), 2);
    }

    #[test]
    fn rollback_flag_latches() {
        let mut flag = RollbackFlag::new();
        assert!(!flag.is_rollback_only());
        flag.mark_rollback_only();
        flag.mark_rollback_only();
        assert!(flag.is_rollback_only());
    }
}
