//! The flush orchestrator.
//!
//! [`FlushAction`] drives one unit-of-work commit through its phases:
//! collect rows from the change set, sort and batch them, generate missing
//! primary keys, dispatch destination by destination, then reconcile
//! identities into the result diff. The only recoverable condition is an
//! empty change set; every other failure marks the transaction
//! rollback-only and aborts the flush with a single descriptive error.
//!
//! One action runs one flush on the calling task. Independent flushes may
//! run concurrently against the same schema registry and id allocator;
//! everything else here is private to the invocation.

use crate::batch::{BatchBuilder, BatchedStatement};
use crate::diff::ChangeSource;
use crate::executor::{KeyGenerator, StatementExecutor, TransactionContext};
use crate::factory::RowFactory;
use crate::reconcile::{FlushDiff, IdReconciler};
use crate::row::RowKind;
use crate::sort::RowSorter;
use asupersync::{Cx, Outcome};
use writeback_core::{Error, ExecutionError, MappingErrorKind, SchemaRegistry, TempIdAllocator};

/// Tunables for one flush.
#[derive(Debug, Clone)]
pub struct FlushOptions {
    /// Build optimistic-lock qualifiers from entity lock attributes.
    pub optimistic_locking: bool,
    /// Drop updates whose value set emptied out during merging.
    pub fold_empty_updates: bool,
}

impl Default for FlushOptions {
    fn default() -> Self {
        Self {
            optimistic_locking: true,
            fold_empty_updates: true,
        }
    }
}

impl FlushOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Toggle optimistic-lock qualifier construction.
    pub fn optimistic_locking(mut self, value: bool) -> Self {
        self.optimistic_locking = value;
        self
    }

    /// Toggle dropping of no-op updates.
    pub fn fold_empty_updates(mut self, value: bool) -> Self {
        self.fold_empty_updates = value;
        self
    }
}

/// Where a flush currently stands. `Failed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushPhase {
    Collecting,
    Sorting,
    Preprocessing,
    Executing,
    Reconciling,
    Done,
    Failed,
}

/// Orchestrates one flush invocation.
pub struct FlushAction<'a> {
    schema: &'a SchemaRegistry,
    ids: &'a TempIdAllocator,
    options: FlushOptions,
    phase: FlushPhase,
}

impl<'a> FlushAction<'a> {
    /// Create a flush action with default options.
    pub fn new(schema: &'a SchemaRegistry, ids: &'a TempIdAllocator) -> Self {
        Self::with_options(schema, ids, FlushOptions::default())
    }

    /// Create a flush action with explicit options.
    pub fn with_options(
        schema: &'a SchemaRegistry,
        ids: &'a TempIdAllocator,
        options: FlushOptions,
    ) -> Self {
        Self {
            schema,
            ids,
            options,
            phase: FlushPhase::Collecting,
        }
    }

    /// The phase the action last reached.
    pub fn phase(&self) -> FlushPhase {
        self.phase
    }

    /// Run the flush: drain the change source, execute the resulting
    /// statements, and reconcile identities.
    #[tracing::instrument(level = "info", skip_all)]
    pub async fn run<S, K, E, T>(
        &mut self,
        cx: &Cx,
        source: &mut S,
        keygen: &K,
        executor: &E,
        tx: &mut T,
    ) -> Outcome<FlushDiff, Error>
    where
        S: ChangeSource,
        K: KeyGenerator,
        E: StatementExecutor,
        T: TransactionContext,
    {
        self.phase = FlushPhase::Collecting;
        let changes = source.pending_changes();
        if changes.is_empty() {
            tracing::debug!("no pending changes; flush is a no-op");
            self.phase = FlushPhase::Done;
            return Outcome::Ok(FlushDiff::empty());
        }
        let start = std::time::Instant::now();
        tracing::info!(objects = changes.len(), "flush started");

        let mut factory =
            RowFactory::new(self.schema, self.ids, self.options.optimistic_locking);
        for diff in &changes {
            if let Err(error) = factory.process(diff) {
                return self.fail(tx, error);
            }
        }
        let output = factory.into_output();

        self.phase = FlushPhase::Sorting;
        let sorted = RowSorter::new(self.schema).sort(output.rows);
        let mut batches =
            BatchBuilder::new(self.schema, self.options.fold_empty_updates).build(sorted);
        let mut reconciler = IdReconciler::new(output.propagations);

        self.phase = FlushPhase::Preprocessing;
        match self
            .generate_keys(cx, keygen, &mut batches, &mut reconciler)
            .await
        {
            Outcome::Ok(()) => {}
            Outcome::Err(error) => return self.fail(tx, error),
            Outcome::Cancelled(reason) => {
                self.abort(tx);
                return Outcome::Cancelled(reason);
            }
            Outcome::Panicked(payload) => {
                self.abort(tx);
                return Outcome::Panicked(payload);
            }
        }

        self.phase = FlushPhase::Executing;
        match self
            .execute_batches(cx, executor, &mut batches, &mut reconciler)
            .await
        {
            Outcome::Ok(()) => {}
            Outcome::Err(error) => return self.fail(tx, error),
            Outcome::Cancelled(reason) => {
                self.abort(tx);
                return Outcome::Cancelled(reason);
            }
            Outcome::Panicked(payload) => {
                self.abort(tx);
                return Outcome::Panicked(payload);
            }
        }

        self.phase = FlushPhase::Reconciling;
        let diff = match reconciler.build_diff(&batches) {
            Ok(diff) => diff,
            Err(error) => return self.fail(tx, error),
        };

        self.phase = FlushPhase::Done;
        tracing::info!(
            elapsed_ms = start.elapsed().as_millis(),
            statements = batches.len(),
            inserted = diff.inserted(),
            deleted = diff.deleted(),
            "flush complete"
        );
        Outcome::Ok(diff)
    }

    fn fail<T: TransactionContext>(
        &mut self,
        tx: &mut T,
        error: Error,
    ) -> Outcome<FlushDiff, Error> {
        tracing::warn!(%error, "flush failed; transaction marked rollback-only");
        self.abort(tx);
        Outcome::Err(error)
    }

    fn abort<T: TransactionContext>(&mut self, tx: &mut T) {
        self.phase = FlushPhase::Failed;
        tx.mark_rollback_only();
    }

    /// Invoke the key generator once per insert row whose primary key is
    /// neither database-generated nor propagated from a relationship.
    async fn generate_keys<K: KeyGenerator>(
        &self,
        cx: &Cx,
        keygen: &K,
        batches: &mut [BatchedStatement],
        reconciler: &mut IdReconciler,
    ) -> Outcome<(), Error> {
        for batch in batches.iter_mut() {
            if batch.kind != RowKind::Insert {
                continue;
            }
            for row_idx in 0..batch.rows.len() {
                let (table, pending) = {
                    let row = &batch.rows[row_idx];
                    if !row.id().is_temporary() {
                        continue;
                    }
                    // Join-table rows receive their whole key by
                    // propagation.
                    if row.table() != row.entity().table {
                        continue;
                    }
                    let snapshot = row.id().id_snapshot();
                    let key = row.key();
                    let pending: Vec<String> = row
                        .entity()
                        .columns
                        .iter()
                        .filter(|c| c.primary_key && !c.generated)
                        .filter(|c| !snapshot.contains_key(&c.name))
                        .filter(|c| !reconciler.supplies(&key, &c.name))
                        .map(|c| c.name.clone())
                        .collect();
                    (row.table().to_string(), pending)
                };
                if pending.len() > 1 {
                    return Outcome::Err(Error::mapping(
                        MappingErrorKind::MultiColumnAutoPk,
                        format!(
                            "table '{table}' is left with {} ungenerated key columns; \
                             PK autogeneration supports a single ungenerated attribute",
                            pending.len()
                        ),
                    ));
                }
                let Some(column) = pending.into_iter().next() else {
                    continue;
                };
                tracing::debug!(table = %table, column = %column, "generating primary key");
                match keygen.generate(cx, &table, &column).await {
                    Outcome::Ok(value) => {
                        let row = &mut batch.rows[row_idx];
                        if let Err(error) = reconciler.stage(row, &column, value.clone()) {
                            return Outcome::Err(error);
                        }
                        if let Some(values) = row.values_mut() {
                            values.set(&column, value);
                        }
                    }
                    Outcome::Err(error) => return Outcome::Err(error),
                    Outcome::Cancelled(reason) => return Outcome::Cancelled(reason),
                    Outcome::Panicked(payload) => return Outcome::Panicked(payload),
                }
            }
        }
        Outcome::Ok(())
    }

    /// Dispatch batches in order, grouping consecutive statements for one
    /// destination, settling owed key values just before each batch goes
    /// out and staging generated keys as they come back.
    async fn execute_batches<E: StatementExecutor>(
        &self,
        cx: &Cx,
        executor: &E,
        batches: &mut [BatchedStatement],
        reconciler: &mut IdReconciler,
    ) -> Outcome<(), Error> {
        let mut idx = 0;
        while idx < batches.len() {
            let destination = batches[idx].destination.clone();
            let mut end = idx;
            while end < batches.len() && batches[end].destination == destination {
                end += 1;
            }
            tracing::debug!(
                destination = %destination,
                statements = end - idx,
                "dispatching statement group"
            );

            for batch in &mut batches[idx..end] {
                if let Err(error) = reconciler.apply_to_batch(batch) {
                    return Outcome::Err(error);
                }
                let label = batch.label();
                tracing::trace!(statement = %label, "executing");
                match executor.execute(cx, batch).await {
                    Outcome::Ok(result) => {
                        tracing::trace!(
                            statement = %label,
                            rows_affected = result.rows_affected,
                            "statement complete"
                        );
                        for (row_idx, value) in result.generated_keys {
                            let Some(column) = batch.generated_column.clone() else {
                                return Outcome::Err(Error::reconciliation(format!(
                                    "data source returned a generated key for '{label}', \
                                     which has no generated column"
                                )));
                            };
                            let Some(row) = batch.rows.get_mut(row_idx) else {
                                return Outcome::Err(Error::reconciliation(format!(
                                    "generated key for out-of-range row {row_idx} of '{label}'"
                                )));
                            };
                            if let Err(error) = reconciler.stage(row, &column, value) {
                                return Outcome::Err(error);
                            }
                        }
                    }
                    Outcome::Err(error) => {
                        return Outcome::Err(Error::Execution(ExecutionError {
                            statement: label,
                            destination: destination.clone(),
                            message: error.to_string(),
                            source: Some(Box::new(error)),
                        }));
                    }
                    Outcome::Cancelled(reason) => return Outcome::Cancelled(reason),
                    Outcome::Panicked(payload) => return Outcome::Panicked(payload),
                }
            }
            idx = end;
        }
        Outcome::Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_default_to_locking_and_folding() {
        let options = FlushOptions::default();
        assert!(options.optimistic_locking);
        assert!(options.fold_empty_updates);

        let options = FlushOptions::new()
            .optimistic_locking(false)
            .fold_empty_updates(false);
        assert!(!options.optimistic_locking);
        assert!(!options.fold_empty_updates);
    }

    #[test]
    fn action_starts_in_collecting() {
        let schema = SchemaRegistry::new();
        let ids = TempIdAllocator::new();
        let action = FlushAction::new(&schema, &ids);
        assert_eq!(action.phase(), FlushPhase::Collecting);
    }
}
