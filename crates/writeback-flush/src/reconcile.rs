//! Resolving temporary identities into permanent ones.
//!
//! The reconciler carries the flush's deferred key propagations and an
//! index of every staged key value, keyed by identity. Values become known
//! in two ways — the key generator stages them during preprocessing, and
//! the executor returns database-generated keys after an insert batch — and
//! owed values are written into dependent rows just before their batch
//! dispatches. After execution it mints the replacement id for every
//! inserted row and assembles the result diff handed back to the caller.

use crate::batch::BatchedStatement;
use crate::factory::FkPropagation;
use crate::row::{DbRow, RowKind};
use std::collections::{BTreeMap, HashMap};
use writeback_core::{Error, ObjectId, Value};

/// The flush's output: identity replacements for inserted rows and the set
/// of deleted identities. The caller applies this to its in-memory object
/// graph.
#[derive(Debug, Default)]
pub struct FlushDiff {
    replaced: Vec<(ObjectId, ObjectId)>,
    deleted: Vec<ObjectId>,
}

/// Receiver of the flush result, applied id by id.
pub trait ResultSink {
    /// A temporary id resolved to its permanent replacement.
    fn id_replaced(&mut self, old: &ObjectId, new: &ObjectId);
    /// A row with this id was deleted.
    fn id_deleted(&mut self, id: &ObjectId);
}

impl FlushDiff {
    /// An empty diff (the no-changes fast path).
    pub fn empty() -> Self {
        Self::default()
    }

    /// The (old, new) identity pairs for every inserted row.
    pub fn replacements(&self) -> &[(ObjectId, ObjectId)] {
        &self.replaced
    }

    /// The identities of deleted rows.
    pub fn deleted_ids(&self) -> &[ObjectId] {
        &self.deleted
    }

    /// The permanent replacement recorded for `id`, if any.
    pub fn replacement_for(&self, id: &ObjectId) -> Option<&ObjectId> {
        self.replaced
            .iter()
            .find(|(old, _)| old == id)
            .map(|(_, new)| new)
    }

    /// Number of inserted rows reconciled.
    pub fn inserted(&self) -> usize {
        self.replaced.len()
    }

    /// Number of deleted identities.
    pub fn deleted(&self) -> usize {
        self.deleted.len()
    }

    /// Whether the flush changed nothing.
    pub fn is_empty(&self) -> bool {
        self.replaced.is_empty() && self.deleted.is_empty()
    }

    /// Stream the diff into a [`ResultSink`].
    pub fn apply_to(&self, sink: &mut dyn ResultSink) {
        for (old, new) in &self.replaced {
            sink.id_replaced(old, new);
        }
        for id in &self.deleted {
            sink.id_deleted(id);
        }
    }

    fn record_replacement(&mut self, old: ObjectId, new: ObjectId) {
        self.replaced.push((old, new));
    }

    fn record_deleted(&mut self, id: ObjectId) {
        self.deleted.push(id);
    }
}

/// Tracks staged key values and settles deferred propagations.
#[derive(Debug)]
pub struct IdReconciler {
    propagations: Vec<FkPropagation>,
    /// Staged key values per identity, updated as keys are generated,
    /// returned by the data source, or propagated onward.
    staged: HashMap<ObjectId, BTreeMap<String, Value>>,
}

impl IdReconciler {
    /// Take ownership of the factory's deferred propagations.
    pub fn new(propagations: Vec<FkPropagation>) -> Self {
        Self {
            propagations,
            staged: HashMap::new(),
        }
    }

    /// Whether a propagation will supply `column` of the given row's key.
    pub fn supplies(&self, target: &crate::row::RowKey, column: &str) -> bool {
        self.propagations
            .iter()
            .any(|p| p.to_pk && p.target == *target && p.target_column == column)
    }

    /// Stage a newly known key value on a row's identity and remember it
    /// for dependents.
    pub fn stage(&mut self, row: &mut DbRow, attr: &str, value: Value) -> Result<(), Error> {
        let index_key = row.id().clone();
        row.id_mut().stage_replacement(attr, value.clone())?;
        self.staged
            .entry(index_key)
            .or_default()
            .insert(attr.to_string(), value);
        Ok(())
    }

    /// Current known value of one key attribute of an identity: staged
    /// values first, then whatever the identity itself knows.
    fn resolve(&self, id: &ObjectId, attr: &str) -> Option<Value> {
        if let Some(staged) = self.staged.get(id) {
            if let Some(value) = staged.get(attr) {
                return Some(value.clone());
            }
        }
        id.id_snapshot().get(attr).cloned()
    }

    /// Settle every propagation owed to rows of this batch; called right
    /// before the batch materializes into a statement.
    ///
    /// An unresolvable owed value is an internal-invariant violation: the
    /// sorter guarantees suppliers execute first.
    pub fn apply_to_batch(&mut self, batch: &mut BatchedStatement) -> Result<(), Error> {
        for row in &mut batch.rows {
            let key = row.key();
            let mut i = 0;
            while i < self.propagations.len() {
                if self.propagations[i].target != key {
                    i += 1;
                    continue;
                }
                let p = self.propagations.remove(i);
                let value = self.resolve(&p.source, &p.source_attr).ok_or_else(|| {
                    Error::reconciliation(format!(
                        "no key value for {}.{} needed by {}.{}",
                        p.source.entity(),
                        p.source_attr,
                        key.table,
                        p.target_column
                    ))
                })?;
                tracing::trace!(
                    table = %key.table,
                    column = %p.target_column,
                    "settling propagated key value"
                );
                if p.to_pk
                    && row.id().is_temporary()
                    && row.id().descriptor().is_pk_attribute(&p.target_column)
                {
                    self.stage(row, &p.target_column, value.clone())?;
                }
                match row {
                    DbRow::Insert { values, .. } => values.set(&p.target_column, value),
                    DbRow::Update {
                        values, qualifier, ..
                    } => {
                        if p.into_qualifier {
                            qualifier.set_id(&p.target_column, value);
                        } else {
                            values.set(&p.target_column, value);
                        }
                    }
                    DbRow::Delete { qualifier, .. } => {
                        if p.into_qualifier {
                            qualifier.set_id(&p.target_column, value);
                        } else {
                            tracing::trace!(
                                column = %p.target_column,
                                "propagated value on a delete row is moot"
                            );
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Build the result diff: a replacement id for every inserted row that
    /// carried a temporary identity, and the deleted-id set. Synthetic
    /// join-row identities stay internal.
    pub fn build_diff(&self, batches: &[BatchedStatement]) -> Result<FlushDiff, Error> {
        let mut diff = FlushDiff::empty();
        for batch in batches {
            for row in &batch.rows {
                match row.kind() {
                    RowKind::Insert => {
                        if !row.id().is_temporary() {
                            continue;
                        }
                        if Self::is_synthetic(row) {
                            continue;
                        }
                        let old = row.id().clone();
                        let new = row.id().create_replacement_id().map_err(|error| {
                            Error::reconciliation(format!(
                                "inserted row in '{}' never received a full key: {error}",
                                batch.table
                            ))
                        })?;
                        diff.record_replacement(old, new);
                    }
                    RowKind::Delete => {
                        if !Self::is_synthetic(row) {
                            diff.record_deleted(row.id().clone());
                        }
                    }
                    RowKind::Update => {}
                }
            }
        }
        Ok(diff)
    }

    /// Join-table rows carry a synthetic identity that never maps to an
    /// object.
    fn is_synthetic(row: &DbRow) -> bool {
        row.id().entity() != row.entity().name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::{Qualifier, Values};
    use std::sync::Arc;
    use writeback_core::{
        ColumnMeta, EntityMeta, ObjectIdDescriptor, TempIdAllocator,
    };

    fn entity() -> Arc<EntityMeta> {
        Arc::new(
            EntityMeta::new("Artist", "artist")
                .column(ColumnMeta::new("artist_id").primary_key(true)),
        )
    }

    fn temp_row(ids: &TempIdAllocator) -> DbRow {
        DbRow::Insert {
            entity: entity(),
            table: "artist".to_string(),
            id: ObjectId::temporary(
                ObjectIdDescriptor::new("Artist", ["artist_id"]).unwrap(),
                ids,
            ),
            values: Values::new(),
            seq: 0,
        }
    }

    #[test]
    fn staging_feeds_dependent_resolution() {
        let ids = TempIdAllocator::new();
        let mut parent = temp_row(&ids);
        let parent_id = parent.id().clone();

        let mut child = temp_row(&ids);
        let child_key = child.key();

        let mut reconciler = IdReconciler::new(vec![FkPropagation {
            source: parent_id.clone(),
            source_attr: "artist_id".to_string(),
            target: child_key.clone(),
            target_column: "artist_id".to_string(),
            to_pk: true,
            into_qualifier: false,
        }]);
        assert!(reconciler.supplies(&child_key, "artist_id"));

        reconciler
            .stage(&mut parent, "artist_id", Value::BigInt(42))
            .unwrap();

        let mut batch = BatchedStatement {
            table: "artist".to_string(),
            destination: "default".to_string(),
            kind: RowKind::Insert,
            generated_column: None,
            rows: vec![child],
        };
        // Move the child into a batch and settle.
        reconciler.apply_to_batch(&mut batch).unwrap();
        let child = &batch.rows[0];
        assert_eq!(
            child.values().unwrap().get("artist_id"),
            Some(&Value::BigInt(42))
        );
        assert!(child.id().is_replacement_needed());
        assert!(!reconciler.supplies(&child_key, "artist_id"));
    }

    #[test]
    fn unresolvable_propagation_is_an_invariant_violation() {
        let ids = TempIdAllocator::new();
        let parent = temp_row(&ids);
        let child = temp_row(&ids);
        let child_key = child.key();

        let mut reconciler = IdReconciler::new(vec![FkPropagation {
            source: parent.id().clone(),
            source_attr: "artist_id".to_string(),
            target: child_key,
            target_column: "artist_id".to_string(),
            to_pk: false,
            into_qualifier: false,
        }]);

        let mut batch = BatchedStatement {
            table: "artist".to_string(),
            destination: "default".to_string(),
            kind: RowKind::Insert,
            generated_column: None,
            rows: vec![child],
        };
        // Parent key never staged: settling must fail loudly.
        let err = reconciler.apply_to_batch(&mut batch).unwrap_err();
        assert!(matches!(err, Error::Reconciliation(_)));
    }

    #[test]
    fn diff_covers_inserts_and_deletes_only() {
        let ids = TempIdAllocator::new();
        let mut insert = temp_row(&ids);
        let old = insert.id().clone();

        let mut reconciler = IdReconciler::new(Vec::new());
        reconciler
            .stage(&mut insert, "artist_id", Value::BigInt(7))
            .unwrap();

        let delete = DbRow::Delete {
            entity: entity(),
            table: "artist".to_string(),
            id: old.create_replacement_id().unwrap_or_else(|_| old.clone()),
            qualifier: Qualifier::default(),
            seq: 1,
        };

        let batches = vec![
            BatchedStatement {
                table: "artist".to_string(),
                destination: "default".to_string(),
                kind: RowKind::Insert,
                generated_column: None,
                rows: vec![insert],
            },
            BatchedStatement {
                table: "artist".to_string(),
                destination: "default".to_string(),
                kind: RowKind::Delete,
                generated_column: None,
                rows: vec![delete],
            },
        ];

        let diff = reconciler.build_diff(&batches).unwrap();
        assert_eq!(diff.inserted(), 1);
        assert_eq!(diff.deleted(), 1);
        let new = diff.replacement_for(&old).unwrap();
        assert!(!new.is_temporary());
        assert!(!diff.is_empty());
    }

    #[test]
    fn sink_receives_every_entry() {
        #[derive(Default)]
        struct Counting {
            replaced: usize,
            deleted: usize,
        }
        impl ResultSink for Counting {
            fn id_replaced(&mut self, _old: &ObjectId, _new: &ObjectId) {
                self.replaced += 1;
            }
            fn id_deleted(&mut self, _id: &ObjectId) {
                self.deleted += 1;
            }
        }

        let ids = TempIdAllocator::new();
        let mut insert = temp_row(&ids);
        let mut reconciler = IdReconciler::new(Vec::new());
        reconciler
            .stage(&mut insert, "artist_id", Value::BigInt(1))
            .unwrap();
        let batches = vec![BatchedStatement {
            table: "artist".to_string(),
            destination: "default".to_string(),
            kind: RowKind::Insert,
            generated_column: None,
            rows: vec![insert],
        }];
        let diff = reconciler.build_diff(&batches).unwrap();

        let mut sink = Counting::default();
        diff.apply_to(&mut sink);
        assert_eq!(sink.replaced, 1);
        assert_eq!(sink.deleted, 0);
    }
}
