//! Collapsing duplicate rows.
//!
//! Several relationship edges (or an object's own diff plus a neighbor's
//! key propagation) can touch the same `(table, identity)` row within one
//! flush. The merger folds such collisions pairwise, in arrival order,
//! through a fixed dispatch table, so any number of aliased operations
//! reduces deterministically.

use crate::row::DbRow;

/// Result of folding two rows that collided on one working-map key.
#[derive(Debug)]
pub enum MergeOutcome {
    /// A single row survives under the key.
    Row(DbRow),
    /// A reused-key pair: the delete must execute before the reinsert.
    Coexist { delete: DbRow, keep: DbRow },
    /// The row was created and deleted within this flush; nothing executes.
    Removed,
}

/// Stateless dispatch table for row collisions.
#[derive(Debug, Default)]
pub struct RowMerger;

impl RowMerger {
    /// Fold `incoming` into `existing`.
    ///
    /// - Insert + Update: still one INSERT, with the update's values taking
    ///   precedence on overlap.
    /// - Update + Update: one UPDATE with merged values and qualifier.
    /// - Update + Delete (either order): the delete wins.
    /// - Insert + Delete: the row was never persisted; both vanish.
    /// - Delete + Insert: identity reuse; both survive, delete first.
    pub fn merge(existing: DbRow, incoming: DbRow) -> MergeOutcome {
        match (existing, incoming) {
            (
                DbRow::Insert {
                    entity,
                    table,
                    id,
                    mut values,
                    seq,
                },
                DbRow::Update {
                    values: update_values,
                    ..
                },
            ) => {
                values.absorb(update_values);
                MergeOutcome::Row(DbRow::Insert {
                    entity,
                    table,
                    id,
                    values,
                    seq,
                })
            }
            (
                DbRow::Update { values, .. },
                DbRow::Insert {
                    entity,
                    table,
                    id,
                    values: insert_values,
                    seq,
                },
            ) => {
                // An update staged by key propagation before the object's
                // own insert arrived: the insert shape wins.
                let mut merged = values;
                merged.absorb(insert_values);
                MergeOutcome::Row(DbRow::Insert {
                    entity,
                    table,
                    id,
                    values: merged,
                    seq,
                })
            }
            (
                DbRow::Insert {
                    entity,
                    table,
                    id,
                    mut values,
                    seq,
                },
                DbRow::Insert {
                    values: more_values,
                    ..
                },
            ) => {
                values.absorb(more_values);
                MergeOutcome::Row(DbRow::Insert {
                    entity,
                    table,
                    id,
                    values,
                    seq,
                })
            }
            (
                DbRow::Update {
                    entity,
                    table,
                    id,
                    mut values,
                    mut qualifier,
                    seq,
                },
                DbRow::Update {
                    values: more_values,
                    qualifier: more_qualifier,
                    ..
                },
            ) => {
                values.absorb(more_values);
                for (column, value) in more_qualifier.id_columns() {
                    qualifier.set_id(column.clone(), value.clone());
                }
                for (column, value) in more_qualifier.lock_columns() {
                    qualifier.lock(column.clone(), value.clone());
                }
                for column in more_qualifier.null_lock_columns() {
                    qualifier.lock(column.clone(), writeback_core::Value::Null);
                }
                MergeOutcome::Row(DbRow::Update {
                    entity,
                    table,
                    id,
                    values,
                    qualifier,
                    seq,
                })
            }
            (DbRow::Update { .. }, delete @ DbRow::Delete { .. }) => MergeOutcome::Row(delete),
            (delete @ DbRow::Delete { .. }, DbRow::Update { .. }) => MergeOutcome::Row(delete),
            (DbRow::Insert { .. }, DbRow::Delete { .. }) => MergeOutcome::Removed,
            (delete @ DbRow::Delete { .. }, insert @ DbRow::Insert { .. }) => {
                MergeOutcome::Coexist {
                    delete,
                    keep: insert,
                }
            }
            (delete @ DbRow::Delete { .. }, DbRow::Delete { .. }) => MergeOutcome::Row(delete),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::{Qualifier, Values};
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use writeback_core::{
        ColumnMeta, EntityMeta, ObjectId, ObjectIdDescriptor, TempIdAllocator, Value,
    };

    fn entity() -> Arc<EntityMeta> {
        Arc::new(
            EntityMeta::new("Artist", "artist")
                .column(ColumnMeta::new("artist_id").primary_key(true)),
        )
    }

    fn temp_id(ids: &TempIdAllocator) -> ObjectId {
        ObjectId::temporary(
            ObjectIdDescriptor::new("Artist", ["artist_id"]).unwrap(),
            ids,
        )
    }

    fn insert(id: ObjectId, pairs: &[(&str, Value)]) -> DbRow {
        let mut values = Values::new();
        for (c, v) in pairs {
            values.set(*c, v.clone());
        }
        DbRow::Insert {
            entity: entity(),
            table: "artist".to_string(),
            id,
            values,
            seq: 0,
        }
    }

    fn update(id: ObjectId, pairs: &[(&str, Value)]) -> DbRow {
        let mut values = Values::new();
        for (c, v) in pairs {
            values.set(*c, v.clone());
        }
        DbRow::Update {
            entity: entity(),
            table: "artist".to_string(),
            id,
            values,
            qualifier: Qualifier::for_id(BTreeMap::new()),
            seq: 1,
        }
    }

    fn delete(id: ObjectId) -> DbRow {
        DbRow::Delete {
            entity: entity(),
            table: "artist".to_string(),
            id,
            qualifier: Qualifier::for_id(BTreeMap::new()),
            seq: 2,
        }
    }

    #[test]
    fn insert_absorbs_update_with_update_precedence() {
        let ids = TempIdAllocator::new();
        let id = temp_id(&ids);
        let merged = RowMerger::merge(
            insert(
                id.clone(),
                &[
                    ("name", Value::Text("a".into())),
                    ("age", Value::Int(30)),
                ],
            ),
            update(id, &[("name", Value::Text("b".into()))]),
        );
        match merged {
            MergeOutcome::Row(DbRow::Insert { values, .. }) => {
                assert_eq!(values.get("name"), Some(&Value::Text("b".into())));
                assert_eq!(values.get("age"), Some(&Value::Int(30)));
            }
            other => panic!("expected a surviving insert, got {other:?}"),
        }
    }

    #[test]
    fn delete_wins_over_update_in_either_order() {
        let ids = TempIdAllocator::new();
        let id = temp_id(&ids);

        let a = RowMerger::merge(update(id.clone(), &[]), delete(id.clone()));
        assert!(matches!(a, MergeOutcome::Row(DbRow::Delete { .. })));

        let b = RowMerger::merge(delete(id.clone()), update(id, &[]));
        assert!(matches!(b, MergeOutcome::Row(DbRow::Delete { .. })));
    }

    #[test]
    fn insert_then_delete_vanishes() {
        let ids = TempIdAllocator::new();
        let id = temp_id(&ids);
        let merged = RowMerger::merge(insert(id.clone(), &[]), delete(id));
        assert!(matches!(merged, MergeOutcome::Removed));
    }

    #[test]
    fn delete_then_insert_coexists() {
        let ids = TempIdAllocator::new();
        let id = temp_id(&ids);
        let merged = RowMerger::merge(delete(id.clone()), insert(id, &[]));
        match merged {
            MergeOutcome::Coexist { delete, keep } => {
                assert!(matches!(delete, DbRow::Delete { .. }));
                assert!(matches!(keep, DbRow::Insert { .. }));
            }
            other => panic!("expected coexisting pair, got {other:?}"),
        }
    }

    #[test]
    fn three_way_alias_folds_deterministically() {
        let ids = TempIdAllocator::new();
        let id = temp_id(&ids);

        // Insert, then Update, then Delete: nets to nothing.
        let step1 = RowMerger::merge(
            insert(id.clone(), &[("name", Value::Text("a".into()))]),
            update(id.clone(), &[("age", Value::Int(1))]),
        );
        let survivor = match step1 {
            MergeOutcome::Row(row) => row,
            other => panic!("expected survivor, got {other:?}"),
        };
        let step2 = RowMerger::merge(survivor, delete(id));
        assert!(matches!(step2, MergeOutcome::Removed));
    }
}
