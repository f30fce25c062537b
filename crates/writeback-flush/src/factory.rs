//! Materializing object diffs into row operations.
//!
//! The factory owns the working map of one flush: every pending row change,
//! keyed by its table-qualified [`ObjectId`]. Replaying an object's diff
//! creates or enriches rows — the object's own row, rows of related objects
//! receiving propagated keys, and synthetic rows for flattened join tables
//! that have no object-level representation. Rows never hold references to
//! each other; relationship effects travel either as immediate column
//! writes or as deferred [`FkPropagation`]s resolved when the value becomes
//! known.

use crate::diff::{ArcTarget, ChangeKind, DiffEvent, ObjectDiff};
use crate::merge::{MergeOutcome, RowMerger};
use crate::row::{DbRow, Qualifier, RowKey, Values};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use writeback_core::{
    EntityMeta, Error, JoinStep, MappingErrorKind, ObjectId, ObjectIdDescriptor, RelationshipMeta,
    SchemaRegistry, TempIdAllocator, Value,
};

/// A key value owed to a row once its source identity is known.
///
/// Recorded when a relationship needs a primary-key value that a temporary
/// identity cannot supply yet; resolved by the reconciler after key
/// generation or parent insertion, before the receiving row materializes
/// into a statement.
#[derive(Debug, Clone)]
pub struct FkPropagation {
    /// Identity whose key snapshot supplies the value
    pub source: ObjectId,
    /// Attribute to read from the source snapshot
    pub source_attr: String,
    /// Row receiving the value
    pub target: RowKey,
    /// Column written on the receiving row
    pub target_column: String,
    /// Also stage the value into the receiving row's identity
    pub to_pk: bool,
    /// Write into the qualifier's identifying part instead of the values
    pub into_qualifier: bool,
}

/// Everything one factory pass produces.
#[derive(Debug)]
pub struct FactoryOutput {
    /// All surviving rows, unordered
    pub rows: Vec<DbRow>,
    /// Deferred key propagations
    pub propagations: Vec<FkPropagation>,
}

/// Walks object diffs and materializes the flush's row set.
pub struct RowFactory<'a> {
    schema: &'a SchemaRegistry,
    ids: &'a TempIdAllocator,
    optimistic_locking: bool,
    rows: HashMap<RowKey, DbRow>,
    /// Keys whose row net-cancelled (insert-then-delete); later touches are
    /// ignored rather than resurrecting the row.
    dropped: HashSet<RowKey>,
    /// Reused-key deletes that must precede their reinsert.
    aliased_deletes: Vec<DbRow>,
    /// Join-table rows per relationship arc, for (source, target) reuse.
    flattened: HashMap<ArcTarget, RowKey>,
    /// Join-table rows indexed by each endpoint, for deletion fan-out.
    flattened_by_object: HashMap<ObjectId, Vec<RowKey>>,
    /// Rows created for flattened attribute paths, per (object, path).
    path_rows: HashMap<(ObjectId, String), RowKey>,
    /// Synthetic identity descriptors per join table.
    join_descriptors: HashMap<String, Arc<ObjectIdDescriptor>>,
    propagations: Vec<FkPropagation>,
    next_seq: u64,
}

impl<'a> RowFactory<'a> {
    /// Create a factory for one flush.
    pub fn new(
        schema: &'a SchemaRegistry,
        ids: &'a TempIdAllocator,
        optimistic_locking: bool,
    ) -> Self {
        Self {
            schema,
            ids,
            optimistic_locking,
            rows: HashMap::new(),
            dropped: HashSet::new(),
            aliased_deletes: Vec::new(),
            flattened: HashMap::new(),
            flattened_by_object: HashMap::new(),
            path_rows: HashMap::new(),
            join_descriptors: HashMap::new(),
            propagations: Vec::new(),
            next_seq: 0,
        }
    }

    /// Replay one object's diff into the working map.
    pub fn process(&mut self, diff: &ObjectDiff) -> Result<(), Error> {
        let entity = Arc::clone(self.schema.entity(diff.id.entity())?);
        if entity.read_only {
            return Err(Error::mapping(
                MappingErrorKind::ReadOnlyEntity,
                format!(
                    "entity '{}' is mapped read-only and cannot be written",
                    entity.name
                ),
            ));
        }

        let root_key = match diff.kind {
            ChangeKind::Created => {
                // An insert even when the caller assigned a meaningful
                // permanent key; that is how a reused identity aliases a
                // delete of the same key within one flush.
                let mut values = Values::new();
                for (attr, value) in diff.id.id_snapshot() {
                    values.set(attr, value);
                }
                let row = DbRow::Insert {
                    entity: Arc::clone(&entity),
                    table: entity.table.clone(),
                    id: diff.id.clone(),
                    values,
                    seq: self.take_seq(),
                };
                let key = row.key();
                self.put_row(row);
                key
            }
            ChangeKind::Modified => {
                let key = self.ensure_object_row(&entity, &diff.id)?;
                self.apply_locks(&entity, &key, diff);
                key
            }
            ChangeKind::Deleted => {
                let key = RowKey::new(entity.table.clone(), diff.id.clone());
                let mut qualifier = Qualifier::for_id(diff.id.id_snapshot());
                self.build_locks(&entity, diff, &mut qualifier);
                let row = DbRow::Delete {
                    entity: Arc::clone(&entity),
                    table: entity.table.clone(),
                    id: diff.id.clone(),
                    qualifier,
                    seq: self.take_seq(),
                };
                self.put_row(row);
                key
            }
        };

        for event in &diff.events {
            match event {
                DiffEvent::AttributeSet { attribute, value } => {
                    self.attribute_set(&entity, diff, &root_key, attribute, value.clone())?;
                }
                DiffEvent::ArcAdded {
                    relationship,
                    target,
                } => {
                    self.process_arc(&entity, diff, &root_key, relationship, target, true)?;
                }
                DiffEvent::ArcRemoved {
                    relationship,
                    target,
                } => {
                    self.process_arc(&entity, diff, &root_key, relationship, target, false)?;
                }
            }
        }

        if diff.kind == ChangeKind::Deleted {
            self.delete_tracked_flattened(&diff.id);
        }
        Ok(())
    }

    /// Hand the accumulated rows and deferred propagations to the pipeline.
    pub fn into_output(self) -> FactoryOutput {
        let mut rows: Vec<DbRow> = self.rows.into_values().collect();
        rows.extend(self.aliased_deletes);
        FactoryOutput {
            rows,
            propagations: self.propagations,
        }
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Insert a row into the working map, folding collisions through the
    /// merger.
    fn put_row(&mut self, row: DbRow) {
        let key = row.key();
        if self.dropped.contains(&key) {
            tracing::trace!(table = %key.table, "row already net-cancelled; ignoring");
            return;
        }
        match self.rows.remove(&key) {
            None => {
                self.rows.insert(key, row);
            }
            Some(existing) => match RowMerger::merge(existing, row) {
                MergeOutcome::Row(merged) => {
                    self.rows.insert(key, merged);
                }
                MergeOutcome::Coexist { delete, keep } => {
                    tracing::debug!(
                        table = %key.table,
                        "identity reused within one flush; delete will precede reinsert"
                    );
                    self.aliased_deletes.push(delete);
                    self.rows.insert(key, keep);
                }
                MergeOutcome::Removed => {
                    tracing::debug!(
                        table = %key.table,
                        "row inserted and deleted in one flush; nothing to execute"
                    );
                    self.dropped.insert(key);
                }
            },
        }
    }

    /// Get or create the row for an object's own table: Insert while its
    /// identity is temporary, Update otherwise.
    fn ensure_object_row(
        &mut self,
        entity: &Arc<EntityMeta>,
        id: &ObjectId,
    ) -> Result<RowKey, Error> {
        let key = RowKey::new(entity.table.clone(), id.clone());
        if self.rows.contains_key(&key) || self.dropped.contains(&key) {
            return Ok(key);
        }
        let row = if id.is_temporary() {
            let mut values = Values::new();
            for (attr, value) in id.id_snapshot() {
                values.set(attr, value);
            }
            DbRow::Insert {
                entity: Arc::clone(entity),
                table: entity.table.clone(),
                id: id.clone(),
                values,
                seq: self.take_seq(),
            }
        } else {
            DbRow::Update {
                entity: Arc::clone(entity),
                table: entity.table.clone(),
                id: id.clone(),
                values: Values::new(),
                qualifier: Qualifier::for_id(id.id_snapshot()),
                seq: self.take_seq(),
            }
        };
        self.put_row(row);
        Ok(key)
    }

    /// Apply optimistic-lock expectations to the root row's qualifier.
    fn apply_locks(&mut self, entity: &EntityMeta, key: &RowKey, diff: &ObjectDiff) {
        if !self.optimistic_locking || entity.lock_attributes.is_empty() {
            return;
        }
        if let Some(row) = self.rows.get_mut(key) {
            if let Some(qualifier) = row.qualifier_mut() {
                Self::lock_into(entity, diff, qualifier);
            }
        }
    }

    fn build_locks(&self, entity: &EntityMeta, diff: &ObjectDiff, qualifier: &mut Qualifier) {
        if !self.optimistic_locking {
            return;
        }
        Self::lock_into(entity, diff, qualifier);
    }

    fn lock_into(entity: &EntityMeta, diff: &ObjectDiff, qualifier: &mut Qualifier) {
        for lock_attr in &entity.lock_attributes {
            let column = entity
                .find_attribute(lock_attr)
                .map_or(lock_attr.as_str(), |a| a.column.as_str());
            match diff.snapshot.get(lock_attr) {
                Some(expected) => qualifier.lock(column, expected.clone()),
                None => {
                    tracing::trace!(
                        entity = %entity.name,
                        attribute = %lock_attr,
                        "no committed snapshot value for lock attribute; not locking on it"
                    );
                }
            }
        }
    }

    /// Handle one attribute-set event, routing flattened paths through
    /// their join chain.
    fn attribute_set(
        &mut self,
        entity: &Arc<EntityMeta>,
        diff: &ObjectDiff,
        root_key: &RowKey,
        attribute: &str,
        value: Value,
    ) -> Result<(), Error> {
        if diff.kind == ChangeKind::Deleted {
            tracing::trace!(
                entity = %entity.name,
                attribute,
                "attribute change on a deleted object is moot"
            );
            return Ok(());
        }
        let attr = match entity.find_attribute(attribute) {
            Some(attr) => attr.clone(),
            None => {
                // Column-name shorthand for unmapped attributes.
                if entity.find_column(attribute).is_some() {
                    self.write_row_value(root_key, attribute, value, false, false);
                    return Ok(());
                }
                return Err(Error::mapping(
                    MappingErrorKind::UnknownAttribute,
                    format!(
                        "attribute '{attribute}' is not mapped on entity '{}'",
                        entity.name
                    ),
                ));
            }
        };

        if !attr.is_flattened() {
            self.write_row_value(root_key, &attr.column, value, false, false);
            return Ok(());
        }

        let final_key = self.walk_attribute_path(entity, diff, &attr.path)?;
        self.write_row_value(&final_key, &attr.column, value, false, false);
        Ok(())
    }

    /// Walk a flattened attribute's relationship chain, materializing each
    /// join-table row once per (object, path prefix), and return the row
    /// owning the final column.
    fn walk_attribute_path(
        &mut self,
        entity: &Arc<EntityMeta>,
        diff: &ObjectDiff,
        path: &[String],
    ) -> Result<RowKey, Error> {
        let mut prev_id = diff.id.clone();
        let mut prev_key = RowKey::new(entity.table.clone(), diff.id.clone());
        let mut prefix = String::new();

        for rel_name in path {
            let rel = entity.find_relationship(rel_name).ok_or_else(|| {
                Error::mapping(
                    MappingErrorKind::UnknownRelationship,
                    format!(
                        "relationship '{rel_name}' is not mapped on entity '{}'",
                        entity.name
                    ),
                )
            })?;
            let rel = rel.clone();
            for step in &rel.chain {
                if prefix.is_empty() {
                    prefix = step.table.clone();
                } else {
                    prefix = format!("{prefix}.{}", step.table);
                }
                let path_key = (diff.id.clone(), prefix.clone());
                let step_key = match self.path_rows.get(&path_key) {
                    Some(existing) => existing.clone(),
                    None => {
                        let key = self.materialize_path_row(
                            entity,
                            diff,
                            &prev_id,
                            &prev_key,
                            step,
                        )?;
                        self.path_rows.insert(path_key, key.clone());
                        key
                    }
                };
                prev_id = step_key.id.clone();
                prev_key = step_key;
            }
        }
        Ok(prev_key)
    }

    /// Create the row for one hop of a flattened attribute path and
    /// propagate the identifying key across the hop's joins.
    fn materialize_path_row(
        &mut self,
        entity: &Arc<EntityMeta>,
        diff: &ObjectDiff,
        prev_id: &ObjectId,
        _prev_key: &RowKey,
        step: &JoinStep,
    ) -> Result<RowKey, Error> {
        let target_cols: Vec<&str> = step.joins.iter().map(|j| j.target.as_str()).collect();
        let descriptor = self.join_descriptor(&step.table, &target_cols)?;
        let id = ObjectId::temporary(descriptor, self.ids);
        let key = RowKey::new(step.table.clone(), id.clone());

        // First traversal for a new object inserts the join row; for an
        // existing object the row is already stored and gets updated.
        let row = if diff.kind == ChangeKind::Created {
            DbRow::Insert {
                entity: Arc::clone(entity),
                table: step.table.clone(),
                id,
                values: Values::new(),
                seq: self.take_seq(),
            }
        } else {
            DbRow::Update {
                entity: Arc::clone(entity),
                table: step.table.clone(),
                id,
                values: Values::new(),
                qualifier: Qualifier::default(),
                seq: self.take_seq(),
            }
        };
        let into_qualifier = matches!(row, DbRow::Update { .. });
        self.put_row(row);

        for join in &step.joins {
            match Self::id_value(prev_id, &join.source) {
                Some(value) => {
                    self.write_row_value(&key, &join.target, value, true, into_qualifier);
                }
                None => self.propagations.push(FkPropagation {
                    source: prev_id.clone(),
                    source_attr: join.source.clone(),
                    target: key.clone(),
                    target_column: join.target.clone(),
                    to_pk: true,
                    into_qualifier,
                }),
            }
        }
        Ok(key)
    }

    /// Handle one relationship-arc event.
    fn process_arc(
        &mut self,
        entity: &Arc<EntityMeta>,
        diff: &ObjectDiff,
        root_key: &RowKey,
        relationship: &str,
        target: &ObjectId,
        added: bool,
    ) -> Result<(), Error> {
        let rel = entity
            .find_relationship(relationship)
            .ok_or_else(|| {
                Error::mapping(
                    MappingErrorKind::UnknownRelationship,
                    format!(
                        "relationship '{relationship}' is not mapped on entity '{}'",
                        entity.name
                    ),
                )
            })?
            .clone();

        if rel.is_flattened() {
            self.flattened_arc(entity, diff, &rel, target, added)
        } else {
            self.direct_arc(entity, diff, root_key, &rel, target, added)
        }
    }

    /// A single-hop arc: propagate key values between the source and
    /// target rows per the three join cases.
    fn direct_arc(
        &mut self,
        entity: &Arc<EntityMeta>,
        diff: &ObjectDiff,
        root_key: &RowKey,
        rel: &RelationshipMeta,
        target: &ObjectId,
        added: bool,
    ) -> Result<(), Error> {
        let step = rel.last_step().clone();
        let target_entity = Arc::clone(self.schema.entity(target.entity())?);

        for join in &step.joins {
            let src_pk = entity.is_pk_column(&join.source);
            let tgt_pk = target_entity.is_pk_column(&join.target);

            if step.to_dependent_pk && src_pk && tgt_pk {
                // (i) dependent PK: the target's key is supplied by the
                // source's key.
                let target_key = self.ensure_object_row(&target_entity, target)?;
                if added {
                    match Self::id_value(&diff.id, &join.source) {
                        Some(value) => {
                            self.write_row_value(&target_key, &join.target, value, true, false);
                        }
                        None => self.propagations.push(FkPropagation {
                            source: diff.id.clone(),
                            source_attr: join.source.clone(),
                            target: target_key.clone(),
                            target_column: join.target.clone(),
                            to_pk: true,
                            into_qualifier: false,
                        }),
                    }
                } else {
                    self.write_row_value(&target_key, &join.target, Value::Null, false, false);
                }
            } else if src_pk && !tgt_pk {
                // (ii) value flows from the PK side into a plain column on
                // the other row.
                let target_key = self.ensure_object_row(&target_entity, target)?;
                if added {
                    match Self::id_value(&diff.id, &join.source) {
                        Some(value) => {
                            self.write_row_value(&target_key, &join.target, value, false, false);
                        }
                        None => self.propagations.push(FkPropagation {
                            source: diff.id.clone(),
                            source_attr: join.source.clone(),
                            target: target_key.clone(),
                            target_column: join.target.clone(),
                            to_pk: false,
                            into_qualifier: false,
                        }),
                    }
                } else {
                    self.write_row_value(&target_key, &join.target, Value::Null, false, false);
                }
            } else if !src_pk && tgt_pk {
                // (ii) mirrored: the target's PK lands in a plain column on
                // the source row.
                if added {
                    match Self::id_value(target, &join.target) {
                        Some(value) => {
                            self.write_row_value(root_key, &join.source, value, false, false);
                        }
                        None => self.propagations.push(FkPropagation {
                            source: target.clone(),
                            source_attr: join.target.clone(),
                            target: root_key.clone(),
                            target_column: join.source.clone(),
                            to_pk: false,
                            into_qualifier: false,
                        }),
                    }
                } else {
                    self.write_row_value(root_key, &join.source, Value::Null, false, false);
                }
            } else {
                // (iii) plain column to plain column: whichever side is
                // already known supplies the value.
                let target_key = self.ensure_object_row(&target_entity, target)?;
                if !added {
                    self.write_row_value(&target_key, &join.target, Value::Null, false, false);
                    continue;
                }
                let source_value = Self::snapshot_column(entity, diff, &join.source);
                if let Some(value) = source_value {
                    self.write_row_value(&target_key, &join.target, value, false, false);
                    continue;
                }
                let target_value = self
                    .rows
                    .get(&target_key)
                    .and_then(DbRow::values)
                    .and_then(|v| v.get(&join.target).cloned());
                match target_value {
                    Some(value) => {
                        self.write_row_value(root_key, &join.source, value, false, false);
                    }
                    None => tracing::trace!(
                        relationship = %rel.name,
                        source = %join.source,
                        target = %join.target,
                        "neither side of a plain-column join is known yet"
                    ),
                }
            }
        }
        Ok(())
    }

    /// A flattened (many-to-many) arc: materialize or delete the join-table
    /// row for this (source, target) pair.
    fn flattened_arc(
        &mut self,
        entity: &Arc<EntityMeta>,
        diff: &ObjectDiff,
        rel: &RelationshipMeta,
        target: &ObjectId,
        added: bool,
    ) -> Result<(), Error> {
        let arc = ArcTarget::new(diff.id.clone(), target.clone(), rel.name.clone());
        let first = &rel.chain[0];
        let last = rel.last_step();

        if added {
            if self.flattened.contains_key(&arc) {
                tracing::trace!(
                    relationship = %rel.name,
                    "join row for this arc already tracked; reusing"
                );
                return Ok(());
            }

            let mut cols: Vec<&str> = first.joins.iter().map(|j| j.target.as_str()).collect();
            cols.extend(last.joins.iter().map(|j| j.source.as_str()));
            let descriptor = self.join_descriptor(&first.table, &cols)?;
            let id = ObjectId::temporary(descriptor, self.ids);
            let key = RowKey::new(first.table.clone(), id.clone());
            let seq = self.take_seq();
            self.put_row(DbRow::Insert {
                entity: Arc::clone(entity),
                table: first.table.clone(),
                id,
                values: Values::new(),
                seq,
            });

            // Source half: the owner's key flows forward into the join row.
            for join in &first.joins {
                match Self::id_value(&diff.id, &join.source) {
                    Some(value) => {
                        self.write_row_value(&key, &join.target, value, true, false);
                    }
                    None => self.propagations.push(FkPropagation {
                        source: diff.id.clone(),
                        source_attr: join.source.clone(),
                        target: key.clone(),
                        target_column: join.target.clone(),
                        to_pk: true,
                        into_qualifier: false,
                    }),
                }
            }
            // Target half: the far end's key flows backward into the join
            // row through the chain's last hop.
            for join in &last.joins {
                match Self::id_value(target, &join.target) {
                    Some(value) => {
                        self.write_row_value(&key, &join.source, value, true, false);
                    }
                    None => self.propagations.push(FkPropagation {
                        source: target.clone(),
                        source_attr: join.target.clone(),
                        target: key.clone(),
                        target_column: join.source.clone(),
                        to_pk: true,
                        into_qualifier: false,
                    }),
                }
            }

            self.flattened.insert(arc.clone(), key.clone());
            self.flattened_by_object
                .entry(arc.source)
                .or_default()
                .push(key.clone());
            self.flattened_by_object
                .entry(arc.target)
                .or_default()
                .push(key);
            return Ok(());
        }

        // Arc removed. A join row tracked in this flush cancels out; one
        // already stored needs a delete qualified by both key halves.
        if let Some(key) = self.flattened.remove(&arc) {
            let delete = DbRow::Delete {
                entity: Arc::clone(entity),
                table: key.table.clone(),
                id: key.id.clone(),
                qualifier: Qualifier::default(),
                seq: self.take_seq(),
            };
            self.put_row(delete);
            return Ok(());
        }

        let mut qualifier = Qualifier::default();
        let mut cols: Vec<&str> = first.joins.iter().map(|j| j.target.as_str()).collect();
        cols.extend(last.joins.iter().map(|j| j.source.as_str()));
        let descriptor = self.join_descriptor(&first.table, &cols)?;
        let id = ObjectId::temporary(descriptor, self.ids);
        let key = RowKey::new(first.table.clone(), id.clone());

        for join in &first.joins {
            match Self::id_value(&diff.id, &join.source) {
                Some(value) => qualifier.set_id(join.target.clone(), value),
                None => self.propagations.push(FkPropagation {
                    source: diff.id.clone(),
                    source_attr: join.source.clone(),
                    target: key.clone(),
                    target_column: join.target.clone(),
                    to_pk: false,
                    into_qualifier: true,
                }),
            }
        }
        for join in &last.joins {
            match Self::id_value(target, &join.target) {
                Some(value) => qualifier.set_id(join.source.clone(), value),
                None => self.propagations.push(FkPropagation {
                    source: target.clone(),
                    source_attr: join.target.clone(),
                    target: key.clone(),
                    target_column: join.source.clone(),
                    to_pk: false,
                    into_qualifier: true,
                }),
            }
        }

        let seq = self.take_seq();
        self.put_row(DbRow::Delete {
            entity: Arc::clone(entity),
            table: first.table.clone(),
            id,
            qualifier,
            seq,
        });
        Ok(())
    }

    /// Issue deletes for every tracked join row referencing a deleted
    /// object.
    fn delete_tracked_flattened(&mut self, id: &ObjectId) {
        let keys = self.flattened_by_object.remove(id).unwrap_or_default();
        for key in keys {
            if self.dropped.contains(&key) || !self.rows.contains_key(&key) {
                continue;
            }
            let (entity, qualifier) = match self.rows.get(&key) {
                Some(row) => {
                    let mut qualifier = Qualifier::default();
                    if let Some(values) = row.values() {
                        for (column, value) in values.iter() {
                            qualifier.set_id(column, value.clone());
                        }
                    }
                    (Arc::clone(row.entity()), qualifier)
                }
                None => continue,
            };
            tracing::debug!(table = %key.table, "deleting join row of a deleted object");
            let delete = DbRow::Delete {
                entity,
                table: key.table.clone(),
                id: key.id.clone(),
                qualifier,
                seq: self.take_seq(),
            };
            self.put_row(delete);
        }
    }

    /// Write a value onto a tracked row: into its values, its identifying
    /// qualifier, or its identity replacement map as requested. Writes to
    /// rows that merged away are dropped silently.
    fn write_row_value(
        &mut self,
        key: &RowKey,
        column: &str,
        value: Value,
        to_pk: bool,
        into_qualifier: bool,
    ) {
        let Some(row) = self.rows.get_mut(key) else {
            tracing::trace!(table = %key.table, column, "value for an untracked row dropped");
            return;
        };
        if to_pk
            && row.id().is_temporary()
            && row.id().descriptor().is_pk_attribute(column)
        {
            // Identity staging is write-once; a conflicting second write
            // would be caught here, but propagation sources are unique per
            // column by construction.
            if let Err(error) = row.id_mut().stage_replacement(column, value.clone()) {
                tracing::warn!(%error, column, "conflicting key propagation ignored");
            }
        }
        match row {
            DbRow::Insert { values, .. } => values.set(column, value),
            DbRow::Update {
                values, qualifier, ..
            } => {
                if into_qualifier {
                    qualifier.set_id(column, value);
                } else {
                    values.set(column, value);
                }
            }
            DbRow::Delete { qualifier, .. } => {
                if into_qualifier {
                    qualifier.set_id(column, value);
                } else {
                    tracing::trace!(column, "column value on a delete row is moot");
                }
            }
        }
    }

    /// Current known key value of an identity, staged entries included.
    fn id_value(id: &ObjectId, attr: &str) -> Option<Value> {
        id.id_snapshot().get(attr).cloned()
    }

    /// Committed value of the attribute mapped onto `column`, from the
    /// diff's snapshot.
    fn snapshot_column(entity: &EntityMeta, diff: &ObjectDiff, column: &str) -> Option<Value> {
        if let Some(value) = diff.snapshot.get(column) {
            return Some(value.clone());
        }
        entity
            .attributes
            .iter()
            .find(|a| a.column == column)
            .and_then(|a| diff.snapshot.get(&a.name).cloned())
    }

    /// Synthetic identity descriptor for a join table.
    fn join_descriptor(
        &mut self,
        table: &str,
        columns: &[&str],
    ) -> Result<Arc<ObjectIdDescriptor>, Error> {
        if let Some(existing) = self.join_descriptors.get(table) {
            return Ok(Arc::clone(existing));
        }
        let descriptor = ObjectIdDescriptor::new(format!("db:{table}"), columns.iter().copied())?;
        self.join_descriptors
            .insert(table.to_string(), Arc::clone(&descriptor));
        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::RowKind;
    use std::collections::BTreeMap;
    use writeback_core::{AttributeMeta, ColumnMeta, DbJoin, MappingError};

    fn schema() -> SchemaRegistry {
        let mut schema = SchemaRegistry::new();
        schema
            .add_entity(
                EntityMeta::new("Artist", "artist")
                    .column(ColumnMeta::new("artist_id").primary_key(true))
                    .column(ColumnMeta::new("name"))
                    .column(ColumnMeta::new("version"))
                    .attribute(AttributeMeta::new("name", "name"))
                    .attribute(AttributeMeta::new("version", "version"))
                    .lock_attribute("version")
                    .relationship(RelationshipMeta::new(
                        "info",
                        vec![
                            JoinStep::new(
                                "artist_info",
                                vec![DbJoin::new("artist_id", "artist_id")],
                            )
                            .dependent_pk(true),
                        ],
                    ))
                    .relationship(RelationshipMeta::new(
                        "paintings",
                        vec![JoinStep::new(
                            "painting",
                            vec![DbJoin::new("artist_id", "artist_id")],
                        )],
                    ))
                    .relationship(RelationshipMeta::new(
                        "galleries",
                        vec![
                            JoinStep::new(
                                "gallery_artist",
                                vec![DbJoin::new("artist_id", "artist_id")],
                            ),
                            JoinStep::new(
                                "gallery",
                                vec![DbJoin::new("gallery_id", "gallery_id")],
                            ),
                        ],
                    )),
            )
            .unwrap();
        schema
            .add_entity(
                EntityMeta::new("ArtistInfo", "artist_info")
                    .column(ColumnMeta::new("artist_id").primary_key(true))
                    .column(ColumnMeta::new("review"))
                    .attribute(AttributeMeta::new("review", "review")),
            )
            .unwrap();
        schema
            .add_entity(
                EntityMeta::new("Painting", "painting")
                    .column(ColumnMeta::new("painting_id").primary_key(true))
                    .column(ColumnMeta::new("artist_id"))
                    .column(ColumnMeta::new("title"))
                    .attribute(AttributeMeta::new("title", "title")),
            )
            .unwrap();
        schema
            .add_entity(
                EntityMeta::new("Gallery", "gallery")
                    .column(ColumnMeta::new("gallery_id").primary_key(true))
                    .column(ColumnMeta::new("name"))
                    .attribute(AttributeMeta::new("name", "name")),
            )
            .unwrap();
        schema
            .add_entity(
                EntityMeta::new("Snapshot", "snapshot")
                    .column(ColumnMeta::new("snapshot_id").primary_key(true))
                    .read_only(true),
            )
            .unwrap();
        schema
    }

    fn temp(schema: &SchemaRegistry, ids: &TempIdAllocator, entity: &str) -> ObjectId {
        ObjectId::temporary(schema.descriptor(entity).unwrap(), ids)
    }

    fn permanent(schema: &SchemaRegistry, entity: &str, attr: &str, key: i64) -> ObjectId {
        let mut map = BTreeMap::new();
        map.insert(attr.to_string(), Value::BigInt(key));
        ObjectId::permanent(schema.descriptor(entity).unwrap(), &map).unwrap()
    }

    fn rows_by_table<'r>(output: &'r FactoryOutput, table: &str) -> Vec<&'r DbRow> {
        output.rows.iter().filter(|r| r.table() == table).collect()
    }

    #[test]
    fn created_object_yields_insert_with_values() {
        let schema = schema();
        let ids = TempIdAllocator::new();
        let mut factory = RowFactory::new(&schema, &ids, true);

        let id = temp(&schema, &ids, "Artist");
        factory
            .process(&ObjectDiff::created(id).set("name", "Monet"))
            .unwrap();

        let output = factory.into_output();
        assert_eq!(output.rows.len(), 1);
        let row = &output.rows[0];
        assert_eq!(row.kind(), RowKind::Insert);
        assert_eq!(
            row.values().unwrap().get("name"),
            Some(&Value::Text("Monet".to_string()))
        );
    }

    #[test]
    fn modified_object_yields_update_with_lock_qualifier() {
        let schema = schema();
        let ids = TempIdAllocator::new();
        let mut factory = RowFactory::new(&schema, &ids, true);

        let id = permanent(&schema, "Artist", "artist_id", 7);
        let diff = ObjectDiff::modified(id)
            .set("name", "Claude Monet")
            .snapshot_value("version", Value::Int(5));
        factory.process(&diff).unwrap();

        let output = factory.into_output();
        let row = &output.rows[0];
        assert_eq!(row.kind(), RowKind::Update);
        let qualifier = row.qualifier().unwrap();
        assert_eq!(
            qualifier.id_columns().get("artist_id"),
            Some(&Value::BigInt(7))
        );
        assert_eq!(qualifier.lock_columns().get("version"), Some(&Value::Int(5)));
    }

    #[test]
    fn locking_disabled_skips_lock_qualifier() {
        let schema = schema();
        let ids = TempIdAllocator::new();
        let mut factory = RowFactory::new(&schema, &ids, false);

        let id = permanent(&schema, "Artist", "artist_id", 7);
        let diff = ObjectDiff::modified(id)
            .set("name", "x")
            .snapshot_value("version", Value::Int(5));
        factory.process(&diff).unwrap();

        let output = factory.into_output();
        assert!(!output.rows[0].qualifier().unwrap().is_locking());
    }

    #[test]
    fn read_only_entity_mutation_is_fatal() {
        let schema = schema();
        let ids = TempIdAllocator::new();
        let mut factory = RowFactory::new(&schema, &ids, true);

        let id = permanent(&schema, "Snapshot", "snapshot_id", 1);
        let err = factory.process(&ObjectDiff::deleted(id)).unwrap_err();
        assert!(matches!(
            err,
            Error::Mapping(MappingError {
                kind: MappingErrorKind::ReadOnlyEntity,
                ..
            })
        ));
    }

    #[test]
    fn dependent_pk_arc_defers_until_parent_key_known() {
        let schema = schema();
        let ids = TempIdAllocator::new();
        let mut factory = RowFactory::new(&schema, &ids, true);

        let artist = temp(&schema, &ids, "Artist");
        let info = temp(&schema, &ids, "ArtistInfo");
        factory
            .process(
                &ObjectDiff::created(artist.clone())
                    .set("name", "Monet")
                    .arc_added("info", info.clone()),
            )
            .unwrap();
        factory
            .process(&ObjectDiff::created(info).set("review", "luminous"))
            .unwrap();

        let output = factory.into_output();
        assert_eq!(rows_by_table(&output, "artist").len(), 1);
        assert_eq!(rows_by_table(&output, "artist_info").len(), 1);
        // The parent's key is unknown, so the child's key is owed.
        assert_eq!(output.propagations.len(), 1);
        let p = &output.propagations[0];
        assert_eq!(p.source, artist);
        assert_eq!(p.target_column, "artist_id");
        assert!(p.to_pk);
    }

    #[test]
    fn arc_with_known_parent_key_writes_immediately() {
        let schema = schema();
        let ids = TempIdAllocator::new();
        let mut factory = RowFactory::new(&schema, &ids, true);

        let artist = permanent(&schema, "Artist", "artist_id", 3);
        let painting = temp(&schema, &ids, "Painting");
        factory
            .process(
                &ObjectDiff::modified(artist).arc_added("paintings", painting.clone()),
            )
            .unwrap();

        let output = factory.into_output();
        let rows = rows_by_table(&output, "painting");
        assert_eq!(rows.len(), 1);
        assert_eq!(
            rows[0].values().unwrap().get("artist_id"),
            Some(&Value::BigInt(3))
        );
        assert!(output.propagations.is_empty());
    }

    #[test]
    fn arc_removed_propagates_null() {
        let schema = schema();
        let ids = TempIdAllocator::new();
        let mut factory = RowFactory::new(&schema, &ids, true);

        let artist = permanent(&schema, "Artist", "artist_id", 3);
        let painting = permanent(&schema, "Painting", "painting_id", 9);
        factory
            .process(&ObjectDiff::modified(artist).arc_removed("paintings", painting))
            .unwrap();

        let output = factory.into_output();
        let rows = rows_by_table(&output, "painting");
        assert_eq!(rows[0].values().unwrap().get("artist_id"), Some(&Value::Null));
    }

    #[test]
    fn flattened_arc_creates_one_join_row_and_reuses_it() {
        let schema = schema();
        let ids = TempIdAllocator::new();
        let mut factory = RowFactory::new(&schema, &ids, true);

        let artist = permanent(&schema, "Artist", "artist_id", 3);
        let gallery = permanent(&schema, "Gallery", "gallery_id", 11);
        factory
            .process(
                &ObjectDiff::modified(artist)
                    .arc_added("galleries", gallery.clone())
                    .arc_added("galleries", gallery),
            )
            .unwrap();

        let output = factory.into_output();
        let join_rows = rows_by_table(&output, "gallery_artist");
        assert_eq!(join_rows.len(), 1);
        let values = join_rows[0].values().unwrap();
        assert_eq!(values.get("artist_id"), Some(&Value::BigInt(3)));
        assert_eq!(values.get("gallery_id"), Some(&Value::BigInt(11)));
    }

    #[test]
    fn flattened_arc_added_then_removed_cancels_out() {
        let schema = schema();
        let ids = TempIdAllocator::new();
        let mut factory = RowFactory::new(&schema, &ids, true);

        let artist = permanent(&schema, "Artist", "artist_id", 3);
        let gallery = permanent(&schema, "Gallery", "gallery_id", 11);
        factory
            .process(
                &ObjectDiff::modified(artist)
                    .arc_added("galleries", gallery.clone())
                    .arc_removed("galleries", gallery),
            )
            .unwrap();

        let output = factory.into_output();
        assert!(rows_by_table(&output, "gallery_artist").is_empty());
    }

    #[test]
    fn removing_stored_flattened_arc_deletes_join_row() {
        let schema = schema();
        let ids = TempIdAllocator::new();
        let mut factory = RowFactory::new(&schema, &ids, true);

        let artist = permanent(&schema, "Artist", "artist_id", 3);
        let gallery = permanent(&schema, "Gallery", "gallery_id", 11);
        factory
            .process(&ObjectDiff::modified(artist).arc_removed("galleries", gallery))
            .unwrap();

        let output = factory.into_output();
        let rows = rows_by_table(&output, "gallery_artist");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].kind(), RowKind::Delete);
        let qualifier = rows[0].qualifier().unwrap();
        assert_eq!(qualifier.id_columns().get("artist_id"), Some(&Value::BigInt(3)));
        assert_eq!(
            qualifier.id_columns().get("gallery_id"),
            Some(&Value::BigInt(11))
        );
    }

    #[test]
    fn deleting_object_deletes_tracked_join_rows() {
        let schema = schema();
        let ids = TempIdAllocator::new();
        let mut factory = RowFactory::new(&schema, &ids, true);

        let artist = permanent(&schema, "Artist", "artist_id", 3);
        let gallery = permanent(&schema, "Gallery", "gallery_id", 11);
        factory
            .process(
                &ObjectDiff::modified(artist.clone()).arc_added("galleries", gallery),
            )
            .unwrap();
        factory.process(&ObjectDiff::deleted(artist)).unwrap();

        let output = factory.into_output();
        // The tracked join insert cancels against the fan-out delete.
        assert!(rows_by_table(&output, "gallery_artist").is_empty());
        let artist_rows = rows_by_table(&output, "artist");
        assert_eq!(artist_rows.len(), 1);
        assert_eq!(artist_rows[0].kind(), RowKind::Delete);
    }

    #[test]
    fn unknown_attribute_and_relationship_are_mapping_errors() {
        let schema = schema();
        let ids = TempIdAllocator::new();
        let mut factory = RowFactory::new(&schema, &ids, true);

        let id = permanent(&schema, "Artist", "artist_id", 1);
        let err = factory
            .process(&ObjectDiff::modified(id.clone()).set("nope", Value::Null))
            .unwrap_err();
        assert!(matches!(err, Error::Mapping(_)));

        let other = permanent(&schema, "Gallery", "gallery_id", 1);
        let err = factory
            .process(&ObjectDiff::modified(id).arc_added("nope", other))
            .unwrap_err();
        assert!(matches!(err, Error::Mapping(_)));
    }
}
