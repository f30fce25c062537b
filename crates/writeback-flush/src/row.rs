//! Row-level change records.
//!
//! A [`DbRow`] is one table-row's pending change: a tagged union over
//! Insert/Update/Delete where each variant carries only what it needs.
//! Inserts and updates accumulate column values in a [`Values`] map;
//! updates and deletes identify their row through a [`Qualifier`]. Rows
//! reference each other only through [`ObjectId`]s, never directly.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use writeback_core::{EntityMeta, ObjectId, Value};

/// Column-to-value accumulator for insert/update rows.
///
/// Setting a column again overwrites the earlier value; iteration order is
/// the column name order, which keeps materialized statements
/// deterministic.
#[derive(Debug, Clone, Default)]
pub struct Values {
    columns: BTreeMap<String, Value>,
}

impl Values {
    /// Create an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a value for `column`, overwriting any earlier value.
    pub fn set(&mut self, column: impl Into<String>, value: Value) {
        self.columns.insert(column.into(), value);
    }

    /// Look up the value recorded for `column`.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns.get(column)
    }

    /// Whether a value was recorded for `column`.
    pub fn contains(&self, column: &str) -> bool {
        self.columns.contains_key(column)
    }

    /// Whether no values were recorded.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Number of recorded columns.
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Iterate columns and values in column-name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.columns.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Merge `other` into `self`, with `other` winning on overlap.
    pub fn absorb(&mut self, other: Values) {
        for (column, value) in other.columns {
            self.columns.insert(column, value);
        }
    }

    /// Batch signature: the column set and which of them are NULL.
    ///
    /// Two insert rows belong to one batched statement only when these
    /// match.
    pub fn signature(&self) -> (Vec<&str>, Vec<bool>) {
        let columns: Vec<&str> = self.columns.keys().map(String::as_str).collect();
        let nulls: Vec<bool> = self.columns.values().map(Value::is_null).collect();
        (columns, nulls)
    }
}

/// Identifying predicate for update/delete rows.
///
/// Holds the primary-key snapshot plus, under optimistic locking, the
/// expected prior values of the lock attributes. Expected-NULL attributes
/// are tracked apart from valued ones because SQL equality does not match
/// NULL.
#[derive(Debug, Clone, Default)]
pub struct Qualifier {
    id: BTreeMap<String, Value>,
    lock: BTreeMap<String, Value>,
    null_lock: BTreeSet<String>,
}

impl Qualifier {
    /// Build a qualifier from the identifying key snapshot.
    pub fn for_id(id_snapshot: BTreeMap<String, Value>) -> Self {
        Self {
            id: id_snapshot,
            lock: BTreeMap::new(),
            null_lock: BTreeSet::new(),
        }
    }

    /// Record one identifying column value.
    pub fn set_id(&mut self, column: impl Into<String>, value: Value) {
        self.id.insert(column.into(), value);
    }

    /// Record an optimistic-lock expectation. `Null` routes into the
    /// separate expected-NULL set.
    pub fn lock(&mut self, column: impl Into<String>, expected: Value) {
        let column = column.into();
        if expected.is_null() {
            self.lock.remove(&column);
            self.null_lock.insert(column);
        } else {
            self.null_lock.remove(&column);
            self.lock.insert(column, expected);
        }
    }

    /// The identifying column snapshot.
    pub fn id_columns(&self) -> &BTreeMap<String, Value> {
        &self.id
    }

    /// The valued lock expectations.
    pub fn lock_columns(&self) -> &BTreeMap<String, Value> {
        &self.lock
    }

    /// The expected-NULL lock attributes.
    pub fn null_lock_columns(&self) -> &BTreeSet<String> {
        &self.null_lock
    }

    /// Whether any optimistic-lock expectation is present.
    pub fn is_locking(&self) -> bool {
        !self.lock.is_empty() || !self.null_lock.is_empty()
    }

    /// Batch signature: identifying attribute set, valued lock set, and
    /// expected-NULL set.
    pub fn signature(&self) -> (Vec<&str>, Vec<&str>, Vec<&str>) {
        (
            self.id.keys().map(String::as_str).collect(),
            self.lock.keys().map(String::as_str).collect(),
            self.null_lock.iter().map(String::as_str).collect(),
        )
    }
}

/// Operation kind of a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RowKind {
    Insert,
    Update,
    Delete,
}

impl RowKind {
    /// Execution phase rank: inserts, then updates, then deletes.
    pub const fn phase(self) -> u8 {
        match self {
            RowKind::Insert => 0,
            RowKind::Update => 1,
            RowKind::Delete => 2,
        }
    }

    /// SQL verb, for labels and logs.
    pub const fn verb(self) -> &'static str {
        match self {
            RowKind::Insert => "INSERT",
            RowKind::Update => "UPDATE",
            RowKind::Delete => "DELETE",
        }
    }
}

/// Key of a row in the factory's working map: the table-qualified identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RowKey {
    pub table: String,
    pub id: ObjectId,
}

impl RowKey {
    pub fn new(table: impl Into<String>, id: ObjectId) -> Self {
        Self {
            table: table.into(),
            id,
        }
    }
}

/// One table-row's pending change.
#[derive(Debug, Clone)]
pub enum DbRow {
    Insert {
        /// Entity whose flush produced this row
        entity: Arc<EntityMeta>,
        /// Target table (differs from the entity's table for join rows)
        table: String,
        /// The row's identity
        id: ObjectId,
        /// Column values to insert
        values: Values,
        /// Per-flush creation sequence, the final ordering tie-break
        seq: u64,
    },
    Update {
        entity: Arc<EntityMeta>,
        table: String,
        id: ObjectId,
        /// Only the changed columns
        values: Values,
        qualifier: Qualifier,
        seq: u64,
    },
    Delete {
        entity: Arc<EntityMeta>,
        table: String,
        id: ObjectId,
        qualifier: Qualifier,
        seq: u64,
    },
}

impl DbRow {
    /// The operation kind.
    pub fn kind(&self) -> RowKind {
        match self {
            DbRow::Insert { .. } => RowKind::Insert,
            DbRow::Update { .. } => RowKind::Update,
            DbRow::Delete { .. } => RowKind::Delete,
        }
    }

    /// The target table.
    pub fn table(&self) -> &str {
        match self {
            DbRow::Insert { table, .. }
            | DbRow::Update { table, .. }
            | DbRow::Delete { table, .. } => table,
        }
    }

    /// The row's identity.
    pub fn id(&self) -> &ObjectId {
        match self {
            DbRow::Insert { id, .. } | DbRow::Update { id, .. } | DbRow::Delete { id, .. } => id,
        }
    }

    /// Mutable access to the row's identity (replacement staging).
    pub fn id_mut(&mut self) -> &mut ObjectId {
        match self {
            DbRow::Insert { id, .. } | DbRow::Update { id, .. } | DbRow::Delete { id, .. } => id,
        }
    }

    /// The owning entity metadata.
    pub fn entity(&self) -> &Arc<EntityMeta> {
        match self {
            DbRow::Insert { entity, .. }
            | DbRow::Update { entity, .. }
            | DbRow::Delete { entity, .. } => entity,
        }
    }

    /// The per-flush creation sequence number.
    pub fn seq(&self) -> u64 {
        match self {
            DbRow::Insert { seq, .. } | DbRow::Update { seq, .. } | DbRow::Delete { seq, .. } => {
                *seq
            }
        }
    }

    /// The working-map key for this row.
    pub fn key(&self) -> RowKey {
        RowKey::new(self.table().to_string(), self.id().clone())
    }

    /// Column values, when the kind carries them.
    pub fn values(&self) -> Option<&Values> {
        match self {
            DbRow::Insert { values, .. } | DbRow::Update { values, .. } => Some(values),
            DbRow::Delete { .. } => None,
        }
    }

    /// Mutable column values, when the kind carries them.
    pub fn values_mut(&mut self) -> Option<&mut Values> {
        match self {
            DbRow::Insert { values, .. } | DbRow::Update { values, .. } => Some(values),
            DbRow::Delete { .. } => None,
        }
    }

    /// The qualifier, when the kind carries one.
    pub fn qualifier(&self) -> Option<&Qualifier> {
        match self {
            DbRow::Insert { .. } => None,
            DbRow::Update { qualifier, .. } | DbRow::Delete { qualifier, .. } => Some(qualifier),
        }
    }

    /// Mutable qualifier, when the kind carries one.
    pub fn qualifier_mut(&mut self) -> Option<&mut Qualifier> {
        match self {
            DbRow::Insert { .. } => None,
            DbRow::Update { qualifier, .. } | DbRow::Delete { qualifier, .. } => Some(qualifier),
        }
    }

    /// Whether two rows may share one batched statement: same table, same
    /// kind, and matching shape (column set with null pattern for inserts;
    /// value columns plus qualifier signature for updates; qualifier
    /// signature for deletes).
    pub fn same_batch(&self, other: &DbRow) -> bool {
        if self.table() != other.table() {
            return false;
        }
        match (self, other) {
            (DbRow::Insert { values: a, .. }, DbRow::Insert { values: b, .. }) => {
                a.signature() == b.signature()
            }
            (
                DbRow::Update {
                    values: av,
                    qualifier: aq,
                    ..
                },
                DbRow::Update {
                    values: bv,
                    qualifier: bq,
                    ..
                },
            ) => {
                av.signature().0 == bv.signature().0 && aq.signature() == bq.signature()
            }
            (DbRow::Delete { qualifier: a, .. }, DbRow::Delete { qualifier: b, .. }) => {
                a.signature() == b.signature()
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use writeback_core::{ColumnMeta, ObjectIdDescriptor, TempIdAllocator};

    fn entity() -> Arc<EntityMeta> {
        Arc::new(
            EntityMeta::new("Artist", "artist")
                .column(ColumnMeta::new("artist_id").primary_key(true)),
        )
    }

    fn temp_id(ids: &TempIdAllocator) -> ObjectId {
        let d = ObjectIdDescriptor::new("Artist", ["artist_id"]).unwrap();
        ObjectId::temporary(d, ids)
    }

    fn insert_row(ids: &TempIdAllocator, seq: u64, values: &[(&str, Value)]) -> DbRow {
        let mut v = Values::new();
        for (col, val) in values {
            v.set(*col, val.clone());
        }
        DbRow::Insert {
            entity: entity(),
            table: "artist".to_string(),
            id: temp_id(ids),
            values: v,
            seq,
        }
    }

    #[test]
    fn values_overwrite_and_order() {
        let mut values = Values::new();
        values.set("name", Value::Text("a".into()));
        values.set("age", Value::Int(1));
        values.set("name", Value::Text("b".into()));

        assert_eq!(values.len(), 2);
        assert_eq!(values.get("name"), Some(&Value::Text("b".into())));
        let cols: Vec<&str> = values.iter().map(|(c, _)| c).collect();
        assert_eq!(cols, vec!["age", "name"]);
    }

    #[test]
    fn qualifier_routes_null_locks() {
        let mut q = Qualifier::for_id(BTreeMap::new());
        q.set_id("artist_id", Value::BigInt(1));
        q.lock("version", Value::Int(5));
        q.lock("note", Value::Null);

        assert!(q.is_locking());
        assert_eq!(q.lock_columns().get("version"), Some(&Value::Int(5)));
        assert!(q.null_lock_columns().contains("note"));
        assert!(!q.lock_columns().contains_key("note"));

        // Re-locking with a value pulls the column out of the null set.
        q.lock("note", Value::Int(1));
        assert!(!q.null_lock_columns().contains("note"));
    }

    #[test]
    fn same_batch_requires_matching_shape() {
        let ids = TempIdAllocator::new();
        let a = insert_row(&ids, 0, &[("name", Value::Text("x".into()))]);
        let b = insert_row(&ids, 1, &[("name", Value::Text("y".into()))]);
        let c = insert_row(&ids, 2, &[("name", Value::Null)]);
        let d = insert_row(&ids, 3, &[("other", Value::Text("z".into()))]);

        assert!(a.same_batch(&b));
        // Same columns, different null pattern.
        assert!(!a.same_batch(&c));
        // Different column set.
        assert!(!a.same_batch(&d));
    }

    #[test]
    fn same_batch_never_crosses_kinds() {
        let ids = TempIdAllocator::new();
        let insert = insert_row(&ids, 0, &[]);
        let delete = DbRow::Delete {
            entity: entity(),
            table: "artist".to_string(),
            id: temp_id(&ids),
            qualifier: Qualifier::default(),
            seq: 1,
        };
        assert!(!insert.same_batch(&delete));
    }
}
