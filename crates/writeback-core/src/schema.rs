//! Schema metadata consumed by the flush engine.
//!
//! The engine does not introspect databases or parse mappings; it is handed
//! entity metadata (table, columns, relationship join chains, optimistic
//! lock attributes) by the surrounding persistence layer and keeps it in a
//! [`SchemaRegistry`]. The registry also derives what the row sorter needs:
//! a deterministic topological order over every table reachable from the
//! registered relationships.

use crate::error::{Error, MappingErrorKind, Result};
use crate::identity::ObjectIdDescriptor;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Metadata about one table column.
#[derive(Debug, Clone)]
pub struct ColumnMeta {
    /// Column name
    pub name: String,
    /// Whether this column is part of the primary key
    pub primary_key: bool,
    /// Whether the data source generates this column's value on insert
    pub generated: bool,
    /// Whether the column is NOT NULL
    pub mandatory: bool,
}

impl ColumnMeta {
    /// Create a plain nullable column.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            primary_key: false,
            generated: false,
            mandatory: false,
        }
    }

    /// Set the primary-key flag.
    pub fn primary_key(mut self, value: bool) -> Self {
        self.primary_key = value;
        self
    }

    /// Set the database-generated flag.
    pub fn generated(mut self, value: bool) -> Self {
        self.generated = value;
        self
    }

    /// Set the NOT NULL flag.
    pub fn mandatory(mut self, value: bool) -> Self {
        self.mandatory = value;
        self
    }
}

/// Mapping of one object attribute onto a column, possibly through a chain
/// of table joins (a flattened attribute path).
#[derive(Debug, Clone)]
pub struct AttributeMeta {
    /// Object-level attribute name
    pub name: String,
    /// Column the value finally lands in
    pub column: String,
    /// Relationship names traversed before reaching the owning table;
    /// empty for an attribute of the entity's own table
    pub path: Vec<String>,
}

impl AttributeMeta {
    /// Map an attribute directly onto a column of the entity's table.
    pub fn new(name: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            column: column.into(),
            path: Vec::new(),
        }
    }

    /// Route the attribute through a chain of relationships first.
    pub fn through(mut self, path: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.path = path.into_iter().map(Into::into).collect();
        self
    }

    /// Whether this attribute lives behind at least one join.
    pub fn is_flattened(&self) -> bool {
        !self.path.is_empty()
    }
}

/// One column-to-column join between two tables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbJoin {
    /// Column on the owning (source) side
    pub source: String,
    /// Column on the target side
    pub target: String,
}

impl DbJoin {
    pub fn new(source: impl Into<String>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

/// One hop of a relationship's table-to-table join chain.
#[derive(Debug, Clone)]
pub struct JoinStep {
    /// Target table of this hop
    pub table: String,
    /// Joins pairing source-side columns with target-side columns
    pub joins: Vec<DbJoin>,
    /// Identifying relationship: the target's primary key is supplied by
    /// the source's primary key
    pub to_dependent_pk: bool,
}

impl JoinStep {
    pub fn new(table: impl Into<String>, joins: Vec<DbJoin>) -> Self {
        Self {
            table: table.into(),
            joins,
            to_dependent_pk: false,
        }
    }

    /// Mark this hop as an identifying (dependent-PK) relationship.
    pub fn dependent_pk(mut self, value: bool) -> Self {
        self.to_dependent_pk = value;
        self
    }
}

/// A named relationship: a chain of join steps starting at the owning
/// entity's table. A chain longer than one hop is a flattened relationship
/// realized through join tables with no object-level representation.
#[derive(Debug, Clone)]
pub struct RelationshipMeta {
    pub name: String,
    pub chain: Vec<JoinStep>,
}

impl RelationshipMeta {
    pub fn new(name: impl Into<String>, chain: Vec<JoinStep>) -> Self {
        Self {
            name: name.into(),
            chain,
        }
    }

    /// Whether the relationship runs through intermediate join tables.
    pub fn is_flattened(&self) -> bool {
        self.chain.len() > 1
    }

    /// The final hop of the chain.
    pub fn last_step(&self) -> &JoinStep {
        &self.chain[self.chain.len() - 1]
    }
}

/// Metadata for one mapped entity.
#[derive(Debug, Clone)]
pub struct EntityMeta {
    /// Entity name
    pub name: String,
    /// Table the entity maps to
    pub table: String,
    /// Logical data source the table belongs to
    pub destination: String,
    /// Columns of the entity's own table
    pub columns: Vec<ColumnMeta>,
    /// Object attribute mappings
    pub attributes: Vec<AttributeMeta>,
    /// Named relationships
    pub relationships: Vec<RelationshipMeta>,
    /// Attributes participating in the optimistic-lock qualifier
    pub lock_attributes: Vec<String>,
    /// Whether the entity is mapped read-only
    pub read_only: bool,
}

impl EntityMeta {
    /// Create entity metadata for `name` mapped to `table` on the default
    /// destination.
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            destination: "default".to_string(),
            columns: Vec::new(),
            attributes: Vec::new(),
            relationships: Vec::new(),
            lock_attributes: Vec::new(),
            read_only: false,
        }
    }

    /// Set the logical data source.
    pub fn destination(mut self, name: impl Into<String>) -> Self {
        self.destination = name.into();
        self
    }

    /// Add a column.
    pub fn column(mut self, column: ColumnMeta) -> Self {
        self.columns.push(column);
        self
    }

    /// Add an attribute mapping.
    pub fn attribute(mut self, attribute: AttributeMeta) -> Self {
        self.attributes.push(attribute);
        self
    }

    /// Add a relationship.
    pub fn relationship(mut self, relationship: RelationshipMeta) -> Self {
        self.relationships.push(relationship);
        self
    }

    /// Add an optimistic-lock attribute.
    pub fn lock_attribute(mut self, attribute: impl Into<String>) -> Self {
        self.lock_attributes.push(attribute.into());
        self
    }

    /// Mark the entity read-only.
    pub fn read_only(mut self, value: bool) -> Self {
        self.read_only = value;
        self
    }

    /// Primary-key column names, in declaration order.
    pub fn pk_columns(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Look up a column by name.
    pub fn find_column(&self, name: &str) -> Option<&ColumnMeta> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// Whether `column` is part of the primary key.
    pub fn is_pk_column(&self, column: &str) -> bool {
        self.find_column(column).is_some_and(|c| c.primary_key)
    }

    /// Look up an attribute mapping by object attribute name.
    pub fn find_attribute(&self, name: &str) -> Option<&AttributeMeta> {
        self.attributes.iter().find(|a| a.name == name)
    }

    /// Look up a relationship by name.
    pub fn find_relationship(&self, name: &str) -> Option<&RelationshipMeta> {
        self.relationships.iter().find(|r| r.name == name)
    }
}

/// Registry of entity metadata plus the derived table dependency order.
#[derive(Debug, Default)]
pub struct SchemaRegistry {
    entities: BTreeMap<String, Arc<EntityMeta>>,
    descriptors: BTreeMap<String, Arc<ObjectIdDescriptor>>,
    /// table -> tables that must be written before it (its parents)
    dependencies: BTreeMap<String, BTreeSet<String>>,
    /// table -> position in the deterministic topological order
    table_order: BTreeMap<String, usize>,
    /// table -> logical data source
    destinations: BTreeMap<String, String>,
}

impl SchemaRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entity and rebuild the table order.
    ///
    /// Fails fast on malformed metadata: no primary key, a lock attribute
    /// that is not mapped, or an empty relationship chain.
    pub fn add_entity(&mut self, entity: EntityMeta) -> Result<()> {
        let pk_columns = entity.pk_columns();
        if pk_columns.is_empty() {
            return Err(Error::mapping(
                MappingErrorKind::UnknownAttribute,
                format!("entity '{}' has no primary-key columns", entity.name),
            ));
        }
        for lock_attr in &entity.lock_attributes {
            if entity.find_attribute(lock_attr).is_none() && entity.find_column(lock_attr).is_none()
            {
                return Err(Error::mapping(
                    MappingErrorKind::UnknownAttribute,
                    format!(
                        "lock attribute '{lock_attr}' of entity '{}' is not mapped",
                        entity.name
                    ),
                ));
            }
        }
        for relationship in &entity.relationships {
            if relationship.chain.is_empty() {
                return Err(Error::mapping(
                    MappingErrorKind::UnknownRelationship,
                    format!(
                        "relationship '{}' of entity '{}' has an empty join chain",
                        relationship.name, entity.name
                    ),
                ));
            }
        }

        let descriptor = ObjectIdDescriptor::new(entity.name.clone(), pk_columns)?;
        self.descriptors.insert(entity.name.clone(), descriptor);
        self.destinations
            .insert(entity.table.clone(), entity.destination.clone());
        self.dependencies.entry(entity.table.clone()).or_default();

        for relationship in &entity.relationships {
            self.record_chain_dependencies(&entity, relationship);
        }

        self.entities
            .insert(entity.name.clone(), Arc::new(entity));
        self.rebuild_order();
        Ok(())
    }

    /// Derive write-order dependencies from one relationship chain.
    ///
    /// Direction per hop: an identifying hop makes the target depend on the
    /// source; otherwise the side holding a non-key join column depends on
    /// the side holding the key. Intermediate join tables (no entity of
    /// their own) depend on both neighbors since their rows are assembled
    /// from both ends' keys.
    fn record_chain_dependencies(&mut self, owner: &EntityMeta, relationship: &RelationshipMeta) {
        let mut prev_table = owner.table.clone();
        for step in &relationship.chain {
            if step.table != prev_table {
                let prev_meta: Option<&EntityMeta> = if prev_table == owner.table {
                    Some(owner)
                } else {
                    self.entities
                        .values()
                        .find(|e| e.table == prev_table)
                        .map(AsRef::as_ref)
                };
                let child_is_target = if step.to_dependent_pk {
                    true
                } else {
                    match prev_meta {
                        Some(prev_meta) => step
                            .joins
                            .iter()
                            .all(|join| prev_meta.is_pk_column(&join.source)),
                        // A join table's outgoing hop points at a parent.
                        None => false,
                    }
                };
                if child_is_target {
                    self.add_dependency(&step.table, &prev_table);
                } else {
                    self.add_dependency(&prev_table, &step.table);
                }
                if !self.destinations.contains_key(&step.table) {
                    self.destinations
                        .insert(step.table.clone(), owner.destination.clone());
                }
            }
            prev_table = step.table.clone();
        }
    }

    fn add_dependency(&mut self, table: &str, parent: &str) {
        self.dependencies
            .entry(table.to_string())
            .or_default()
            .insert(parent.to_string());
        self.dependencies.entry(parent.to_string()).or_default();
    }

    /// Recompute the total topological table order.
    ///
    /// Deterministic Kahn: among ready tables the lexicographically
    /// smallest name goes first. A genuine reference cycle is broken at the
    /// smallest-named remaining table with a warning rather than an error;
    /// self-joins never register as dependencies.
    fn rebuild_order(&mut self) {
        let mut remaining: BTreeMap<String, BTreeSet<String>> = self
            .dependencies
            .iter()
            .map(|(table, parents)| {
                let parents = parents
                    .iter()
                    .filter(|p| *p != table && self.dependencies.contains_key(*p))
                    .cloned()
                    .collect();
                (table.clone(), parents)
            })
            .collect();

        self.table_order.clear();
        let mut index = 0usize;
        while !remaining.is_empty() {
            let ready = remaining
                .iter()
                .find(|(_, parents)| parents.iter().all(|p| self.table_order.contains_key(p)))
                .map(|(table, _)| table.clone());

            let next = match ready {
                Some(table) => table,
                None => {
                    // Reference cycle: break it deterministically.
                    let Some(table) = remaining.keys().next().cloned() else {
                        break;
                    };
                    tracing::warn!(
                        table = %table,
                        "reference cycle in table dependencies; breaking at this table"
                    );
                    table
                }
            };
            remaining.remove(&next);
            self.table_order.insert(next, index);
            index += 1;
        }
    }

    /// Look up an entity by name.
    pub fn entity(&self, name: &str) -> Result<&Arc<EntityMeta>> {
        self.entities.get(name).ok_or_else(|| {
            Error::mapping(
                MappingErrorKind::UnknownEntity,
                format!("entity '{name}' is not registered"),
            )
        })
    }

    /// Look up an entity by its table name.
    pub fn entity_by_table(&self, table: &str) -> Option<&Arc<EntityMeta>> {
        self.entities.values().find(|e| e.table == table)
    }

    /// The identity descriptor for an entity.
    pub fn descriptor(&self, entity: &str) -> Result<Arc<ObjectIdDescriptor>> {
        self.descriptors.get(entity).map(Arc::clone).ok_or_else(|| {
            Error::mapping(
                MappingErrorKind::UnknownEntity,
                format!("entity '{entity}' is not registered"),
            )
        })
    }

    /// Position of `table` in the topological order. Tables never seen by
    /// dependency analysis sort after all known tables.
    pub fn order_of(&self, table: &str) -> usize {
        self.table_order
            .get(table)
            .copied()
            .unwrap_or(usize::MAX)
    }

    /// Number of ordered tables.
    pub fn ordered_table_count(&self) -> usize {
        self.table_order.len()
    }

    /// Logical data source of `table`.
    pub fn destination(&self, table: &str) -> &str {
        self.destinations
            .get(table)
            .map_or("default", String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artist() -> EntityMeta {
        EntityMeta::new("Artist", "artist")
            .column(ColumnMeta::new("artist_id").primary_key(true).generated(true))
            .column(ColumnMeta::new("name").mandatory(true))
            .attribute(AttributeMeta::new("name", "name"))
            .relationship(RelationshipMeta::new(
                "paintings",
                vec![JoinStep::new(
                    "painting",
                    vec![DbJoin::new("artist_id", "artist_id")],
                )],
            ))
    }

    fn painting() -> EntityMeta {
        EntityMeta::new("Painting", "painting")
            .column(ColumnMeta::new("painting_id").primary_key(true))
            .column(ColumnMeta::new("artist_id").mandatory(true))
            .column(ColumnMeta::new("title"))
            .attribute(AttributeMeta::new("title", "title"))
            .relationship(RelationshipMeta::new(
                "artist",
                vec![JoinStep::new(
                    "artist",
                    vec![DbJoin::new("artist_id", "artist_id")],
                )],
            ))
    }

    fn gallery_with_flattened_artists() -> EntityMeta {
        EntityMeta::new("Gallery", "gallery")
            .column(ColumnMeta::new("gallery_id").primary_key(true))
            .column(ColumnMeta::new("name"))
            .attribute(AttributeMeta::new("name", "name"))
            .relationship(RelationshipMeta::new(
                "exhibits",
                vec![
                    JoinStep::new(
                        "gallery_artist",
                        vec![DbJoin::new("gallery_id", "gallery_id")],
                    ),
                    JoinStep::new("artist", vec![DbJoin::new("artist_id", "artist_id")]),
                ],
            ))
    }

    #[test]
    fn parent_orders_before_child() {
        let mut schema = SchemaRegistry::new();
        schema.add_entity(artist()).unwrap();
        schema.add_entity(painting()).unwrap();

        assert!(schema.order_of("artist") < schema.order_of("painting"));
    }

    #[test]
    fn join_table_orders_after_both_ends() {
        let mut schema = SchemaRegistry::new();
        schema.add_entity(artist()).unwrap();
        schema.add_entity(painting()).unwrap();
        schema.add_entity(gallery_with_flattened_artists()).unwrap();

        assert!(schema.order_of("gallery") < schema.order_of("gallery_artist"));
        assert!(schema.order_of("artist") < schema.order_of("gallery_artist"));
    }

    #[test]
    fn order_is_deterministic_across_rebuilds() {
        let build = || {
            let mut schema = SchemaRegistry::new();
            schema.add_entity(gallery_with_flattened_artists()).unwrap();
            schema.add_entity(painting()).unwrap();
            schema.add_entity(artist()).unwrap();
            (
                schema.order_of("artist"),
                schema.order_of("painting"),
                schema.order_of("gallery"),
                schema.order_of("gallery_artist"),
            )
        };
        assert_eq!(build(), build());
    }

    #[test]
    fn self_join_does_not_cycle() {
        let mut schema = SchemaRegistry::new();
        let employee = EntityMeta::new("Employee", "employee")
            .column(ColumnMeta::new("employee_id").primary_key(true))
            .column(ColumnMeta::new("manager_id"))
            .relationship(RelationshipMeta::new(
                "manager",
                vec![JoinStep::new(
                    "employee",
                    vec![DbJoin::new("manager_id", "employee_id")],
                )],
            ));
        schema.add_entity(employee).unwrap();
        assert_eq!(schema.ordered_table_count(), 1);
    }

    #[test]
    fn cycle_is_broken_deterministically() {
        let mut schema = SchemaRegistry::new();
        let a = EntityMeta::new("A", "table_a")
            .column(ColumnMeta::new("id").primary_key(true))
            .column(ColumnMeta::new("b_id"))
            .relationship(RelationshipMeta::new(
                "b",
                vec![JoinStep::new("table_b", vec![DbJoin::new("b_id", "id")])],
            ));
        let b = EntityMeta::new("B", "table_b")
            .column(ColumnMeta::new("id").primary_key(true))
            .column(ColumnMeta::new("a_id"))
            .relationship(RelationshipMeta::new(
                "a",
                vec![JoinStep::new("table_a", vec![DbJoin::new("a_id", "id")])],
            ));
        schema.add_entity(a).unwrap();
        schema.add_entity(b).unwrap();
        // Both ordered despite the cycle; order stays total and stable.
        assert_eq!(schema.ordered_table_count(), 2);
        assert_ne!(schema.order_of("table_a"), schema.order_of("table_b"));
    }

    #[test]
    fn validation_rejects_bad_metadata() {
        let mut schema = SchemaRegistry::new();
        let no_pk = EntityMeta::new("Bad", "bad").column(ColumnMeta::new("x"));
        assert!(schema.add_entity(no_pk).is_err());

        let bad_lock = EntityMeta::new("Bad", "bad")
            .column(ColumnMeta::new("id").primary_key(true))
            .lock_attribute("missing");
        assert!(schema.add_entity(bad_lock).is_err());

        assert!(schema.entity("Nope").is_err());
        assert!(schema.descriptor("Nope").is_err());
    }

    #[test]
    fn destinations_default_and_propagate() {
        let mut schema = SchemaRegistry::new();
        schema
            .add_entity(gallery_with_flattened_artists().destination("archive"))
            .unwrap();
        assert_eq!(schema.destination("gallery"), "archive");
        // Join table inherits the owner's destination.
        assert_eq!(schema.destination("gallery_artist"), "archive");
        assert_eq!(schema.destination("unknown"), "default");
    }
}
