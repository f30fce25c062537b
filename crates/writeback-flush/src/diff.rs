//! Per-object change descriptions consumed by one flush.
//!
//! The unit-of-work layer records what happened to each object; the flush
//! engine replays those recordings. A diff is an ordered sequence of
//! attribute and relationship-arc events plus the committed snapshot the
//! optimistic-lock qualifier is built from. Event order matters within one
//! object's diff (attribute/arc interleaving), never across objects.

use std::collections::BTreeMap;
use writeback_core::{ObjectId, Value};

/// What happened to the object as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Newly registered; its row does not exist yet.
    Created,
    /// Existing object with property or relationship changes.
    Modified,
    /// Marked for deletion.
    Deleted,
}

/// One recorded change event.
#[derive(Debug, Clone)]
pub enum DiffEvent {
    /// An attribute took a new value (possibly `Null`).
    AttributeSet {
        /// Object-level attribute name
        attribute: String,
        /// The new value
        value: Value,
    },
    /// A relationship arc to `target` was added.
    ArcAdded {
        /// Relationship name on the source entity
        relationship: String,
        /// Identity of the far end
        target: ObjectId,
    },
    /// A relationship arc to `target` was removed.
    ArcRemoved {
        relationship: String,
        target: ObjectId,
    },
}

/// The full recorded change for one object.
#[derive(Debug, Clone)]
pub struct ObjectDiff {
    /// The object's identity at flush time
    pub id: ObjectId,
    /// Overall lifecycle change
    pub kind: ChangeKind,
    /// Replayable event sequence
    pub events: Vec<DiffEvent>,
    /// Committed attribute values, keyed by attribute name. Source of
    /// optimistic-lock expectations and of join values for arcs between
    /// plain columns.
    pub snapshot: BTreeMap<String, Value>,
}

impl ObjectDiff {
    /// Diff for a newly created object.
    pub fn created(id: ObjectId) -> Self {
        Self::new(id, ChangeKind::Created)
    }

    /// Diff for a modified object.
    pub fn modified(id: ObjectId) -> Self {
        Self::new(id, ChangeKind::Modified)
    }

    /// Diff for a deleted object.
    pub fn deleted(id: ObjectId) -> Self {
        Self::new(id, ChangeKind::Deleted)
    }

    fn new(id: ObjectId, kind: ChangeKind) -> Self {
        Self {
            id,
            kind,
            events: Vec::new(),
            snapshot: BTreeMap::new(),
        }
    }

    /// Record an attribute change.
    pub fn set(mut self, attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        self.events.push(DiffEvent::AttributeSet {
            attribute: attribute.into(),
            value: value.into(),
        });
        self
    }

    /// Record an added relationship arc.
    pub fn arc_added(mut self, relationship: impl Into<String>, target: ObjectId) -> Self {
        self.events.push(DiffEvent::ArcAdded {
            relationship: relationship.into(),
            target,
        });
        self
    }

    /// Record a removed relationship arc.
    pub fn arc_removed(mut self, relationship: impl Into<String>, target: ObjectId) -> Self {
        self.events.push(DiffEvent::ArcRemoved {
            relationship: relationship.into(),
            target,
        });
        self
    }

    /// Record one committed snapshot value.
    pub fn snapshot_value(mut self, attribute: impl Into<String>, value: impl Into<Value>) -> Self {
        self.snapshot.insert(attribute.into(), value.into());
        self
    }
}

/// A directed relationship instance between two identities.
///
/// Only used to track relationship-driven row creation (flattened join
/// rows); never persisted and never outlives one flush.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ArcTarget {
    pub source: ObjectId,
    pub target: ObjectId,
    pub relationship: String,
}

impl ArcTarget {
    pub fn new(source: ObjectId, target: ObjectId, relationship: impl Into<String>) -> Self {
        Self {
            source,
            target,
            relationship: relationship.into(),
        }
    }
}

/// Supplier of the change set for one flush.
///
/// Consumed exactly once per flush; an empty result is the "nothing to do"
/// fast path.
pub trait ChangeSource {
    /// Drain the pending per-object diffs.
    fn pending_changes(&mut self) -> Vec<ObjectDiff>;
}

impl ChangeSource for Vec<ObjectDiff> {
    fn pending_changes(&mut self) -> Vec<ObjectDiff> {
        std::mem::take(self)
    }
}
