//! Portable object identity.
//!
//! An [`ObjectId`] names one persistent entity instance, either by a
//! temporary key (before the row exists) or by its permanent primary-key
//! values. Identity is the only handle rows hold on each other: the flush
//! engine indexes everything by id, so cyclic relationship graphs never
//! produce reference cycles.
//!
//! Replacement is two-phase: pending entries are staged write-once into the
//! id, then consumed by [`ObjectId::create_replacement_id`] to mint a new
//! immutable permanent id. Ids are never mutated into permanence in place.

use crate::error::{Error, IdentityErrorKind, Result};
use crate::value::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::num::NonZeroU64;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Shared, immutable identity shape: entity name plus the ordered
/// primary-key attribute names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectIdDescriptor {
    entity: String,
    pk_attributes: Vec<String>,
}

impl ObjectIdDescriptor {
    /// Create a descriptor. Fails fast on a malformed shape: empty entity
    /// name, empty attribute list, or duplicate attribute names.
    pub fn new(
        entity: impl Into<String>,
        pk_attributes: impl IntoIterator<Item = impl Into<String>>,
    ) -> Result<Arc<Self>> {
        let entity = entity.into();
        let pk_attributes: Vec<String> = pk_attributes.into_iter().map(Into::into).collect();

        if entity.is_empty() {
            return Err(Error::identity(
                IdentityErrorKind::MalformedDescriptor,
                "descriptor entity name is empty",
            ));
        }
        if pk_attributes.is_empty() {
            return Err(Error::identity(
                IdentityErrorKind::MalformedDescriptor,
                format!("descriptor for '{entity}' has no primary-key attributes"),
            ));
        }
        for (i, attr) in pk_attributes.iter().enumerate() {
            if pk_attributes[..i].contains(attr) {
                return Err(Error::identity(
                    IdentityErrorKind::MalformedDescriptor,
                    format!("descriptor for '{entity}' repeats attribute '{attr}'"),
                ));
            }
        }

        Ok(Arc::new(Self {
            entity,
            pk_attributes,
        }))
    }

    /// The entity name.
    pub fn entity(&self) -> &str {
        &self.entity
    }

    /// The ordered primary-key attribute names.
    pub fn pk_attributes(&self) -> &[String] {
        &self.pk_attributes
    }

    /// Whether `attr` is one of the primary-key attributes.
    pub fn is_pk_attribute(&self, attr: &str) -> bool {
        self.pk_attributes.iter().any(|a| a == attr)
    }
}

/// Mints temporary identity keys.
///
/// Explicitly owned and injected; the sequence is process-wide monotonic,
/// wraps past `u64::MAX` back to 1, and never yields zero (zero is reserved
/// to mean "permanent").
#[derive(Debug)]
pub struct TempIdAllocator {
    next: AtomicU64,
}

impl TempIdAllocator {
    /// Create an allocator starting at 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Take the next temporary key. Thread-safe; skips zero on wraparound.
    pub fn next_key(&self) -> NonZeroU64 {
        loop {
            let key = self.next.fetch_add(1, Ordering::Relaxed);
            if let Some(key) = NonZeroU64::new(key) {
                return key;
            }
        }
    }
}

impl Default for TempIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Temporary or permanent state; exactly one holds at any time.
#[derive(Debug, Clone)]
enum IdState {
    Temporary(NonZeroU64),
    Permanent(Vec<Value>),
}

/// Identity of one persistent entity instance.
///
/// Equality and hashing ignore the pending replacement map: two ids are
/// equal iff they share a descriptor entity and either the same temporary
/// key or elementwise-equal permanent values (numerics by integral value,
/// bytes by content).
#[derive(Clone)]
pub struct ObjectId {
    descriptor: Arc<ObjectIdDescriptor>,
    state: IdState,
    pending: BTreeMap<String, Value>,
}

impl ObjectId {
    /// Create a temporary id from the injected allocator.
    pub fn temporary(descriptor: Arc<ObjectIdDescriptor>, ids: &TempIdAllocator) -> Self {
        Self {
            descriptor,
            state: IdState::Temporary(ids.next_key()),
            pending: BTreeMap::new(),
        }
    }

    /// Create a permanent id from a key map.
    ///
    /// The map must supply a value for every primary-key attribute of the
    /// descriptor; insertion order of the map is irrelevant because values
    /// are stored in descriptor attribute order.
    pub fn permanent(
        descriptor: Arc<ObjectIdDescriptor>,
        key_map: &BTreeMap<String, Value>,
    ) -> Result<Self> {
        let mut values = Vec::with_capacity(descriptor.pk_attributes.len());
        for attr in &descriptor.pk_attributes {
            match key_map.get(attr) {
                Some(v) => values.push(v.clone()),
                None => {
                    return Err(Error::identity(
                        IdentityErrorKind::IncompleteKey,
                        format!(
                            "key map for '{}' is missing attribute '{attr}'",
                            descriptor.entity
                        ),
                    ));
                }
            }
        }
        Ok(Self {
            descriptor,
            state: IdState::Permanent(values),
            pending: BTreeMap::new(),
        })
    }

    /// The shared descriptor.
    pub fn descriptor(&self) -> &Arc<ObjectIdDescriptor> {
        &self.descriptor
    }

    /// The entity name.
    pub fn entity(&self) -> &str {
        &self.descriptor.entity
    }

    /// Whether this id is still temporary.
    pub fn is_temporary(&self) -> bool {
        matches!(self.state, IdState::Temporary(_))
    }

    /// The temporary key, when temporary.
    pub fn tmp_key(&self) -> Option<NonZeroU64> {
        match self.state {
            IdState::Temporary(key) => Some(key),
            IdState::Permanent(_) => None,
        }
    }

    /// The permanent key values in descriptor attribute order, when
    /// permanent.
    pub fn values(&self) -> Option<&[Value]> {
        match &self.state {
            IdState::Temporary(_) => None,
            IdState::Permanent(values) => Some(values),
        }
    }

    /// Whether replacement entries are staged and a replacement id should
    /// eventually be minted.
    pub fn is_replacement_needed(&self) -> bool {
        !self.pending.is_empty()
    }

    /// The staged replacement entries.
    pub fn pending_replacement(&self) -> &BTreeMap<String, Value> {
        &self.pending
    }

    /// Current view of the key: the permanent key map overlaid with any
    /// staged replacement entries. Empty for a temporary id with nothing
    /// staged yet.
    pub fn id_snapshot(&self) -> BTreeMap<String, Value> {
        let mut snapshot = BTreeMap::new();
        if let IdState::Permanent(values) = &self.state {
            for (attr, value) in self.descriptor.pk_attributes.iter().zip(values) {
                snapshot.insert(attr.clone(), value.clone());
            }
        }
        for (attr, value) in &self.pending {
            snapshot.insert(attr.clone(), value.clone());
        }
        snapshot
    }

    /// Stage a replacement value for one primary-key attribute.
    ///
    /// Staging is write-once per attribute: staging an equal value again is
    /// a no-op, a different value is a conflict.
    pub fn stage_replacement(&mut self, attr: &str, value: Value) -> Result<()> {
        if !self.descriptor.is_pk_attribute(attr) {
            return Err(Error::identity(
                IdentityErrorKind::ForeignAttribute,
                format!(
                    "'{attr}' is not a primary-key attribute of '{}'",
                    self.descriptor.entity
                ),
            ));
        }
        if let Some(existing) = self.pending.get(attr) {
            if existing.id_eq(&value) {
                return Ok(());
            }
            return Err(Error::identity(
                IdentityErrorKind::ReplacementConflict,
                format!(
                    "attribute '{attr}' of '{}' already staged as {:?}, got {:?}",
                    self.descriptor.entity, existing, value
                ),
            ));
        }
        self.pending.insert(attr.to_string(), value);
        Ok(())
    }

    /// Mint the replacement id: a new permanent [`ObjectId`] from the
    /// permanent snapshot (if any) merged with the staged entries. Never
    /// mutates `self`.
    ///
    /// Fails when the merged map does not cover every primary-key
    /// attribute.
    pub fn create_replacement_id(&self) -> Result<ObjectId> {
        let snapshot = self.id_snapshot();
        ObjectId::permanent(Arc::clone(&self.descriptor), &snapshot)
    }
}

impl PartialEq for ObjectId {
    fn eq(&self, other: &Self) -> bool {
        if self.descriptor.entity != other.descriptor.entity {
            return false;
        }
        match (&self.state, &other.state) {
            (IdState::Temporary(a), IdState::Temporary(b)) => a == b,
            (IdState::Permanent(a), IdState::Permanent(b)) => {
                a.len() == b.len() && a.iter().zip(b).all(|(x, y)| x.id_eq(y))
            }
            _ => false,
        }
    }
}

impl Eq for ObjectId {}

impl Hash for ObjectId {
    fn hash<H: Hasher>(&self, hasher: &mut H) {
        self.descriptor.entity.hash(hasher);
        match &self.state {
            IdState::Temporary(key) => {
                0u8.hash(hasher);
                key.hash(hasher);
            }
            IdState::Permanent(values) => {
                1u8.hash(hasher);
                for value in values {
                    value.id_hash(hasher);
                }
            }
        }
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.state {
            IdState::Temporary(key) => {
                write!(f, "ObjectId({}, tmp:{key}", self.descriptor.entity)?;
            }
            IdState::Permanent(values) => {
                write!(f, "ObjectId({}, {values:?}", self.descriptor.entity)?;
            }
        }
        if !self.pending.is_empty() {
            write!(f, ", pending:{:?}", self.pending)?;
        }
        write!(f, ")")
    }
}
