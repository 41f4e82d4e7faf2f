//! Tracked entries and the per-entry state machine.
//!
//! A [`TrackedEntry`] is the change-tracking record for one entity: its
//! property storage, the original-value snapshot captured at attach/load
//! time, and an [`EntityState`] tag. Property storage comes in two flavors
//! behind one surface: bound to a live instance, or shadow values owned
//! directly by the entry. The rest of the engine never cares which.

use crate::EntityKey;
use entrack_core::{
    EntityRef, EntityType, EntityTypeId, Error, ForeignKey, InvalidKeyError, PropertyId, Result,
    Value,
};
use serde::Serialize;
use std::sync::Arc;

/// State of a tracked entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum EntityState {
    /// Known to the session but not tracked against the store.
    Detached,
    /// Tracked and assumed to match the store.
    Unchanged,
    /// New entry, needs INSERT on save.
    Added,
    /// Tracked with pending changes, needs UPDATE on save.
    Modified,
    /// Marked for deletion, needs DELETE on save.
    Deleted,
}

impl EntityState {
    /// Whether this state contributes a row operation on save.
    #[must_use]
    pub const fn is_dirty(self) -> bool {
        matches!(
            self,
            EntityState::Added | EntityState::Modified | EntityState::Deleted
        )
    }

    /// Fixed rank used in the deterministic save ordering tie-break.
    pub(crate) const fn sort_rank(self) -> u8 {
        match self {
            EntityState::Added => 0,
            EntityState::Modified => 1,
            EntityState::Deleted => 2,
            EntityState::Unchanged | EntityState::Detached => 3,
        }
    }

    /// Short name for diagnostics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            EntityState::Detached => "detached",
            EntityState::Unchanged => "unchanged",
            EntityState::Added => "added",
            EntityState::Modified => "modified",
            EntityState::Deleted => "deleted",
        }
    }
}

/// Handle to a tracked entry in the state manager's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntryId(pub(crate) usize);

impl EntryId {
    /// Arena index of this entry.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Property storage for one entry.
///
/// `Bound` reads and writes through the live instance; `Shadow` owns the
/// values directly with no instance at all (query materialization before
/// object construction, or purely dynamic hosts).
pub enum PropertyStore {
    /// Backed by a shared live instance.
    Bound(EntityRef),
    /// Values owned by the entry, indexed by property.
    Shadow(Vec<Value>),
}

impl PropertyStore {
    /// Read one property.
    pub fn get(&self, entity_type: &EntityType, property: PropertyId) -> Value {
        match self {
            PropertyStore::Bound(r) => r
                .read()
                .expect("lock poisoned")
                .get(&entity_type.property(property).name),
            PropertyStore::Shadow(values) => values[property.index()].clone(),
        }
    }

    /// Write one property.
    pub fn set(&mut self, entity_type: &EntityType, property: PropertyId, value: Value) {
        match self {
            PropertyStore::Bound(r) => r
                .write()
                .expect("lock poisoned")
                .set(&entity_type.property(property).name, value),
            PropertyStore::Shadow(values) => values[property.index()] = value,
        }
    }
}

impl std::fmt::Debug for PropertyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PropertyStore::Bound(_) => f.write_str("PropertyStore::Bound"),
            PropertyStore::Shadow(values) => {
                write!(f, "PropertyStore::Shadow({} values)", values.len())
            }
        }
    }
}

/// The change-tracking record for one entity.
#[derive(Debug)]
pub struct TrackedEntry {
    entity_type: EntityTypeId,
    store: PropertyStore,
    /// Snapshot captured at attach/load time, indexed by property.
    original: Vec<Value>,
    state: EntityState,
    /// The key the identity map currently holds for this entry. Kept here so
    /// stop-tracking removes the map entry even if key properties drifted.
    map_key: Option<EntityKey>,
}

impl TrackedEntry {
    pub(crate) fn new(
        entity_type: EntityTypeId,
        store: PropertyStore,
        et: &EntityType,
    ) -> Self {
        let original = match &store {
            PropertyStore::Shadow(values) => values.clone(),
            PropertyStore::Bound(_) => et.property_ids().map(|p| store.get(et, p)).collect(),
        };
        Self {
            entity_type,
            store,
            original,
            state: EntityState::Detached,
            map_key: None,
        }
    }

    /// The entity type this entry tracks.
    #[must_use]
    pub fn entity_type(&self) -> EntityTypeId {
        self.entity_type
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> EntityState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: EntityState) {
        self.state = state;
    }

    pub(crate) fn map_key(&self) -> Option<&EntityKey> {
        self.map_key.as_ref()
    }

    pub(crate) fn set_map_key(&mut self, key: Option<EntityKey>) {
        self.map_key = key;
    }

    /// Pointer identity of the bound instance, if any.
    pub(crate) fn instance_ptr(&self) -> Option<usize> {
        match &self.store {
            PropertyStore::Bound(r) => Some(Arc::as_ptr(r).cast::<()>() as usize),
            PropertyStore::Shadow(_) => None,
        }
    }

    /// Read the current value of one property.
    #[must_use]
    pub fn property(&self, et: &EntityType, property: PropertyId) -> Value {
        self.store.get(et, property)
    }

    /// The original (snapshot) value of one property.
    #[must_use]
    pub fn original_value(&self, property: PropertyId) -> &Value {
        &self.original[property.index()]
    }

    pub(crate) fn set_property(&mut self, et: &EntityType, property: PropertyId, value: Value) {
        self.store.set(et, property, value);
    }

    /// Overwrite both current and original value; used for store-generated
    /// read-backs accepted after a successful save.
    pub(crate) fn set_property_accepted(
        &mut self,
        et: &EntityType,
        property: PropertyId,
        value: Value,
    ) {
        self.store.set(et, property, value.clone());
        self.original[property.index()] = value;
    }

    /// All current property values, in declaration order.
    #[must_use]
    pub fn current_values(&self, et: &EntityType) -> Vec<Value> {
        et.property_ids().map(|p| self.store.get(et, p)).collect()
    }

    /// Current key property values.
    #[must_use]
    pub fn key_values(&self, et: &EntityType) -> Vec<Value> {
        et.key().iter().map(|p| self.store.get(et, *p)).collect()
    }

    /// Key property values from the original snapshot.
    #[must_use]
    pub fn original_key_values(&self, et: &EntityType) -> Vec<Value> {
        et.key()
            .iter()
            .map(|p| self.original[p.index()].clone())
            .collect()
    }

    /// Compute this entry's identity key from current values.
    ///
    /// Fails with `InvalidKey` when any key component is null/unset.
    #[allow(clippy::result_large_err)]
    pub fn compute_key(&self, et: &EntityType) -> Result<EntityKey> {
        let mut values = Vec::with_capacity(et.key().len());
        for p in et.key() {
            let v = self.store.get(et, *p);
            if v.is_null() {
                return Err(Error::InvalidKey(InvalidKeyError {
                    entity: et.name.clone(),
                    property: et.property(*p).name.clone(),
                }));
            }
            values.push(v);
        }
        Ok(EntityKey::new(self.entity_type, values))
    }

    /// Properties whose current value differs from the snapshot.
    #[must_use]
    pub fn changed_properties(&self, et: &EntityType) -> Vec<PropertyId> {
        et.property_ids()
            .filter(|p| self.store.get(et, *p) != self.original[p.index()])
            .collect()
    }

    /// Project this entry's foreign-key values for one FK.
    ///
    /// Returns `None` if any component is null (no principal referenced).
    #[must_use]
    pub fn foreign_key_values(
        &self,
        et: &EntityType,
        fk: &ForeignKey,
        from_original: bool,
    ) -> Option<Vec<Value>> {
        let mut values = Vec::with_capacity(fk.dependent.len());
        for p in &fk.dependent {
            let v = if from_original {
                self.original[p.index()].clone()
            } else {
                self.store.get(et, *p)
            };
            if v.is_null() {
                return None;
            }
            values.push(v);
        }
        Some(values)
    }

    /// Re-baseline the snapshot to the current values.
    pub(crate) fn snapshot(&mut self, et: &EntityType) {
        self.original = self.current_values(et);
    }

    /// Restore current values from the snapshot.
    pub(crate) fn revert(&mut self, et: &EntityType) {
        for p in et.property_ids() {
            let v = self.original[p.index()].clone();
            self.store.set(et, p, v);
        }
    }
}
