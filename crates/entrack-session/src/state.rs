//! Identity map and entry lifecycle management.
//!
//! The [`StateManager`] owns every tracked entry arena-style: entries live in
//! an index-addressed slab, and relationships between entries are expressed
//! as key lookups, never as owning pointers between entries. Two indexes keep
//! identity coherent:
//!
//! - a key map `(entity type, key values) -> entry`, guaranteeing at most one
//!   tracked entry per identity
//! - an instance map keyed by `Arc` pointer identity, making
//!   [`StateManager::get_or_create_entry`] idempotent per live instance

use crate::EntityKey;
use crate::entry::{EntityState, EntryId, PropertyStore, TrackedEntry};
use entrack_core::{
    EntityModel, EntityRef, EntityTypeId, Error, ForeignKey, IdentityConflictError, Result, Value,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Owns all tracked entries and the identity indexes over them.
pub struct StateManager {
    model: Arc<EntityModel>,
    entries: Vec<Option<TrackedEntry>>,
    free: Vec<usize>,
    key_map: HashMap<EntityKey, EntryId>,
    instance_map: HashMap<usize, EntryId>,
}

impl StateManager {
    /// Create a state manager over an immutable model.
    #[must_use]
    pub fn new(model: Arc<EntityModel>) -> Self {
        Self {
            model,
            entries: Vec::new(),
            free: Vec::new(),
            key_map: HashMap::new(),
            instance_map: HashMap::new(),
        }
    }

    /// The entity model this manager tracks against.
    #[must_use]
    pub fn model(&self) -> &EntityModel {
        &self.model
    }

    /// Borrow an entry. Panics on a stale handle.
    #[must_use]
    pub fn entry(&self, id: EntryId) -> &TrackedEntry {
        self.entries[id.0].as_ref().expect("stale entry id")
    }

    pub(crate) fn entry_mut(&mut self, id: EntryId) -> &mut TrackedEntry {
        self.entries[id.0].as_mut().expect("stale entry id")
    }

    /// Borrow an entry if the handle is still live.
    #[must_use]
    pub fn try_entry(&self, id: EntryId) -> Option<&TrackedEntry> {
        self.entries.get(id.0).and_then(Option::as_ref)
    }

    /// Number of live entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len() - self.free.len()
    }

    /// Check if no entries are tracked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn alloc(&mut self, entry: TrackedEntry) -> EntryId {
        if let Some(i) = self.free.pop() {
            self.entries[i] = Some(entry);
            EntryId(i)
        } else {
            self.entries.push(Some(entry));
            EntryId(self.entries.len() - 1)
        }
    }

    /// Get the entry for a live instance, creating a `Detached` one (with a
    /// fresh snapshot) if the instance is not yet known.
    ///
    /// Idempotent: repeated calls with the same `Arc` return the same entry.
    #[allow(clippy::result_large_err)]
    pub fn get_or_create_entry(
        &mut self,
        entity_type: EntityTypeId,
        instance: EntityRef,
    ) -> Result<EntryId> {
        let ptr = Arc::as_ptr(&instance).cast::<()>() as usize;
        if let Some(id) = self.instance_map.get(&ptr) {
            return Ok(*id);
        }

        let et = self.model.entity(entity_type);
        {
            let guard = instance.read().expect("lock poisoned");
            if guard.entity_name() != et.name {
                return Err(Error::Custom(format!(
                    "instance reports entity type '{}' but was attached as '{}'",
                    guard.entity_name(),
                    et.name
                )));
            }
        }

        let entry = TrackedEntry::new(entity_type, PropertyStore::Bound(instance), et);
        tracing::trace!(entity = %et.name, "created entry for instance");
        let id = self.alloc(entry);
        self.instance_map.insert(ptr, id);
        Ok(id)
    }

    /// Create a `Detached` shadow-state entry owning its values directly.
    #[allow(clippy::result_large_err)]
    pub fn create_shadow_entry(
        &mut self,
        entity_type: EntityTypeId,
        values: Vec<Value>,
    ) -> Result<EntryId> {
        let et = self.model.entity(entity_type);
        if values.len() != et.property_count() {
            return Err(Error::Custom(format!(
                "entity '{}' has {} properties but {} values were provided",
                et.name,
                et.property_count(),
                values.len()
            )));
        }
        let entry = TrackedEntry::new(entity_type, PropertyStore::Shadow(values), et);
        Ok(self.alloc(entry))
    }

    /// Begin tracking an entry as `Unchanged`.
    ///
    /// Computes the entry's key (failing with `InvalidKey` on a null
    /// component) and registers it in the key map, failing with
    /// `IdentityConflict` if a *different* entry already holds that key.
    #[allow(clippy::result_large_err)]
    pub fn start_tracking(&mut self, id: EntryId) -> Result<()> {
        let key = {
            let entry = self.entry(id);
            let et = self.model.entity(entry.entity_type());
            entry.compute_key(et)?
        };

        if let Some(existing) = self.key_map.get(&key) {
            if *existing != id {
                let et = self.model.entity(self.entry(id).entity_type());
                return Err(Error::IdentityConflict(IdentityConflictError {
                    entity: et.name.clone(),
                    key: key.values().to_vec(),
                }));
            }
        }

        self.key_map.insert(key.clone(), id);
        let entry = self.entry_mut(id);
        entry.set_map_key(Some(key));
        entry.set_state(EntityState::Unchanged);
        Ok(())
    }

    /// Register an entry's key in the key map if it is computable.
    ///
    /// Used for `Added` entries: a store-generated key may still be unset, in
    /// which case the entry stays unregistered until read-back at accept time.
    #[allow(clippy::result_large_err)]
    pub(crate) fn register_key(&mut self, id: EntryId) -> Result<bool> {
        let key = {
            let entry = self.entry(id);
            let et = self.model.entity(entry.entity_type());
            match entry.compute_key(et) {
                Ok(key) => key,
                Err(Error::InvalidKey(_)) => return Ok(false),
                Err(e) => return Err(e),
            }
        };

        if let Some(existing) = self.key_map.get(&key) {
            if *existing != id {
                let et = self.model.entity(self.entry(id).entity_type());
                return Err(Error::IdentityConflict(IdentityConflictError {
                    entity: et.name.clone(),
                    key: key.values().to_vec(),
                }));
            }
        }

        self.key_map.insert(key.clone(), id);
        self.entry_mut(id).set_map_key(Some(key));
        Ok(true)
    }

    /// Stop tracking an entry: remove it from both maps and free its slot.
    ///
    /// Removal uses the key the map actually holds, not a recomputed one, so
    /// this is safe even when key properties changed while tracked.
    pub fn stop_tracking(&mut self, id: EntryId) {
        let Some(entry) = self.entries.get_mut(id.0).and_then(Option::take) else {
            return;
        };
        if let Some(key) = entry.map_key() {
            self.key_map.remove(key);
        }
        if let Some(ptr) = entry.instance_ptr() {
            self.instance_map.remove(&ptr);
        }
        self.free.push(id.0);
    }

    /// Reindex an entry whose key properties changed while tracked.
    ///
    /// Fails with `IdentityConflict` when the new key collides with a
    /// different tracked entry; the old registration is kept in that case.
    #[allow(clippy::result_large_err)]
    pub fn update_identity_map(&mut self, id: EntryId, old_key: &EntityKey) -> Result<()> {
        let new_key = {
            let entry = self.entry(id);
            let et = self.model.entity(entry.entity_type());
            entry.compute_key(et)?
        };
        if new_key == *old_key {
            return Ok(());
        }

        if let Some(existing) = self.key_map.get(&new_key) {
            if *existing != id {
                let et = self.model.entity(self.entry(id).entity_type());
                return Err(Error::IdentityConflict(IdentityConflictError {
                    entity: et.name.clone(),
                    key: new_key.values().to_vec(),
                }));
            }
        }

        self.key_map.remove(old_key);
        self.key_map.insert(new_key.clone(), id);
        self.entry_mut(id).set_map_key(Some(new_key));
        Ok(())
    }

    /// Find a tracked entry by identity key.
    #[must_use]
    pub fn find_entry(&self, key: &EntityKey) -> Option<EntryId> {
        self.key_map.get(key).copied()
    }

    /// Find the entry for a live instance, if it is known.
    #[must_use]
    pub fn find_instance_entry(&self, instance: &EntityRef) -> Option<EntryId> {
        let ptr = Arc::as_ptr(instance).cast::<()>() as usize;
        self.instance_map.get(&ptr).copied()
    }

    /// Resolve the principal entry a dependent currently references.
    ///
    /// The key map serves as the index for this hot path; entries whose key
    /// never registered (pending store-generated keys) are found by scan.
    #[must_use]
    pub fn get_principal(&self, dependent: EntryId, fk: &ForeignKey) -> Option<EntryId> {
        let entry = self.try_entry(dependent)?;
        let et = self.model.entity(entry.entity_type());
        let fk_values = entry.foreign_key_values(et, fk, false)?;

        let key = EntityKey::new(fk.principal_type, fk_values.clone());
        if let Some(id) = self.key_map.get(&key) {
            return Some(*id);
        }

        let principal_et = self.model.entity(fk.principal_type);
        self.iter_ids().find(|id| {
            let e = self.entry(*id);
            e.entity_type() == fk.principal_type && e.key_values(principal_et) == fk_values
        })
    }

    /// All dependent entries of `dependent_type` whose FK currently
    /// references the given principal.
    #[must_use]
    pub fn get_dependents(
        &self,
        principal: EntryId,
        dependent_type: EntityTypeId,
        fk_index: usize,
    ) -> Vec<EntryId> {
        let Some(principal_entry) = self.try_entry(principal) else {
            return Vec::new();
        };
        let principal_et = self.model.entity(principal_entry.entity_type());
        let principal_key = principal_entry.key_values(principal_et);

        let dependent_et = self.model.entity(dependent_type);
        let fk = &dependent_et.foreign_keys()[fk_index];

        self.iter_ids()
            .filter(|id| {
                let e = self.entry(*id);
                e.entity_type() == dependent_type
                    && e.foreign_key_values(dependent_et, fk, false)
                        .is_some_and(|vals| vals == principal_key)
            })
            .collect()
    }

    /// Iterate live entry handles in arena order.
    pub fn iter_ids(&self) -> impl Iterator<Item = EntryId> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.is_some())
            .map(|(i, _)| EntryId(i))
    }

    /// Entries currently in any of the given states.
    #[must_use]
    pub fn entries_in(&self, states: &[EntityState]) -> Vec<EntryId> {
        self.iter_ids()
            .filter(|id| states.contains(&self.entry(*id).state()))
            .collect()
    }

    /// Count entries in one state.
    #[must_use]
    pub fn count_in(&self, state: EntityState) -> usize {
        self.iter_ids()
            .filter(|id| self.entry(*id).state() == state)
            .count()
    }

    /// Promote `Unchanged` entries whose values drifted from their snapshot
    /// to `Modified`. Catches instances mutated outside the session API.
    pub fn detect_changes(&mut self) -> usize {
        let candidates: Vec<EntryId> = self.entries_in(&[EntityState::Unchanged]);
        let mut promoted = 0;
        for id in candidates {
            let changed = {
                let entry = self.entry(id);
                let et = self.model.entity(entry.entity_type());
                !entry.changed_properties(et).is_empty()
            };
            if changed {
                self.entry_mut(id).set_state(EntityState::Modified);
                promoted += 1;
            }
        }
        if promoted > 0 {
            tracing::debug!(promoted, "detected out-of-band modifications");
        }
        promoted
    }
}

impl std::fmt::Debug for StateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateManager")
            .field("entries", &self.len())
            .field("keyed", &self.key_map.len())
            .field("instances", &self.instance_map.len())
            .finish()
    }
}
