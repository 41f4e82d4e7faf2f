//! Dynamic property access for host entity instances.
//!
//! The engine never reads struct fields directly. A host type implements
//! [`EntityObject`] to expose its properties by name; the tracking layer
//! reads and writes through that surface (or through shadow storage when no
//! instance exists at all).

use crate::value::Value;
use std::sync::{Arc, RwLock};

/// Object-safe dynamic property access.
///
/// Implementations map property names from the entity model to their fields.
/// Unknown property names should return [`Value::Null`] from `get` and be
/// ignored by `set`; the engine only asks for properties the model declares.
pub trait EntityObject: Send + Sync {
    /// The entity type name this instance belongs to in the model.
    fn entity_name(&self) -> &str;

    /// Read a property value by name.
    fn get(&self, property: &str) -> Value;

    /// Write a property value by name.
    fn set(&mut self, property: &str, value: Value);
}

/// A shared, lockable reference to a live entity instance.
///
/// The identity map hands out clones of the same `Arc`, so every holder sees
/// the same underlying object and instance identity is pointer identity.
pub type EntityRef = Arc<RwLock<dyn EntityObject>>;

/// Wrap an entity instance for sharing with a session.
pub fn entity_ref<E: EntityObject + 'static>(entity: E) -> EntityRef {
    Arc::new(RwLock::new(entity))
}
