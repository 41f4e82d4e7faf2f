//! Runtime entity-relationship model.
//!
//! The model describes entity shapes the engine persists: properties, primary
//! keys, foreign keys, concurrency tokens, and store-generated columns. It is
//! produced by an external model-building layer (or by hand in tests) and is
//! immutable for the lifetime of a session.
//!
//! Entity types and properties are addressed by index newtypes
//! ([`EntityTypeId`], [`PropertyId`]) rather than references, so the rest of
//! the engine can hold plain `Copy` handles without borrowing the model.

use crate::error::{Error, ModelError, Result};
use std::collections::HashMap;

/// Handle to an entity type within an [`EntityModel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityTypeId(pub(crate) usize);

impl EntityTypeId {
    /// Index of this entity type within the model.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Handle to a property within an [`EntityType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PropertyId(pub(crate) usize);

impl PropertyId {
    /// Index of this property within its entity type.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Metadata about a single entity property.
#[derive(Debug, Clone)]
pub struct Property {
    /// Property name (model-facing).
    pub name: String,
    /// Database column name (may differ from the property name).
    pub column: String,
    /// Whether the column accepts NULL.
    pub nullable: bool,
    /// Whether the store generates this value (identity column, rowversion).
    pub store_generated: bool,
    /// Whether this property participates in optimistic concurrency checks.
    pub concurrency_token: bool,
}

impl Property {
    /// Create a property; the column name defaults to the property name.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            column: name.to_string(),
            nullable: false,
            store_generated: false,
            concurrency_token: false,
        }
    }

    /// Set the database column name.
    #[must_use]
    pub fn column(mut self, column: &str) -> Self {
        self.column = column.to_string();
        self
    }

    /// Mark the column as nullable.
    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    /// Mark the value as generated by the store.
    #[must_use]
    pub fn store_generated(mut self) -> Self {
        self.store_generated = true;
        self
    }

    /// Mark the property as a concurrency token.
    #[must_use]
    pub fn concurrency_token(mut self) -> Self {
        self.concurrency_token = true;
        self
    }
}

/// A resolved foreign key: dependent properties referencing a principal key.
#[derive(Debug, Clone)]
pub struct ForeignKey {
    /// Dependent-side properties, ordered.
    pub dependent: Vec<PropertyId>,
    /// The principal entity type.
    pub principal_type: EntityTypeId,
    /// Principal-side key properties, ordered to match `dependent`.
    pub principal_key: Vec<PropertyId>,
}

impl ForeignKey {
    /// A foreign key is nullable when every dependent column accepts NULL.
    ///
    /// Only nullable foreign keys are eligible for cycle splitting.
    #[must_use]
    pub fn is_nullable(&self, dependent_type: &EntityType) -> bool {
        self.dependent
            .iter()
            .all(|p| dependent_type.property(*p).nullable)
    }
}

/// An entity type: one logical shape mapped to a physical table.
#[derive(Debug, Clone)]
pub struct EntityType {
    /// Entity type name.
    pub name: String,
    /// Physical table name.
    pub table: String,
    /// Optional schema qualifier.
    pub schema: Option<String>,
    properties: Vec<Property>,
    key: Vec<PropertyId>,
    foreign_keys: Vec<ForeignKey>,
    concurrency_tokens: Vec<PropertyId>,
}

impl EntityType {
    /// All properties, in declaration order.
    #[must_use]
    pub fn properties(&self) -> &[Property] {
        &self.properties
    }

    /// Number of properties.
    #[must_use]
    pub fn property_count(&self) -> usize {
        self.properties.len()
    }

    /// Look up a property by handle.
    #[must_use]
    pub fn property(&self, id: PropertyId) -> &Property {
        &self.properties[id.0]
    }

    /// Iterate property handles in declaration order.
    pub fn property_ids(&self) -> impl Iterator<Item = PropertyId> {
        (0..self.properties.len()).map(PropertyId)
    }

    /// Resolve a property handle by name.
    #[must_use]
    pub fn property_id(&self, name: &str) -> Option<PropertyId> {
        self.properties
            .iter()
            .position(|p| p.name == name)
            .map(PropertyId)
    }

    /// Primary key properties, ordered.
    #[must_use]
    pub fn key(&self) -> &[PropertyId] {
        &self.key
    }

    /// Whether a property is part of the primary key.
    #[must_use]
    pub fn is_key(&self, id: PropertyId) -> bool {
        self.key.contains(&id)
    }

    /// Foreign keys declared on this (dependent) entity type.
    #[must_use]
    pub fn foreign_keys(&self) -> &[ForeignKey] {
        &self.foreign_keys
    }

    /// Concurrency-token properties.
    #[must_use]
    pub fn concurrency_tokens(&self) -> &[PropertyId] {
        &self.concurrency_tokens
    }
}

/// The immutable entity-relationship model for one session.
#[derive(Debug, Clone, Default)]
pub struct EntityModel {
    types: Vec<EntityType>,
    by_name: HashMap<String, EntityTypeId>,
}

impl EntityModel {
    /// Start building a model.
    #[must_use]
    pub fn builder() -> ModelBuilder {
        ModelBuilder::default()
    }

    /// Resolve an entity type handle by name.
    #[must_use]
    pub fn entity_id(&self, name: &str) -> Option<EntityTypeId> {
        self.by_name.get(name).copied()
    }

    /// Look up an entity type by handle.
    #[must_use]
    pub fn entity(&self, id: EntityTypeId) -> &EntityType {
        &self.types[id.0]
    }

    /// Iterate all entity types with their handles.
    pub fn entities(&self) -> impl Iterator<Item = (EntityTypeId, &EntityType)> {
        self.types.iter().enumerate().map(|(i, t)| (EntityTypeId(i), t))
    }

    /// Number of entity types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// Check if the model has no entity types.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

/// Unresolved foreign key captured during building.
#[derive(Debug, Clone)]
struct ForeignKeyDef {
    dependent: Vec<String>,
    principal_entity: String,
    principal: Vec<String>,
}

/// Builder for one entity type.
#[derive(Debug, Clone)]
pub struct EntityTypeBuilder {
    name: String,
    table: String,
    schema: Option<String>,
    properties: Vec<Property>,
    key: Vec<String>,
    foreign_keys: Vec<ForeignKeyDef>,
}

impl EntityTypeBuilder {
    /// Set the physical table name (defaults to the entity name).
    pub fn table(&mut self, table: &str) -> &mut Self {
        self.table = table.to_string();
        self
    }

    /// Set the schema qualifier.
    pub fn schema(&mut self, schema: &str) -> &mut Self {
        self.schema = Some(schema.to_string());
        self
    }

    /// Add a property.
    pub fn property(&mut self, property: Property) -> &mut Self {
        self.properties.push(property);
        self
    }

    /// Declare the primary key properties, ordered.
    pub fn key(&mut self, names: &[&str]) -> &mut Self {
        self.key = names.iter().map(|n| (*n).to_string()).collect();
        self
    }

    /// Declare a foreign key from dependent properties to a principal key.
    pub fn foreign_key(
        &mut self,
        dependent: &[&str],
        principal_entity: &str,
        principal: &[&str],
    ) -> &mut Self {
        self.foreign_keys.push(ForeignKeyDef {
            dependent: dependent.iter().map(|n| (*n).to_string()).collect(),
            principal_entity: principal_entity.to_string(),
            principal: principal.iter().map(|n| (*n).to_string()).collect(),
        });
        self
    }
}

/// Builder for an [`EntityModel`].
#[derive(Debug, Clone, Default)]
pub struct ModelBuilder {
    entities: Vec<EntityTypeBuilder>,
}

impl ModelBuilder {
    /// Add an entity type and return its builder.
    pub fn entity(&mut self, name: &str) -> &mut EntityTypeBuilder {
        self.entities.push(EntityTypeBuilder {
            name: name.to_string(),
            table: name.to_string(),
            schema: None,
            properties: Vec::new(),
            key: Vec::new(),
            foreign_keys: Vec::new(),
        });
        self.entities.last_mut().expect("just pushed")
    }

    /// Validate and resolve the model.
    #[allow(clippy::result_large_err)]
    pub fn build(self) -> Result<EntityModel> {
        let mut by_name: HashMap<String, EntityTypeId> = HashMap::new();
        for (i, e) in self.entities.iter().enumerate() {
            if by_name.insert(e.name.clone(), EntityTypeId(i)).is_some() {
                return Err(Error::Model(ModelError {
                    message: format!("duplicate entity type '{}'", e.name),
                }));
            }
        }

        let mut types = Vec::with_capacity(self.entities.len());
        for e in &self.entities {
            let mut seen = HashMap::new();
            for (i, p) in e.properties.iter().enumerate() {
                if seen.insert(p.name.clone(), i).is_some() {
                    return Err(Error::Model(ModelError {
                        message: format!("duplicate property '{}.{}'", e.name, p.name),
                    }));
                }
            }

            if e.key.is_empty() {
                return Err(Error::Model(ModelError {
                    message: format!("entity '{}' has no primary key", e.name),
                }));
            }
            let mut key = Vec::with_capacity(e.key.len());
            for name in &e.key {
                let Some(idx) = seen.get(name) else {
                    return Err(Error::Model(ModelError {
                        message: format!("unknown key property '{}.{}'", e.name, name),
                    }));
                };
                if e.properties[*idx].nullable {
                    return Err(Error::Model(ModelError {
                        message: format!("key property '{}.{}' must not be nullable", e.name, name),
                    }));
                }
                key.push(PropertyId(*idx));
            }

            let concurrency_tokens = e
                .properties
                .iter()
                .enumerate()
                .filter(|(_, p)| p.concurrency_token)
                .map(|(i, _)| PropertyId(i))
                .collect();

            types.push(EntityType {
                name: e.name.clone(),
                table: e.table.clone(),
                schema: e.schema.clone(),
                properties: e.properties.clone(),
                key,
                foreign_keys: Vec::new(),
                concurrency_tokens,
            });
        }

        // Second pass: resolve foreign keys now that all types exist.
        for (i, e) in self.entities.iter().enumerate() {
            let mut resolved = Vec::with_capacity(e.foreign_keys.len());
            for fk in &e.foreign_keys {
                let Some(principal_type) = by_name.get(&fk.principal_entity).copied() else {
                    return Err(Error::Model(ModelError {
                        message: format!(
                            "foreign key on '{}' references unknown entity '{}'",
                            e.name, fk.principal_entity
                        ),
                    }));
                };

                if fk.dependent.len() != fk.principal.len() {
                    return Err(Error::Model(ModelError {
                        message: format!(
                            "foreign key on '{}' has {} dependent but {} principal properties",
                            e.name,
                            fk.dependent.len(),
                            fk.principal.len()
                        ),
                    }));
                }

                let dependent = resolve_properties(&types[i], &fk.dependent, &e.name)?;
                let principal_key = resolve_properties(
                    &types[principal_type.0],
                    &fk.principal,
                    &fk.principal_entity,
                )?;

                // The graph builder resolves principals through the identity
                // map, so the referenced properties must be the principal's
                // primary key.
                if principal_key != types[principal_type.0].key {
                    return Err(Error::Model(ModelError {
                        message: format!(
                            "foreign key on '{}' must reference the primary key of '{}'",
                            e.name, fk.principal_entity
                        ),
                    }));
                }

                resolved.push(ForeignKey {
                    dependent,
                    principal_type,
                    principal_key,
                });
            }
            types[i].foreign_keys = resolved;
        }

        tracing::debug!(entities = types.len(), "entity model built");
        Ok(EntityModel { types, by_name })
    }
}

#[allow(clippy::result_large_err)]
fn resolve_properties(
    entity: &EntityType,
    names: &[String],
    entity_name: &str,
) -> Result<Vec<PropertyId>> {
    names
        .iter()
        .map(|name| {
            entity.property_id(name).ok_or_else(|| {
                Error::Model(ModelError {
                    message: format!("unknown property '{}.{}'", entity_name, name),
                })
            })
        })
        .collect()
}
