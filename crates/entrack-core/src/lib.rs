//! Core types for entrack.
//!
//! This crate provides the foundational abstractions for the change-tracking
//! and write-ordering engine:
//!
//! - `Value` dynamic property values with identity-map-grade equality
//! - `EntityModel` runtime entity/key/foreign-key metadata
//! - `EntityObject` trait for dynamic property access on host instances
//! - Error taxonomy shared across the engine
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Budget, Cx, Outcome, RegionId, TaskId};

pub mod entity;
pub mod error;
pub mod model;
pub mod value;

pub use entity::{EntityObject, EntityRef, entity_ref};
pub use error::{
    ConcurrencyError, DependencyCycleError, EntryStamp, Error, IdentityConflictError,
    InvalidKeyError, ModelError, Result, RowNotFoundError, StoreError,
};
pub use model::{
    EntityModel, EntityType, EntityTypeBuilder, EntityTypeId, ForeignKey, ModelBuilder, Property,
    PropertyId,
};
pub use value::Value;
