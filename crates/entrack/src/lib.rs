//! Entrack - entity change tracking and write ordering for Rust persistence
//! layers.
//!
//! Entrack is the persistence core that sits between "user mutated some
//! objects" and "send these statements to the database in this order, inside
//! this transaction":
//!
//! - **Identity map**: one tracked entry per entity identity per session
//! - **Change tracking**: snapshot-based detection of inserts, updates, and
//!   deletes, for live instances and shadow-state entries alike
//! - **Write ordering**: a dependency graph over foreign keys, topologically
//!   sorted, with nullable-FK cycle splitting
//! - **Transactional batches**: ordered commands grouped into round-trips,
//!   executed atomically, with store-generated values read back and
//!   optimistic concurrency failures surfaced per entry
//!
//! SQL generation and connections are external collaborators behind the
//! [`Database`]/[`BlockingDatabase`] traits; entrack defines no dialect.
//!
//! # Quick Start
//!
//! ```ignore
//! use entrack::prelude::*;
//!
//! let mut b = EntityModel::builder();
//! b.entity("Customer")
//!     .table("customers")
//!     .property(Property::new("id"))
//!     .property(Property::new("name"))
//!     .key(&["id"]);
//! b.entity("Order")
//!     .table("orders")
//!     .property(Property::new("id"))
//!     .property(Property::new("customer_id").nullable())
//!     .key(&["id"])
//!     .foreign_key(&["customer_id"], "Customer", &["id"]);
//! let model = Arc::new(b.build()?);
//!
//! let mut session = Session::new(Arc::clone(&model));
//! session.add_shadow("Customer", vec![1_i64.into(), "Ada".into()])?;
//! session.add_shadow("Order", vec![10_i64.into(), 1_i64.into()])?;
//!
//! // Inserts run customer-first regardless of add order.
//! let affected = session.save_changes(&cx, &db).await?;
//! ```

// Re-export all public types from sub-crates
pub use entrack_core::{
    // asupersync re-exports
    Budget,
    ConcurrencyError,
    Cx,
    DependencyCycleError,
    EntityModel,
    EntityObject,
    EntityRef,
    EntityType,
    EntityTypeId,
    EntryStamp,
    Error,
    ForeignKey,
    IdentityConflictError,
    InvalidKeyError,
    ModelBuilder,
    ModelError,
    Outcome,
    Property,
    PropertyId,
    RegionId,
    Result,
    RowNotFoundError,
    StoreError,
    TaskId,
    Value,
    entity_ref,
};

pub use entrack_session::{
    BlockingDatabase, ColumnModification, CommandBatch, CommandResult, DEFAULT_MAX_BATCH_SIZE,
    Database, EntityKey, EntityState, EntryId, ModificationCommand, PendingCounts, PropertyStore,
    Session, SessionConfig, StateManager, TrackedEntry,
};

/// Commonly used types, importable in one line.
pub mod prelude {
    pub use crate::{
        BlockingDatabase, CommandBatch, CommandResult, Cx, Database, EntityKey, EntityModel,
        EntityObject, EntityRef, EntityState, Error, Outcome, Property, Result, Session,
        SessionConfig, Value, entity_ref,
    };
}
