//! Session and unit of work for entrack.
//!
//! `entrack-session` is the **change-tracking layer**. It coordinates entity
//! identity, per-entry state, and dependency-ordered transactional writes.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: ensures a single tracked entry per entity identity.
//! - **Change tracking**: snapshot-based detection of inserts, updates, and
//!   deletes before save.
//! - **Write ordering**: a dependency graph over the save set, topologically
//!   sorted with foreign-key cycle splitting.
//! - **Transactional safety**: batches execute inside one transaction; no
//!   entry is accepted unless the whole save commits.
//!
//! # Design Philosophy
//!
//! - **Explicit over implicit**: collaborators (model, store) are passed in,
//!   never resolved from a global container.
//! - **Ownership clarity**: the state manager owns all entries arena-style;
//!   entries reference each other through key lookups, never pointers.
//! - **Cancel-correct**: the async save path uses `Cx` + `Outcome`, checking
//!   cancellation between batches, never mid-batch.
//!
//! # Example
//!
//! ```ignore
//! let mut session = Session::new(Arc::clone(&model));
//!
//! // New entities (INSERTed on save)
//! let customer = session.add(customer_ref)?;
//!
//! // Loaded entities (tracked as Unchanged)
//! let order = session.attach(order_ref)?;
//!
//! // Mutations route through the session to keep identity coherent
//! session.set_property(order, "status", Value::Text("shipped".into()))?;
//!
//! // One transaction, dependency-ordered
//! let affected = session.save_changes(&cx, &db).await?;
//! ```

pub mod command;
pub mod entry;
pub mod executor;
mod graph;
pub mod state;

pub use command::{
    ColumnModification, CommandBatch, DEFAULT_MAX_BATCH_SIZE, ModificationCommand,
};
pub use entry::{EntityState, EntryId, PropertyStore, TrackedEntry};
pub use executor::{BlockingDatabase, CommandResult, Database};
pub use state::StateManager;

use crate::executor::ReadBack;
use entrack_core::{Cx, EntityModel, EntityRef, EntityTypeId, Error, Outcome, Result, Value};
use std::sync::Arc;

// ============================================================================
// Entity Key
// ============================================================================

/// Value-type identity for one entity: its type plus ordered key values.
///
/// Two keys are equal iff they have the same entity type and the same ordered
/// value sequence. Unlike a hash-based key, collisions are impossible.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    entity_type: EntityTypeId,
    values: Box<[Value]>,
}

impl EntityKey {
    /// Create a key from ordered key-property values.
    #[must_use]
    pub fn new(entity_type: EntityTypeId, values: Vec<Value>) -> Self {
        Self {
            entity_type,
            values: values.into_boxed_slice(),
        }
    }

    /// The entity type this key identifies.
    #[must_use]
    pub fn entity_type(&self) -> EntityTypeId {
        self.entity_type
    }

    /// The ordered key values.
    #[must_use]
    pub fn values(&self) -> &[Value] {
        &self.values
    }
}

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Whether the session opens/commits its own transaction around a save
    /// when the store reports none is open.
    pub auto_begin: bool,
    /// Whether `save_changes` scans for out-of-band instance mutations first.
    pub detect_changes_on_save: bool,
    /// Upper bound on commands per round-trip batch.
    pub max_batch_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auto_begin: true,
            detect_changes_on_save: true,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
        }
    }
}

/// Count of pending operations by kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct PendingCounts {
    /// Entries pending INSERT.
    pub added: usize,
    /// Entries pending UPDATE.
    pub modified: usize,
    /// Entries pending DELETE.
    pub deleted: usize,
}

impl PendingCounts {
    /// Total number of pending operations.
    #[must_use]
    pub fn total(&self) -> usize {
        self.added + self.modified + self.deleted
    }

    /// Check if there are no pending operations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

// ============================================================================
// Session
// ============================================================================

struct SavePlan {
    batches: Vec<CommandBatch>,
    affected: Vec<EntryId>,
}

/// The unit-of-work: one logical session over one entity model.
///
/// A session is single-threaded by design; callers needing concurrency use
/// independent sessions, each with its own identity map.
pub struct Session {
    model: Arc<EntityModel>,
    state: StateManager,
    config: SessionConfig,
}

impl Session {
    /// Create a session over an immutable model.
    #[must_use]
    pub fn new(model: Arc<EntityModel>) -> Self {
        Self::with_config(model, SessionConfig::default())
    }

    /// Create a session with custom configuration.
    #[must_use]
    pub fn with_config(model: Arc<EntityModel>, config: SessionConfig) -> Self {
        Self {
            state: StateManager::new(Arc::clone(&model)),
            model,
            config,
        }
    }

    /// The entity model this session tracks against.
    #[must_use]
    pub fn model(&self) -> &EntityModel {
        &self.model
    }

    /// The session configuration.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// The underlying state manager, for inspection.
    #[must_use]
    pub fn state_manager(&self) -> &StateManager {
        &self.state
    }

    fn entity_type_of(&self, instance: &EntityRef) -> Result<EntityTypeId> {
        let name = instance.read().expect("lock poisoned").entity_name().to_string();
        self.model
            .entity_id(&name)
            .ok_or_else(|| Error::Custom(format!("entity type '{name}' is not in the model")))
    }

    // ========================================================================
    // Tracking
    // ========================================================================

    /// Track a new instance for insertion (`Detached` -> `Added`).
    ///
    /// A `Deleted` instance is resurrected to `Modified` instead. Adding an
    /// instance already tracked as `Unchanged`/`Modified` is an error.
    #[allow(clippy::result_large_err)]
    pub fn add(&mut self, instance: EntityRef) -> Result<EntryId> {
        let ty = self.entity_type_of(&instance)?;
        let id = self.state.get_or_create_entry(ty, instance)?;
        match self.state.entry(id).state() {
            EntityState::Detached => {
                self.state.entry_mut(id).set_state(EntityState::Added);
                // A store-generated key may be unset; registration then waits
                // for read-back at accept time.
                self.state.register_key(id)?;
                Ok(id)
            }
            EntityState::Added => Ok(id),
            EntityState::Deleted => {
                self.state.entry_mut(id).set_state(EntityState::Modified);
                Ok(id)
            }
            EntityState::Unchanged | EntityState::Modified => Err(Error::Custom(
                "instance is already tracked; use set_property to modify it".to_string(),
            )),
        }
    }

    /// Track a new shadow-state entity for insertion.
    #[allow(clippy::result_large_err)]
    pub fn add_shadow(&mut self, entity: &str, values: Vec<Value>) -> Result<EntryId> {
        let ty = self
            .model
            .entity_id(entity)
            .ok_or_else(|| Error::Custom(format!("entity type '{entity}' is not in the model")))?;
        let id = self.state.create_shadow_entry(ty, values)?;
        self.state.entry_mut(id).set_state(EntityState::Added);
        self.state.register_key(id)?;
        Ok(id)
    }

    /// Track an existing instance as loaded (`Detached` -> `Unchanged`).
    #[allow(clippy::result_large_err)]
    pub fn attach(&mut self, instance: EntityRef) -> Result<EntryId> {
        let ty = self.entity_type_of(&instance)?;
        let id = self.state.get_or_create_entry(ty, instance)?;
        if self.state.entry(id).state() == EntityState::Detached {
            self.state.start_tracking(id)?;
        }
        Ok(id)
    }

    /// Track an existing shadow-state entity as loaded.
    #[allow(clippy::result_large_err)]
    pub fn attach_shadow(&mut self, entity: &str, values: Vec<Value>) -> Result<EntryId> {
        let ty = self
            .model
            .entity_id(entity)
            .ok_or_else(|| Error::Custom(format!("entity type '{entity}' is not in the model")))?;
        let id = self.state.create_shadow_entry(ty, values)?;
        self.state.start_tracking(id)?;
        Ok(id)
    }

    /// Mark an entry for deletion.
    ///
    /// `Added` entries are simply detached (nothing to delete in the store).
    #[allow(clippy::result_large_err)]
    pub fn remove(&mut self, id: EntryId) -> Result<()> {
        match self.state.try_entry(id).map(TrackedEntry::state) {
            Some(EntityState::Added) => {
                self.state.stop_tracking(id);
                Ok(())
            }
            Some(EntityState::Unchanged | EntityState::Modified) => {
                self.state.entry_mut(id).set_state(EntityState::Deleted);
                Ok(())
            }
            Some(EntityState::Deleted) => Ok(()),
            Some(EntityState::Detached) | None => Err(Error::Custom(
                "cannot remove an entry that is not tracked".to_string(),
            )),
        }
    }

    /// Mark a tracked instance for deletion.
    #[allow(clippy::result_large_err)]
    pub fn remove_instance(&mut self, instance: &EntityRef) -> Result<EntryId> {
        let id = self
            .state
            .find_instance_entry(instance)
            .ok_or_else(|| Error::Custom("instance is not tracked by this session".to_string()))?;
        self.remove(id)?;
        Ok(id)
    }

    /// Detach an entry from the session entirely.
    pub fn detach(&mut self, id: EntryId) {
        self.state.stop_tracking(id);
    }

    // ========================================================================
    // Property Access
    // ========================================================================

    /// Read a property of a tracked entry.
    #[allow(clippy::result_large_err)]
    pub fn property(&self, id: EntryId, property: &str) -> Result<Value> {
        let entry = self
            .state
            .try_entry(id)
            .ok_or_else(|| Error::Custom("unknown entry".to_string()))?;
        let et = self.model.entity(entry.entity_type());
        let pid = et
            .property_id(property)
            .ok_or_else(|| Error::Custom(format!("unknown property '{property}'")))?;
        Ok(entry.property(et, pid))
    }

    /// Write a property of a tracked entry.
    ///
    /// Promotes `Unchanged` entries to `Modified` when the value actually
    /// differs, and routes key-property changes through the identity map so
    /// the entry is reindexed (or the write rejected on a key collision).
    #[allow(clippy::result_large_err)]
    pub fn set_property(&mut self, id: EntryId, property: &str, value: Value) -> Result<()> {
        let entry = self
            .state
            .try_entry(id)
            .ok_or_else(|| Error::Custom("unknown entry".to_string()))?;
        let ty = entry.entity_type();
        let et = self.model.entity(ty);
        let pid = et
            .property_id(property)
            .ok_or_else(|| Error::Custom(format!("unknown property '{property}'")))?;

        let old_key = entry.map_key().cloned();
        let previous = entry.property(et, pid);
        if previous == value {
            return Ok(());
        }

        self.state.entry_mut(id).set_property(et, pid, value);

        if et.is_key(pid) {
            if let Some(key) = old_key {
                if let Err(e) = self.state.update_identity_map(id, &key) {
                    self.state.entry_mut(id).set_property(et, pid, previous);
                    return Err(e);
                }
            }
        }

        if self.state.entry(id).state() == EntityState::Unchanged
            && !self.state.entry(id).changed_properties(et).is_empty()
        {
            self.state.entry_mut(id).set_state(EntityState::Modified);
        }
        Ok(())
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// The state of an entry, if the handle is live.
    #[must_use]
    pub fn state_of(&self, id: EntryId) -> Option<EntityState> {
        self.state.try_entry(id).map(TrackedEntry::state)
    }

    /// Find a tracked entry by identity key.
    #[must_use]
    pub fn find_entry(&self, key: &EntityKey) -> Option<EntryId> {
        self.state.find_entry(key)
    }

    /// Whether an identity is currently tracked.
    #[must_use]
    pub fn is_tracked(&self, key: &EntityKey) -> bool {
        self.state.find_entry(key).is_some()
    }

    /// Compute the identity key of an entry from its current values.
    #[allow(clippy::result_large_err)]
    pub fn entity_key(&self, id: EntryId) -> Result<EntityKey> {
        let entry = self
            .state
            .try_entry(id)
            .ok_or_else(|| Error::Custom("unknown entry".to_string()))?;
        let et = self.model.entity(entry.entity_type());
        entry.compute_key(et)
    }

    /// Count pending operations by kind.
    #[must_use]
    pub fn pending_count(&self) -> PendingCounts {
        PendingCounts {
            added: self.state.count_in(EntityState::Added),
            modified: self.state.count_in(EntityState::Modified),
            deleted: self.state.count_in(EntityState::Deleted),
        }
    }

    /// Whether any entry has a pending row operation.
    #[must_use]
    pub fn has_changes(&self) -> bool {
        !self.pending_count().is_empty()
    }

    /// Scan for out-of-band instance mutations; returns entries promoted to
    /// `Modified`.
    pub fn detect_changes(&mut self) -> usize {
        self.state.detect_changes()
    }

    /// Discard all pending changes in memory.
    ///
    /// `Added` entries are detached; `Modified`/`Deleted` entries revert to
    /// their snapshots and become `Unchanged`. The store is not touched.
    #[allow(clippy::result_large_err)]
    pub fn rollback_state(&mut self) -> Result<()> {
        let ids: Vec<EntryId> = self.state.iter_ids().collect();
        for id in ids {
            match self.state.entry(id).state() {
                EntityState::Added => self.state.stop_tracking(id),
                EntityState::Modified | EntityState::Deleted => {
                    let ty = self.state.entry(id).entity_type();
                    let et = self.model.entity(ty);
                    let old_key = self.state.entry(id).map_key().cloned();
                    self.state.entry_mut(id).revert(et);
                    self.state.entry_mut(id).set_state(EntityState::Unchanged);
                    if let Some(key) = old_key {
                        self.state.update_identity_map(id, &key)?;
                    }
                }
                EntityState::Unchanged | EntityState::Detached => {}
            }
        }
        Ok(())
    }

    // ========================================================================
    // Save Pipeline
    // ========================================================================

    /// Plan the save: detect changes, order the dirty set, build commands.
    ///
    /// Pure CPU work; model and graph errors surface here, before any store
    /// interaction.
    #[allow(clippy::result_large_err)]
    fn plan_save(&mut self) -> Result<Option<SavePlan>> {
        if self.config.detect_changes_on_save {
            self.state.detect_changes();
        }

        let dirty = self.state.entries_in(&[
            EntityState::Added,
            EntityState::Modified,
            EntityState::Deleted,
        ]);
        if dirty.is_empty() {
            return Ok(None);
        }

        let order = graph::order_entries(&self.state, &dirty)?;
        let commands = command::build_commands(&self.state, &order)?;

        let mut affected: Vec<EntryId> = commands.iter().flat_map(|c| c.entries.clone()).collect();
        affected.sort_unstable();
        affected.dedup();

        let batches = command::batch_commands(commands, self.config.max_batch_size);
        tracing::debug!(
            entries = affected.len(),
            batches = batches.len(),
            "save plan ready"
        );
        Ok(Some(SavePlan { batches, affected }))
    }

    /// Save all pending changes through the asynchronous store collaborator.
    ///
    /// Returns the number of entries written. Executes inside one
    /// transaction: either every ordered command succeeds and entries are
    /// accepted, or the transaction rolls back and no entry state changes.
    /// Cancellation is checked before each batch, never mid-batch.
    #[tracing::instrument(level = "info", skip(self, cx, db))]
    pub async fn save_changes<D: Database>(&mut self, cx: &Cx, db: &D) -> Outcome<usize, Error> {
        let plan = match self.plan_save() {
            Ok(Some(plan)) => plan,
            Ok(None) => return Outcome::Ok(0),
            Err(e) => return Outcome::Err(e),
        };

        let owns_tx = self.config.auto_begin && !db.in_transaction();
        if owns_tx {
            match db.begin(cx).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        let mut read_backs: Vec<ReadBack> = Vec::new();
        for batch in &plan.batches {
            if let Some(reason) = cx.cancel_reason() {
                if owns_tx {
                    let _ = db.rollback(cx).await;
                }
                return Outcome::Cancelled(reason);
            }

            match db.execute_batch(cx, batch).await {
                Outcome::Ok(results) => {
                    if results.len() != batch.commands.len() {
                        if owns_tx {
                            let _ = db.rollback(cx).await;
                        }
                        return Outcome::Err(Error::Store(entrack_core::StoreError::new(
                            format!(
                                "store returned {} results for a batch of {} commands",
                                results.len(),
                                batch.commands.len()
                            ),
                        )));
                    }
                    for (cmd, result) in batch.commands.iter().zip(&results) {
                        if let Err(e) = executor::check_command_result(&self.state, cmd, result) {
                            if owns_tx {
                                let _ = db.rollback(cx).await;
                            }
                            return Outcome::Err(e);
                        }
                        read_backs.extend(executor::collect_read_backs(cmd, result));
                    }
                }
                Outcome::Err(e) => {
                    if owns_tx {
                        let _ = db.rollback(cx).await;
                    }
                    return Outcome::Err(e);
                }
                Outcome::Cancelled(r) => {
                    if owns_tx {
                        let _ = db.rollback(cx).await;
                    }
                    return Outcome::Cancelled(r);
                }
                Outcome::Panicked(p) => {
                    if owns_tx {
                        let _ = db.rollback(cx).await;
                    }
                    return Outcome::Panicked(p);
                }
            }
        }

        if owns_tx {
            match db.commit(cx).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => return Outcome::Err(e),
                Outcome::Cancelled(r) => return Outcome::Cancelled(r),
                Outcome::Panicked(p) => return Outcome::Panicked(p),
            }
        }

        match self.accept_changes(&plan.affected, read_backs) {
            Ok(()) => Outcome::Ok(plan.affected.len()),
            Err(e) => Outcome::Err(e),
        }
    }

    /// Save all pending changes through the blocking store collaborator.
    ///
    /// Same semantics as [`Session::save_changes`], for synchronous hosts.
    #[allow(clippy::result_large_err)]
    pub fn save_changes_blocking<D: BlockingDatabase>(&mut self, db: &mut D) -> Result<usize> {
        let Some(plan) = self.plan_save()? else {
            return Ok(0);
        };

        let owns_tx = self.config.auto_begin && !db.in_transaction();
        if owns_tx {
            db.begin()?;
        }

        let mut read_backs: Vec<ReadBack> = Vec::new();
        for batch in &plan.batches {
            let results = match db.execute_batch(batch) {
                Ok(results) => results,
                Err(e) => {
                    if owns_tx {
                        let _ = db.rollback();
                    }
                    return Err(e);
                }
            };
            if results.len() != batch.commands.len() {
                if owns_tx {
                    let _ = db.rollback();
                }
                return Err(Error::Store(entrack_core::StoreError::new(format!(
                    "store returned {} results for a batch of {} commands",
                    results.len(),
                    batch.commands.len()
                ))));
            }
            for (cmd, result) in batch.commands.iter().zip(&results) {
                if let Err(e) = executor::check_command_result(&self.state, cmd, result) {
                    if owns_tx {
                        let _ = db.rollback();
                    }
                    return Err(e);
                }
                read_backs.extend(executor::collect_read_backs(cmd, result));
            }
        }

        if owns_tx {
            db.commit()?;
        }

        self.accept_changes(&plan.affected, read_backs)?;
        Ok(plan.affected.len())
    }

    /// Apply staged read-backs and accept all written entries.
    ///
    /// Runs only after the transaction committed: `Added`/`Modified` entries
    /// re-baseline to `Unchanged` (reindexed under any store-generated key),
    /// `Deleted` entries leave the session.
    #[allow(clippy::result_large_err)]
    fn accept_changes(&mut self, affected: &[EntryId], read_backs: Vec<ReadBack>) -> Result<()> {
        for rb in read_backs {
            let ty = self.state.entry(rb.entry).entity_type();
            let et = self.model.entity(ty);
            self.state
                .entry_mut(rb.entry)
                .set_property_accepted(et, rb.property, rb.value);
        }

        // Deletes first, so their identities are free for re-use by inserts
        // accepted in the same save.
        for id in affected {
            if self.state.entry(*id).state() == EntityState::Deleted {
                self.state.stop_tracking(*id);
            }
        }

        for id in affected {
            let Some((state, old_key, ty)) = self
                .state
                .try_entry(*id)
                .map(|e| (e.state(), e.map_key().cloned(), e.entity_type()))
            else {
                continue;
            };
            if !matches!(state, EntityState::Added | EntityState::Modified) {
                continue;
            }
            match old_key {
                Some(key) => self.state.update_identity_map(*id, &key)?,
                None => {
                    self.state.register_key(*id)?;
                }
            }
            let et = self.model.entity(ty);
            self.state.entry_mut(*id).snapshot(et);
            self.state.entry_mut(*id).set_state(EntityState::Unchanged);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("config", &self.config)
            .finish()
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use entrack_core::{EntityModel, EntityObject, Property, StoreError, entity_ref};
    use std::future::Future;
    use std::sync::Mutex;

    fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            Outcome::Err(e) => panic!("unexpected error: {e}"),
            Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
            Outcome::Panicked(p) => panic!("panicked: {p:?}"),
        }
    }

    fn shop_model() -> Arc<EntityModel> {
        let mut b = EntityModel::builder();
        b.entity("Customer")
            .table("customers")
            .property(Property::new("id"))
            .property(Property::new("name"))
            .key(&["id"]);
        b.entity("Order")
            .table("orders")
            .property(Property::new("id"))
            .property(Property::new("customer_id").nullable())
            .key(&["id"])
            .foreign_key(&["customer_id"], "Customer", &["id"]);
        b.entity("Invoice")
            .table("invoices")
            .property(Property::new("id").store_generated())
            .property(Property::new("total"))
            .key(&["id"]);
        b.entity("Doc")
            .table("docs")
            .property(Property::new("id"))
            .property(Property::new("body"))
            .property(Property::new("version").concurrency_token())
            .key(&["id"]);
        Arc::new(b.build().expect("valid model"))
    }

    // ------------------------------------------------------------------
    // Mock store
    // ------------------------------------------------------------------

    #[derive(Default)]
    struct MockState {
        /// (table, state) per command, per batch, in execution order.
        batches: Vec<Vec<(String, EntityState)>>,
        rows_affected: u64,
        fail_on_batch: Option<usize>,
        ambient_tx: bool,
        begun: usize,
        committed: usize,
        rolled_back: usize,
        next_generated: i64,
    }

    impl MockState {
        fn execute(&mut self, batch: &CommandBatch) -> Outcome<Vec<CommandResult>, Error> {
            let index = self.batches.len();
            self.batches.push(
                batch
                    .commands
                    .iter()
                    .map(|c| (c.table.clone(), c.state))
                    .collect(),
            );
            if self.fail_on_batch == Some(index) {
                return Outcome::Err(Error::Store(StoreError::new("injected failure")));
            }
            let results = batch
                .commands
                .iter()
                .map(|cmd| {
                    let reads = cmd
                        .read_columns()
                        .map(|_| {
                            self.next_generated += 1;
                            Value::Int(self.next_generated)
                        })
                        .collect();
                    CommandResult::with_reads(self.rows_affected, reads)
                })
                .collect();
            Outcome::Ok(results)
        }

        fn executed_tables(&self) -> Vec<String> {
            self.batches
                .iter()
                .flatten()
                .map(|(table, _)| table.clone())
                .collect()
        }
    }

    struct MockDb {
        state: Arc<Mutex<MockState>>,
    }

    impl MockDb {
        fn new() -> (Self, Arc<Mutex<MockState>>) {
            let state = Arc::new(Mutex::new(MockState {
                rows_affected: 1,
                next_generated: 100,
                ..MockState::default()
            }));
            (
                Self {
                    state: Arc::clone(&state),
                },
                state,
            )
        }
    }

    impl Database for MockDb {
        fn in_transaction(&self) -> bool {
            self.state.lock().expect("lock poisoned").ambient_tx
        }

        fn begin(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
            self.state.lock().expect("lock poisoned").begun += 1;
            async { Outcome::Ok(()) }
        }

        fn execute_batch(
            &self,
            _cx: &Cx,
            batch: &CommandBatch,
        ) -> impl Future<Output = Outcome<Vec<CommandResult>, Error>> + Send {
            let out = self.state.lock().expect("lock poisoned").execute(batch);
            async move { out }
        }

        fn commit(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
            self.state.lock().expect("lock poisoned").committed += 1;
            async { Outcome::Ok(()) }
        }

        fn rollback(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
            self.state.lock().expect("lock poisoned").rolled_back += 1;
            async { Outcome::Ok(()) }
        }
    }

    struct BlockingMockDb {
        state: MockState,
    }

    impl BlockingDatabase for BlockingMockDb {
        fn in_transaction(&self) -> bool {
            self.state.ambient_tx
        }

        fn begin(&mut self) -> Result<()> {
            self.state.begun += 1;
            Ok(())
        }

        fn execute_batch(&mut self, batch: &CommandBatch) -> Result<Vec<CommandResult>> {
            match self.state.execute(batch) {
                Outcome::Ok(results) => Ok(results),
                Outcome::Err(e) => Err(e),
                _ => Err(Error::Custom("unexpected outcome".to_string())),
            }
        }

        fn commit(&mut self) -> Result<()> {
            self.state.committed += 1;
            Ok(())
        }

        fn rollback(&mut self) -> Result<()> {
            self.state.rolled_back += 1;
            Ok(())
        }
    }

    // ------------------------------------------------------------------
    // State machine
    // ------------------------------------------------------------------

    struct Customer {
        id: Option<i64>,
        name: String,
    }

    impl EntityObject for Customer {
        fn entity_name(&self) -> &str {
            "Customer"
        }

        fn get(&self, property: &str) -> Value {
            match property {
                "id" => self.id.into(),
                "name" => self.name.as_str().into(),
                _ => Value::Null,
            }
        }

        fn set(&mut self, property: &str, value: Value) {
            match property {
                "id" => self.id = value.as_i64(),
                "name" => {
                    if let Value::Text(s) = value {
                        self.name = s;
                    }
                }
                _ => {}
            }
        }
    }

    #[test]
    fn test_config_defaults() {
        let config = SessionConfig::default();
        assert!(config.auto_begin);
        assert!(config.detect_changes_on_save);
        assert_eq!(config.max_batch_size, DEFAULT_MAX_BATCH_SIZE);
    }

    #[test]
    fn test_add_marks_added() {
        let mut session = Session::new(shop_model());
        let id = session
            .add_shadow("Customer", vec![Value::Int(1), Value::Text("Ada".into())])
            .unwrap();
        assert_eq!(session.state_of(id), Some(EntityState::Added));
        assert_eq!(session.pending_count().added, 1);
    }

    #[test]
    fn test_attach_marks_unchanged() {
        let mut session = Session::new(shop_model());
        let id = session
            .attach_shadow("Customer", vec![Value::Int(1), Value::Text("Ada".into())])
            .unwrap();
        assert_eq!(session.state_of(id), Some(EntityState::Unchanged));
        assert!(!session.has_changes());
    }

    #[test]
    fn test_remove_tracked_marks_deleted() {
        let mut session = Session::new(shop_model());
        let id = session
            .attach_shadow("Customer", vec![Value::Int(1), Value::Text("Ada".into())])
            .unwrap();
        session.remove(id).unwrap();
        assert_eq!(session.state_of(id), Some(EntityState::Deleted));
    }

    #[test]
    fn test_remove_added_detaches() {
        let mut session = Session::new(shop_model());
        let id = session
            .add_shadow("Customer", vec![Value::Int(1), Value::Text("Ada".into())])
            .unwrap();
        session.remove(id).unwrap();
        assert_eq!(session.state_of(id), None);
        assert!(!session.has_changes());
    }

    #[test]
    fn test_add_resurrects_deleted_instance() {
        let mut session = Session::new(shop_model());
        let instance = entity_ref(Customer {
            id: Some(1),
            name: "Ada".to_string(),
        });
        let id = session.attach(Arc::clone(&instance)).unwrap();
        session.remove(id).unwrap();
        assert_eq!(session.state_of(id), Some(EntityState::Deleted));

        let same = session.add(instance).unwrap();
        assert_eq!(same, id);
        assert_eq!(session.state_of(id), Some(EntityState::Modified));
    }

    #[test]
    fn test_add_tracked_instance_is_error() {
        let mut session = Session::new(shop_model());
        let instance = entity_ref(Customer {
            id: Some(1),
            name: "Ada".to_string(),
        });
        session.attach(Arc::clone(&instance)).unwrap();
        assert!(matches!(session.add(instance), Err(Error::Custom(_))));
    }

    #[test]
    fn test_set_property_promotes_to_modified() {
        let mut session = Session::new(shop_model());
        let id = session
            .attach_shadow("Customer", vec![Value::Int(1), Value::Text("Ada".into())])
            .unwrap();

        // Writing the same value changes nothing.
        session
            .set_property(id, "name", Value::Text("Ada".into()))
            .unwrap();
        assert_eq!(session.state_of(id), Some(EntityState::Unchanged));

        session
            .set_property(id, "name", Value::Text("Grace".into()))
            .unwrap();
        assert_eq!(session.state_of(id), Some(EntityState::Modified));
    }

    #[test]
    fn test_set_key_property_reindexes() {
        let model = shop_model();
        let mut session = Session::new(Arc::clone(&model));
        let customer_t = model.entity_id("Customer").unwrap();
        let id = session
            .attach_shadow("Customer", vec![Value::Int(1), Value::Text("Ada".into())])
            .unwrap();

        session.set_property(id, "id", Value::Int(2)).unwrap();

        assert_eq!(
            session.find_entry(&EntityKey::new(customer_t, vec![Value::Int(2)])),
            Some(id)
        );
        assert!(!session.is_tracked(&EntityKey::new(customer_t, vec![Value::Int(1)])));
    }

    #[test]
    fn test_set_key_property_collision_rejected_and_reverted() {
        let model = shop_model();
        let mut session = Session::new(Arc::clone(&model));
        session
            .attach_shadow("Customer", vec![Value::Int(1), Value::Text("Ada".into())])
            .unwrap();
        let second = session
            .attach_shadow("Customer", vec![Value::Int(2), Value::Text("Grace".into())])
            .unwrap();

        let result = session.set_property(second, "id", Value::Int(1));
        assert!(matches!(result, Err(Error::IdentityConflict(_))));
        // The failed write is rolled back.
        assert_eq!(session.property(second, "id").unwrap(), Value::Int(2));
        assert_eq!(session.state_of(second), Some(EntityState::Unchanged));
    }

    #[test]
    fn test_rollback_state_discards_pending() {
        let mut session = Session::new(shop_model());
        let added = session
            .add_shadow("Customer", vec![Value::Int(1), Value::Text("Ada".into())])
            .unwrap();
        let modified = session
            .attach_shadow("Customer", vec![Value::Int(2), Value::Text("Grace".into())])
            .unwrap();
        session
            .set_property(modified, "name", Value::Text("Hopper".into()))
            .unwrap();
        let deleted = session
            .attach_shadow("Customer", vec![Value::Int(3), Value::Text("Joan".into())])
            .unwrap();
        session.remove(deleted).unwrap();

        session.rollback_state().unwrap();

        assert_eq!(session.state_of(added), None);
        assert_eq!(session.state_of(modified), Some(EntityState::Unchanged));
        assert_eq!(
            session.property(modified, "name").unwrap(),
            Value::Text("Grace".into())
        );
        assert_eq!(session.state_of(deleted), Some(EntityState::Unchanged));
        assert!(!session.has_changes());
    }

    // ------------------------------------------------------------------
    // Save pipeline
    // ------------------------------------------------------------------

    #[test]
    fn test_save_nothing_is_a_no_op() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        let mut session = Session::new(shop_model());
        session
            .attach_shadow("Customer", vec![Value::Int(1), Value::Text("Ada".into())])
            .unwrap();

        let (db, state) = MockDb::new();
        rt.block_on(async {
            let affected = unwrap_outcome(session.save_changes(&cx, &db).await);
            assert_eq!(affected, 0);
        });

        let s = state.lock().unwrap();
        assert_eq!(s.begun, 0);
        assert!(s.batches.is_empty());
    }

    #[test]
    fn test_save_inserts_principal_before_dependent() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        let mut session = Session::new(shop_model());
        // Insert the dependent first; the engine must reorder.
        let order = session
            .add_shadow("Order", vec![Value::Int(10), Value::Int(1)])
            .unwrap();
        let customer = session
            .add_shadow("Customer", vec![Value::Int(1), Value::Text("Ada".into())])
            .unwrap();

        let (db, state) = MockDb::new();
        rt.block_on(async {
            let affected = unwrap_outcome(session.save_changes(&cx, &db).await);
            assert_eq!(affected, 2);
        });

        let s = state.lock().unwrap();
        assert_eq!(s.executed_tables(), vec!["customers", "orders"]);
        assert_eq!(s.begun, 1);
        assert_eq!(s.committed, 1);
        assert_eq!(s.rolled_back, 0);
        drop(s);

        assert_eq!(session.state_of(customer), Some(EntityState::Unchanged));
        assert_eq!(session.state_of(order), Some(EntityState::Unchanged));
        assert!(!session.has_changes());
    }

    #[test]
    fn test_save_deletes_dependent_before_principal() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        let mut session = Session::new(shop_model());
        let customer = session
            .attach_shadow("Customer", vec![Value::Int(1), Value::Text("Ada".into())])
            .unwrap();
        let order = session
            .attach_shadow("Order", vec![Value::Int(10), Value::Int(1)])
            .unwrap();
        session.remove(customer).unwrap();
        session.remove(order).unwrap();

        let (db, state) = MockDb::new();
        rt.block_on(async {
            let affected = unwrap_outcome(session.save_changes(&cx, &db).await);
            assert_eq!(affected, 2);
        });

        let s = state.lock().unwrap();
        assert_eq!(s.executed_tables(), vec!["orders", "customers"]);
        drop(s);

        // Deleted entries left the session.
        assert_eq!(session.state_of(customer), None);
        assert_eq!(session.state_of(order), None);
    }

    #[test]
    fn test_save_reads_back_generated_key() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        let model = shop_model();
        let mut session = Session::new(Arc::clone(&model));
        let invoice = session
            .add_shadow("Invoice", vec![Value::Null, Value::Int(250)])
            .unwrap();

        let (db, _) = MockDb::new();
        rt.block_on(async {
            let affected = unwrap_outcome(session.save_changes(&cx, &db).await);
            assert_eq!(affected, 1);
        });

        // Mock generates ids from 101.
        assert_eq!(session.property(invoice, "id").unwrap(), Value::Int(101));
        assert_eq!(session.state_of(invoice), Some(EntityState::Unchanged));

        let invoice_t = model.entity_id("Invoice").unwrap();
        let key = EntityKey::new(invoice_t, vec![Value::Int(101)]);
        assert_eq!(session.find_entry(&key), Some(invoice));
    }

    #[test]
    fn test_save_concurrency_failure_reports_entry() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        let mut session = Session::new(shop_model());
        let doc = session
            .attach_shadow(
                "Doc",
                vec![Value::Int(5), Value::Text("a".into()), Value::Int(1)],
            )
            .unwrap();
        session
            .set_property(doc, "body", Value::Text("b".into()))
            .unwrap();

        let (db, state) = MockDb::new();
        state.lock().unwrap().rows_affected = 0;

        rt.block_on(async {
            match session.save_changes(&cx, &db).await {
                Outcome::Err(Error::Concurrency(e)) => {
                    assert_eq!(e.entries.len(), 1);
                    assert_eq!(e.entries[0].entity, "Doc");
                    assert_eq!(e.entries[0].key, vec![Value::Int(5)]);
                }
                other => panic!("expected Concurrency, got {other:?}"),
            }
        });

        // Transaction rolled back, entry still pending.
        let s = state.lock().unwrap();
        assert_eq!(s.rolled_back, 1);
        assert_eq!(s.committed, 0);
        drop(s);
        assert_eq!(session.state_of(doc), Some(EntityState::Modified));
    }

    #[test]
    fn test_save_transport_failure_leaves_entries_untouched() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        let mut session = Session::new(shop_model());
        let customer = session
            .add_shadow("Customer", vec![Value::Int(1), Value::Text("Ada".into())])
            .unwrap();

        let (db, state) = MockDb::new();
        state.lock().unwrap().fail_on_batch = Some(0);

        rt.block_on(async {
            match session.save_changes(&cx, &db).await {
                Outcome::Err(Error::Store(_)) => {}
                other => panic!("expected Store error, got {other:?}"),
            }
        });

        assert_eq!(state.lock().unwrap().rolled_back, 1);
        assert_eq!(session.state_of(customer), Some(EntityState::Added));
        assert!(session.has_changes());
    }

    #[test]
    fn test_save_respects_ambient_transaction() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();

        let mut session = Session::new(shop_model());
        session
            .add_shadow("Customer", vec![Value::Int(1), Value::Text("Ada".into())])
            .unwrap();

        let (db, state) = MockDb::new();
        state.lock().unwrap().ambient_tx = true;

        rt.block_on(async {
            let affected = unwrap_outcome(session.save_changes(&cx, &db).await);
            assert_eq!(affected, 1);
        });

        // The host owns the transaction; the engine neither begins nor commits.
        let s = state.lock().unwrap();
        assert_eq!(s.begun, 0);
        assert_eq!(s.committed, 0);
        assert_eq!(s.rolled_back, 0);
    }

    #[test]
    fn test_save_blocking_mirrors_async() {
        let mut session = Session::new(shop_model());
        let order = session
            .add_shadow("Order", vec![Value::Int(10), Value::Int(1)])
            .unwrap();
        let customer = session
            .add_shadow("Customer", vec![Value::Int(1), Value::Text("Ada".into())])
            .unwrap();

        let mut db = BlockingMockDb {
            state: MockState {
                rows_affected: 1,
                next_generated: 100,
                ..MockState::default()
            },
        };
        let affected = session.save_changes_blocking(&mut db).unwrap();
        assert_eq!(affected, 2);
        assert_eq!(db.state.executed_tables(), vec!["customers", "orders"]);
        assert_eq!(db.state.begun, 1);
        assert_eq!(db.state.committed, 1);

        assert_eq!(session.state_of(customer), Some(EntityState::Unchanged));
        assert_eq!(session.state_of(order), Some(EntityState::Unchanged));
    }

    #[test]
    fn test_detect_changes_on_save_picks_up_instance_drift() {
        let mut session = Session::new(shop_model());
        let instance = entity_ref(Customer {
            id: Some(1),
            name: "Ada".to_string(),
        });
        let id = session.attach(Arc::clone(&instance)).unwrap();

        // Mutate behind the session's back.
        instance
            .write()
            .unwrap()
            .set("name", Value::Text("Grace".into()));

        let mut db = BlockingMockDb {
            state: MockState {
                rows_affected: 1,
                ..MockState::default()
            },
        };
        let affected = session.save_changes_blocking(&mut db).unwrap();
        assert_eq!(affected, 1);
        assert_eq!(session.state_of(id), Some(EntityState::Unchanged));
    }
}
