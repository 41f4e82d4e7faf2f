//! Row-level modification commands.
//!
//! Each ordered save step becomes one [`ModificationCommand`]: a logical row
//! operation with per-column read/write/condition flags. A command can
//! aggregate more than one tracked entry when several entity types share one
//! physical table (table splitting). Flag invariants:
//!
//! - `Added` commands carry writes and store-generated reads, no conditions
//! - `Modified` commands write only changed columns and condition on the
//!   original key plus any concurrency tokens; a command with zero writes is
//!   degenerate and is dropped, never sent
//! - `Deleted` commands carry conditions only

use crate::entry::{EntityState, EntryId};
use crate::graph::{SaveOp, SaveOrder};
use crate::state::StateManager;
use entrack_core::{Error, PropertyId, Result, Value};
use std::collections::{HashMap, HashSet};

/// Default upper bound on commands per round-trip batch.
pub const DEFAULT_MAX_BATCH_SIZE: usize = 100;

/// One column of a modification command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnModification {
    /// Database column name.
    pub column: String,
    /// The entry this column belongs to.
    pub entry: EntryId,
    /// The property behind the column.
    pub property: PropertyId,
    /// Part of the primary key.
    pub is_key: bool,
    /// Used in the WHERE clause (original key values, concurrency tokens).
    pub is_condition: bool,
    /// Store-generated; value must be read back after execution.
    pub is_read: bool,
    /// Sent in the SET/INSERT list.
    pub is_write: bool,
    /// The value written, when `is_write`.
    pub value: Option<Value>,
    /// The original value conditioned on, when `is_condition`.
    pub original_value: Option<Value>,
}

/// One logical row operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModificationCommand {
    /// Physical table name.
    pub table: String,
    /// Optional schema qualifier.
    pub schema: Option<String>,
    /// The row operation kind (`Added`, `Modified`, or `Deleted`).
    pub state: EntityState,
    /// Tracked entries aggregated into this command.
    pub entries: Vec<EntryId>,
    /// Columns, in property declaration order.
    pub columns: Vec<ColumnModification>,
}

impl ModificationCommand {
    /// Columns sent in the SET/INSERT list.
    pub fn write_columns(&self) -> impl Iterator<Item = &ColumnModification> {
        self.columns.iter().filter(|c| c.is_write)
    }

    /// Columns used in the WHERE clause.
    pub fn condition_columns(&self) -> impl Iterator<Item = &ColumnModification> {
        self.columns.iter().filter(|c| c.is_condition)
    }

    /// Store-generated columns whose post-execution value must be read back.
    pub fn read_columns(&self) -> impl Iterator<Item = &ColumnModification> {
        self.columns.iter().filter(|c| c.is_read)
    }

    /// Whether the WHERE clause checks anything beyond the primary key.
    #[must_use]
    pub fn has_concurrency_condition(&self) -> bool {
        self.columns.iter().any(|c| c.is_condition && !c.is_key)
    }

    /// Whether an affected-row count of zero indicates a missing/changed row.
    #[must_use]
    pub fn requires_result_check(&self) -> bool {
        matches!(self.state, EntityState::Modified | EntityState::Deleted)
    }
}

/// A group of commands sharing one parameterized round-trip.
#[derive(Debug, Default)]
pub struct CommandBatch {
    /// Commands in global sort order.
    pub commands: Vec<ModificationCommand>,
}

impl CommandBatch {
    /// Number of commands in this batch.
    #[must_use]
    pub fn len(&self) -> usize {
        self.commands.len()
    }

    /// Check if the batch is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }
}

/// Build modification commands for an ordered save plan.
#[allow(clippy::result_large_err)]
pub(crate) fn build_commands(
    mgr: &StateManager,
    order: &SaveOrder,
) -> Result<Vec<ModificationCommand>> {
    let mut commands: Vec<ModificationCommand> = Vec::new();
    // Table splitting: entries sharing (table, schema, state, key) merge into
    // one command, each contributing columns for its own properties.
    let mut merge_index: HashMap<(String, Option<String>, u8, Vec<Value>), usize> = HashMap::new();

    for op in &order.ops {
        match op {
            SaveOp::Entry {
                entry,
                deferred_fks,
            } => {
                let Some(cmd) = build_entry_command(mgr, *entry, deferred_fks)? else {
                    continue;
                };
                let key_values = {
                    let e = mgr.entry(*entry);
                    let et = mgr.model().entity(e.entity_type());
                    if e.state() == EntityState::Deleted {
                        e.original_key_values(et)
                    } else {
                        e.key_values(et)
                    }
                };
                // Rows without a client-known key (pending store-generated
                // values) are always distinct rows; never merge them.
                if key_values.iter().any(Value::is_null) {
                    commands.push(cmd);
                    continue;
                }
                let merge_key = (
                    cmd.table.clone(),
                    cmd.schema.clone(),
                    cmd.state.sort_rank(),
                    key_values,
                );
                if let Some(&idx) = merge_index.get(&merge_key) {
                    let existing = &mut commands[idx];
                    existing.entries.push(*entry);
                    for col in cmd.columns {
                        if !existing.columns.iter().any(|c| c.column == col.column) {
                            existing.columns.push(col);
                        }
                    }
                } else {
                    merge_index.insert(merge_key, commands.len());
                    commands.push(cmd);
                }
            }
            SaveOp::NullOutForeignKey { entry, fk_index } => {
                commands.push(build_fk_command(mgr, *entry, *fk_index, true)?);
            }
            SaveOp::SetForeignKey { entry, fk_index } => {
                commands.push(build_fk_command(mgr, *entry, *fk_index, false)?);
            }
        }
    }

    Ok(commands)
}

/// Build the main row operation for one entry; `None` for degenerate updates.
#[allow(clippy::result_large_err)]
fn build_entry_command(
    mgr: &StateManager,
    id: EntryId,
    deferred_fks: &[usize],
) -> Result<Option<ModificationCommand>> {
    let entry = mgr.entry(id);
    let et = mgr.model().entity(entry.entity_type());
    let state = entry.state();

    let deferred: HashSet<PropertyId> = deferred_fks
        .iter()
        .flat_map(|i| et.foreign_keys()[*i].dependent.iter().copied())
        .collect();

    let mut columns = Vec::new();
    match state {
        EntityState::Added => {
            for pid in et.property_ids() {
                if deferred.contains(&pid) {
                    continue;
                }
                let p = et.property(pid);
                let is_key = et.is_key(pid);
                if p.store_generated {
                    columns.push(ColumnModification {
                        column: p.column.clone(),
                        entry: id,
                        property: pid,
                        is_key,
                        is_condition: false,
                        is_read: true,
                        is_write: false,
                        value: None,
                        original_value: None,
                    });
                } else {
                    let value = entry.property(et, pid);
                    if value.is_null() && !p.nullable {
                        return Err(Error::Custom(format!(
                            "required property '{}.{}' is null",
                            et.name, p.name
                        )));
                    }
                    columns.push(ColumnModification {
                        column: p.column.clone(),
                        entry: id,
                        property: pid,
                        is_key,
                        is_condition: false,
                        is_read: false,
                        is_write: true,
                        value: Some(value),
                        original_value: None,
                    });
                }
            }
        }
        EntityState::Modified => {
            let changed: HashSet<PropertyId> = entry.changed_properties(et).into_iter().collect();
            for pid in et.property_ids() {
                let p = et.property(pid);
                let is_key = et.is_key(pid);
                let is_condition = is_key || p.concurrency_token;
                let is_read = p.store_generated && !is_key;
                let is_write =
                    !is_key && !p.store_generated && changed.contains(&pid) && !deferred.contains(&pid);
                if !(is_condition || is_read || is_write) {
                    continue;
                }
                columns.push(ColumnModification {
                    column: p.column.clone(),
                    entry: id,
                    property: pid,
                    is_key,
                    is_condition,
                    is_read,
                    is_write,
                    value: is_write.then(|| entry.property(et, pid)),
                    original_value: is_condition.then(|| entry.original_value(pid).clone()),
                });
            }
            if !columns.iter().any(|c| c.is_write) {
                tracing::trace!(entity = %et.name, "dropping degenerate update with no changed columns");
                return Ok(None);
            }
        }
        EntityState::Deleted => {
            for pid in et.property_ids() {
                let p = et.property(pid);
                let is_key = et.is_key(pid);
                let is_condition = is_key || p.concurrency_token;
                if !is_condition {
                    continue;
                }
                columns.push(ColumnModification {
                    column: p.column.clone(),
                    entry: id,
                    property: pid,
                    is_key,
                    is_condition: true,
                    is_read: false,
                    is_write: false,
                    value: None,
                    original_value: Some(entry.original_value(pid).clone()),
                });
            }
        }
        EntityState::Detached | EntityState::Unchanged => {
            return Err(Error::Custom(format!(
                "entry in state '{}' has no row operation",
                state.as_str()
            )));
        }
    }

    Ok(Some(ModificationCommand {
        table: et.table.clone(),
        schema: et.schema.clone(),
        state,
        entries: vec![id],
        columns,
    }))
}

/// Build a cycle-splitting FK fixup: null the FK out, or set it once the
/// principal exists. The whole (possibly composite) FK is handled atomically.
#[allow(clippy::result_large_err)]
fn build_fk_command(
    mgr: &StateManager,
    id: EntryId,
    fk_index: usize,
    null_out: bool,
) -> Result<ModificationCommand> {
    let entry = mgr.entry(id);
    let et = mgr.model().entity(entry.entity_type());
    let fk = &et.foreign_keys()[fk_index];

    let mut columns = Vec::new();
    for pid in et.key() {
        let p = et.property(*pid);
        // A deferred-insert fixup conditions on the key the row was inserted
        // with; a delete-side null-out conditions on the stored original.
        let condition_value = if null_out {
            entry.original_value(*pid).clone()
        } else {
            entry.property(et, *pid)
        };
        if condition_value.is_null() {
            return Err(Error::Custom(format!(
                "cannot split foreign key on '{}': key column '{}' is not client-known",
                et.name, p.column
            )));
        }
        columns.push(ColumnModification {
            column: p.column.clone(),
            entry: id,
            property: *pid,
            is_key: true,
            is_condition: true,
            is_read: false,
            is_write: false,
            value: None,
            original_value: Some(condition_value),
        });
    }

    for pid in &fk.dependent {
        let p = et.property(*pid);
        let value = if null_out {
            Value::Null
        } else {
            entry.property(et, *pid)
        };
        columns.push(ColumnModification {
            column: p.column.clone(),
            entry: id,
            property: *pid,
            is_key: false,
            is_condition: false,
            is_read: false,
            is_write: true,
            value: Some(value),
            original_value: None,
        });
    }

    Ok(ModificationCommand {
        table: et.table.clone(),
        schema: et.schema.clone(),
        state: EntityState::Modified,
        entries: vec![id],
        columns,
    })
}

/// Group ordered commands into round-trip batches.
///
/// Consecutive commands sharing (table, schema, operation) batch together up
/// to `max_batch_size`; crossing the limit starts a new batch but the global
/// order is preserved across batches.
pub(crate) fn batch_commands(
    commands: Vec<ModificationCommand>,
    max_batch_size: usize,
) -> Vec<CommandBatch> {
    let limit = max_batch_size.max(1);
    let mut batches = Vec::new();
    let mut current: Vec<ModificationCommand> = Vec::new();

    for cmd in commands {
        let split = current.last().is_some_and(|last| {
            last.table != cmd.table || last.schema != cmd.schema || last.state != cmd.state
        }) || current.len() >= limit;
        if split && !current.is_empty() {
            batches.push(CommandBatch {
                commands: std::mem::take(&mut current),
            });
        }
        current.push(cmd);
    }
    if !current.is_empty() {
        batches.push(CommandBatch { commands: current });
    }
    batches
}
