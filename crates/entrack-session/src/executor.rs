//! The store execution boundary.
//!
//! SQL generation, parameter binding, and the physical connection live in an
//! external collaborator. The engine hands it one [`CommandBatch`] at a time
//! and gets back a per-command affected-row count plus values for the
//! command's read columns. Affected-row mismatches are classified here:
//! a zero count with a concurrency condition is an optimistic concurrency
//! failure, without one it means the row vanished out of band.

use crate::command::{CommandBatch, ModificationCommand};
use crate::entry::{EntityState, EntryId};
use crate::state::StateManager;
use entrack_core::{
    ConcurrencyError, Cx, EntryStamp, Error, Outcome, PropertyId, Result, RowNotFoundError,
    StoreError, Value,
};
use std::future::Future;

/// Per-command execution result reported by the store collaborator.
#[derive(Debug, Clone, Default)]
pub struct CommandResult {
    /// Rows matched/affected by the command.
    pub rows_affected: u64,
    /// Values for the command's read columns, in `read_columns()` order.
    pub read_values: Vec<Value>,
}

impl CommandResult {
    /// A result with an affected-row count and no read-backs.
    #[must_use]
    pub fn new(rows_affected: u64) -> Self {
        Self {
            rows_affected,
            read_values: Vec::new(),
        }
    }

    /// A result carrying read-back values for store-generated columns.
    #[must_use]
    pub fn with_reads(rows_affected: u64, read_values: Vec<Value>) -> Self {
        Self {
            rows_affected,
            read_values,
        }
    }
}

/// Asynchronous store collaborator.
///
/// All operations take a `Cx` context for cancellation/timeout support.
/// `in_transaction` reports whether the host already opened an explicit
/// transaction; the engine begins/commits its own only when none is open.
pub trait Database: Send + Sync {
    /// Whether an explicit transaction is already open on this connection.
    fn in_transaction(&self) -> bool;

    /// Begin a transaction.
    fn begin(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Execute one batch and return one result per command, in order.
    fn execute_batch(
        &self,
        cx: &Cx,
        batch: &CommandBatch,
    ) -> impl Future<Output = Outcome<Vec<CommandResult>, Error>> + Send;

    /// Commit the engine-owned transaction.
    fn commit(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;

    /// Roll back the engine-owned transaction.
    fn rollback(&self, cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send;
}

/// Synchronous store collaborator for the blocking save path.
pub trait BlockingDatabase {
    /// Whether an explicit transaction is already open on this connection.
    fn in_transaction(&self) -> bool;

    /// Begin a transaction.
    #[allow(clippy::result_large_err)]
    fn begin(&mut self) -> Result<()>;

    /// Execute one batch and return one result per command, in order.
    #[allow(clippy::result_large_err)]
    fn execute_batch(&mut self, batch: &CommandBatch) -> Result<Vec<CommandResult>>;

    /// Commit the engine-owned transaction.
    #[allow(clippy::result_large_err)]
    fn commit(&mut self) -> Result<()>;

    /// Roll back the engine-owned transaction.
    #[allow(clippy::result_large_err)]
    fn rollback(&mut self) -> Result<()>;
}

/// A store-generated value staged for one entry, applied only on accept.
#[derive(Debug, Clone)]
pub(crate) struct ReadBack {
    pub entry: EntryId,
    pub property: PropertyId,
    pub value: Value,
}

/// Identify a command's entries for error payloads.
pub(crate) fn entry_stamps(mgr: &StateManager, cmd: &ModificationCommand) -> Vec<EntryStamp> {
    cmd.entries
        .iter()
        .filter_map(|id| {
            let entry = mgr.try_entry(*id)?;
            let et = mgr.model().entity(entry.entity_type());
            let key = if entry.state() == EntityState::Deleted {
                entry.original_key_values(et)
            } else {
                entry.key_values(et)
            };
            Some(EntryStamp {
                entity: et.name.clone(),
                key,
            })
        })
        .collect()
}

/// Classify one command's execution result.
#[allow(clippy::result_large_err)]
pub(crate) fn check_command_result(
    mgr: &StateManager,
    cmd: &ModificationCommand,
    result: &CommandResult,
) -> Result<()> {
    let expected_reads = cmd.read_columns().count();
    if result.read_values.len() != expected_reads {
        return Err(Error::Store(StoreError::new(format!(
            "store returned {} read values for a command expecting {}",
            result.read_values.len(),
            expected_reads
        ))));
    }

    if cmd.requires_result_check() && result.rows_affected == 0 {
        let stamps = entry_stamps(mgr, cmd);
        if cmd.has_concurrency_condition() {
            return Err(Error::Concurrency(ConcurrencyError { entries: stamps }));
        }
        let entry = stamps.into_iter().next().unwrap_or(EntryStamp {
            entity: cmd.table.clone(),
            key: Vec::new(),
        });
        return Err(Error::RowNotFound(RowNotFoundError { entry }));
    }

    Ok(())
}

/// Stage read-back values from one command's result.
pub(crate) fn collect_read_backs(
    cmd: &ModificationCommand,
    result: &CommandResult,
) -> Vec<ReadBack> {
    cmd.read_columns()
        .zip(result.read_values.iter())
        .map(|(col, value)| ReadBack {
            entry: col.entry,
            property: col.property,
            value: value.clone(),
        })
        .collect()
}
