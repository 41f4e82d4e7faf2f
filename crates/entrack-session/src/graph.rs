//! Dependency-ordered save planning.
//!
//! Builds a directed graph over the entries of one save set, one node per
//! entry, with an edge `X -> Y` meaning "X must execute before Y":
//!
//! - a principal being inserted precedes its dependents' writes (dependents
//!   resolved through *current* foreign-key values)
//! - dependents' deletes/reparenting precede a principal's delete (resolved
//!   through *original* foreign-key values)
//!
//! A Kahn sort over the graph yields the execution order. Node order and
//! candidate selection are fully deterministic: entries are pre-sorted by
//! (table, schema, state rank, key values, entity name) so repeated runs over
//! the same save set produce the same command sequence.
//!
//! Cycles are broken by splitting a nullable foreign key into two phases:
//! an insert-side cycle defers the FK columns out of the insert and re-sets
//! them in a trailing update; a delete-side cycle nulls the FK in a leading
//! update before the deletes run. A cycle made entirely of non-nullable
//! foreign keys is unorderable and fails before any store interaction.

use crate::EntityKey;
use crate::entry::{EntityState, EntryId};
use crate::state::StateManager;
use entrack_core::{DependencyCycleError, Error, ForeignKey, Result, Value};
use std::collections::{BTreeSet, HashMap, HashSet};

/// One step of the planned save sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SaveOp {
    /// Clear a nullable FK on an existing row before the deletes it unblocks.
    NullOutForeignKey { entry: EntryId, fk_index: usize },
    /// The entry's own row operation; `deferred_fks` are excluded from an
    /// insert's write set and applied by a later `SetForeignKey`.
    Entry {
        entry: EntryId,
        deferred_fks: Vec<usize>,
    },
    /// Set previously deferred FK columns once the principal exists.
    SetForeignKey { entry: EntryId, fk_index: usize },
}

/// The dependency-ordered plan for one save set.
#[derive(Debug, Default)]
pub(crate) struct SaveOrder {
    pub ops: Vec<SaveOp>,
}

#[derive(Debug, Clone, Copy)]
enum EdgeKind {
    /// Edge principal -> dependent: insert principal first.
    InsertAfterPrincipal,
    /// Edge dependent -> principal: remove the reference first.
    DeleteBeforePrincipal,
}

#[derive(Debug, Clone, Copy)]
struct EdgeInfo {
    /// Node index of the dependent side (the FK owner).
    dependent: usize,
    fk_index: usize,
    kind: EdgeKind,
}

/// Compute the deterministic execution order for a save set.
#[allow(clippy::result_large_err)]
pub(crate) fn order_entries(mgr: &StateManager, set: &[EntryId]) -> Result<SaveOrder> {
    let nodes = sorted_nodes(mgr, set);
    let n = nodes.len();
    let index_of: HashMap<EntryId, usize> =
        nodes.iter().enumerate().map(|(i, id)| (*id, i)).collect();

    let mut adj: Vec<Vec<usize>> = vec![Vec::new(); n];
    let mut indegree = vec![0_usize; n];
    let mut edge_meta: HashMap<(usize, usize), EdgeInfo> = HashMap::new();
    let mut seen = HashSet::new();

    let mut add_edge = |from: usize, to: usize, info: EdgeInfo, adj: &mut Vec<Vec<usize>>, indegree: &mut Vec<usize>| {
        if from != to && seen.insert((from, to)) {
            adj[from].push(to);
            indegree[to] += 1;
            edge_meta.insert((from, to), info);
        }
    };

    for (i, id) in nodes.iter().enumerate() {
        let entry = mgr.entry(*id);
        let et = mgr.model().entity(entry.entity_type());
        let state = entry.state();

        for (fk_index, fk) in et.foreign_keys().iter().enumerate() {
            // Current FK values name the (possibly new) principal.
            if matches!(state, EntityState::Added | EntityState::Modified) {
                if let Some(p) = mgr.get_principal(*id, fk) {
                    if let Some(&pi) = index_of.get(&p) {
                        if mgr.entry(p).state() == EntityState::Added {
                            add_edge(
                                pi,
                                i,
                                EdgeInfo {
                                    dependent: i,
                                    fk_index,
                                    kind: EdgeKind::InsertAfterPrincipal,
                                },
                                &mut adj,
                                &mut indegree,
                            );
                        }
                    }
                }
            }

            // Original FK values name the principal the store still sees.
            if matches!(state, EntityState::Modified | EntityState::Deleted) {
                if let Some(p) = find_principal_original(mgr, *id, fk) {
                    if let Some(&pi) = index_of.get(&p) {
                        if mgr.entry(p).state() == EntityState::Deleted {
                            add_edge(
                                i,
                                pi,
                                EdgeInfo {
                                    dependent: i,
                                    fk_index,
                                    kind: EdgeKind::DeleteBeforePrincipal,
                                },
                                &mut adj,
                                &mut indegree,
                            );
                        }
                    }
                }
            }
        }
    }

    // Kahn sort; BTreeSet keeps candidate selection deterministic.
    let mut ready: BTreeSet<usize> = (0..n).filter(|i| indegree[*i] == 0).collect();
    let mut removed: HashSet<(usize, usize)> = HashSet::new();
    let mut placed = vec![false; n];
    let mut order = Vec::with_capacity(n);
    let mut deferred: HashMap<usize, Vec<usize>> = HashMap::new();
    let mut null_outs: Vec<(usize, usize)> = Vec::new();
    let mut fk_sets: Vec<(usize, usize)> = Vec::new();

    while order.len() < n {
        while let Some(i) = ready.pop_first() {
            placed[i] = true;
            order.push(i);
            for &j in &adj[i] {
                if removed.contains(&(i, j)) {
                    continue;
                }
                indegree[j] -= 1;
                if indegree[j] == 0 {
                    ready.insert(j);
                }
            }
        }
        if order.len() == n {
            break;
        }

        let cycle = find_cycle(&adj, &removed, &placed)?;
        let mut broke = false;
        for w in 0..cycle.len() {
            let u = cycle[w];
            let v = cycle[(w + 1) % cycle.len()];
            let Some(info) = edge_meta.get(&(u, v)).copied() else {
                continue;
            };
            let dep_entry = mgr.entry(nodes[info.dependent]);
            let dep_et = mgr.model().entity(dep_entry.entity_type());
            let fk = &dep_et.foreign_keys()[info.fk_index];
            if !fk.is_nullable(dep_et) {
                continue;
            }

            tracing::debug!(
                dependent = %dep_et.name,
                fk = info.fk_index,
                kind = ?info.kind,
                "splitting foreign key to break dependency cycle"
            );
            removed.insert((u, v));
            indegree[v] -= 1;
            if indegree[v] == 0 {
                ready.insert(v);
            }
            match info.kind {
                EdgeKind::InsertAfterPrincipal => {
                    deferred.entry(info.dependent).or_default().push(info.fk_index);
                    fk_sets.push((info.dependent, info.fk_index));
                }
                EdgeKind::DeleteBeforePrincipal => {
                    null_outs.push((info.dependent, info.fk_index));
                }
            }
            broke = true;
            break;
        }

        if !broke {
            let mut entities: Vec<String> = cycle
                .iter()
                .map(|i| {
                    mgr.model()
                        .entity(mgr.entry(nodes[*i]).entity_type())
                        .name
                        .clone()
                })
                .collect();
            if let Some(first) = entities.first().cloned() {
                entities.push(first);
            }
            return Err(Error::DependencyCycle(DependencyCycleError { entities }));
        }
    }

    let mut ops = Vec::with_capacity(n + null_outs.len() + fk_sets.len());
    for (node, fk_index) in &null_outs {
        ops.push(SaveOp::NullOutForeignKey {
            entry: nodes[*node],
            fk_index: *fk_index,
        });
    }
    for i in &order {
        ops.push(SaveOp::Entry {
            entry: nodes[*i],
            deferred_fks: deferred.remove(i).unwrap_or_default(),
        });
    }
    for (node, fk_index) in &fk_sets {
        ops.push(SaveOp::SetForeignKey {
            entry: nodes[*node],
            fk_index: *fk_index,
        });
    }
    Ok(SaveOrder { ops })
}

/// Save-set entries in the deterministic base order.
fn sorted_nodes(mgr: &StateManager, set: &[EntryId]) -> Vec<EntryId> {
    let mut keyed: Vec<((String, Option<String>, u8, Vec<Value>, String), EntryId)> = set
        .iter()
        .map(|id| {
            let entry = mgr.entry(*id);
            let et = mgr.model().entity(entry.entity_type());
            // Deleted rows are identified by their original key.
            let key_values = if entry.state() == EntityState::Deleted {
                entry.original_key_values(et)
            } else {
                entry.key_values(et)
            };
            (
                (
                    et.table.clone(),
                    et.schema.clone(),
                    entry.state().sort_rank(),
                    key_values,
                    et.name.clone(),
                ),
                *id,
            )
        })
        .collect();
    keyed.sort();
    keyed.into_iter().map(|(_, id)| id).collect()
}

/// Resolve the principal an entry referenced through its original FK values.
fn find_principal_original(
    mgr: &StateManager,
    dependent: EntryId,
    fk: &ForeignKey,
) -> Option<EntryId> {
    let entry = mgr.try_entry(dependent)?;
    let et = mgr.model().entity(entry.entity_type());
    let values = entry.foreign_key_values(et, fk, true)?;

    let key = EntityKey::new(fk.principal_type, values.clone());
    if let Some(id) = mgr.find_entry(&key) {
        return Some(id);
    }

    let principal_et = mgr.model().entity(fk.principal_type);
    mgr.iter_ids().find(|id| {
        let e = mgr.entry(*id);
        e.entity_type() == fk.principal_type && e.key_values(principal_et) == values
    })
}

/// Extract one cycle from the stalled subgraph via DFS.
#[allow(clippy::result_large_err)]
fn find_cycle(
    adj: &[Vec<usize>],
    removed: &HashSet<(usize, usize)>,
    placed: &[bool],
) -> Result<Vec<usize>> {
    let n = adj.len();
    let mut color = vec![0_u8; n];
    let mut stack = Vec::new();

    for start in 0..n {
        if placed[start] || color[start] != 0 {
            continue;
        }
        if let Some(cycle) = dfs(start, adj, removed, placed, &mut color, &mut stack) {
            return Ok(cycle);
        }
    }
    // A stalled Kahn sort always leaves a cycle among unplaced nodes.
    Err(Error::Custom(
        "topological sort stalled without a detectable cycle".to_string(),
    ))
}

fn dfs(
    u: usize,
    adj: &[Vec<usize>],
    removed: &HashSet<(usize, usize)>,
    placed: &[bool],
    color: &mut Vec<u8>,
    stack: &mut Vec<usize>,
) -> Option<Vec<usize>> {
    color[u] = 1;
    stack.push(u);
    for &v in &adj[u] {
        if placed[v] || removed.contains(&(u, v)) {
            continue;
        }
        if color[v] == 1 {
            let pos = stack.iter().position(|&x| x == v)?;
            return Some(stack[pos..].to_vec());
        }
        if color[v] == 0 {
            if let Some(cycle) = dfs(v, adj, removed, placed, color, stack) {
                return Some(cycle);
            }
        }
    }
    color[u] = 2;
    stack.pop();
    None
}
