//! The Replica: one process's copy of a replicated document
//!
//! A Replica stores named containers (last-writer-wins maps and replicated
//! growable arrays), stages local operations inside transactions and
//! integrates remote operations in causal order.

use super::horizon::{Horizon, ReplicaId, SeqNum};
use super::operation::{ContainerId, ElemId, OpEnvelope, Operation, Stamp, Value};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ReplicaError {
    #[error("Container {container} is a {actual}, not a {expected}")]
    KindMismatch {
        container: ContainerId,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Index {index} out of bounds for {container} (len {len})")]
    IndexOutOfBounds {
        container: ContainerId,
        index: usize,
        len: usize,
    },

    #[error("Local edits require an open transaction")]
    NoTransaction,

    #[error("Cannot integrate remote operations while a transaction is open")]
    TransactionOpen,

    #[error("Array element {0} is unknown")]
    UnknownElement(ElemId),
}

#[derive(Clone, Debug)]
struct MapEntry {
    stamp: Stamp,
    /// `None` is a tombstone
    value: Option<Value>,
}

#[derive(Clone, Debug, Default)]
struct LwwMap {
    entries: BTreeMap<String, MapEntry>,
}

#[derive(Clone, Debug)]
struct ArrayElem {
    id: ElemId,
    value: Value,
    removed: bool,
}

#[derive(Clone, Debug, Default)]
struct Rga {
    elems: Vec<ArrayElem>,
}

impl Rga {
    fn visible(&self) -> impl Iterator<Item = &ArrayElem> {
        self.elems.iter().filter(|e| !e.removed)
    }

    fn len(&self) -> usize {
        self.visible().count()
    }

    /// Position in `elems` of the `index`-th visible element
    fn position_of_visible(&self, index: usize) -> Option<usize> {
        self.elems
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.removed)
            .nth(index)
            .map(|(pos, _)| pos)
    }

    /// Where an element with `id` anchored after `after` belongs.
    ///
    /// Concurrent insertions at the same anchor are ordered by descending
    /// stamp; causal delivery guarantees anything inserted after a newer
    /// sibling carries an even newer stamp, so a single forward skip suffices.
    fn integration_position(&self, after: Option<&ElemId>, id: &ElemId) -> Option<usize> {
        let mut pos = match after {
            None => 0,
            Some(anchor) => self.elems.iter().position(|e| &e.id == anchor)? + 1,
        };
        while pos < self.elems.len() && self.elems[pos].id > *id {
            pos += 1;
        }
        Some(pos)
    }
}

#[derive(Clone, Debug)]
enum Container {
    Map(LwwMap),
    Array(Rga),
}

impl Container {
    fn kind_name(&self) -> &'static str {
        match self {
            Container::Map(_) => "map",
            Container::Array(_) => "array",
        }
    }
}

#[derive(Debug)]
enum Undo {
    CreateContainer(ContainerId),
    MapEntry {
        container: ContainerId,
        key: String,
        prev: Option<MapEntry>,
    },
    ArrayInsert {
        container: ContainerId,
        id: ElemId,
    },
    ArrayRemove {
        container: ContainerId,
        id: ElemId,
    },
}

#[derive(Debug, Default)]
struct TxnLog {
    staged: Vec<OpEnvelope>,
    undo: Vec<Undo>,
}

/// A point a transaction can be rolled back to
#[derive(Clone, Debug)]
pub struct Savepoint {
    staged_len: usize,
    undo_len: usize,
    next_seq: SeqNum,
    lamport: u64,
    horizon: Horizon,
}

/// Result of integrating a batch of remote operations
#[derive(Clone, Debug, Default)]
pub struct RemoteOutcome {
    pub applied: usize,
    /// Containers changed, with the map key when the op was keyed
    pub touched: BTreeSet<(ContainerId, Option<String>)>,
    /// Operations still waiting for causal predecessors
    pub pending: usize,
}

pub struct Replica {
    replica_id: ReplicaId,
    next_seq: SeqNum,
    lamport: u64,
    horizon: Horizon,
    containers: HashMap<ContainerId, Container>,
    /// Every integrated operation, ordered by (author, seq)
    log: BTreeMap<(ReplicaId, SeqNum), OpEnvelope>,
    /// Remote operations whose causal context has not arrived yet
    pending: Vec<OpEnvelope>,
    txn: Option<TxnLog>,
}

impl Replica {
    pub fn new(replica_id: impl Into<ReplicaId>) -> Self {
        Self {
            replica_id: replica_id.into(),
            next_seq: 1,
            lamport: 0,
            horizon: Horizon::new(),
            containers: HashMap::new(),
            log: BTreeMap::new(),
            pending: Vec::new(),
            txn: None,
        }
    }

    pub fn replica_id(&self) -> &ReplicaId {
        &self.replica_id
    }

    pub fn horizon(&self) -> &Horizon {
        &self.horizon
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    // === Reads ===

    fn map(&self, container: &ContainerId) -> Option<&LwwMap> {
        match self.containers.get(container) {
            Some(Container::Map(m)) => Some(m),
            _ => None,
        }
    }

    fn array(&self, container: &ContainerId) -> Option<&Rga> {
        match self.containers.get(container) {
            Some(Container::Array(a)) => Some(a),
            _ => None,
        }
    }

    pub fn map_get(&self, container: &ContainerId, key: &str) -> Option<&Value> {
        self.map(container)?.entries.get(key)?.value.as_ref()
    }

    pub fn map_contains(&self, container: &ContainerId, key: &str) -> bool {
        self.map_get(container, key).is_some()
    }

    /// Stamp of the live entry under `key`
    pub fn map_entry_stamp(&self, container: &ContainerId, key: &str) -> Option<&Stamp> {
        let entry = self.map(container)?.entries.get(key)?;
        entry.value.as_ref().map(|_| &entry.stamp)
    }

    /// Live entries in key order
    pub fn map_entries(&self, container: &ContainerId) -> Vec<(String, Value)> {
        self.map_entries_stamped(container)
            .into_iter()
            .map(|(k, v, _)| (k, v))
            .collect()
    }

    pub fn map_entries_stamped(&self, container: &ContainerId) -> Vec<(String, Value, Stamp)> {
        self.map(container)
            .map(|m| {
                m.entries
                    .iter()
                    .filter_map(|(k, e)| {
                        e.value
                            .as_ref()
                            .map(|v| (k.clone(), v.clone(), e.stamp.clone()))
                    })
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn map_len(&self, container: &ContainerId) -> usize {
        self.map(container)
            .map(|m| m.entries.values().filter(|e| e.value.is_some()).count())
            .unwrap_or(0)
    }

    pub fn array_len(&self, container: &ContainerId) -> usize {
        self.array(container).map(Rga::len).unwrap_or(0)
    }

    pub fn array_get(&self, container: &ContainerId, index: usize) -> Option<&Value> {
        self.array(container)?.visible().nth(index).map(|e| &e.value)
    }

    pub fn array_values(&self, container: &ContainerId) -> Vec<Value> {
        self.array(container)
            .map(|a| a.visible().map(|e| e.value.clone()).collect())
            .unwrap_or_default()
    }

    /// Visible elements together with their element ids
    pub fn array_entries(&self, container: &ContainerId) -> Vec<(ElemId, Value)> {
        self.array(container)
            .map(|a| a.visible().map(|e| (e.id.clone(), e.value.clone())).collect())
            .unwrap_or_default()
    }

    // === Transactions ===

    pub fn in_transaction(&self) -> bool {
        self.txn.is_some()
    }

    /// Open a transaction and return the savepoint that undoes all of it
    pub fn begin(&mut self) -> Result<Savepoint, ReplicaError> {
        if self.txn.is_some() {
            return Err(ReplicaError::TransactionOpen);
        }
        self.txn = Some(TxnLog::default());
        self.savepoint()
    }

    pub fn savepoint(&self) -> Result<Savepoint, ReplicaError> {
        let txn = self.txn.as_ref().ok_or(ReplicaError::NoTransaction)?;
        Ok(Savepoint {
            staged_len: txn.staged.len(),
            undo_len: txn.undo.len(),
            next_seq: self.next_seq,
            lamport: self.lamport,
            horizon: self.horizon.clone(),
        })
    }

    /// Revert every local edit made after `savepoint`
    pub fn rollback_to(&mut self, savepoint: &Savepoint) {
        let Some(txn) = self.txn.as_mut() else {
            return;
        };
        while txn.undo.len() > savepoint.undo_len {
            if let Some(undo) = txn.undo.pop() {
                revert(&mut self.containers, undo);
            }
        }
        txn.staged.truncate(savepoint.staged_len);
        self.next_seq = savepoint.next_seq;
        self.lamport = savepoint.lamport;
        self.horizon = savepoint.horizon.clone();
    }

    /// Roll back everything and close the transaction
    pub fn abort(&mut self, savepoint: &Savepoint) {
        self.rollback_to(savepoint);
        self.txn = None;
    }

    /// Close the transaction, returning the operations it produced
    pub fn commit(&mut self) -> Vec<OpEnvelope> {
        let staged = self.txn.take().map(|t| t.staged).unwrap_or_default();
        for env in &staged {
            self.log.insert((env.author.clone(), env.seq), env.clone());
        }
        staged
    }

    // === Local edits ===

    fn stage(&mut self, op: Operation) -> Result<Stamp, ReplicaError> {
        let Some(txn) = self.txn.as_mut() else {
            return Err(ReplicaError::NoTransaction);
        };
        let lamport = self.lamport + 1;
        let seq = self.next_seq;
        let envelope = OpEnvelope::new(
            self.replica_id.clone(),
            seq,
            lamport,
            self.horizon.clone(),
            op,
        );
        integrate(&mut self.containers, &envelope, Some(&mut txn.undo))?;
        self.lamport = lamport;
        self.next_seq += 1;
        self.horizon.observe(&self.replica_id, seq);
        let stamp = envelope.stamp();
        txn.staged.push(envelope);
        Ok(stamp)
    }

    fn check_kind(&self, container: &ContainerId, expected: &'static str) -> Result<(), ReplicaError> {
        match self.containers.get(container) {
            Some(c) if c.kind_name() != expected => Err(ReplicaError::KindMismatch {
                container: container.clone(),
                expected,
                actual: c.kind_name(),
            }),
            _ => Ok(()),
        }
    }

    pub fn map_put(&mut self, container: &ContainerId, key: &str, value: Value) -> Result<(), ReplicaError> {
        self.check_kind(container, "map")?;
        self.stage(Operation::MapPut {
            container: container.clone(),
            key: key.to_string(),
            value,
        })
        .map(|_| ())
    }

    /// Remove a map entry; returns false (and emits nothing) if it was absent
    pub fn map_remove(&mut self, container: &ContainerId, key: &str) -> Result<bool, ReplicaError> {
        self.check_kind(container, "map")?;
        if !self.map_contains(container, key) {
            return Ok(false);
        }
        self.stage(Operation::MapRemove {
            container: container.clone(),
            key: key.to_string(),
        })?;
        Ok(true)
    }

    pub fn array_insert(
        &mut self,
        container: &ContainerId,
        index: usize,
        value: Value,
    ) -> Result<ElemId, ReplicaError> {
        self.check_kind(container, "array")?;
        let len = self.array_len(container);
        if index > len {
            return Err(ReplicaError::IndexOutOfBounds {
                container: container.clone(),
                index,
                len,
            });
        }
        let after = match index {
            0 => None,
            i => self
                .array(container)
                .and_then(|a| a.visible().nth(i - 1))
                .map(|e| e.id.clone()),
        };
        self.stage(Operation::ArrayInsert {
            container: container.clone(),
            after,
            value,
        })
    }

    pub fn array_push(&mut self, container: &ContainerId, value: Value) -> Result<ElemId, ReplicaError> {
        let len = self.array_len(container);
        self.array_insert(container, len, value)
    }

    pub fn array_remove(&mut self, container: &ContainerId, index: usize) -> Result<Value, ReplicaError> {
        self.check_kind(container, "array")?;
        let len = self.array_len(container);
        let (id, value) = self
            .array(container)
            .and_then(|a| a.visible().nth(index))
            .map(|e| (e.id.clone(), e.value.clone()))
            .ok_or_else(|| ReplicaError::IndexOutOfBounds {
                container: container.clone(),
                index,
                len,
            })?;
        self.stage(Operation::ArrayRemove {
            container: container.clone(),
            target: id,
        })?;
        Ok(value)
    }

    /// Remove a specific element by id; false if it is already gone
    pub fn array_remove_elem(&mut self, container: &ContainerId, id: &ElemId) -> Result<bool, ReplicaError> {
        let live = self
            .array(container)
            .map(|a| a.visible().any(|e| &e.id == id))
            .unwrap_or(false);
        if !live {
            return Ok(false);
        }
        self.stage(Operation::ArrayRemove {
            container: container.clone(),
            target: id.clone(),
        })?;
        Ok(true)
    }

    // === Remote integration ===

    fn is_ready(&self, env: &OpEnvelope) -> bool {
        self.horizon.get(&env.author) + 1 == env.seq && self.horizon.dominates(&env.horizon)
    }

    /// Integrate remote operations, buffering any that arrive ahead of
    /// their causal predecessors. Duplicates are ignored.
    pub fn apply_remote(&mut self, envelopes: Vec<OpEnvelope>) -> Result<RemoteOutcome, ReplicaError> {
        if self.txn.is_some() {
            return Err(ReplicaError::TransactionOpen);
        }
        for env in envelopes {
            let duplicate = self.horizon.has_seen(&env.author, env.seq)
                || self
                    .pending
                    .iter()
                    .any(|p| p.author == env.author && p.seq == env.seq);
            if !duplicate {
                self.pending.push(env);
            }
        }

        let mut outcome = RemoteOutcome::default();
        loop {
            let Some(idx) = self.pending.iter().position(|env| self.is_ready(env)) else {
                break;
            };
            let env = self.pending.swap_remove(idx);
            match integrate(&mut self.containers, &env, None) {
                Ok(()) => {
                    outcome
                        .touched
                        .insert((env.op.container().clone(), env.op.key().map(str::to_string)));
                }
                Err(e) => {
                    log::warn!("Skipping remote op {} from {}: {}", env.id, env.author, e);
                }
            }
            self.horizon.observe(&env.author, env.seq);
            self.lamport = self.lamport.max(env.lamport);
            self.log.insert((env.author.clone(), env.seq), env);
            outcome.applied += 1;
        }
        outcome.pending = self.pending.len();
        Ok(outcome)
    }

    /// Operations not covered by `since` (for incremental sync)
    pub fn operations_since(&self, since: &Horizon) -> Vec<OpEnvelope> {
        self.log
            .iter()
            .filter(|((author, seq), _)| !since.has_seen(author, *seq))
            .map(|(_, env)| env.clone())
            .collect()
    }
}

fn container_entry<'a>(
    containers: &'a mut HashMap<ContainerId, Container>,
    container: &ContainerId,
    fresh: fn() -> Container,
    undo: &mut Option<&mut Vec<Undo>>,
) -> &'a mut Container {
    if !containers.contains_key(container) {
        if let Some(undo) = undo.as_mut() {
            undo.push(Undo::CreateContainer(container.clone()));
        }
    }
    containers.entry(container.clone()).or_insert_with(fresh)
}

fn integrate(
    containers: &mut HashMap<ContainerId, Container>,
    env: &OpEnvelope,
    mut undo: Option<&mut Vec<Undo>>,
) -> Result<(), ReplicaError> {
    let stamp = env.stamp();
    match &env.op {
        Operation::MapPut { container, key, .. } | Operation::MapRemove { container, key } => {
            let value = match &env.op {
                Operation::MapPut { value, .. } => Some(value.clone()),
                _ => None,
            };
            let map = match container_entry(containers, container, || Container::Map(LwwMap::default()), &mut undo) {
                Container::Map(m) => m,
                other => {
                    return Err(ReplicaError::KindMismatch {
                        container: container.clone(),
                        expected: "map",
                        actual: other.kind_name(),
                    })
                }
            };
            let prev = map.entries.get(key).cloned();
            if prev.as_ref().map_or(true, |p| p.stamp < stamp) {
                map.entries.insert(key.clone(), MapEntry { stamp, value });
                if let Some(undo) = undo {
                    undo.push(Undo::MapEntry {
                        container: container.clone(),
                        key: key.clone(),
                        prev,
                    });
                }
            }
        }
        Operation::ArrayInsert {
            container,
            after,
            value,
        } => {
            let rga = match container_entry(containers, container, || Container::Array(Rga::default()), &mut undo) {
                Container::Array(a) => a,
                other => {
                    return Err(ReplicaError::KindMismatch {
                        container: container.clone(),
                        expected: "array",
                        actual: other.kind_name(),
                    })
                }
            };
            if rga.elems.iter().any(|e| e.id == stamp) {
                return Ok(());
            }
            let pos = rga
                .integration_position(after.as_ref(), &stamp)
                .ok_or_else(|| ReplicaError::UnknownElement(after.clone().unwrap_or_else(|| stamp.clone())))?;
            rga.elems.insert(
                pos,
                ArrayElem {
                    id: stamp.clone(),
                    value: value.clone(),
                    removed: false,
                },
            );
            if let Some(undo) = undo {
                undo.push(Undo::ArrayInsert {
                    container: container.clone(),
                    id: stamp,
                });
            }
        }
        Operation::ArrayRemove { container, target } => {
            let Some(Container::Array(rga)) = containers.get_mut(container) else {
                return Err(ReplicaError::UnknownElement(target.clone()));
            };
            let elem = rga
                .elems
                .iter_mut()
                .find(|e| &e.id == target)
                .ok_or_else(|| ReplicaError::UnknownElement(target.clone()))?;
            if !elem.removed {
                elem.removed = true;
                if let Some(undo) = undo {
                    undo.push(Undo::ArrayRemove {
                        container: container.clone(),
                        id: target.clone(),
                    });
                }
            }
        }
    }
    Ok(())
}

fn revert(containers: &mut HashMap<ContainerId, Container>, undo: Undo) {
    match undo {
        Undo::CreateContainer(id) => {
            containers.remove(&id);
        }
        Undo::MapEntry {
            container,
            key,
            prev,
        } => {
            if let Some(Container::Map(map)) = containers.get_mut(&container) {
                match prev {
                    Some(entry) => {
                        map.entries.insert(key, entry);
                    }
                    None => {
                        map.entries.remove(&key);
                    }
                }
            }
        }
        Undo::ArrayInsert { container, id } => {
            if let Some(Container::Array(rga)) = containers.get_mut(&container) {
                rga.elems.retain(|e| e.id != id);
            }
        }
        Undo::ArrayRemove { container, id } => {
            if let Some(Container::Array(rga)) = containers.get_mut(&container) {
                if let Some(elem) = rga.elems.iter_mut().find(|e| e.id == id) {
                    elem.removed = false;
                }
            }
        }
    }
}
