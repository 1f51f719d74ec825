//! Ownership tracking
//!
//! Every owned entity has exactly one back-pointer naming the slot that
//! holds it: a root name, or an owner entity's field (plus list index or map
//! key). The index is per document, kept in step with the substrate by the
//! protocol functions below, and journaled so rollbacks restore it.
//!
//! Moves go through two primitives: emancipation removes the entity from its
//! current slot (structurally and in the index), adoption records the new
//! slot. Orphanization is emancipation with no adoption to follow.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use super::document::{DocState, Document};
use super::entity::Entity;
use super::layout;
use super::notify::ChangeKey;
use super::reference::{EntityId, RefTuple};
use super::schema::{CollectionShape, FieldKind, SchemaRegistry};
use super::transfer;
use crate::convergent::Value;
use crate::error::{GraphError, Result};

/// Who holds an owned slot
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SlotOwner {
    /// The document itself, through a named root
    Root,
    Entity(EntityId),
}

/// Position inside a collection slot
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum SlotKey {
    Index(usize),
    Key(String),
}

/// Back-pointer from an owned entity to the slot holding it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OwnerSlot {
    pub owner: SlotOwner,
    /// Field name, or root name when the owner is the document
    pub field: String,
    pub key: Option<SlotKey>,
}

impl OwnerSlot {
    pub fn root(name: impl Into<String>) -> Self {
        Self {
            owner: SlotOwner::Root,
            field: name.into(),
            key: None,
        }
    }

    pub fn field(owner: &EntityId, field: impl Into<String>) -> Self {
        Self {
            owner: SlotOwner::Entity(owner.clone()),
            field: field.into(),
            key: None,
        }
    }

    pub fn indexed(owner: &EntityId, field: impl Into<String>, index: usize) -> Self {
        Self {
            key: Some(SlotKey::Index(index)),
            ..Self::field(owner, field)
        }
    }

    pub fn keyed(owner: &EntityId, field: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            key: Some(SlotKey::Key(key.into())),
            ..Self::field(owner, field)
        }
    }

    pub fn owner_entity(&self) -> Option<&EntityId> {
        match &self.owner {
            SlotOwner::Entity(id) => Some(id),
            SlotOwner::Root => None,
        }
    }

    pub(crate) fn change_key(&self) -> ChangeKey {
        match &self.owner {
            SlotOwner::Root => ChangeKey::Root(self.field.clone()),
            SlotOwner::Entity(owner) => ChangeKey::field(owner, &self.field),
        }
    }
}

impl fmt::Display for OwnerSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.owner {
            SlotOwner::Root => write!(f, "root:{}", self.field)?,
            SlotOwner::Entity(owner) => write!(f, "{}.{}", owner, self.field)?,
        }
        match &self.key {
            Some(SlotKey::Index(i)) => write!(f, "[{}]", i),
            Some(SlotKey::Key(k)) => write!(f, "[{:?}]", k),
            None => Ok(()),
        }
    }
}

/// Document-level back-pointer index with an undo journal for savepoints
#[derive(Default)]
pub(crate) struct OwnershipTracker {
    slots: HashMap<EntityId, OwnerSlot>,
    undo: Vec<(EntityId, Option<OwnerSlot>)>,
    recording: bool,
}

impl OwnershipTracker {
    pub fn slot(&self, id: &EntityId) -> Option<&OwnerSlot> {
        self.slots.get(id)
    }

    pub fn set(&mut self, id: EntityId, slot: Option<OwnerSlot>) -> Option<OwnerSlot> {
        let prev = match slot {
            Some(slot) => self.slots.insert(id.clone(), slot),
            None => self.slots.remove(&id),
        };
        if self.recording {
            self.undo.push((id, prev.clone()));
        }
        prev
    }

    pub fn begin(&mut self) {
        self.recording = true;
        self.undo.clear();
    }

    pub fn mark(&self) -> usize {
        self.undo.len()
    }

    pub fn rollback_to(&mut self, mark: usize) {
        while self.undo.len() > mark {
            if let Some((id, prev)) = self.undo.pop() {
                match prev {
                    Some(slot) => self.slots.insert(id, slot),
                    None => self.slots.remove(&id),
                };
            }
        }
    }

    pub fn end(&mut self) {
        self.recording = false;
        self.undo.clear();
    }

    pub fn entries(&self) -> impl Iterator<Item = (&EntityId, &OwnerSlot)> {
        self.slots.iter()
    }

    /// Would placing `child` under `owner` make `child` its own ancestor?
    pub fn would_cycle(&self, child: &EntityId, owner: &EntityId) -> bool {
        let mut current = owner.clone();
        // A consistent index cannot have a chain longer than its size
        for _ in 0..=self.slots.len() {
            if current == *child {
                return true;
            }
            match self.slots.get(&current).and_then(OwnerSlot::owner_entity) {
                Some(next) => current = next.clone(),
                None => return false,
            }
        }
        true
    }
}

// ---- Protocol ----
//
// Callers hold a transaction on `doc`.

/// Remove `id` from its owning slot and clear its back-pointer. Returns the
/// slot it left, if it had one.
pub(crate) fn request_emancipation(doc: &Document, id: &EntityId) -> Result<Option<OwnerSlot>> {
    let vacated = vacate(doc, id)?;
    if let Some(slot) = &vacated {
        log::trace!("Emancipated {} from {}", id, slot);
    }
    Ok(vacated)
}

/// Remove `id` from its owning slot with no new owner to follow
pub(crate) fn request_orphanization(doc: &Document, id: &EntityId) -> Result<Option<OwnerSlot>> {
    let vacated = vacate(doc, id)?;
    if let Some(slot) = &vacated {
        log::debug!("Orphaned {} (was {})", id, slot);
    }
    Ok(vacated)
}

/// Record that `id` now sits in `slot`. The entity must be unowned.
pub(crate) fn inform_adoption(doc: &Document, id: &EntityId, slot: OwnerSlot) -> Result<()> {
    doc.with_state(|s| match s.ownership.slot(id) {
        Some(existing) if *existing != slot => Err(GraphError::OwnershipConflict {
            entity: id.clone(),
            reason: format!("already owned by {}", existing),
        }),
        _ => {
            s.ownership.set(id.clone(), Some(slot));
            Ok(())
        }
    })
}

/// Clear the back-pointer of an entity whose slot was already overwritten
pub(crate) fn inform_orphanization(doc: &Document, id: &EntityId) {
    if let Some(prev) = doc.with_state(|s| s.ownership.set(id.clone(), None)) {
        log::debug!("Orphaned {} (was {})", id, prev);
    }
}

/// Move `child` into `slot`: emancipate it from wherever it is (bringing it
/// into `doc` if it is ephemeral) and record the adoption. The caller
/// writes the reference into the slot.
pub(crate) fn request_adoption(doc: &Document, child: &Entity, slot: OwnerSlot) -> Result<()> {
    detach_for_adoption(doc, &slot.owner, child)?;
    inform_adoption(doc, child.id(), slot)
}

/// Bring `child` into `doc` as an unowned entity ready to be placed under
/// `owner`.
///
/// Owned edges never cross documents: a child living in another replicated
/// document is rejected. An ephemeral child is emancipated inside its
/// scratch document and its subtree moves into `doc`.
pub(crate) fn detach_for_adoption(doc: &Document, owner: &SlotOwner, child: &Entity) -> Result<()> {
    let home = child.document();

    if home.same(doc) {
        if let SlotOwner::Entity(owner_id) = owner {
            if doc.read(|s| s.ownership.would_cycle(child.id(), owner_id)) {
                return Err(GraphError::OwnershipCycle {
                    entity: child.id().clone(),
                    owner: owner_id.clone(),
                });
            }
        }
        request_emancipation(doc, child.id())?;
        return Ok(());
    }

    if !home.is_scratch() {
        return Err(GraphError::DocumentMismatch(format!(
            "{} lives in document {}; owned edges cannot reach it from {}",
            child.id(),
            home.id(),
            doc.id()
        )));
    }

    let left = home.transact(|| request_emancipation(&home, child.id()))?;
    if let Some(slot) = left {
        let scratch = home.clone();
        let id = child.id().clone();
        doc.push_compensation(move || restore_slot(&scratch, &id, slot));
    }
    transfer::absorb(doc, child)
}

/// Put `id` back into `slot` after a rolled-back move
pub(crate) fn restore_slot(doc: &Document, id: &EntityId, slot: OwnerSlot) {
    let registry = doc.registry().clone();
    let restored = doc.transact(|| {
        doc.with_state(|s| insert_into_slot(s, &registry, id, &slot))?;
        doc.record_change(slot.change_key());
        Ok(())
    });
    if let Err(e) = restored {
        log::warn!("Could not restore {} into {}: {}", id, slot, e);
    }
}

fn vacate(doc: &Document, id: &EntityId) -> Result<Option<OwnerSlot>> {
    let Some(slot) = doc.read(|s| s.ownership.slot(id).cloned()) else {
        return Ok(None);
    };
    let registry = doc.registry().clone();
    doc.with_state(|s| -> Result<()> {
        remove_from_slot(s, &registry, id, &slot)?;
        s.ownership.set(id.clone(), None);
        if let (Some(SlotKey::Index(_)), SlotOwner::Entity(owner)) = (&slot.key, &slot.owner) {
            reindex_list(s, owner, &slot.field);
        }
        Ok(())
    })?;
    doc.record_change(slot.change_key());
    Ok(Some(slot))
}

pub(crate) fn refers_to(value: &Value, id: &EntityId) -> bool {
    RefTuple::from_value(value).map_or(false, |r| r.is_local() && r.id == *id)
}

/// Structurally remove `id` from `slot` (no index update)
pub(crate) fn remove_from_slot(
    s: &mut DocState,
    registry: &Arc<SchemaRegistry>,
    id: &EntityId,
    slot: &OwnerSlot,
) -> Result<()> {
    let owner = match &slot.owner {
        SlotOwner::Root => {
            let roots = layout::roots();
            if s.replica.map_get(&roots, &slot.field).map_or(false, |v| refers_to(v, id)) {
                s.replica.map_remove(&roots, &slot.field)?;
            }
            return Ok(());
        }
        SlotOwner::Entity(owner) => owner,
    };

    let schema = s.schema_of(registry, owner)?;
    let spec = schema.require_field(&slot.field)?;
    match &spec.kind {
        FieldKind::Reference { .. } => {
            let fields = layout::fields(owner);
            if s.replica.map_get(&fields, &slot.field).map_or(false, |v| refers_to(v, id)) {
                s.replica.map_put(&fields, &slot.field, Value::Null)?;
            }
        }
        FieldKind::Collection { shape, .. } => {
            let container = layout::collection(owner, &slot.field);
            match shape {
                CollectionShape::List => {
                    let position = s
                        .replica
                        .array_values(&container)
                        .iter()
                        .position(|v| refers_to(v, id));
                    if let Some(position) = position {
                        s.replica.array_remove(&container, position)?;
                    }
                }
                CollectionShape::Map => {
                    let hinted = match &slot.key {
                        Some(SlotKey::Key(k))
                            if s.replica.map_get(&container, k).map_or(false, |v| refers_to(v, id)) =>
                        {
                            Some(k.clone())
                        }
                        _ => s
                            .replica
                            .map_entries(&container)
                            .into_iter()
                            .find(|(_, v)| refers_to(v, id))
                            .map(|(k, _)| k),
                    };
                    if let Some(key) = hinted {
                        s.replica.map_remove(&container, &key)?;
                    }
                }
                CollectionShape::Set => {
                    s.replica.map_remove(&container, id.as_str())?;
                }
            }
        }
        FieldKind::Scalar { .. } => {
            return Err(GraphError::OwnershipConflict {
                entity: id.clone(),
                reason: format!("{} is a scalar field", slot),
            })
        }
    }
    Ok(())
}

/// Structurally place `id` into `slot` and record the back-pointer
pub(crate) fn insert_into_slot(
    s: &mut DocState,
    registry: &Arc<SchemaRegistry>,
    id: &EntityId,
    slot: &OwnerSlot,
) -> Result<()> {
    let reference = RefTuple::local(id.clone()).to_value();
    let owner = match &slot.owner {
        SlotOwner::Root => {
            s.replica.map_put(&layout::roots(), &slot.field, reference)?;
            s.ownership.set(id.clone(), Some(slot.clone()));
            return Ok(());
        }
        SlotOwner::Entity(owner) => owner,
    };

    let schema = s.schema_of(registry, owner)?;
    let spec = schema.require_field(&slot.field)?;
    match (spec.shape(), &slot.key) {
        (None, _) => {
            s.replica.map_put(&layout::fields(owner), &slot.field, reference)?;
        }
        (Some(CollectionShape::List), key) => {
            let container = layout::collection(owner, &slot.field);
            let index = match key {
                Some(SlotKey::Index(i)) => (*i).min(s.replica.array_len(&container)),
                _ => s.replica.array_len(&container),
            };
            s.replica.array_insert(&container, index, reference)?;
        }
        (Some(CollectionShape::Map), Some(SlotKey::Key(key))) => {
            s.replica
                .map_put(&layout::collection(owner, &slot.field), key, reference)?;
        }
        (Some(CollectionShape::Map), _) => {
            return Err(GraphError::OwnershipConflict {
                entity: id.clone(),
                reason: format!("{} has no map key", slot),
            })
        }
        (Some(CollectionShape::Set), _) => {
            s.replica
                .map_put(&layout::collection(owner, &slot.field), id.as_str(), reference)?;
        }
    }
    s.ownership.set(id.clone(), Some(slot.clone()));
    if spec.shape() == Some(CollectionShape::List) {
        reindex_list(s, owner, &slot.field);
    }
    Ok(())
}

/// Refresh the index back-pointers of every element of an owned list
pub(crate) fn reindex_list(s: &mut DocState, owner: &EntityId, field: &str) {
    let values = s.replica.array_values(&layout::collection(owner, field));
    for (i, value) in values.iter().enumerate() {
        if let Some(r) = RefTuple::from_value(value).filter(RefTuple::is_local) {
            let slot = OwnerSlot::indexed(owner, field, i);
            if s.ownership.slot(&r.id) != Some(&slot) {
                s.ownership.set(r.id, Some(slot));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> EntityId {
        EntityId::from(s)
    }

    #[test]
    fn test_tracker_rollback() {
        let mut tracker = OwnershipTracker::default();
        tracker.set(id("a"), Some(OwnerSlot::root("main")));

        tracker.begin();
        let mark = tracker.mark();
        tracker.set(id("a"), None);
        tracker.set(id("b"), Some(OwnerSlot::indexed(&id("a"), "items", 0)));
        tracker.rollback_to(mark);
        tracker.end();

        assert_eq!(tracker.slot(&id("a")), Some(&OwnerSlot::root("main")));
        assert_eq!(tracker.slot(&id("b")), None);
    }

    #[test]
    fn test_cycle_detection() {
        let mut tracker = OwnershipTracker::default();
        // a owns b owns c
        tracker.set(id("b"), Some(OwnerSlot::field(&id("a"), "child")));
        tracker.set(id("c"), Some(OwnerSlot::field(&id("b"), "child")));

        assert!(tracker.would_cycle(&id("a"), &id("c")));
        assert!(tracker.would_cycle(&id("a"), &id("a")));
        assert!(!tracker.would_cycle(&id("c"), &id("a")));
    }

    #[test]
    fn test_slot_display() {
        assert_eq!(OwnerSlot::root("main").to_string(), "root:main");
        assert_eq!(OwnerSlot::indexed(&id("t"), "members", 2).to_string(), "t.members[2]");
        assert_eq!(OwnerSlot::keyed(&id("t"), "byRole", "lead").to_string(), "t.byRole[\"lead\"]");
    }
}
