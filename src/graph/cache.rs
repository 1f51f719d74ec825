//! Singleton cache: at most one live handle per entity id per document
//!
//! Entries are weak; a handle evicts its own entry when the last clone is
//! dropped (see `EntityInner`'s `Drop`).

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use super::entity::{Entity, EntityInner};
use super::reference::EntityId;

#[derive(Default)]
pub(crate) struct SingletonCache {
    entries: HashMap<EntityId, Weak<EntityInner>>,
}

impl SingletonCache {
    pub fn lookup(&self, id: &EntityId) -> Option<Entity> {
        self.entries
            .get(id)
            .and_then(Weak::upgrade)
            .map(Entity::from_inner)
    }

    /// Return the live handle for `id`, constructing and registering one if
    /// there is none
    pub fn get_or_insert_with(&mut self, id: &EntityId, make: impl FnOnce() -> Entity) -> Entity {
        if let Some(existing) = self.lookup(id) {
            return existing;
        }
        let entity = make();
        self.entries.insert(id.clone(), Arc::downgrade(entity.inner()));
        entity
    }

    /// Register a handle that moved in from another document
    pub fn adopt(&mut self, entity: &Entity) {
        self.entries
            .insert(entity.id().clone(), Arc::downgrade(entity.inner()));
    }

    pub fn remove(&mut self, id: &EntityId) {
        self.entries.remove(id);
    }

    /// Drop the entry for `id` unless a live handle has replaced it
    pub fn evict_if_dead(&mut self, id: &EntityId) {
        if self
            .entries
            .get(id)
            .map_or(false, |w| w.strong_count() == 0)
        {
            self.entries.remove(id);
        }
    }

    pub fn live_count(&self) -> usize {
        self.entries.values().filter(|w| w.strong_count() > 0).count()
    }
}
