//! Change notification
//!
//! Two channels: reads report field accesses synchronously to registered
//! observers (so a reactive layer can build dependency sets), and committed
//! transactions deliver one batch of changed keys per commit to observers
//! and to per-field subscriptions.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use uuid::Uuid;

use super::reference::EntityId;

/// Something that changed in a committed transaction
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum ChangeKey {
    Field { entity: EntityId, field: String },
    Root(String),
}

impl ChangeKey {
    pub fn field(entity: &EntityId, field: &str) -> Self {
        ChangeKey::Field {
            entity: entity.clone(),
            field: field.to_string(),
        }
    }

    pub fn entity(&self) -> Option<&EntityId> {
        match self {
            ChangeKey::Field { entity, .. } => Some(entity),
            ChangeKey::Root(_) => None,
        }
    }
}

/// Hook for a reactive layer
pub trait ChangeObserver: Send + Sync {
    /// A field was read. Called synchronously, on the reading thread.
    fn field_accessed(&self, _document: Uuid, _entity: &EntityId, _field: &str) {}

    /// A transaction committed (or a remote batch merged) on `document`
    fn changes_committed(&self, document: Uuid, changes: &[ChangeKey]);
}

pub type SubscriptionId = Uuid;
pub type ObserverId = Uuid;

pub(crate) type ChangeCallback = Arc<dyn Fn(&ChangeKey) + Send + Sync>;

#[derive(Clone)]
pub(crate) struct Subscription {
    pub entity: EntityId,
    pub field: String,
    pub callback: ChangeCallback,
}

#[derive(Default)]
pub(crate) struct Notifier {
    observers: HashMap<ObserverId, Arc<dyn ChangeObserver>>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
}

impl Notifier {
    pub fn add_observer(&mut self, observer: Arc<dyn ChangeObserver>) -> ObserverId {
        let id = Uuid::new_v4();
        self.observers.insert(id, observer);
        id
    }

    pub fn remove_observer(&mut self, id: &ObserverId) -> bool {
        self.observers.remove(id).is_some()
    }

    pub fn observers(&self) -> Vec<Arc<dyn ChangeObserver>> {
        self.observers.values().cloned().collect()
    }

    pub fn subscribe(&mut self, subscription: Subscription) -> SubscriptionId {
        let id = Uuid::new_v4();
        self.subscriptions.insert(id, subscription);
        id
    }

    pub fn insert_subscription(&mut self, id: SubscriptionId, subscription: Subscription) {
        self.subscriptions.insert(id, subscription);
    }

    pub fn unsubscribe(&mut self, id: &SubscriptionId) -> bool {
        self.subscriptions.remove(id).is_some()
    }

    /// Remove and return the subscriptions on any of `entities`
    pub fn take_subscriptions(&mut self, entities: &HashSet<EntityId>) -> Vec<(SubscriptionId, Subscription)> {
        let ids: Vec<SubscriptionId> = self
            .subscriptions
            .iter()
            .filter(|(_, s)| entities.contains(&s.entity))
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter_map(|id| self.subscriptions.remove(&id).map(|s| (id, s)))
            .collect()
    }

    /// Callbacks to run for a batch, one entry per matching subscription
    pub fn matching(&self, changes: &[ChangeKey]) -> Vec<(ChangeCallback, ChangeKey)> {
        let mut out = Vec::new();
        for sub in self.subscriptions.values() {
            let hit = changes.iter().find(|c| match c {
                ChangeKey::Field { entity, field } => *entity == sub.entity && *field == sub.field,
                ChangeKey::Root(_) => false,
            });
            if let Some(key) = hit {
                out.push((sub.callback.clone(), key.clone()));
            }
        }
        out
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }
}

/// Order-preserving dedup of a transaction's change log
pub(crate) fn dedup(changes: Vec<ChangeKey>) -> Vec<ChangeKey> {
    let mut seen = HashSet::new();
    changes.into_iter().filter(|c| seen.insert(c.clone())).collect()
}
