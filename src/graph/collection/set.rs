use std::fmt;

use super::FieldView;
use crate::error::Result;
use crate::graph::entity::Entity;
use crate::graph::ownership::{self, OwnerSlot};
use crate::graph::reference::RefTuple;

/// Unordered entity-valued field, keyed by member id
#[derive(Clone)]
pub struct EntitySet {
    view: FieldView,
}

impl EntitySet {
    pub(crate) fn new(owner: Entity, field: &str, owned: bool, target: Option<String>) -> Self {
        Self {
            view: FieldView::new(owner, field, owned, target),
        }
    }

    pub fn owner(&self) -> &Entity {
        &self.view.owner
    }

    pub fn field(&self) -> &str {
        &self.view.field
    }

    pub fn is_owned(&self) -> bool {
        self.view.owned
    }

    pub fn len(&self) -> usize {
        let doc = self.view.track();
        doc.read(|s| s.replica.map_len(&self.view.container()))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, item: &Entity) -> bool {
        let doc = self.view.track();
        doc.read(|s| s.replica.map_contains(&self.view.container(), item.id().as_str()))
    }

    /// Members in id order
    pub fn to_vec(&self) -> Result<Vec<Entity>> {
        let doc = self.view.track();
        let raw = doc.read(|s| s.replica.map_entries(&self.view.container()));
        raw.iter()
            .map(|(_, v)| doc.try_resolve(&self.view.decode(v)?))
            .collect()
    }

    /// Add `item`; false if it was already a member
    pub fn add(&self, item: &Entity) -> Result<bool> {
        self.view.check_item(item)?;
        let doc = self.view.document();
        let container = self.view.container();
        doc.transact(|| {
            let member = doc.read(|s| s.replica.map_contains(&container, item.id().as_str()));
            if member {
                return Ok(false);
            }
            let value = if self.view.owned {
                let slot = OwnerSlot::field(self.view.owner.id(), &self.view.field);
                ownership::request_adoption(&doc, item, slot)?;
                RefTuple::local(item.id().clone()).to_value()
            } else {
                self.view.stage_item(&doc, item)?
            };
            doc.with_state(|s| s.replica.map_put(&container, item.id().as_str(), value))?;
            doc.record_change(self.view.change_key());
            Ok(true)
        })
    }

    /// Remove `item`; an owned member is orphaned. False if it was absent.
    pub fn remove(&self, item: &Entity) -> Result<bool> {
        let doc = self.view.document();
        let container = self.view.container();
        doc.transact(|| {
            let value = doc.read(|s| s.replica.map_get(&container, item.id().as_str()).cloned());
            let Some(value) = value else {
                return Ok(false);
            };
            doc.with_state(|s| s.replica.map_remove(&container, item.id().as_str()))?;
            if let Some(reference) = RefTuple::from_value(&value) {
                self.view.release(&doc, &reference);
            }
            doc.record_change(self.view.change_key());
            Ok(true)
        })
    }

    pub fn clear(&self) -> Result<()> {
        let doc = self.view.document();
        let container = self.view.container();
        doc.transact(|| {
            let entries = doc.read(|s| s.replica.map_entries(&container));
            if entries.is_empty() {
                return Ok(());
            }
            for (key, value) in &entries {
                doc.with_state(|s| s.replica.map_remove(&container, key))?;
                if let Some(reference) = RefTuple::from_value(value) {
                    self.view.release(&doc, &reference);
                }
            }
            doc.record_change(self.view.change_key());
            Ok(())
        })
    }
}

impl fmt::Debug for EntitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntitySet({:?}.{})", self.view.owner, self.view.field)
    }
}
