use std::fmt;

use super::FieldView;
use crate::error::Result;
use crate::graph::entity::Entity;
use crate::graph::ownership::{self, OwnerSlot};
use crate::graph::reference::RefTuple;

/// String-keyed entity-valued field
#[derive(Clone)]
pub struct EntityMap {
    view: FieldView,
}

impl EntityMap {
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

    pub fn keys(&self) -> Vec<String> {
        let doc = self.view.track();
        doc.read(|s| {
            s.replica
                .map_entries(&self.view.container())
                .into_iter()
                .map(|(k, _)| k)
                .collect()
        })
    }

    pub fn contains_key(&self, key: &str) -> bool {
        let doc = self.view.track();
        doc.read(|s| s.replica.map_contains(&self.view.container(), key))
    }

    fn stored(&self, key: &str) -> Result<Option<RefTuple>> {
        let doc = self.view.document();
        let value = doc.read(|s| s.replica.map_get(&self.view.container(), key).cloned());
        value.map(|v| self.view.decode(&v)).transpose()
    }

    pub fn get(&self, key: &str) -> Result<Option<Entity>> {
        let doc = self.view.track();
        match self.stored(key)? {
            Some(r) => doc.try_resolve(&r).map(Some),
            None => Ok(None),
        }
    }

    /// Entries in key order
    pub fn entries(&self) -> Result<Vec<(String, Entity)>> {
        let doc = self.view.track();
        let raw = doc.read(|s| s.replica.map_entries(&self.view.container()));
        raw.into_iter()
            .map(|(k, v)| {
                let entity = doc.try_resolve(&self.view.decode(&v)?)?;
                Ok((k, entity))
            })
            .collect()
    }

    /// Put `item` under `key`, returning the entity it displaced. An owned
    /// item is moved out of its previous slot, including another key of
    /// this map.
    pub fn insert(&self, key: &str, item: &Entity) -> Result<Option<Entity>> {
        self.view.check_item(item)?;
        let doc = self.view.document();
        let owner = self.view.owner.id();
        let container = self.view.container();
        doc.transact(|| {
            let current = self.stored(key)?;
            let unchanged = item.document().same(&doc)
                && current.as_ref().map_or(false, |r| r.is_local() && r.id == *item.id());
            if unchanged {
                return Ok(None);
            }

            let displaced = match &current {
                Some(r) => doc.try_resolve(r).ok(),
                None => None,
            };
            let value = self.view.stage_item(&doc, item)?;
            if let Some(r) = &current {
                self.view.release(&doc, r);
            }
            doc.with_state(|s| s.replica.map_put(&container, key, value))?;
            if self.view.owned {
                ownership::inform_adoption(&doc, item.id(), OwnerSlot::keyed(owner, &self.view.field, key))?;
            }
            doc.record_change(self.view.change_key());
            Ok(displaced.filter(|e| e != item))
        })
    }

    /// Remove the entry under `key`; an owned entity is orphaned. Returns
    /// the removed entity when it can be resolved: an entry pointing into
    /// an unloaded document is still removed.
    pub fn remove(&self, key: &str) -> Result<Option<Entity>> {
        let doc = self.view.document();
        let container = self.view.container();
        doc.transact(|| {
            let Some(reference) = self.stored(key)? else {
                return Ok(None);
            };
            let entity = doc.try_resolve(&reference).ok();
            doc.with_state(|s| s.replica.map_remove(&container, key))?;
            self.view.release(&doc, &reference);
            doc.record_change(self.view.change_key());
            Ok(entity)
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

impl fmt::Debug for EntityMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityMap({:?}.{})", self.view.owner, self.view.field)
    }
}

#[cfg(test)]
mod tests {
    use crate::graph::entity::{Entity, Fields};
    use crate::graph::ownership::OwnerSlot;
    use crate::graph::schema::{ScalarKind, SchemaRegistry, TypeSchema};
    use std::sync::Arc;

    fn registry() -> Arc<SchemaRegistry> {
        let registry = SchemaRegistry::new();
        registry
            .define_type(TypeSchema::new("Role").scalar("title", ScalarKind::String))
            .unwrap();
        registry
            .define_type(TypeSchema::new("Org").owned_map("roles", "Role"))
            .unwrap();
        registry
    }

    fn role(registry: &Arc<SchemaRegistry>, title: &str) -> Entity {
        Entity::create(registry, "Role", Fields::new().scalar("title", title)).unwrap()
    }

    #[test]
    fn test_insert_and_displace() {
        let registry = registry();
        let org = Entity::create(&registry, "Org", Fields::new()).unwrap();
        let roles = org.map("roles").unwrap();
        let (lead, deputy) = (role(&registry, "lead"), role(&registry, "deputy"));

        assert_eq!(roles.insert("top", &lead).unwrap(), None);
        assert_eq!(lead.owner(), Some(OwnerSlot::keyed(org.id(), "roles", "top")));

        let displaced = roles.insert("top", &deputy).unwrap();
        assert_eq!(displaced, Some(lead.clone()));
        assert_eq!(lead.owner(), None);
        assert_eq!(roles.keys(), vec!["top"]);
    }

    #[test]
    fn test_rekey_moves_entry() {
        let registry = registry();
        let org = Entity::create(&registry, "Org", Fields::new()).unwrap();
        let roles = org.map("roles").unwrap();
        let lead = role(&registry, "lead");

        roles.insert("a", &lead).unwrap();
        roles.insert("b", &lead).unwrap();
        assert_eq!(roles.keys(), vec!["b"]);
        assert_eq!(roles.get("b").unwrap(), Some(lead.clone()));
        assert_eq!(lead.owner(), Some(OwnerSlot::keyed(org.id(), "roles", "b")));

        assert_eq!(roles.remove("b").unwrap(), Some(lead.clone()));
        assert_eq!(roles.remove("b").unwrap(), None);
        assert_eq!(lead.owner(), None);
    }

    #[test]
    fn test_entries_in_key_order() {
        let registry = registry();
        let org = Entity::create(&registry, "Org", Fields::new()).unwrap();
        let roles = org.map("roles").unwrap();
        roles.insert("z", &role(&registry, "last")).unwrap();
        roles.insert("a", &role(&registry, "first")).unwrap();

        let keys: Vec<String> = roles.entries().unwrap().into_iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["a", "z"]);
        roles.clear().unwrap();
        assert!(roles.is_empty());
    }
}
