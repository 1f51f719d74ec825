use std::fmt;

use super::FieldView;
use crate::error::{GraphError, Result};
use crate::graph::entity::Entity;
use crate::graph::ownership::{self, OwnerSlot};
use crate::graph::reference::RefTuple;

/// Ordered entity-valued field
#[derive(Clone)]
pub struct EntityList {
    view: FieldView,
}

impl EntityList {
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
        doc.read(|s| s.replica.array_len(&self.view.container()))
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Stored references, in order
    pub fn references(&self) -> Result<Vec<RefTuple>> {
        let doc = self.view.track();
        doc.read(|s| s.replica.array_values(&self.view.container()))
            .iter()
            .map(|v| self.view.decode(v))
            .collect()
    }

    pub fn get(&self, index: usize) -> Result<Entity> {
        let doc = self.view.track();
        let (value, len) = doc.read(|s| {
            let container = self.view.container();
            (
                s.replica.array_get(&container, index).cloned(),
                s.replica.array_len(&container),
            )
        });
        let value = value.ok_or(GraphError::IndexOutOfBounds { index, len })?;
        doc.try_resolve(&self.view.decode(&value)?)
    }

    pub fn to_vec(&self) -> Result<Vec<Entity>> {
        let doc = self.view.document();
        self.references()?
            .iter()
            .map(|r| doc.try_resolve(r))
            .collect()
    }

    pub fn index_of(&self, item: &Entity) -> Option<usize> {
        self.references()
            .ok()?
            .iter()
            .position(|r| r.id == *item.id())
    }

    pub fn contains(&self, item: &Entity) -> bool {
        self.index_of(item).is_some()
    }

    pub fn push(&self, item: &Entity) -> Result<()> {
        let len = self.view.document().read(|s| s.replica.array_len(&self.view.container()));
        self.insert(len, item)
    }

    /// Insert `item` at `index`. An owned item already in this list is
    /// moved: `index` is taken relative to the list with the item removed.
    pub fn insert(&self, index: usize, item: &Entity) -> Result<()> {
        self.view.check_item(item)?;
        let doc = self.view.document();
        let owner = self.view.owner.id();
        let container = self.view.container();
        doc.transact(|| {
            let len = doc.read(|s| s.replica.array_len(&container));
            if index > len {
                return Err(GraphError::IndexOutOfBounds { index, len });
            }
            let value = self.view.stage_item(&doc, item)?;
            let index = index.min(doc.read(|s| s.replica.array_len(&container)));
            doc.with_state(|s| s.replica.array_insert(&container, index, value))?;
            if self.view.owned {
                ownership::inform_adoption(&doc, item.id(), OwnerSlot::indexed(owner, &self.view.field, index))?;
                doc.with_state(|s| ownership::reindex_list(s, owner, &self.view.field));
            }
            doc.record_change(self.view.change_key());
            Ok(())
        })
    }

    /// Remove the item at `index`; an owned item is orphaned. The removed
    /// entity is returned when it can be resolved, so a reference into an
    /// unloaded document can still be dropped.
    pub fn remove(&self, index: usize) -> Result<Option<Entity>> {
        let doc = self.view.document();
        doc.transact(|| {
            let reference = self.take(index)?;
            Ok(doc.try_resolve(&reference).ok())
        })
    }

    fn take(&self, index: usize) -> Result<RefTuple> {
        let doc = self.view.document();
        let owner = self.view.owner.id();
        let container = self.view.container();
        let (value, len) = doc.read(|s| {
            (
                s.replica.array_get(&container, index).cloned(),
                s.replica.array_len(&container),
            )
        });
        let value = value.ok_or(GraphError::IndexOutOfBounds { index, len })?;
        let reference = self.view.decode(&value)?;

        doc.with_state(|s| s.replica.array_remove(&container, index))?;
        self.view.release(&doc, &reference);
        if self.view.owned {
            doc.with_state(|s| ownership::reindex_list(s, owner, &self.view.field));
        }
        doc.record_change(self.view.change_key());
        Ok(reference)
    }

    /// Replace the item at `index`, returning the one it displaced when it
    /// can be resolved
    pub fn set(&self, index: usize, item: &Entity) -> Result<Option<Entity>> {
        self.view.check_item(item)?;
        let doc = self.view.document();
        doc.transact(|| {
            let current = self.references()?;
            let len = current.len();
            let stored = current.get(index).ok_or(GraphError::IndexOutOfBounds { index, len })?;
            if stored.id == *item.id() {
                return Ok(Some(item.clone()));
            }
            let displaced = self.remove(index)?;
            let len = doc.read(|s| s.replica.array_len(&self.view.container()));
            self.insert(index.min(len), item)?;
            Ok(displaced)
        })
    }

    /// Move the item at `from` so that it ends up at `to`
    pub fn move_item(&self, from: usize, to: usize) -> Result<()> {
        let doc = self.view.document();
        doc.transact(|| {
            let item = self.get(from)?;
            self.take(from)?;
            let len = doc.read(|s| s.replica.array_len(&self.view.container()));
            if to > len {
                return Err(GraphError::IndexOutOfBounds { index: to, len: len + 1 });
            }
            self.insert(to, &item)
        })
    }

    pub fn clear(&self) -> Result<()> {
        let doc = self.view.document();
        let container = self.view.container();
        doc.transact(|| {
            let values = doc.read(|s| s.replica.array_values(&container));
            if values.is_empty() {
                return Ok(());
            }
            for index in (0..values.len()).rev() {
                doc.with_state(|s| s.replica.array_remove(&container, index))?;
            }
            for value in &values {
                if let Some(reference) = RefTuple::from_value(value) {
                    self.view.release(&doc, &reference);
                }
            }
            doc.record_change(self.view.change_key());
            Ok(())
        })
    }
}

impl fmt::Debug for EntityList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EntityList({:?}.{})", self.view.owner, self.view.field)
    }
}

#[cfg(test)]
mod tests {
    use crate::graph::entity::{Entity, Fields};
    use crate::graph::ownership::OwnerSlot;
    use crate::graph::schema::{ScalarKind, SchemaRegistry, TypeSchema};
    use crate::GraphError;
    use std::sync::Arc;

    fn registry() -> Arc<SchemaRegistry> {
        let registry = SchemaRegistry::new();
        registry
            .define_type(TypeSchema::new("Item").scalar("label", ScalarKind::String))
            .unwrap();
        registry
            .define_type(
                TypeSchema::new("Bin")
                    .owned_list("items", "Item")
                    .ref_list("favorites", "Item"),
            )
            .unwrap();
        registry
    }

    fn item(registry: &Arc<SchemaRegistry>, label: &str) -> Entity {
        Entity::create(registry, "Item", Fields::new().scalar("label", label)).unwrap()
    }

    fn labels(bin: &Entity) -> Vec<String> {
        bin.list("items")
            .unwrap()
            .to_vec()
            .unwrap()
            .iter()
            .map(|e| e.get_scalar("label").unwrap().as_str().unwrap().to_string())
            .collect()
    }

    #[test]
    fn test_push_tracks_indices() {
        let registry = registry();
        let bin = Entity::create(&registry, "Bin", Fields::new()).unwrap();
        let items = bin.list("items").unwrap();
        let (a, b) = (item(&registry, "a"), item(&registry, "b"));

        items.push(&a).unwrap();
        items.insert(0, &b).unwrap();
        assert_eq!(labels(&bin), vec!["b", "a"]);
        assert_eq!(a.owner(), Some(OwnerSlot::indexed(bin.id(), "items", 1)));
        assert_eq!(b.owner(), Some(OwnerSlot::indexed(bin.id(), "items", 0)));
    }

    #[test]
    fn test_move_within_list_reinterprets_index() {
        let registry = registry();
        let bin = Entity::create(&registry, "Bin", Fields::new()).unwrap();
        let items = bin.list("items").unwrap();
        let all: Vec<Entity> = ["a", "b", "c"].iter().map(|l| item(&registry, l)).collect();
        for e in &all {
            items.push(e).unwrap();
        }

        // Re-inserting `a` at 2 places it after the shift
        items.insert(2, &all[0]).unwrap();
        assert_eq!(labels(&bin), vec!["b", "c", "a"]);
        assert_eq!(items.len(), 3);

        items.move_item(2, 0).unwrap();
        assert_eq!(labels(&bin), vec!["a", "b", "c"]);
        assert_eq!(all[2].owner(), Some(OwnerSlot::indexed(bin.id(), "items", 2)));
    }

    #[test]
    fn test_remove_orphans_and_bounds() {
        let registry = registry();
        let bin = Entity::create(&registry, "Bin", Fields::new()).unwrap();
        let items = bin.list("items").unwrap();
        let a = item(&registry, "a");
        items.push(&a).unwrap();

        assert!(matches!(items.remove(5), Err(GraphError::IndexOutOfBounds { index: 5, len: 1 })));
        assert!(matches!(items.insert(3, &a), Err(GraphError::IndexOutOfBounds { .. })));

        let removed = items.remove(0).unwrap();
        assert_eq!(removed, Some(a.clone()));
        assert_eq!(a.owner(), None);
        assert!(items.is_empty());
    }

    #[test]
    fn test_non_owning_list_shares_items() {
        let registry = registry();
        let bin = Entity::create(&registry, "Bin", Fields::new()).unwrap();
        let a = item(&registry, "a");
        bin.list("items").unwrap().push(&a).unwrap();

        let favorites = bin.list("favorites").unwrap();
        favorites.push(&a).unwrap();
        favorites.push(&a).unwrap();
        assert_eq!(favorites.len(), 2);
        assert_eq!(a.owner(), Some(OwnerSlot::indexed(bin.id(), "items", 0)));

        favorites.clear().unwrap();
        assert!(favorites.is_empty());
        assert!(a.owner().is_some());
    }

    #[test]
    fn test_wrong_item_type_rejected() {
        let registry = registry();
        let bin = Entity::create(&registry, "Bin", Fields::new()).unwrap();
        let other = Entity::create(&registry, "Bin", Fields::new()).unwrap();
        assert!(matches!(
            bin.list("items").unwrap().push(&other),
            Err(GraphError::SchemaViolation { .. })
        ));
    }
}
