//! Entity handles
//!
//! An `Entity` is the live, schema-typed view of one entity. Handles are
//! unique per document (see `cache`), so `==` is identity. Field access goes
//! through the schema: scalars are validated before they reach the
//! substrate, single references and collections dispatch to the ownership
//! protocol or the reference protocol depending on the field kind.
//!
//! Entities constructed with `Entity::create` are ephemeral: they live in a
//! private scratch document until they are placed into a replicated one, at
//! which point the same handle is rebound there.

use parking_lot::RwLock;
use std::fmt;
use std::sync::Arc;

use super::collection::{EntityList, EntityMap, EntitySet};
use super::document::Document;
use super::layout;
use super::notify::{ChangeKey, SubscriptionId};
use super::ownership::{self, OwnerSlot, SlotOwner};
use super::reference::{self, EntityId, RefTuple};
use super::schema::{CollectionShape, FieldKind, SchemaRegistry, TypeSchema};
use crate::convergent::Value;
use crate::error::{GraphError, Result};

/// A value supplied for one field, at construction or through `assign`
#[derive(Clone, Debug)]
pub enum FieldInput {
    Scalar(Value),
    Entity(Option<Entity>),
    List(Vec<Entity>),
    Map(Vec<(String, Entity)>),
    Set(Vec<Entity>),
}

/// Initial field values for `Entity::create`
#[derive(Clone, Debug, Default)]
pub struct Fields {
    values: Vec<(String, FieldInput)>,
}

impl Fields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, input: FieldInput) -> Self {
        self.values.push((name.into(), input));
        self
    }

    pub fn scalar(self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.with(name, FieldInput::Scalar(value.into()))
    }

    pub fn entity(self, name: impl Into<String>, entity: &Entity) -> Self {
        self.with(name, FieldInput::Entity(Some(entity.clone())))
    }

    pub fn list(self, name: impl Into<String>, items: impl IntoIterator<Item = Entity>) -> Self {
        self.with(name, FieldInput::List(items.into_iter().collect()))
    }

    pub fn map<K: Into<String>>(self, name: impl Into<String>, entries: impl IntoIterator<Item = (K, Entity)>) -> Self {
        let entries = entries.into_iter().map(|(k, e)| (k.into(), e)).collect();
        self.with(name, FieldInput::Map(entries))
    }

    pub fn set(self, name: impl Into<String>, items: impl IntoIterator<Item = Entity>) -> Self {
        self.with(name, FieldInput::Set(items.into_iter().collect()))
    }
}

/// The value of a field, as returned by `Entity::get`
#[derive(Debug)]
pub enum FieldValue {
    Scalar(Value),
    Entity(Option<Entity>),
    List(EntityList),
    Map(EntityMap),
    Set(EntitySet),
}

impl FieldValue {
    pub fn into_scalar(self) -> Option<Value> {
        match self {
            FieldValue::Scalar(v) => Some(v),
            _ => None,
        }
    }

    pub fn into_entity(self) -> Option<Entity> {
        match self {
            FieldValue::Entity(e) => e,
            _ => None,
        }
    }
}

pub(crate) struct EntityInner {
    id: EntityId,
    schema: Arc<TypeSchema>,
    /// Document this handle currently reads and writes through
    binding: RwLock<Document>,
}

impl Drop for EntityInner {
    fn drop(&mut self) {
        self.binding.get_mut().cache().evict_if_dead(&self.id);
    }
}

#[derive(Clone)]
pub struct Entity {
    inner: Arc<EntityInner>,
}

impl PartialEq for Entity {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Entity {}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.type_name(), self.id())
    }
}

impl Entity {
    /// Construct an ephemeral entity.
    ///
    /// Every required scalar must be supplied (or have a default); entity
    /// valued fields may be filled in, which moves owned children into the
    /// new entity's subtree.
    pub fn create(registry: &Arc<SchemaRegistry>, type_name: &str, fields: Fields) -> Result<Entity> {
        let schema = registry.get(type_name)?;
        let mut scalars: Vec<(String, Value)> = Vec::new();
        let mut linked: Vec<(String, FieldInput)> = Vec::new();

        for (name, input) in fields.values {
            let spec = schema.require_field(&name)?;
            let given_twice = scalars.iter().any(|(n, _)| *n == name) || linked.iter().any(|(n, _)| *n == name);
            if given_twice {
                return Err(GraphError::schema(type_name, &name, "given twice"));
            }
            match (&spec.kind, input) {
                (FieldKind::Scalar { .. }, FieldInput::Scalar(value)) => {
                    schema.validate_scalar(&name, &value)?;
                    scalars.push((name, value));
                }
                (FieldKind::Reference { .. }, input @ FieldInput::Entity(_))
                | (FieldKind::Collection { shape: CollectionShape::List, .. }, input @ FieldInput::List(_))
                | (FieldKind::Collection { shape: CollectionShape::Map, .. }, input @ FieldInput::Map(_))
                | (FieldKind::Collection { shape: CollectionShape::Set, .. }, input @ FieldInput::Set(_)) => {
                    linked.push((name, input));
                }
                _ => return Err(GraphError::schema(type_name, &name, "value does not match the field kind")),
            }
        }

        for spec in schema.fields() {
            if !spec.is_scalar() || scalars.iter().any(|(n, _)| *n == spec.name) {
                continue;
            }
            match spec.initial_value() {
                Some(value) => scalars.push((spec.name.clone(), value)),
                None => return Err(GraphError::schema(type_name, &spec.name, "required field missing")),
            }
        }

        let id = EntityId::new();
        let scratch = Document::scratch(registry.clone());
        scratch.transact(|| {
            scratch.with_state(|s| -> Result<()> {
                s.replica
                    .map_put(&layout::entities(), id.as_str(), Value::string(type_name))?;
                let container = layout::fields(&id);
                for (name, value) in scalars {
                    s.replica.map_put(&container, &name, value)?;
                }
                for spec in schema.fields() {
                    if matches!(spec.kind, FieldKind::Reference { .. }) {
                        s.replica.map_put(&container, &spec.name, Value::Null)?;
                    }
                }
                Ok(())
            })
        })?;

        let entity = scratch.resolve_local(&id)?;
        if !linked.is_empty() {
            scratch.transact(|| {
                for (name, input) in linked {
                    entity.assign(&name, input)?;
                }
                Ok(())
            })?;
        }
        log::trace!("Created ephemeral {} {}", type_name, id);
        Ok(entity)
    }

    pub(crate) fn bind(id: EntityId, schema: Arc<TypeSchema>, doc: Document) -> Entity {
        Entity {
            inner: Arc::new(EntityInner {
                id,
                schema,
                binding: RwLock::new(doc),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<EntityInner>) -> Entity {
        Entity { inner }
    }

    pub(crate) fn inner(&self) -> &Arc<EntityInner> {
        &self.inner
    }

    pub(crate) fn rebind(&self, doc: Document) {
        *self.inner.binding.write() = doc;
    }

    pub fn id(&self) -> &EntityId {
        &self.inner.id
    }

    pub fn type_name(&self) -> &str {
        self.inner.schema.name()
    }

    pub fn schema(&self) -> &Arc<TypeSchema> {
        &self.inner.schema
    }

    /// The document this entity currently lives in
    pub fn document(&self) -> Document {
        self.inner.binding.read().clone()
    }

    /// Not yet placed into a replicated document
    pub fn is_ephemeral(&self) -> bool {
        self.document().is_scratch()
    }

    pub fn owner(&self) -> Option<OwnerSlot> {
        self.document().owner_slot(self.id())
    }

    /// The entity owning this one, if it is held by an entity field
    pub fn parent(&self) -> Result<Option<Entity>> {
        let doc = self.document();
        match doc.owner_slot(self.id()).as_ref().and_then(OwnerSlot::owner_entity) {
            Some(owner) => doc.resolve_local(owner).map(Some),
            None => Ok(None),
        }
    }

    /// The reference `doc` would store to point at this entity
    pub fn reference_in(&self, doc: &Document) -> Result<RefTuple> {
        reference::reference_of(self, doc)
    }

    // ---- Generic dispatch ----

    pub fn get(&self, field: &str) -> Result<FieldValue> {
        let spec = self.inner.schema.require_field(field)?;
        Ok(match &spec.kind {
            FieldKind::Scalar { .. } => FieldValue::Scalar(self.get_scalar(field)?),
            FieldKind::Reference { .. } => FieldValue::Entity(self.get_ref(field)?),
            FieldKind::Collection { shape, .. } => match shape {
                CollectionShape::List => FieldValue::List(self.list(field)?),
                CollectionShape::Map => FieldValue::Map(self.map(field)?),
                CollectionShape::Set => FieldValue::Set(self.entity_set(field)?),
            },
        })
    }

    /// Write any field. Collections are replaced wholesale; owned members
    /// that are not carried over are orphaned.
    pub fn assign(&self, field: &str, input: FieldInput) -> Result<()> {
        let doc = self.document();
        match input {
            FieldInput::Scalar(value) => self.set(field, value),
            FieldInput::Entity(target) => self.set_ref(field, target.as_ref()),
            FieldInput::List(items) => {
                let list = self.list(field)?;
                doc.transact(|| {
                    list.clear()?;
                    for item in &items {
                        list.push(item)?;
                    }
                    Ok(())
                })
            }
            FieldInput::Map(entries) => {
                let map = self.map(field)?;
                doc.transact(|| {
                    map.clear()?;
                    for (key, item) in &entries {
                        map.insert(key, item)?;
                    }
                    Ok(())
                })
            }
            FieldInput::Set(items) => {
                let set = self.entity_set(field)?;
                doc.transact(|| {
                    set.clear()?;
                    for item in &items {
                        set.add(item)?;
                    }
                    Ok(())
                })
            }
        }
    }

    // ---- Scalars ----

    pub fn get_scalar(&self, field: &str) -> Result<Value> {
        let spec = self.inner.schema.require_field(field)?;
        if !spec.is_scalar() {
            return Err(GraphError::schema(self.type_name(), field, "not a scalar field"));
        }
        let doc = self.document();
        doc.track_access(self.id(), field);
        let stored = doc.read(|s| s.replica.map_get(&layout::fields(self.id()), field).cloned());
        Ok(stored.or_else(|| spec.initial_value()).unwrap_or(Value::Null))
    }

    pub fn set(&self, field: &str, value: impl Into<Value>) -> Result<()> {
        let value = value.into();
        self.inner.schema.validate_scalar(field, &value)?;
        let doc = self.document();
        doc.transact(|| {
            doc.with_state(|s| s.replica.map_put(&layout::fields(self.id()), field, value))?;
            doc.record_change(ChangeKey::field(self.id(), field));
            Ok(())
        })
    }

    // ---- Single references ----

    fn reference_field(&self, field: &str) -> Result<bool> {
        match &self.inner.schema.require_field(field)?.kind {
            FieldKind::Reference { owned, .. } => Ok(*owned),
            _ => Err(GraphError::schema(self.type_name(), field, "not a reference field")),
        }
    }

    /// The stored reference tuple, without resolving it
    pub fn reference(&self, field: &str) -> Result<Option<RefTuple>> {
        self.reference_field(field)?;
        let doc = self.document();
        doc.track_access(self.id(), field);
        Ok(doc.read(|s| {
            s.replica
                .map_get(&layout::fields(self.id()), field)
                .and_then(RefTuple::from_value)
        }))
    }

    pub fn get_ref(&self, field: &str) -> Result<Option<Entity>> {
        match self.reference(field)? {
            Some(r) => self.document().try_resolve(&r).map(Some),
            None => Ok(None),
        }
    }

    /// Like `get_ref`, waiting for a dependency document if needed
    pub async fn resolve_ref(&self, field: &str) -> Result<Option<Entity>> {
        match self.reference(field)? {
            Some(r) => {
                let doc = self.document();
                doc.resolve(&r).await.map(Some)
            }
            None => Ok(None),
        }
    }

    pub fn set_ref(&self, field: &str, target: Option<&Entity>) -> Result<()> {
        let owned = self.reference_field(field)?;
        if let Some(t) = target {
            self.inner.schema.validate_target(field, t.type_name())?;
        }
        let doc = self.document();
        let container = layout::fields(self.id());
        doc.transact(|| {
            let current = doc.read(|s| s.replica.map_get(&container, field).and_then(RefTuple::from_value));
            let value = if owned {
                if let Some(t) = target {
                    let unchanged = t.document().same(&doc)
                        && current.as_ref().map_or(false, |r| r.is_local() && r.id == *t.id());
                    if unchanged {
                        return Ok(());
                    }
                    ownership::detach_for_adoption(&doc, &SlotOwner::Entity(self.id().clone()), t)?;
                }
                if let Some(r) = current.as_ref().filter(|r| r.is_local()) {
                    ownership::inform_orphanization(&doc, &r.id);
                }
                match target {
                    Some(t) => RefTuple::local(t.id().clone()).to_value(),
                    None => Value::Null,
                }
            } else {
                match target {
                    Some(t) => reference::reference_of(t, &doc)?.to_value(),
                    None => Value::Null,
                }
            };

            doc.with_state(|s| s.replica.map_put(&container, field, value))?;
            if let (true, Some(t)) = (owned, target) {
                ownership::inform_adoption(&doc, t.id(), OwnerSlot::field(self.id(), field))?;
            }
            doc.record_change(ChangeKey::field(self.id(), field));
            Ok(())
        })
    }

    // ---- Collections ----

    fn collection_field(&self, field: &str, expected: CollectionShape) -> Result<(bool, Option<String>)> {
        let spec = self.inner.schema.require_field(field)?;
        match &spec.kind {
            FieldKind::Collection { shape, owned, target } if *shape == expected => Ok((*owned, target.clone())),
            _ => Err(GraphError::schema(
                self.type_name(),
                field,
                format!("not a {:?} field", expected).to_lowercase(),
            )),
        }
    }

    pub fn list(&self, field: &str) -> Result<EntityList> {
        let (owned, target) = self.collection_field(field, CollectionShape::List)?;
        Ok(EntityList::new(self.clone(), field, owned, target))
    }

    pub fn map(&self, field: &str) -> Result<EntityMap> {
        let (owned, target) = self.collection_field(field, CollectionShape::Map)?;
        Ok(EntityMap::new(self.clone(), field, owned, target))
    }

    pub fn entity_set(&self, field: &str) -> Result<EntitySet> {
        let (owned, target) = self.collection_field(field, CollectionShape::Set)?;
        Ok(EntitySet::new(self.clone(), field, owned, target))
    }

    // ---- Notification ----

    /// Call `callback` once per committed transaction that changes `field`
    pub fn subscribe(
        &self,
        field: &str,
        callback: impl Fn(&ChangeKey) + Send + Sync + 'static,
    ) -> Result<SubscriptionId> {
        self.inner.schema.require_field(field)?;
        Ok(self.document().subscribe_to_changes(self.id(), field, callback))
    }

    pub fn unsubscribe(&self, id: &SubscriptionId) -> bool {
        self.document().unsubscribe(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::schema::ScalarKind;

    fn registry() -> Arc<SchemaRegistry> {
        let registry = SchemaRegistry::new();
        registry
            .define_type(
                TypeSchema::new("Note")
                    .scalar("title", ScalarKind::String)
                    .nullable("body", ScalarKind::String)
                    .scalar_with_default("pinned", ScalarKind::Bool, Value::bool(false))
                    .owned_reference("attachment", "Note")
                    .reference("related", "Note"),
            )
            .unwrap();
        registry
    }

    #[test]
    fn test_create_applies_defaults() {
        let registry = registry();
        let note = Entity::create(&registry, "Note", Fields::new().scalar("title", "Hi")).unwrap();

        assert!(note.is_ephemeral());
        assert_eq!(note.get_scalar("title").unwrap(), Value::string("Hi"));
        assert_eq!(note.get_scalar("body").unwrap(), Value::Null);
        assert_eq!(note.get_scalar("pinned").unwrap(), Value::bool(false));
        assert_eq!(note.get_ref("attachment").unwrap(), None);
    }

    #[test]
    fn test_create_rejects_bad_fields() {
        let registry = registry();
        assert!(matches!(
            Entity::create(&registry, "Note", Fields::new()),
            Err(GraphError::SchemaViolation { .. })
        ));
        assert!(Entity::create(&registry, "Note", Fields::new().scalar("title", 3)).is_err());
        assert!(Entity::create(&registry, "Note", Fields::new().scalar("title", "x").scalar("nope", 1)).is_err());
        assert!(matches!(
            Entity::create(&registry, "Nope", Fields::new()),
            Err(GraphError::UnknownType(_))
        ));
    }

    #[test]
    fn test_scalar_writes_are_validated() {
        let registry = registry();
        let note = Entity::create(&registry, "Note", Fields::new().scalar("title", "Hi")).unwrap();

        note.set("title", "Bye").unwrap();
        assert_eq!(note.get_scalar("title").unwrap(), Value::string("Bye"));
        assert!(note.set("title", Value::Null).is_err());
        assert!(note.set("attachment", "x").is_err());
        assert_eq!(note.get_scalar("title").unwrap(), Value::string("Bye"));
    }

    #[test]
    fn test_owned_reference_between_ephemerals() {
        let registry = registry();
        let parent = Entity::create(&registry, "Note", Fields::new().scalar("title", "parent")).unwrap();
        let child = Entity::create(&registry, "Note", Fields::new().scalar("title", "child")).unwrap();

        parent.set_ref("attachment", Some(&child)).unwrap();
        assert!(child.document().same(&parent.document()));
        assert_eq!(parent.get_ref("attachment").unwrap(), Some(child.clone()));
        assert_eq!(child.parent().unwrap(), Some(parent.clone()));

        // A note cannot own its own owner
        assert!(matches!(
            child.set_ref("attachment", Some(&parent)),
            Err(GraphError::OwnershipCycle { .. })
        ));
        assert!(matches!(
            parent.set_ref("attachment", Some(&parent)),
            Err(GraphError::OwnershipCycle { .. })
        ));
    }

    #[test]
    fn test_replacing_owned_reference_orphans_previous() {
        let registry = registry();
        let parent = Entity::create(&registry, "Note", Fields::new().scalar("title", "p")).unwrap();
        let first = Entity::create(&registry, "Note", Fields::new().scalar("title", "1")).unwrap();
        let second = Entity::create(&registry, "Note", Fields::new().scalar("title", "2")).unwrap();

        parent.set_ref("attachment", Some(&first)).unwrap();
        parent.set_ref("attachment", Some(&second)).unwrap();
        assert_eq!(first.owner(), None);
        assert_eq!(second.owner(), Some(OwnerSlot::field(parent.id(), "attachment")));

        parent.set_ref("attachment", None).unwrap();
        assert_eq!(second.owner(), None);
    }

    #[test]
    fn test_get_dispatches_on_field_kind() {
        let registry = registry();
        let note = Entity::create(&registry, "Note", Fields::new().scalar("title", "Hi")).unwrap();
        assert_eq!(note.get("title").unwrap().into_scalar(), Some(Value::string("Hi")));
        assert!(note.get("attachment").unwrap().into_entity().is_none());
        assert!(note.get("missing").is_err());
    }
}
