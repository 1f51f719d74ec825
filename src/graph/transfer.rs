//! Moving ephemeral entities into another document
//!
//! An ephemeral entity lives in a private scratch document. When it is
//! placed into a slot of another document (or referenced from one), its
//! transfer closure moves with it: the entity, everything it owns, and any
//! free ephemeral entity those reference. Rows are copied with their
//! references rewritten for the destination, live handles are rebound, and
//! the scratch document keeps a forwarding entry so stale lookups still find
//! the entity. Everything is journaled on the destination's transaction.

use std::collections::HashSet;

use super::document::{DocState, Document};
use super::entity::Entity;
use super::layout;
use super::ownership::OwnerSlot;
use super::reference::{self, EntityId, RefTuple};
use super::schema::{CollectionShape, FieldKind, SchemaRegistry};
use crate::convergent::Value;
use crate::error::{GraphError, Result};

enum Content {
    Single(Option<RefTuple>),
    List(Vec<RefTuple>),
    Keyed(Vec<(String, RefTuple)>),
}

struct FieldContent {
    field: String,
    owned: bool,
    shape: Option<CollectionShape>,
    content: Content,
}

impl FieldContent {
    fn references(&self) -> Vec<&RefTuple> {
        match &self.content {
            Content::Single(r) => r.iter().collect(),
            Content::List(items) => items.iter().collect(),
            Content::Keyed(entries) => entries.iter().map(|(_, r)| r).collect(),
        }
    }
}

/// One entity's data, read out of its source document
struct Row {
    id: EntityId,
    type_name: String,
    scalars: Vec<(String, Value)>,
    links: Vec<FieldContent>,
}

impl Row {
    fn owned_children(&self) -> impl Iterator<Item = &EntityId> {
        self.links
            .iter()
            .filter(|f| f.owned)
            .flat_map(FieldContent::references)
            .filter(|r| r.is_local())
            .map(|r| &r.id)
    }

    fn referenced(&self) -> impl Iterator<Item = &EntityId> {
        self.links
            .iter()
            .filter(|f| !f.owned)
            .flat_map(FieldContent::references)
            .filter(|r| r.is_local())
            .map(|r| &r.id)
    }
}

/// Move `root` (bound to a scratch document, and unowned there) and its
/// transfer closure into `dst`
pub(crate) fn absorb(dst: &Document, root: &Entity) -> Result<()> {
    let src = root.document();
    if src.same(dst) {
        return Ok(());
    }
    if !src.is_scratch() {
        return Err(GraphError::DocumentMismatch(format!(
            "{} already lives in document {}",
            root.id(),
            src.id()
        )));
    }

    dst.transact(|| {
        let rows = collect_closure(&src, root.id())?;
        let closure: HashSet<EntityId> = rows.iter().map(|r| r.id.clone()).collect();
        if let Some(clash) = closure.iter().find(|id| dst.contains(id)) {
            return Err(GraphError::DocumentMismatch(format!(
                "{} already exists in document {}",
                clash,
                dst.id()
            )));
        }

        let mut translated = Vec::with_capacity(rows.len());
        for row in rows {
            translated.push(translate_row(&src, dst, row, &closure)?);
        }
        let registry = dst.registry().clone();
        dst.with_state(|s| -> Result<()> {
            for row in &translated {
                write_row(s, &registry, row)?;
            }
            Ok(())
        })?;

        rebind(&src, dst, &closure);
        log::debug!(
            "Materialized {} entities rooted at {} from {} into {}",
            closure.len(),
            root.id(),
            src.id(),
            dst.id()
        );
        Ok(())
    })
}

fn collect_closure(src: &Document, root: &EntityId) -> Result<Vec<Row>> {
    let registry = src.registry().clone();
    let mut rows = Vec::new();
    let mut seen = HashSet::new();
    let mut owned_elsewhere = Vec::new();
    let mut frontier = vec![root.clone()];

    while !frontier.is_empty() {
        let mut referenced = Vec::new();
        while let Some(id) = frontier.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            let row = src.read(|s| export_row(s, &registry, &id))?;
            frontier.extend(row.owned_children().cloned());
            referenced.extend(row.referenced().cloned());
            rows.push(row);
        }

        for id in referenced {
            if seen.contains(&id) || src.forwarded_to(&id).is_some() {
                continue;
            }
            let (present, owned) = src.read(|s| (s.contains_entity(&id), s.ownership.slot(&id).is_some()));
            if !present {
                continue;
            }
            if owned {
                owned_elsewhere.push(id);
            } else {
                // Free entities come along
                frontier.push(id);
            }
        }
    }

    if let Some(stranded) = owned_elsewhere.into_iter().find(|id| !seen.contains(id)) {
        return Err(GraphError::DocumentMismatch(format!(
            "{} is referenced from {} but owned by a detached entity",
            stranded, root
        )));
    }
    Ok(rows)
}

fn export_row(s: &DocState, registry: &SchemaRegistry, id: &EntityId) -> Result<Row> {
    let schema = s.schema_of(registry, id)?;
    let fields = layout::fields(id);
    let mut row = Row {
        id: id.clone(),
        type_name: schema.name().to_string(),
        scalars: Vec::new(),
        links: Vec::new(),
    };

    for spec in schema.fields() {
        let (owned, shape, content) = match &spec.kind {
            FieldKind::Scalar { .. } => {
                if let Some(value) = s.replica.map_get(&fields, &spec.name) {
                    row.scalars.push((spec.name.clone(), value.clone()));
                }
                continue;
            }
            FieldKind::Reference { owned, .. } => {
                let r = s
                    .replica
                    .map_get(&fields, &spec.name)
                    .and_then(RefTuple::from_value);
                (*owned, None, Content::Single(r))
            }
            FieldKind::Collection { shape, owned, .. } => {
                let container = layout::collection(id, &spec.name);
                let content = match shape {
                    CollectionShape::List => Content::List(
                        s.replica
                            .array_values(&container)
                            .iter()
                            .filter_map(RefTuple::from_value)
                            .collect(),
                    ),
                    CollectionShape::Map | CollectionShape::Set => Content::Keyed(
                        s.replica
                            .map_entries(&container)
                            .into_iter()
                            .filter_map(|(k, v)| RefTuple::from_value(&v).map(|r| (k, r)))
                            .collect(),
                    ),
                };
                (*owned, Some(*shape), content)
            }
        };
        row.links.push(FieldContent {
            field: spec.name.clone(),
            owned,
            shape,
            content,
        });
    }
    Ok(row)
}

/// Rewrite references from the source document's point of view into the
/// destination's
fn translate(src: &Document, dst: &Document, r: &RefTuple, closure: &HashSet<EntityId>) -> Result<RefTuple> {
    match &r.dependency {
        None => {
            if closure.contains(&r.id) {
                return Ok(r.clone());
            }
            match src.forwarded_to(&r.id) {
                Some(home) => {
                    let entity = home.resolve_local(&r.id)?;
                    reference::reference_of(&entity, dst)
                }
                None => Ok(r.clone()),
            }
        }
        Some(dep) => {
            let target = src.dependency_target(dep)?;
            if target == dst.id() {
                return Ok(RefTuple::local(r.id.clone()));
            }
            if let Some(doc) = src.loaded_document(target) {
                dst.link(&doc);
            }
            Ok(RefTuple::external(r.id.clone(), dst.ensure_dependency(target)?))
        }
    }
}

fn translate_row(src: &Document, dst: &Document, mut row: Row, closure: &HashSet<EntityId>) -> Result<Row> {
    for link in &mut row.links {
        link.content = match &link.content {
            Content::Single(r) => Content::Single(match r {
                Some(r) => Some(translate(src, dst, r, closure)?),
                None => None,
            }),
            Content::List(items) => Content::List(
                items
                    .iter()
                    .map(|r| translate(src, dst, r, closure))
                    .collect::<Result<_>>()?,
            ),
            Content::Keyed(entries) => Content::Keyed(
                entries
                    .iter()
                    .map(|(k, r)| Ok((k.clone(), translate(src, dst, r, closure)?)))
                    .collect::<Result<_>>()?,
            ),
        };
    }
    Ok(row)
}

fn write_row(s: &mut DocState, registry: &SchemaRegistry, row: &Row) -> Result<()> {
    registry.get(&row.type_name)?;
    s.replica
        .map_put(&layout::entities(), row.id.as_str(), Value::string(row.type_name.as_str()))?;
    let fields = layout::fields(&row.id);
    for (name, value) in &row.scalars {
        s.replica.map_put(&fields, name, value.clone())?;
    }

    for link in &row.links {
        let container = layout::collection(&row.id, &link.field);
        match &link.content {
            Content::Single(r) => {
                let value = r.as_ref().map(RefTuple::to_value).unwrap_or(Value::Null);
                s.replica.map_put(&fields, &link.field, value)?;
                if let (true, Some(r)) = (link.owned, r) {
                    s.ownership
                        .set(r.id.clone(), Some(OwnerSlot::field(&row.id, &link.field)));
                }
            }
            Content::List(items) => {
                for (i, r) in items.iter().enumerate() {
                    s.replica.array_push(&container, r.to_value())?;
                    if link.owned {
                        s.ownership
                            .set(r.id.clone(), Some(OwnerSlot::indexed(&row.id, &link.field, i)));
                    }
                }
            }
            Content::Keyed(entries) => {
                for (key, r) in entries {
                    s.replica.map_put(&container, key, r.to_value())?;
                    if link.owned {
                        let slot = match link.shape {
                            Some(CollectionShape::Map) => OwnerSlot::keyed(&row.id, &link.field, key.as_str()),
                            _ => OwnerSlot::field(&row.id, &link.field),
                        };
                        s.ownership.set(r.id.clone(), Some(slot));
                    }
                }
            }
        }
    }
    Ok(())
}

/// Point live handles, forwarding entries, back-pointers and subscriptions
/// at `dst`, journaling the reverse on `dst`'s transaction
fn rebind(src: &Document, dst: &Document, closure: &HashSet<EntityId>) {
    let mut moved = Vec::new();
    for id in closure {
        let handle = src.cache().lookup(id);
        if let Some(handle) = handle {
            src.cache().remove(id);
            handle.rebind(dst.clone());
            dst.cache().adopt(&handle);
            moved.push(handle);
        }
        src.forward(id.clone(), dst.clone());
    }

    let released: Vec<(EntityId, OwnerSlot)> = src.with_state(|s| {
        closure
            .iter()
            .filter_map(|id| s.ownership.set(id.clone(), None).map(|slot| (id.clone(), slot)))
            .collect()
    });

    let subscriptions = src.notifier().take_subscriptions(closure);
    {
        let mut notifier = dst.notifier();
        for (id, sub) in &subscriptions {
            notifier.insert_subscription(*id, sub.clone());
        }
    }

    let (src, dst_handle, ids) = (src.clone(), dst.clone(), closure.clone());
    dst.push_compensation(move || {
        for handle in &moved {
            dst_handle.cache().remove(handle.id());
            handle.rebind(src.clone());
            src.cache().adopt(handle);
        }
        for id in &ids {
            src.unforward(id);
        }
        src.with_state(|s| {
            for (id, slot) in released {
                s.ownership.set(id, Some(slot));
            }
        });
        let mut from = dst_handle.notifier();
        let mut to = src.notifier();
        for (id, sub) in subscriptions {
            from.unsubscribe(&id);
            to.insert_subscription(id, sub);
        }
    });
}
