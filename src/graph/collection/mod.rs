//! Collection wrappers for entity-valued list, map and set fields
//!
//! A wrapper is a thin view over one field of one owner entity. It holds no
//! contents of its own: every call reads or writes the owner's document, so
//! a wrapper stays valid when its owner is materialized into another
//! document. Owned collections run every placement through the ownership
//! protocol; non-owning collections only store references.

mod list;
mod map;
mod set;

pub use list::EntityList;
pub use map::EntityMap;
pub use set::EntitySet;

use crate::convergent::{ContainerId, Value};
use crate::error::{GraphError, Result};

use super::document::Document;
use super::entity::Entity;
use super::layout;
use super::notify::ChangeKey;
use super::ownership::{self, SlotOwner};
use super::reference::{self, RefTuple};

/// What every wrapper knows about its field
#[derive(Clone)]
pub(crate) struct FieldView {
    pub owner: Entity,
    pub field: String,
    pub owned: bool,
    pub target: Option<String>,
}

impl FieldView {
    pub fn new(owner: Entity, field: &str, owned: bool, target: Option<String>) -> Self {
        Self {
            owner,
            field: field.to_string(),
            owned,
            target,
        }
    }

    pub fn document(&self) -> Document {
        self.owner.document()
    }

    pub fn container(&self) -> ContainerId {
        layout::collection(self.owner.id(), &self.field)
    }

    pub fn change_key(&self) -> ChangeKey {
        ChangeKey::field(self.owner.id(), &self.field)
    }

    /// Record the read with observers and return the document to read from
    pub fn track(&self) -> Document {
        let doc = self.document();
        doc.track_access(self.owner.id(), &self.field);
        doc
    }

    pub fn check_item(&self, item: &Entity) -> Result<()> {
        match &self.target {
            Some(target) if target != item.type_name() => Err(GraphError::schema(
                self.owner.type_name(),
                &self.field,
                format!("expected {}, got {}", target, item.type_name()),
            )),
            _ => Ok(()),
        }
    }

    /// Prepare `item` for placement in this collection and return the value
    /// to store: owned items are detached from their current slot (and
    /// brought in from a scratch document), others just get a reference.
    pub fn stage_item(&self, doc: &Document, item: &Entity) -> Result<Value> {
        if self.owned {
            ownership::detach_for_adoption(doc, &SlotOwner::Entity(self.owner.id().clone()), item)?;
            Ok(RefTuple::local(item.id().clone()).to_value())
        } else {
            Ok(reference::reference_of(item, doc)?.to_value())
        }
    }

    pub fn decode(&self, value: &Value) -> Result<RefTuple> {
        RefTuple::from_value(value)
            .ok_or_else(|| GraphError::schema(self.owner.type_name(), &self.field, "malformed reference"))
    }

    /// A stored reference no longer held by this owned collection
    pub fn release(&self, doc: &Document, reference: &RefTuple) {
        if self.owned && reference.is_local() {
            ownership::inform_orphanization(doc, &reference.id);
        }
    }
}
