//! Schema-typed object graph over a convergent document
//!
//! Entities are typed records living in a [`Document`]. Every entity has at
//! most one owner (a root name or an owned field of another entity), and a
//! document hands out a single [`Entity`] handle per id while one is alive.
//! Entities created outside any document stay ephemeral until they are
//! referenced from one, at which point they move in together with the
//! subtree they own.

mod cache;
pub mod collection;
mod document;
mod entity;
mod layout;
mod notify;
mod ownership;
mod reference;
mod repair;
pub mod schema;
mod store;
mod transfer;

pub use collection::{EntityList, EntityMap, EntitySet};
pub use document::{Document, DocumentKind};
pub use entity::{Entity, FieldInput, FieldValue, Fields};
pub use notify::{ChangeKey, ChangeObserver, ObserverId, SubscriptionId};
pub use ownership::{OwnerSlot, SlotKey, SlotOwner};
pub use reference::{reference_of, DependencyId, EntityId, RefTuple};
pub use repair::RepairReport;
pub use schema::{CollectionShape, FieldKind, FieldSpec, ScalarKind, SchemaRegistry, TypeSchema};
pub use store::DocumentStore;
