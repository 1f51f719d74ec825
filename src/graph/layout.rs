//! How entities are laid out in substrate containers
//!
//! ```text
//! entities            map   entity id -> type name
//! roots               map   root name -> reference
//! meta                map   documentId, schemaVersion, dep:<id> -> document id
//! e/<id>              map   field -> scalar or single reference
//! e/<id>/<field>      array (list fields) or map (map and set fields)
//! ```

use crate::convergent::ContainerId;

use super::reference::EntityId;

pub(crate) const ENTITIES: &str = "entities";
pub(crate) const ROOTS: &str = "roots";
pub(crate) const META: &str = "meta";

pub(crate) const META_DOCUMENT_ID: &str = "documentId";
pub(crate) const META_SCHEMA_VERSION: &str = "schemaVersion";
pub(crate) const META_DEPENDENCY_PREFIX: &str = "dep:";

pub(crate) fn entities() -> ContainerId {
    ContainerId::new(ENTITIES)
}

pub(crate) fn roots() -> ContainerId {
    ContainerId::new(ROOTS)
}

pub(crate) fn meta() -> ContainerId {
    ContainerId::new(META)
}

pub(crate) fn fields(id: &EntityId) -> ContainerId {
    ContainerId::new(format!("e/{}", id))
}

pub(crate) fn collection(id: &EntityId, field: &str) -> ContainerId {
    ContainerId::new(format!("e/{}/{}", id, field))
}

/// What a container holds, decoded from its name
#[derive(Debug, PartialEq)]
pub(crate) enum ContainerRole {
    Entities,
    Roots,
    Meta,
    Fields(EntityId),
    Collection(EntityId, String),
}

pub(crate) fn role_of(container: &ContainerId) -> Option<ContainerRole> {
    match container.as_str() {
        ENTITIES => Some(ContainerRole::Entities),
        ROOTS => Some(ContainerRole::Roots),
        META => Some(ContainerRole::Meta),
        name => {
            let rest = name.strip_prefix("e/")?;
            match rest.split_once('/') {
                Some((id, field)) => Some(ContainerRole::Collection(EntityId::from(id), field.to_string())),
                None => Some(ContainerRole::Fields(EntityId::from(rest))),
            }
        }
    }
}
