//! Entity identity and serialized references
//!
//! A reference is stored in the substrate as a short list: `[id]` for an
//! entity in the same document, `[id, dependency]` for one that lives in a
//! dependency document named in the metadata map.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::document::Document;
use super::entity::Entity;
use super::transfer;
use crate::convergent::Value;
use crate::error::{GraphError, Result};

/// Stable identifier of an entity, unique across documents
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityId(String);

impl EntityId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for EntityId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<&str> for EntityId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for EntityId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Document-local name for a dependency document
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DependencyId(String);

impl DependencyId {
    pub(crate) fn generate() -> Self {
        let full = Uuid::new_v4().simple().to_string();
        Self(full[..12].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DependencyId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for DependencyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Reference tuple: an entity id, plus the dependency it lives in when it
/// is not in the referring document
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct RefTuple {
    pub id: EntityId,
    pub dependency: Option<DependencyId>,
}

impl RefTuple {
    pub fn local(id: EntityId) -> Self {
        Self { id, dependency: None }
    }

    pub fn external(id: EntityId, dependency: DependencyId) -> Self {
        Self {
            id,
            dependency: Some(dependency),
        }
    }

    pub fn is_local(&self) -> bool {
        self.dependency.is_none()
    }

    pub fn to_value(&self) -> Value {
        let mut parts = vec![Value::string(self.id.as_str())];
        if let Some(dep) = &self.dependency {
            parts.push(Value::string(dep.as_str()));
        }
        Value::List(parts)
    }

    /// Decode a stored reference; anything else (including null) is `None`
    pub fn from_value(value: &Value) -> Option<Self> {
        let Value::List(parts) = value else {
            return None;
        };
        match parts.as_slice() {
            [Value::String(id)] => Some(Self::local(EntityId::from(id.as_str()))),
            [Value::String(id), Value::String(dep)] => Some(Self::external(
                EntityId::from(id.as_str()),
                DependencyId::from(dep.as_str()),
            )),
            _ => None,
        }
    }
}

impl fmt::Display for RefTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.dependency {
            Some(dep) => write!(f, "{}@{}", self.id, dep),
            None => write!(f, "{}", self.id),
        }
    }
}

/// Produce the reference `doc` should store to point at `entity`.
///
/// A free ephemeral entity is materialized into `doc` first. An entity in
/// another replicated document gets a dependency entry in `doc`'s metadata.
pub fn reference_of(entity: &Entity, doc: &Document) -> Result<RefTuple> {
    let home = entity.document();
    if home.same(doc) {
        return Ok(RefTuple::local(entity.id().clone()));
    }

    if home.is_scratch() {
        if home.read(|s| s.ownership.slot(entity.id()).is_some()) {
            return Err(GraphError::DocumentMismatch(format!(
                "{} is owned by a detached entity; attach its owner first",
                entity.id()
            )));
        }
        doc.transact(|| transfer::absorb(doc, entity))?;
        return Ok(RefTuple::local(entity.id().clone()));
    }

    let dependency = doc.add_dependency(&home)?;
    Ok(RefTuple::external(entity.id().clone(), dependency))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ref_tuple_values() {
        let local = RefTuple::local(EntityId::from("a1"));
        assert_eq!(local.to_value(), Value::List(vec![Value::string("a1")]));
        assert_eq!(RefTuple::from_value(&local.to_value()), Some(local));

        let ext = RefTuple::external(EntityId::from("a1"), DependencyId::from("d9"));
        assert_eq!(RefTuple::from_value(&ext.to_value()), Some(ext.clone()));
        assert_eq!(ext.to_string(), "a1@d9");

        assert_eq!(RefTuple::from_value(&Value::Null), None);
        assert_eq!(RefTuple::from_value(&Value::string("a1")), None);
    }

    #[test]
    fn test_entity_ids_are_unique() {
        assert_ne!(EntityId::new(), EntityId::new());
        assert_eq!(DependencyId::generate().as_str().len(), 12);
    }
}
