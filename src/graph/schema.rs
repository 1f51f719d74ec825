//! Schema definitions for entity types
//!
//! A schema is a static registration table built when a type is defined:
//! field name → field kind. The generic get/set dispatcher in `entity`
//! consults it for every access.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

use super::entity::{Entity, Fields};
use crate::convergent::Value;
use crate::error::{GraphError, Result};

/// Types a scalar field accepts (in addition to null, when nullable)
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScalarKind {
    Any,
    Bool,
    Int,
    Float,
    String,
    Bytes,
    List,
    Map,
}

impl ScalarKind {
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (ScalarKind::Any, _) => true,
            (ScalarKind::Bool, Value::Bool(_)) => true,
            (ScalarKind::Int, Value::Int(_)) => true,
            (ScalarKind::Float, Value::Float(_) | Value::Int(_)) => true,
            (ScalarKind::String, Value::String(_)) => true,
            (ScalarKind::Bytes, Value::Bytes(_)) => true,
            (ScalarKind::List, Value::List(_)) => true,
            (ScalarKind::Map, Value::Map(_)) => true,
            _ => false,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CollectionShape {
    List,
    Map,
    Set,
}

#[derive(Clone, Debug, PartialEq)]
pub enum FieldKind {
    Scalar {
        kind: ScalarKind,
        nullable: bool,
        default: Option<Value>,
    },

    /// A single entity slot. Owned slots hold their target exclusively.
    Reference { target: Option<String>, owned: bool },

    Collection {
        shape: CollectionShape,
        target: Option<String>,
        owned: bool,
    },
}

/// Specification for one field of an entity type
#[derive(Clone, Debug, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: FieldKind,
}

impl FieldSpec {
    pub fn is_owned(&self) -> bool {
        matches!(
            self.kind,
            FieldKind::Reference { owned: true, .. } | FieldKind::Collection { owned: true, .. }
        )
    }

    pub fn is_scalar(&self) -> bool {
        matches!(self.kind, FieldKind::Scalar { .. })
    }

    /// Entity type this field points at, when restricted
    pub fn target(&self) -> Option<&str> {
        match &self.kind {
            FieldKind::Reference { target, .. } | FieldKind::Collection { target, .. } => {
                target.as_deref()
            }
            FieldKind::Scalar { .. } => None,
        }
    }

    pub fn shape(&self) -> Option<CollectionShape> {
        match &self.kind {
            FieldKind::Collection { shape, .. } => Some(*shape),
            _ => None,
        }
    }

    /// Value a scalar takes when construction does not supply one
    pub fn initial_value(&self) -> Option<Value> {
        match &self.kind {
            FieldKind::Scalar {
                default: Some(v), ..
            } => Some(v.clone()),
            FieldKind::Scalar { nullable: true, .. } => Some(Value::Null),
            _ => None,
        }
    }
}

/// Schema for one entity type, built with chained field declarations
#[derive(Clone, Debug)]
pub struct TypeSchema {
    name: String,
    fields: Vec<FieldSpec>,
}

impl TypeSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.fields.push(FieldSpec {
            name: name.into(),
            kind,
        });
        self
    }

    /// Required, non-null scalar
    pub fn scalar(self, name: impl Into<String>, kind: ScalarKind) -> Self {
        self.with_field(
            name,
            FieldKind::Scalar {
                kind,
                nullable: false,
                default: None,
            },
        )
    }

    /// Nullable scalar, null unless given at construction
    pub fn nullable(self, name: impl Into<String>, kind: ScalarKind) -> Self {
        self.with_field(
            name,
            FieldKind::Scalar {
                kind,
                nullable: true,
                default: None,
            },
        )
    }

    pub fn scalar_with_default(self, name: impl Into<String>, kind: ScalarKind, default: Value) -> Self {
        self.with_field(
            name,
            FieldKind::Scalar {
                kind,
                nullable: false,
                default: Some(default),
            },
        )
    }

    pub fn reference(self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.with_field(
            name,
            FieldKind::Reference {
                target: Some(target.into()),
                owned: false,
            },
        )
    }

    pub fn owned_reference(self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.with_field(
            name,
            FieldKind::Reference {
                target: Some(target.into()),
                owned: true,
            },
        )
    }

    pub fn collection(
        self,
        name: impl Into<String>,
        shape: CollectionShape,
        target: impl Into<String>,
        owned: bool,
    ) -> Self {
        self.with_field(
            name,
            FieldKind::Collection {
                shape,
                target: Some(target.into()),
                owned,
            },
        )
    }

    pub fn owned_list(self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.collection(name, CollectionShape::List, target, true)
    }

    pub fn owned_map(self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.collection(name, CollectionShape::Map, target, true)
    }

    pub fn owned_set(self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.collection(name, CollectionShape::Set, target, true)
    }

    pub fn ref_list(self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.collection(name, CollectionShape::List, target, false)
    }

    pub fn ref_map(self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.collection(name, CollectionShape::Map, target, false)
    }

    pub fn ref_set(self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.collection(name, CollectionShape::Set, target, false)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn fields(&self) -> &[FieldSpec] {
        &self.fields
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Look up a field, failing with `SchemaViolation` when it is not declared
    pub fn require_field(&self, name: &str) -> Result<&FieldSpec> {
        self.field(name)
            .ok_or_else(|| GraphError::schema(&self.name, name, "no such field"))
    }

    pub fn owned_fields(&self) -> impl Iterator<Item = &FieldSpec> {
        self.fields.iter().filter(|f| f.is_owned())
    }

    /// Check a value destined for a scalar field
    pub fn validate_scalar(&self, field: &str, value: &Value) -> Result<()> {
        let spec = self.require_field(field)?;
        match &spec.kind {
            FieldKind::Scalar { kind, nullable, .. } => {
                if value.is_null() {
                    if *nullable {
                        return Ok(());
                    }
                    return Err(GraphError::schema(&self.name, field, "null is not allowed"));
                }
                if !kind.accepts(value) {
                    return Err(GraphError::schema(
                        &self.name,
                        field,
                        format!("expected {:?}, got {}", kind, value.kind_name()),
                    ));
                }
                Ok(())
            }
            _ => Err(GraphError::schema(&self.name, field, "not a scalar field")),
        }
    }

    /// Check that an entity of `type_name` may be stored in `field`
    pub fn validate_target(&self, field: &str, type_name: &str) -> Result<()> {
        let spec = self.require_field(field)?;
        match spec.target() {
            Some(target) if target != type_name => Err(GraphError::schema(
                &self.name,
                field,
                format!("expected {}, got {}", target, type_name),
            )),
            _ => Ok(()),
        }
    }

    fn check_definition(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(GraphError::schema("", "", "type name must not be empty"));
        }
        for (i, spec) in self.fields.iter().enumerate() {
            if spec.name.is_empty() || spec.name.contains('/') {
                return Err(GraphError::schema(&self.name, &spec.name, "invalid field name"));
            }
            if self.fields[..i].iter().any(|f| f.name == spec.name) {
                return Err(GraphError::schema(&self.name, &spec.name, "declared twice"));
            }
            if let FieldKind::Scalar {
                default: Some(default),
                kind,
                ..
            } = &spec.kind
            {
                if !kind.accepts(default) {
                    return Err(GraphError::schema(
                        &self.name,
                        &spec.name,
                        "default does not match the field kind",
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Registry of every entity type known to a set of documents
#[derive(Default)]
pub struct SchemaRegistry {
    types: RwLock<HashMap<String, Arc<TypeSchema>>>,
}

impl SchemaRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a type. Field targets may name types defined later.
    pub fn define_type(&self, schema: TypeSchema) -> Result<Arc<TypeSchema>> {
        schema.check_definition()?;
        let mut types = self.types.write();
        if types.contains_key(schema.name()) {
            return Err(GraphError::schema(schema.name(), "", "type already defined"));
        }
        let schema = Arc::new(schema);
        types.insert(schema.name().to_string(), schema.clone());
        log::debug!("Defined entity type {}", schema.name());
        Ok(schema)
    }

    pub fn get(&self, type_name: &str) -> Result<Arc<TypeSchema>> {
        self.types
            .read()
            .get(type_name)
            .cloned()
            .ok_or_else(|| GraphError::UnknownType(type_name.to_string()))
    }

    pub fn contains(&self, type_name: &str) -> bool {
        self.types.read().contains_key(type_name)
    }

    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Construct an ephemeral entity of a registered type
    pub fn create(self: &Arc<Self>, type_name: &str, fields: Fields) -> Result<Entity> {
        Entity::create(self, type_name, fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> TypeSchema {
        TypeSchema::new("User")
            .scalar("name", ScalarKind::String)
            .nullable("nickname", ScalarKind::String)
            .scalar_with_default("age", ScalarKind::Int, Value::int(0))
            .reference("friend", "User")
    }

    #[test]
    fn test_define_and_lookup() {
        let registry = SchemaRegistry::new();
        registry.define_type(user()).unwrap();

        let schema = registry.get("User").unwrap();
        assert_eq!(schema.fields().len(), 4);
        assert!(schema.field("friend").map(|f| !f.is_owned()).unwrap());
        assert!(matches!(registry.get("Nope"), Err(GraphError::UnknownType(_))));
        assert!(registry.define_type(user()).is_err());
    }

    #[test]
    fn test_scalar_validation() {
        let schema = user();
        assert!(schema.validate_scalar("name", &Value::string("Alice")).is_ok());
        assert!(schema.validate_scalar("nickname", &Value::Null).is_ok());
        assert!(matches!(
            schema.validate_scalar("name", &Value::Null),
            Err(GraphError::SchemaViolation { .. })
        ));
        assert!(schema.validate_scalar("age", &Value::string("old")).is_err());
        assert!(schema.validate_scalar("friend", &Value::int(1)).is_err());
        assert!(schema.validate_scalar("missing", &Value::int(1)).is_err());
    }

    #[test]
    fn test_initial_values() {
        let schema = user();
        assert_eq!(schema.field("name").unwrap().initial_value(), None);
        assert_eq!(schema.field("nickname").unwrap().initial_value(), Some(Value::Null));
        assert_eq!(schema.field("age").unwrap().initial_value(), Some(Value::int(0)));
    }

    #[test]
    fn test_bad_definitions_rejected() {
        let registry = SchemaRegistry::new();
        let dup = TypeSchema::new("Dup")
            .scalar("x", ScalarKind::Int)
            .scalar("x", ScalarKind::Int);
        assert!(registry.define_type(dup).is_err());

        let slash = TypeSchema::new("Slash").scalar("a/b", ScalarKind::Int);
        assert!(registry.define_type(slash).is_err());

        let bad_default =
            TypeSchema::new("Bad").scalar_with_default("n", ScalarKind::Int, Value::string("x"));
        assert!(registry.define_type(bad_default).is_err());
    }
}
