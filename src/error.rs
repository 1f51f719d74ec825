use thiserror::Error;
use uuid::Uuid;

use crate::convergent::{CodecError, ReplicaError};
use crate::graph::EntityId;

#[derive(Error, Debug)]
pub enum GraphError {
    /// Wrong field kind, wrong scalar type, missing or unknown field.
    /// Raised before anything reaches the substrate.
    #[error("Schema violation on {type_name}.{field}: {reason}")]
    SchemaViolation {
        type_name: String,
        field: String,
        reason: String,
    },

    #[error("Unknown entity type: {0}")]
    UnknownType(String),

    /// Low-level ownership primitives invoked out of protocol
    #[error("Ownership conflict on {entity}: {reason}")]
    OwnershipConflict { entity: EntityId, reason: String },

    #[error("Placing {entity} under {owner} would create an ownership cycle")]
    OwnershipCycle { entity: EntityId, owner: EntityId },

    #[error("Entity {0} not found")]
    NotFound(EntityId),

    #[error("Dependency document {0} is not loaded")]
    DependencyUnavailable(Uuid),

    #[error("No dependency {0} in document metadata")]
    UnknownDependency(String),

    /// Owned edges cannot cross documents
    #[error("Document mismatch: {0}")]
    DocumentMismatch(String),

    #[error("Index {index} out of bounds (len {len})")]
    IndexOutOfBounds { index: usize, len: usize },

    #[error("Substrate error: {0}")]
    Substrate(#[from] ReplicaError),

    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl GraphError {
    pub fn schema(type_name: &str, field: &str, reason: impl Into<String>) -> Self {
        GraphError::SchemaViolation {
            type_name: type_name.to_string(),
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, GraphError>;
