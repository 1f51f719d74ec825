//! Wire format for replicating operations between replicas

use super::operation::OpEnvelope;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("CBOR encode failed: {0}")]
    Encode(String),

    #[error("CBOR decode failed: {0}")]
    Decode(String),
}

/// A batch of operations for one document.
///
/// Serialized with CBOR (`ciborium`); the transport that carries it is out
/// of scope.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub document_id: Uuid,
    pub ops: Vec<OpEnvelope>,
}

impl Update {
    pub fn new(document_id: Uuid, ops: Vec<OpEnvelope>) -> Self {
        Self { document_id, ops }
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Serialize to CBOR bytes.
    pub fn to_cbor(&self) -> Result<Vec<u8>, CodecError> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf).map_err(|e| CodecError::Encode(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize from CBOR bytes.
    pub fn from_cbor(data: &[u8]) -> Result<Self, CodecError> {
        ciborium::from_reader(data).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::convergent::{ContainerId, Replica, Value};

    #[test]
    fn test_update_survives_cbor() {
        let mut r = Replica::new("A");
        r.begin().unwrap();
        r.map_put(&ContainerId::new("m"), "score", Value::Float(1.5)).unwrap();
        r.array_push(&ContainerId::new("a"), Value::Bytes(vec![0, 1, 2])).unwrap();
        let update = Update::new(Uuid::new_v4(), r.commit());

        let bytes = update.to_cbor().unwrap();
        let decoded = Update::from_cbor(&bytes).unwrap();
        assert_eq!(decoded, update);
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(matches!(
            Update::from_cbor(&[0xff, 0x00, 0x13]),
            Err(CodecError::Decode(_))
        ));
    }
}
