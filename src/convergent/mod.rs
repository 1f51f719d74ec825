//! Convergent Document Substrate
//!
//! Operation-based replicated storage the object graph is layered on: named
//! last-writer-wins maps and replicated growable arrays, local transactions
//! with savepoints, and causally ordered integration of remote operations.
//! Any two replicas that have seen the same operations expose the same
//! container contents.

mod horizon;
mod operation;
mod replica;
mod update;

pub use horizon::{Horizon, ReplicaId, SeqNum};
pub use operation::{ContainerId, ElemId, OpEnvelope, OpId, Operation, Stamp, Value};
pub use replica::{RemoteOutcome, Replica, ReplicaError, Savepoint};
pub use update::{CodecError, Update};
