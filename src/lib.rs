// Entwine - schema-typed object graph on a replicated document

pub mod config;
pub mod convergent;
pub mod error;
pub mod graph;

pub use config::GraphConfig;
pub use convergent::{Horizon, Update, Value};
pub use error::{GraphError, Result};
pub use graph::*;
