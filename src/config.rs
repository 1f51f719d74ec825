//! Document configuration

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};

/// Per-document settings.
///
/// Every field has a default, so a config file only needs to name what it
/// changes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GraphConfig {
    /// Replica identity used to author operations; random when absent
    pub replica_id: Option<String>,

    /// Written to document metadata as `schemaVersion`
    pub schema_version: u32,

    /// Capacity of the broadcast channel carrying committed local updates
    pub update_channel_capacity: usize,

    /// Remove duplicate owners and cycles after every merged remote batch.
    /// Back-pointers are rebuilt from the merged slots either way.
    pub repair_after_merge: bool,

    /// Log a warning once this many remote ops are waiting on causal predecessors
    pub pending_ops_warn_threshold: usize,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            replica_id: None,
            schema_version: 1,
            update_channel_capacity: 64,
            repair_after_merge: true,
            pending_ops_warn_threshold: 1024,
        }
    }
}

impl GraphConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: GraphConfig =
            serde_json::from_str(json).map_err(|e| GraphError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_replica_id(mut self, replica_id: impl Into<String>) -> Self {
        self.replica_id = Some(replica_id.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.update_channel_capacity == 0 {
            return Err(GraphError::Config(
                "update_channel_capacity must be at least 1".into(),
            ));
        }
        if let Some(id) = &self.replica_id {
            if id.is_empty() {
                return Err(GraphError::Config("replica_id must not be empty".into()));
            }
        }
        Ok(())
    }

    /// The configured replica id, or a fresh random one
    pub fn resolve_replica_id(&self) -> String {
        self.replica_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string())
    }
}
