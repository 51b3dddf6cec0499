//! Streaming configuration, read once at startup.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::core::error::Error;
use crate::core::types::Result;
use crate::streaming::catalog::ResourceDesc;

/// Runtime limits of the streaming cache.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Total bytes reserved for the slot pool. Divided by the node size of the
    /// catalog to get the number of slots.
    pub slot_pool_bytes: usize,
    /// Number of loader worker threads.
    pub loader_threads: usize,
    /// Nodes that may be newly uploaded per update cycle. Must cover the
    /// largest sibling group, since a split uploads one in a single cycle.
    pub transfer_budget: usize,
    /// Nodes that may be drawable per context.
    pub render_budget: usize,
    /// How long a loader waits for a slot before retrying a parked job.
    pub retry_interval_ms: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            slot_pool_bytes: 512 * 1024 * 1024, // 512 MB
            loader_threads: 4,
            transfer_budget: 256,
            render_budget: 16 * 1024,
            retry_interval_ms: 5,
        }
    }
}

impl StreamingConfig {
    /// Check the limits are usable.
    pub fn validate(&self) -> Result<()> {
        if self.loader_threads == 0 {
            return Err(Error::Config("loader_threads must be at least 1".into()));
        }
        if self.slot_pool_bytes == 0 {
            return Err(Error::Config("slot_pool_bytes must be non-zero".into()));
        }
        if self.transfer_budget == 0 {
            return Err(Error::Config("transfer_budget must be non-zero".into()));
        }
        if self.render_budget == 0 {
            return Err(Error::Config("render_budget must be non-zero".into()));
        }
        Ok(())
    }

    /// Number of slots for a given node size (0 if the pool cannot hold one node).
    pub fn num_slots(&self, node_size: usize) -> usize {
        if node_size == 0 {
            0
        } else {
            self.slot_pool_bytes / node_size
        }
    }

    /// Save to file (sync)
    pub fn save_sync(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load from file (sync) and validate
    pub fn load_sync(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }
}

/// Dataset description: cache limits plus every resource sharing the cache.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DatasetManifest {
    #[serde(default)]
    pub config: StreamingConfig,
    pub resources: Vec<ResourceDesc>,
}

impl DatasetManifest {
    /// Load from file (sync)
    pub fn load_sync(path: &Path) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let manifest: Self = serde_json::from_str(&json)?;
        manifest.config.validate()?;
        Ok(manifest)
    }
}
