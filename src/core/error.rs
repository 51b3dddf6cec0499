//! Error types for the streaming cache

use thiserror::Error;

use crate::core::types::{NodeKey, ResourceId};

/// Main error type for the crate
///
/// Backpressure and load failures are not errors: they are absorbed by the
/// loader pool and retried by the next update cycle. Only configuration
/// problems and invalid requests surface here.
#[derive(Debug, Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Resource node size mismatch: cache uses {expected} bytes per node, resource has {found}")]
    ResourceMismatch { expected: usize, found: usize },

    #[error("Unknown resource {0}")]
    UnknownResource(ResourceId),

    #[error("Node {0} is outside its resource hierarchy")]
    UnknownNode(NodeKey),
}
