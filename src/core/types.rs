//! Core identifiers and type aliases

use std::fmt;

use serde::{Deserialize, Serialize};

/// Index of a resource (dataset) within a catalog
pub type ResourceId = u32;

/// Node or tile id inside an implicit complete k-ary tree (root = 0)
pub type NodeId = u64;

/// Rendering context (one cut-update thread per context)
pub type ContextId = u32;

/// View (camera) within a context
pub type ViewId = u32;

/// Load priority. Higher = more important
pub type Priority = i32;

/// Standard Result type for the crate
pub type Result<T> = std::result::Result<T, crate::core::error::Error>;

/// Cache key: one node of one resource
///
/// Ordered by resource first, then node id.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeKey {
    pub resource: ResourceId,
    pub node: NodeId,
}

impl NodeKey {
    pub fn new(resource: ResourceId, node: NodeId) -> Self {
        Self { resource, node }
    }
}

impl fmt::Display for NodeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.resource, self.node)
    }
}

/// Identifies one cut: a (resource, view, context) triple
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CutKey {
    pub context: ContextId,
    pub view: ViewId,
    pub resource: ResourceId,
}

impl CutKey {
    pub fn new(context: ContextId, view: ViewId, resource: ResourceId) -> Self {
        Self { context, view, resource }
    }
}

impl fmt::Display for CutKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ctx{}/view{}/res{}", self.context, self.view, self.resource)
    }
}
