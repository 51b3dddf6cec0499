//! Resource catalog: immutable hierarchy metadata per resource
//!
//! Every resource is an implicit complete k-ary tree stored node after node in
//! one file. Node ids are breadth-first (root = 0), so parent and child ids are
//! pure arithmetic and the byte range of a node is `id * node_size`.
//! Virtual textures are the special case k = 4 (quadtree of tiles).

use std::ops::Range;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::core::error::Error;
use crate::core::types::{NodeId, NodeKey, ResourceId, Result};

/// What a resource's nodes contain
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    /// Geometry LOD nodes (surfels, points or mesh patches)
    Geometry,
    /// Virtual texture tiles, always a quadtree
    Texture,
}

/// Description of a resource as stored in a dataset manifest
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceDesc {
    pub kind: ResourceKind,
    /// File holding the node payloads back to back
    pub path: PathBuf,
    /// Children per inner node
    pub fan_factor: u32,
    /// Depth of the deepest level (root level = 0)
    pub depth: u32,
    /// Bytes per node payload
    pub node_size: usize,
}

impl ResourceDesc {
    pub fn geometry(path: impl Into<PathBuf>, fan_factor: u32, depth: u32, node_size: usize) -> Self {
        Self {
            kind: ResourceKind::Geometry,
            path: path.into(),
            fan_factor,
            depth,
            node_size,
        }
    }

    pub fn texture(path: impl Into<PathBuf>, depth: u32, tile_size: usize) -> Self {
        Self {
            kind: ResourceKind::Texture,
            path: path.into(),
            fan_factor: 4,
            depth,
            node_size: tile_size,
        }
    }
}

/// A registered resource with its derived node count
#[derive(Clone, Debug)]
pub struct Resource {
    id: ResourceId,
    desc: ResourceDesc,
    node_count: NodeId,
}

impl Resource {
    fn new(id: ResourceId, desc: ResourceDesc) -> Result<Self> {
        if desc.fan_factor < 2 {
            return Err(Error::Config(format!(
                "resource {:?}: fan factor must be at least 2, got {}",
                desc.path, desc.fan_factor
            )));
        }
        if desc.kind == ResourceKind::Texture && desc.fan_factor != 4 {
            return Err(Error::Config(format!(
                "texture resource {:?} must be a quadtree, got fan factor {}",
                desc.path, desc.fan_factor
            )));
        }
        if desc.node_size == 0 {
            return Err(Error::Config(format!("resource {:?}: node size is zero", desc.path)));
        }

        let node_count = level_offset(desc.fan_factor, desc.depth + 1).ok_or_else(|| {
            Error::Config(format!(
                "resource {:?}: depth {} with fan factor {} overflows node ids",
                desc.path, desc.depth, desc.fan_factor
            ))
        })?;
        node_count
            .checked_mul(desc.node_size as u64)
            .ok_or_else(|| Error::Config(format!("resource {:?}: file size overflows", desc.path)))?;

        Ok(Self { id, desc, node_count })
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn desc(&self) -> &ResourceDesc {
        &self.desc
    }

    pub fn kind(&self) -> ResourceKind {
        self.desc.kind
    }

    pub fn fan_factor(&self) -> u32 {
        self.desc.fan_factor
    }

    pub fn depth(&self) -> u32 {
        self.desc.depth
    }

    pub fn node_size(&self) -> usize {
        self.desc.node_size
    }

    pub fn node_count(&self) -> NodeId {
        self.node_count
    }

    pub fn contains(&self, node: NodeId) -> bool {
        node < self.node_count
    }

    /// Parent id, `None` for the root
    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        if node == 0 {
            None
        } else {
            Some((node - 1) / self.fan())
        }
    }

    /// Child `index` of `node`, `None` for leaves or an out of range index
    pub fn child(&self, node: NodeId, index: u32) -> Option<NodeId> {
        if index >= self.desc.fan_factor || self.is_leaf(node) {
            return None;
        }
        Some(node * self.fan() + 1 + index as NodeId)
    }

    /// Ids of all children (empty for leaves)
    pub fn children(&self, node: NodeId) -> Range<NodeId> {
        if self.is_leaf(node) {
            return 0..0;
        }
        let first = node * self.fan() + 1;
        first..first + self.fan()
    }

    /// The sibling group `node` belongs to, including `node` itself
    pub fn siblings(&self, node: NodeId) -> Range<NodeId> {
        match self.parent(node) {
            Some(parent) => self.children(parent),
            None => 0..1,
        }
    }

    /// Level of `node` (root = 0)
    pub fn depth_of(&self, node: NodeId) -> u32 {
        let fan = self.fan();
        let mut depth = 0;
        let mut level_end: NodeId = 1;
        let mut level_len: NodeId = 1;
        while node >= level_end && level_end != NodeId::MAX {
            level_len = level_len.saturating_mul(fan);
            level_end = level_end.saturating_add(level_len);
            depth += 1;
        }
        depth
    }

    pub fn is_leaf(&self, node: NodeId) -> bool {
        self.depth_of(node) >= self.desc.depth
    }

    /// Id of the first node on `depth`
    pub fn first_node_of_depth(&self, depth: u32) -> NodeId {
        level_offset(self.desc.fan_factor, depth).unwrap_or(NodeId::MAX)
    }

    /// Number of nodes on `depth`
    pub fn nodes_at_depth(&self, depth: u32) -> NodeId {
        self.fan().checked_pow(depth).unwrap_or(NodeId::MAX)
    }

    /// Byte offset and length of a node's payload in the resource file
    pub fn byte_range(&self, node: NodeId) -> (u64, usize) {
        (node * self.desc.node_size as u64, self.desc.node_size)
    }

    /// Tile coordinates of a texture tile within its level (morton order).
    /// `None` for geometry resources or ids outside the hierarchy.
    pub fn tile_position(&self, node: NodeId) -> Option<(u32, u32)> {
        if self.desc.kind != ResourceKind::Texture || !self.contains(node) {
            return None;
        }
        let offset = node - self.first_node_of_depth(self.depth_of(node));
        Some((compact_bits(offset), compact_bits(offset >> 1)))
    }

    fn fan(&self) -> NodeId {
        self.desc.fan_factor as NodeId
    }
}

/// Number of nodes above `depth`, i.e. the id of the first node on `depth`
fn level_offset(fan: u32, depth: u32) -> Option<NodeId> {
    let fan = fan as NodeId;
    let mut total: NodeId = 0;
    let mut level: NodeId = 1;
    for _ in 0..depth {
        total = total.checked_add(level)?;
        level = level.checked_mul(fan)?;
    }
    Some(total)
}

/// Morton decode: gather every second bit
fn compact_bits(value: u64) -> u32 {
    let mut x = value & 0x5555_5555_5555_5555;
    x = (x | (x >> 1)) & 0x3333_3333_3333_3333;
    x = (x | (x >> 2)) & 0x0f0f_0f0f_0f0f_0f0f;
    x = (x | (x >> 4)) & 0x00ff_00ff_00ff_00ff;
    x = (x | (x >> 8)) & 0x0000_ffff_0000_ffff;
    x = (x | (x >> 16)) & 0x0000_0000_ffff_ffff;
    x as u32
}

/// All resources sharing one cache
///
/// One slot holds exactly one node, so every resource must have the same
/// node size. Built once at load time and shared read-only afterwards.
#[derive(Clone, Debug, Default)]
pub struct Catalog {
    resources: Vec<Resource>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a catalog from manifest entries
    pub fn from_descs(descs: impl IntoIterator<Item = ResourceDesc>) -> Result<Self> {
        let mut catalog = Self::new();
        for desc in descs {
            catalog.register(desc)?;
        }
        Ok(catalog)
    }

    /// Add a resource, rejecting it if its node size differs from the others
    pub fn register(&mut self, desc: ResourceDesc) -> Result<ResourceId> {
        if let Some(expected) = self.node_size() {
            if desc.node_size != expected {
                return Err(Error::ResourceMismatch {
                    expected,
                    found: desc.node_size,
                });
            }
        }

        let id = self.resources.len() as ResourceId;
        let resource = Resource::new(id, desc)?;
        log::info!(
            "Registered {:?} resource {} ({:?}): {} nodes, fan {}, depth {}",
            resource.kind(),
            id,
            resource.desc().path,
            resource.node_count(),
            resource.fan_factor(),
            resource.depth()
        );
        self.resources.push(resource);
        Ok(id)
    }

    pub fn get(&self, id: ResourceId) -> Result<&Resource> {
        self.resources
            .get(id as usize)
            .ok_or(Error::UnknownResource(id))
    }

    /// Resolve a key, failing if either the resource or the node is unknown
    pub fn resolve(&self, key: NodeKey) -> Result<&Resource> {
        let resource = self.get(key.resource)?;
        if !resource.contains(key.node) {
            return Err(Error::UnknownNode(key));
        }
        Ok(resource)
    }

    pub fn contains(&self, key: NodeKey) -> bool {
        self.resolve(key).is_ok()
    }

    /// Shared node size, `None` while empty
    pub fn node_size(&self) -> Option<usize> {
        self.resources.first().map(Resource::node_size)
    }

    pub fn len(&self) -> usize {
        self.resources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.resources.iter()
    }
}
