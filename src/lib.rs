//! lodstream - out-of-core streaming of multi-resolution hierarchies
//!
//! Geometry LOD trees and virtual-texture quadtrees far larger than memory are
//! streamed node by node into a fixed slot pool. Per-context update threads
//! keep a hole-free cut through each hierarchy and publish it to the renderer
//! without ever blocking on it.

pub mod core;
pub mod cut;
pub mod streaming;
